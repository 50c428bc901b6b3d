/* ------------------------------------------------------------------ */
/* Model structs: parameters, init, structural names                 */
/* ------------------------------------------------------------------ */
//
// Parameter names follow the GPT-2 state-dict layout:
//   transformer.wte.weight                 [vocab × n_embd]   (tied with lm_head)
//   transformer.wpe.weight                 [block × n_embd]
//   transformer.h.{i}.ln_1.{weight,bias}
//   transformer.h.{i}.attn.c_attn.{weight,bias}   [3·n_embd × n_embd]
//   transformer.h.{i}.attn.c_proj.{weight,bias}   [n_embd × n_embd]
//   transformer.h.{i}.ln_2.{weight,bias}
//   transformer.h.{i}.mlp.c_fc.{weight,bias}      [4·n_embd × n_embd]
//   transformer.h.{i}.mlp.c_proj.{weight,bias}    [n_embd × 4·n_embd]
//   transformer.ln_f.{weight,bias}
// Bias entries are absent when `config.bias` is false.

use std::collections::{HashMap, HashSet};

use candle_core::{DType, Device, Tensor, Var};

use crate::attention::{build_kernel, AttentionKernel};
use crate::config::{GptConfig, INIT_STD};
use crate::error::{Error, Result};
use crate::rng::Rng;

pub const TIED_WEIGHT: &str = "transformer.wte.weight";

pub struct Linear {
    pub(crate) weight: Var, // [nout × nin]
    pub(crate) bias: Option<Var>,
}

pub struct LayerNorm {
    pub(crate) weight: Var,
    pub(crate) bias: Option<Var>,
}

pub struct CausalSelfAttention {
    pub(crate) c_attn: Linear,
    pub(crate) c_proj: Linear,
    pub(crate) n_head: usize,
}

pub struct Mlp {
    pub(crate) c_fc: Linear,
    pub(crate) c_proj: Linear,
}

pub struct Block {
    pub(crate) ln_1: LayerNorm,
    pub(crate) attn: CausalSelfAttention,
    pub(crate) ln_2: LayerNorm,
    pub(crate) mlp: Mlp,
}

/* Full GPT model: embeddings + n_layer blocks + final norm + tied LM head */
pub struct Gpt {
    pub(crate) config: GptConfig,
    pub(crate) device: Device,
    pub(crate) wte: Var,
    pub(crate) wpe: Var,
    pub(crate) blocks: Vec<Block>,
    pub(crate) ln_f: LayerNorm,
    // Same Var as `wte`: one storage, one optimizer slot.
    pub(crate) lm_head: Var,
    pub(crate) kernel: Box<dyn AttentionKernel>,
    params: Vec<(String, Var)>,
}

// Draws every parameter from the run's Rng and records it under its name.
struct ParamInit<'a> {
    rng: &'a mut Rng,
    device: &'a Device,
    params: Vec<(String, Var)>,
}

impl ParamInit<'_> {
    fn normal(&mut self, name: String, rows: usize, cols: usize, std: f32) -> Result<Var> {
        let data: Vec<f32> = (0..rows * cols).map(|_| self.rng.gauss(0.0, std)).collect();
        let var = Var::from_vec(data, (rows, cols), self.device)?;
        self.params.push((name, var.clone()));
        Ok(var)
    }

    fn fill(&mut self, name: String, n: usize, value: f32) -> Result<Var> {
        let var = if value == 0.0 {
            Var::zeros(n, DType::F32, self.device)?
        } else {
            Var::ones(n, DType::F32, self.device)?
        };
        self.params.push((name, var.clone()));
        Ok(var)
    }

    fn linear(&mut self, prefix: &str, nin: usize, nout: usize, std: f32, bias: bool) -> Result<Linear> {
        let weight = self.normal(format!("{prefix}.weight"), nout, nin, std)?;
        let bias = if bias { Some(self.fill(format!("{prefix}.bias"), nout, 0.0)?) } else { None };
        Ok(Linear { weight, bias })
    }

    fn layer_norm(&mut self, prefix: &str, n: usize, bias: bool) -> Result<LayerNorm> {
        let weight = self.fill(format!("{prefix}.weight"), n, 1.0)?;
        let bias = if bias { Some(self.fill(format!("{prefix}.bias"), n, 0.0)?) } else { None };
        Ok(LayerNorm { weight, bias })
    }
}

impl Gpt {
    /// Build a freshly initialised model. Fails before allocating anything if
    /// the configuration is invalid.
    pub fn new(config: &GptConfig, rng: &mut Rng, device: &Device) -> Result<Self> {
        config.validate()?;

        let c = config.n_embd;
        let mlp = config.mlp_dim();
        // GPT-2 style: residual output projections scaled down by 1/sqrt(2·n_layer)
        let std_in  = INIT_STD;
        let std_out = INIT_STD / (2.0 * config.n_layer as f32).sqrt();

        let mut init = ParamInit { rng, device, params: Vec::new() };

        let wte = init.normal(TIED_WEIGHT.to_string(), config.vocab_size, c, std_in)?;
        let wpe = init.normal("transformer.wpe.weight".to_string(), config.block_size, c, std_in)?;

        let mut blocks = Vec::with_capacity(config.n_layer);
        for li in 0..config.n_layer {
            let p = format!("transformer.h.{li}");
            blocks.push(Block {
                ln_1: init.layer_norm(&format!("{p}.ln_1"), c, config.bias)?,
                attn: CausalSelfAttention {
                    c_attn: init.linear(&format!("{p}.attn.c_attn"), c, 3 * c, std_in, config.bias)?,
                    c_proj: init.linear(&format!("{p}.attn.c_proj"), c, c, std_out, config.bias)?,
                    n_head: config.n_head,
                },
                ln_2: init.layer_norm(&format!("{p}.ln_2"), c, config.bias)?,
                mlp: Mlp {
                    c_fc:   init.linear(&format!("{p}.mlp.c_fc"), c, mlp, std_in, config.bias)?,
                    c_proj: init.linear(&format!("{p}.mlp.c_proj"), mlp, c, std_out, config.bias)?,
                },
            });
        }
        let ln_f = init.layer_norm("transformer.ln_f", c, config.bias)?;
        let params = init.params;

        let kernel = build_kernel(config.attention, config.block_size, device)?;
        let lm_head = wte.clone();

        let model = Self {
            config: config.clone(),
            device: device.clone(),
            wte,
            wpe,
            blocks,
            ln_f,
            lm_head,
            kernel,
            params,
        };
        log::info!(
            "model created: {} parameters ({} layers, {} heads, {} embd, {} attention)",
            model.param_count(),
            config.n_layer,
            config.n_head,
            config.n_embd,
            model.kernel.name(),
        );
        Ok(model)
    }

    pub fn config(&self) -> &GptConfig { &self.config }

    pub fn device(&self) -> &Device { &self.device }

    /// Learnable parameters keyed by structural name, each listed once.
    pub fn named_params(&self) -> &[(String, Var)] { &self.params }

    pub fn vars(&self) -> Vec<Var> {
        self.params.iter().map(|(_, v)| v.clone()).collect()
    }

    /// Tied weights are counted once.
    pub fn param_count(&self) -> usize {
        self.params.iter().map(|(_, v)| v.elem_count()).sum()
    }

    pub fn token_embedding(&self) -> &Var { &self.wte }

    pub fn lm_head_weight(&self) -> &Var { &self.lm_head }

    /// Overwrite every parameter from `tensors`, matched by structural name.
    /// Missing, unexpected or mis-shaped entries are errors.
    pub fn load_state(&self, tensors: &HashMap<String, Tensor>) -> Result<()> {
        let known: HashSet<&str> = self.params.iter().map(|(n, _)| n.as_str()).collect();
        if let Some(extra) = tensors.keys().find(|k| !known.contains(k.as_str())) {
            return Err(Error::InvalidConfig(format!("unexpected parameter {extra}")));
        }
        for (name, var) in &self.params {
            let src = tensors
                .get(name)
                .ok_or_else(|| Error::InvalidConfig(format!("missing parameter {name}")))?;
            if src.dims() != var.dims() {
                return Err(Error::InvalidConfig(format!(
                    "parameter {name}: expected shape {:?}, got {:?}",
                    var.dims(),
                    src.dims()
                )));
            }
            let src = src.to_device(&self.device)?.to_dtype(var.dtype())?;
            var.set(&src)?;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn small() -> GptConfig {
        GptConfig { n_layer: 3, n_head: 2, n_embd: 16, block_size: 8, vocab_size: 40, ..GptConfig::default() }
    }

    #[test]
    fn invalid_config_fails_before_init() {
        let cfg = GptConfig { n_embd: 10, n_head: 3, ..small() };
        let err = Gpt::new(&cfg, &mut Rng::new(1), &Device::Cpu).err().unwrap();
        assert!(matches!(err, Error::InvalidConfig(_)));
    }

    #[test]
    fn lm_head_is_the_embedding_var() -> Result<()> {
        let model = Gpt::new(&small(), &mut Rng::new(1), &Device::Cpu)?;
        assert_eq!(model.token_embedding().id(), model.lm_head_weight().id());
        let tied = model.named_params().iter().filter(|(n, _)| n == TIED_WEIGHT).count();
        assert_eq!(tied, 1);
        assert!(model.named_params().iter().all(|(n, _)| !n.starts_with("lm_head")));
        Ok(())
    }

    #[test]
    fn param_count_matches_formula() -> Result<()> {
        let cfg = small();
        let model = Gpt::new(&cfg, &mut Rng::new(1), &Device::Cpu)?;
        let (c, v, t, l) = (cfg.n_embd, cfg.vocab_size, cfg.block_size, cfg.n_layer);
        let per_block = 2 * (2 * c)          // two layer norms
            + (3 * c * c + 3 * c)            // c_attn
            + (c * c + c)                    // attn c_proj
            + (4 * c * c + 4 * c)            // c_fc
            + (4 * c * c + c);               // mlp c_proj
        let expected = v * c + t * c + l * per_block + 2 * c;
        assert_eq!(model.param_count(), expected);
        Ok(())
    }

    #[test]
    fn residual_projections_use_scaled_init() -> Result<()> {
        let cfg = GptConfig { n_layer: 8, n_embd: 64, n_head: 4, ..small() };
        let model = Gpt::new(&cfg, &mut Rng::new(3), &Device::Cpu)?;
        let std_of = |name: &str| -> f32 {
            let (_, v) = model.named_params().iter().find(|(n, _)| n == name).unwrap();
            let data = v.flatten_all().unwrap().to_vec1::<f32>().unwrap();
            let mean = data.iter().sum::<f32>() / data.len() as f32;
            (data.iter().map(|x| (x - mean).powi(2)).sum::<f32>() / data.len() as f32).sqrt()
        };
        let fc = std_of("transformer.h.0.mlp.c_fc.weight");
        let proj = std_of("transformer.h.0.mlp.c_proj.weight");
        assert!((fc - 0.02).abs() < 0.002, "c_fc std {fc}");
        assert!((proj - 0.005).abs() < 0.001, "c_proj std {proj}");
        Ok(())
    }

    #[test]
    fn no_bias_entries_when_disabled() -> Result<()> {
        let cfg = GptConfig { bias: false, ..small() };
        let model = Gpt::new(&cfg, &mut Rng::new(1), &Device::Cpu)?;
        assert!(model.named_params().iter().all(|(n, _)| !n.ends_with(".bias")));
        Ok(())
    }

    #[test]
    fn load_state_rejects_unknown_names() -> Result<()> {
        let model = Gpt::new(&small(), &mut Rng::new(1), &Device::Cpu)?;
        let mut state: HashMap<String, Tensor> = model
            .named_params()
            .iter()
            .map(|(n, v)| (n.clone(), v.as_tensor().clone()))
            .collect();
        state.insert("lm_head.bias".into(), Tensor::zeros(40, DType::F32, &Device::Cpu)?);
        assert!(model.load_state(&state).is_err());
        Ok(())
    }
}
