/* ------------------------------------------------------------------ */
/* Forward pass: batched [B, T] token ids -> logits (+ loss)         */
/* ------------------------------------------------------------------ */
//
// Training mode is `rng = Some(..)`: dropout is active and the attention kernel
// keeps a differentiable softmax. Eval mode is `rng = None`. A backward pass is
// only supported on training-mode outputs.

use candle_core::{Tensor, D};

use crate::config::LAYER_NORM_EPS;
use crate::error::{Error, Result};
use crate::model::{Block, CausalSelfAttention, Gpt, LayerNorm, Linear, Mlp};
use crate::ops::{apply_dropout, cross_entropy_loss, layer_norm_fwd, linear_fwd};
use crate::rng::Rng;

impl Linear {
    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        linear_fwd(x, self.weight.as_tensor(), self.bias.as_ref().map(|b| b.as_tensor()))
    }
}

impl LayerNorm {
    pub(crate) fn forward(&self, x: &Tensor) -> Result<Tensor> {
        layer_norm_fwd(
            x,
            self.weight.as_tensor(),
            self.bias.as_ref().map(|b| b.as_tensor()),
            LAYER_NORM_EPS,
        )
    }
}

impl CausalSelfAttention {
    fn forward(&self, x: &Tensor, gpt: &Gpt, mut rng: Option<&mut Rng>) -> Result<Tensor> {
        let (b, t, c) = x.dims3()?;
        let hd = c / self.n_head;
        let dropout = gpt.config.dropout;

        // Fused QKV, then split into heads: [B, H, T, hd]
        let qkv = self.c_attn.forward(x)?;
        let heads = |i: usize| -> Result<Tensor> {
            Ok(qkv
                .narrow(D::Minus1, i * c, c)?
                .reshape((b, t, self.n_head, hd))?
                .transpose(1, 2)?
                .contiguous()?)
        };
        let (q, k, v) = (heads(0)?, heads(1)?, heads(2)?);

        let att = gpt.kernel.weights(&q, &k, rng.is_some())?;
        let att = apply_dropout(&att, dropout, rng.as_deref_mut())?;

        let y = att
            .matmul(&v)?
            .transpose(1, 2)?
            .contiguous()?
            .reshape((b, t, c))?;
        let y = self.c_proj.forward(&y)?;
        apply_dropout(&y, dropout, rng)
    }
}

impl Mlp {
    fn forward(&self, x: &Tensor, dropout: f32, rng: Option<&mut Rng>) -> Result<Tensor> {
        let h = self.c_fc.forward(x)?.gelu_erf()?;
        let h = self.c_proj.forward(&h)?;
        apply_dropout(&h, dropout, rng)
    }
}

impl Block {
    // Pre-norm residual block
    fn forward(&self, x: &Tensor, gpt: &Gpt, mut rng: Option<&mut Rng>) -> Result<Tensor> {
        let a = self.attn.forward(&self.ln_1.forward(x)?, gpt, rng.as_deref_mut())?;
        let x = (x + a)?;
        let m = self.mlp.forward(&self.ln_2.forward(&x)?, gpt.config.dropout, rng)?;
        Ok((x + m)?)
    }
}

impl Gpt {
    fn check_input(&self, idx: &Tensor) -> Result<(usize, usize)> {
        let (b, t) = idx.dims2()?;
        if b == 0 || t == 0 {
            return Err(Error::EmptyInput("token batch"));
        }
        if t > self.config.block_size {
            return Err(Error::ContextOverflow { len: t, block_size: self.config.block_size });
        }
        let max = idx.max_all()?.to_scalar::<u32>()?;
        if max as usize >= self.config.vocab_size {
            return Err(Error::TokenOutOfRange { token: max, vocab_size: self.config.vocab_size });
        }
        Ok((b, t))
    }

    // Embeddings + blocks + final norm: [B, T] -> [B, T, C]
    fn hidden(&self, idx: &Tensor, mut rng: Option<&mut Rng>) -> Result<Tensor> {
        let (b, t) = self.check_input(idx)?;
        let c = self.config.n_embd;

        let tok = self.wte.as_tensor().index_select(&idx.flatten_all()?, 0)?.reshape((b, t, c))?;
        let positions = Tensor::arange(0u32, t as u32, &self.device)?;
        let pos = self.wpe.as_tensor().index_select(&positions, 0)?;
        let mut x = apply_dropout(&tok.broadcast_add(&pos)?, self.config.dropout, rng.as_deref_mut())?;

        for block in &self.blocks {
            x = block.forward(&x, self, rng.as_deref_mut())?;
        }
        self.ln_f.forward(&x)
    }

    /// Logits for every position, `[B, T, vocab]`.
    pub fn logits(&self, idx: &Tensor, rng: Option<&mut Rng>) -> Result<Tensor> {
        let x = self.hidden(idx, rng)?;
        linear_fwd(&x, self.lm_head.as_tensor(), None)
    }

    /// With targets: `[B, T, vocab]` logits and the mean cross-entropy over
    /// positions whose target is not `IGNORE_INDEX`. Without targets: `[B, vocab]`
    /// logits of the last position only, and no loss.
    pub fn forward(
        &self,
        idx: &Tensor,
        targets: Option<&Tensor>,
        rng: Option<&mut Rng>,
    ) -> Result<(Tensor, Option<Tensor>)> {
        match targets {
            Some(targets) => {
                if targets.dims() != idx.dims() {
                    return Err(Error::InvalidConfig(format!(
                        "targets shape {:?} does not match inputs {:?}",
                        targets.dims(),
                        idx.dims()
                    )));
                }
                let logits = self.logits(idx, rng)?;
                let (b, t, v) = logits.dims3()?;
                let loss = cross_entropy_loss(&logits.reshape((b * t, v))?, targets)?;
                Ok((logits, Some(loss)))
            }
            None => {
                let x = self.hidden(idx, rng)?;
                let t = x.dim(1)?;
                let last = x.narrow(1, t - 1, 1)?.squeeze(1)?;
                Ok((linear_fwd(&last, self.lm_head.as_tensor(), None)?, None))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{AttentionKind, GptConfig};
    use candle_core::Device;

    fn cfg() -> GptConfig {
        GptConfig {
            n_layer: 2, n_head: 2, n_embd: 16, block_size: 8, vocab_size: 30,
            dropout: 0.0,
            ..GptConfig::default()
        }
    }

    fn ids(rows: &[&[u32]]) -> Tensor {
        let t = rows[0].len();
        let flat: Vec<u32> = rows.iter().flat_map(|r| r.iter().copied()).collect();
        Tensor::from_vec(flat, (rows.len(), t), &Device::Cpu).unwrap()
    }

    #[test]
    fn output_shapes() -> Result<()> {
        let model = Gpt::new(&cfg(), &mut Rng::new(1), &Device::Cpu)?;
        let x = ids(&[&[1, 2, 3, 4, 5], &[6, 7, 8, 9, 10]]);
        let (logits, loss) = model.forward(&x, None, None)?;
        assert_eq!(logits.dims(), &[2, 30]);
        assert!(loss.is_none());

        let (logits, loss) = model.forward(&x, Some(&x), None)?;
        assert_eq!(logits.dims(), &[2, 5, 30]);
        assert!(loss.is_some());
        Ok(())
    }

    #[test]
    fn initial_loss_is_near_uniform() -> Result<()> {
        let model = Gpt::new(&cfg(), &mut Rng::new(2), &Device::Cpu)?;
        let x = ids(&[&[1, 2, 3, 4, 5, 6, 7, 8]]);
        let y = ids(&[&[2, 3, 4, 5, 6, 7, 8, 9]]);
        let (_, loss) = model.forward(&x, Some(&y), None)?;
        let loss = loss.unwrap().to_scalar::<f32>()?;
        assert!((loss - (30f32).ln()).abs() < 0.3, "loss {loss}");
        Ok(())
    }

    #[test]
    fn rejects_overlong_and_empty_input() -> Result<()> {
        let model = Gpt::new(&cfg(), &mut Rng::new(1), &Device::Cpu)?;
        let long = ids(&[&[1; 9]]);
        assert!(matches!(
            model.forward(&long, None, None),
            Err(Error::ContextOverflow { len: 9, block_size: 8 })
        ));
        let empty = Tensor::zeros((1, 0), candle_core::DType::U32, &Device::Cpu)?;
        assert!(matches!(model.forward(&empty, None, None), Err(Error::EmptyInput(_))));
        Ok(())
    }

    #[test]
    fn rejects_out_of_vocab_ids() -> Result<()> {
        let model = Gpt::new(&cfg(), &mut Rng::new(1), &Device::Cpu)?;
        let x = ids(&[&[1, 30]]);
        assert!(matches!(model.forward(&x, None, None), Err(Error::TokenOutOfRange { token: 30, .. })));
        Ok(())
    }

    #[test]
    fn last_position_matches_full_logits() -> Result<()> {
        let model = Gpt::new(&cfg(), &mut Rng::new(4), &Device::Cpu)?;
        let x = ids(&[&[3, 1, 4, 1, 5, 9]]);
        let (last, _) = model.forward(&x, None, None)?;
        let full = model.logits(&x, None)?;
        let tail = full.narrow(1, 5, 1)?.squeeze(1)?;
        let diff = (last - tail)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff < 1e-5);
        Ok(())
    }

    #[test]
    fn later_tokens_do_not_change_earlier_logits() -> Result<()> {
        for attention in [AttentionKind::Masked, AttentionKind::Fused] {
            let model = Gpt::new(&GptConfig { attention, ..cfg() }, &mut Rng::new(5), &Device::Cpu)?;
            let a = model.logits(&ids(&[&[1, 2, 3, 4, 5, 6]]), None)?;
            let b = model.logits(&ids(&[&[1, 2, 3, 4, 29, 0]]), None)?;
            let prefix_a = a.narrow(1, 0, 4)?;
            let prefix_b = b.narrow(1, 0, 4)?;
            let diff = (prefix_a - prefix_b)?.abs()?.max_all()?.to_scalar::<f32>()?;
            assert!(diff < 1e-5, "{attention:?}: {diff}");
        }
        Ok(())
    }

    #[test]
    fn dropout_changes_training_output_only() -> Result<()> {
        let model = Gpt::new(&GptConfig { dropout: 0.5, ..cfg() }, &mut Rng::new(6), &Device::Cpu)?;
        let x = ids(&[&[1, 2, 3]]);
        let e1 = model.logits(&x, None)?;
        let e2 = model.logits(&x, None)?;
        assert_eq!(e1.flatten_all()?.to_vec1::<f32>()?, e2.flatten_all()?.to_vec1::<f32>()?);

        let mut rng = Rng::new(7);
        let t = model.logits(&x, Some(&mut rng))?;
        let diff = (t - e1)?.abs()?.max_all()?.to_scalar::<f32>()?;
        assert!(diff > 0.0);
        Ok(())
    }
}
