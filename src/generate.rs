/* ------------------------------------------------------------------ */
/* Autoregressive sampling                                           */
/* ------------------------------------------------------------------ */

use std::time::{Duration, Instant};

use candle_core::{DType, Tensor};
use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::Gpt;
use crate::ops::{softmax_fwd, top_k_filter};
use crate::rng::Rng;
use crate::tokenizer::Codec;

/// Sampling settings for one text generation call.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationParams {
    pub max_new_tokens: usize,
    pub temperature: f32,
    pub top_k: Option<usize>,
    pub seed: u64,
}

impl Default for GenerationParams {
    fn default() -> Self {
        Self { max_new_tokens: 50, temperature: 0.8, top_k: Some(40), seed: 42 }
    }
}

impl GenerationParams {
    /// Shorter budget used when sampling the test prompts after training.
    pub fn preview() -> Self {
        Self { max_new_tokens: 30, ..Self::default() }
    }

    /// Defaults for a model with `vocab_size` tokens. The default top-k is
    /// left out when it would not restrict that vocabulary; an explicit
    /// `top_k >= vocab_size` is still rejected at sampling time.
    pub fn default_for(vocab_size: usize) -> Self {
        Self::default().without_idle_top_k(vocab_size)
    }

    pub fn preview_for(vocab_size: usize) -> Self {
        Self::preview().without_idle_top_k(vocab_size)
    }

    fn without_idle_top_k(self, vocab_size: usize) -> Self {
        Self { top_k: self.top_k.filter(|&k| k < vocab_size), ..self }
    }
}

#[derive(Clone, Debug)]
pub struct Generation {
    pub tokens: Vec<u32>,
    pub text: String,
    pub new_tokens: usize,
    pub elapsed: Duration,
}

impl Generation {
    pub fn tokens_per_sec(&self) -> f64 {
        let secs = self.elapsed.as_secs_f64();
        if secs > 0.0 { self.new_tokens as f64 / secs } else { 0.0 }
    }
}

impl Gpt {
    /// Extend `prompt` by exactly `max_new_tokens` sampled tokens.
    ///
    /// The context is cropped to the last `block_size` tokens before every
    /// step. There is no end-of-text stop. Returns prompt followed by samples.
    pub fn generate(
        &self,
        prompt: &[u32],
        max_new_tokens: usize,
        temperature: f32,
        top_k: Option<usize>,
        rng: &mut Rng,
    ) -> Result<Vec<u32>> {
        let vocab = self.config.vocab_size;
        if !(temperature > 0.0 && temperature.is_finite()) {
            return Err(Error::InvalidSampling(format!("temperature {temperature} must be positive")));
        }
        if let Some(k) = top_k {
            if k == 0 || k >= vocab {
                return Err(Error::InvalidSampling(format!(
                    "top_k {k} must be in 1..{vocab}"
                )));
            }
        }
        if prompt.is_empty() {
            return Err(Error::EmptyInput("prompt"));
        }
        if let Some(&bad) = prompt.iter().find(|&&t| t as usize >= vocab) {
            return Err(Error::TokenOutOfRange { token: bad, vocab_size: vocab });
        }

        let block = self.config.block_size;
        let mut seq = prompt.to_vec();
        seq.reserve(max_new_tokens);
        let mut probs = vec![0.0f32; vocab];

        for _ in 0..max_new_tokens {
            let start = seq.len().saturating_sub(block);
            let ctx = &seq[start..];
            let idx = Tensor::from_slice(ctx, (1, ctx.len()), &self.device)?;

            let (logits, _) = self.forward(&idx, None, None)?;
            let mut logits = logits.squeeze(0)?.to_dtype(DType::F32)?.to_vec1::<f32>()?;

            if let Some(k) = top_k {
                top_k_filter(&mut logits, k);
            }
            softmax_fwd(&logits, &mut probs, temperature);
            seq.push(rng.categorical(&probs) as u32);
        }
        Ok(seq)
    }
}

/// Prompt text in, prompt plus continuation out. Deterministic for fixed
/// model, prompt and params.
pub fn generate_text<C: Codec + ?Sized>(
    model: &Gpt,
    codec: &C,
    prompt: &str,
    params: &GenerationParams,
) -> Result<String> {
    Ok(generate_timed(model, codec, prompt, params)?.text)
}

pub fn generate_timed<C: Codec + ?Sized>(
    model: &Gpt,
    codec: &C,
    prompt: &str,
    params: &GenerationParams,
) -> Result<Generation> {
    let ids = codec.encode(prompt);
    let mut rng = Rng::new(params.seed);
    let t0 = Instant::now();
    let tokens = model.generate(&ids, params.max_new_tokens, params.temperature, params.top_k, &mut rng)?;
    let elapsed = t0.elapsed();

    let out = Generation {
        text: codec.decode(&tokens),
        new_tokens: tokens.len() - ids.len(),
        tokens,
        elapsed,
    };
    log::debug!(
        "generated {} tokens in {:.1}ms ({:.1} tok/s)",
        out.new_tokens,
        elapsed.as_secs_f64() * 1000.0,
        out.tokens_per_sec()
    );
    Ok(out)
}
