/* ------------------------------------------------------------------ */
/* Hyperparameters and global constants                               */
/* ------------------------------------------------------------------ */
//
// Per-experiment settings live in `GptConfig`; the optimizer coefficients and
// numerical constants below are fixed for every run.
//
// Presets mirror the CPU / GPU tables used for the dataset-size ladder:
//   ultra_tiny  100 tokens,   2L 2H  32d, ctx 16
//   tiny        200 tokens,   2L 2H  64d, ctx 16
//   small      1000 tokens,   3L 3H  96d, ctx 24
//   medium     3000 tokens,   3L 3H  96d, ctx 32
//   large     10000 tokens,   4L 4H 128d, ctx 32
// Checkpoints are NOT cross-compatible between presets (different weight shapes).

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

// ── Optimizer ─────────────────────────────────────────────────────────────

pub const BETA1: f64 = 0.9;
pub const BETA2: f64 = 0.95;
pub const WEIGHT_DECAY: f64 = 0.1;
pub const ADAM_EPS: f64 = 1e-9;
pub const GRAD_CLIP: f32 = 1.0;
// Floor of the cosine schedule as a fraction of the peak learning rate.
pub const MIN_LR_FRACTION: f64 = 0.1;

// ── Model ─────────────────────────────────────────────────────────────────

pub const LAYER_NORM_EPS: f64 = 1e-5;
pub const INIT_STD: f32 = 0.02;
pub const MLP_EXPANSION: usize = 4;
/// Target value excluded from the loss.
pub const IGNORE_INDEX: u32 = u32::MAX;
/// GPT-2 byte-pair vocabulary size.
pub const GPT2_VOCAB_SIZE: usize = 50257;

// ── Training ──────────────────────────────────────────────────────────────

pub const DEFAULT_EVAL_ITERS: usize = 20;
pub const BEST_CHECKPOINT_PATH: &str = "best_model.ckpt";
pub const VOCAB_PATH: &str = "vocab.json";

/// Which attention implementation the model uses. Both compute the same
/// function; `Fused` routes through the last-dim softmax kernel.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttentionKind {
    #[default]
    Masked,
    Fused,
}

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GptConfig {
    // Data
    pub dataset_size: usize,
    pub train_test_split: f64,

    // Architecture
    pub n_layer: usize,
    pub n_head: usize,
    pub n_embd: usize,
    pub block_size: usize,
    pub dropout: f32,
    pub bias: bool,
    pub vocab_size: usize,
    pub attention: AttentionKind,

    // Training
    pub max_iters: usize,
    pub batch_size: usize,
    pub learning_rate: f64,
    /// Linear warmup length in optimizer steps. 0 trains at a constant rate.
    pub warmup_steps: usize,
    pub decay_lr: bool,
    pub gradient_accumulation_steps: usize,
    pub eval_interval: usize,
    pub eval_iters: usize,
    pub seed: u64,

    // Runtime policy
    /// Cyclically tile splits that are not longer than `block_size`.
    pub tile_undersized: bool,
    pub use_accelerator: bool,
}

impl Default for GptConfig {
    fn default() -> Self {
        Self {
            dataset_size: 200,
            train_test_split: 0.9,
            n_layer: 2,
            n_head: 2,
            n_embd: 64,
            block_size: 32,
            dropout: 0.1,
            bias: true,
            vocab_size: GPT2_VOCAB_SIZE,
            attention: AttentionKind::Masked,
            max_iters: 1000,
            batch_size: 4,
            learning_rate: 1e-3,
            warmup_steps: 0,
            decay_lr: false,
            gradient_accumulation_steps: 4,
            eval_interval: 100,
            eval_iters: DEFAULT_EVAL_ITERS,
            seed: 42,
            tile_undersized: true,
            use_accelerator: false,
        }
    }
}

impl GptConfig {
    pub fn head_dim(&self) -> usize {
        self.n_embd / self.n_head
    }

    pub fn mlp_dim(&self) -> usize {
        MLP_EXPANSION * self.n_embd
    }

    /// Tokens seen per optimizer step.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size * self.gradient_accumulation_steps
    }

    pub fn validate(&self) -> Result<()> {
        let bad = |msg: String| Err(Error::InvalidConfig(msg));
        if self.n_layer == 0 { return bad("n_layer must be at least 1".into()); }
        if self.n_head == 0 { return bad("n_head must be at least 1".into()); }
        if self.n_embd % self.n_head != 0 {
            return bad(format!(
                "n_embd ({}) must be divisible by n_head ({})",
                self.n_embd, self.n_head
            ));
        }
        if self.block_size == 0 { return bad("block_size must be at least 1".into()); }
        if self.vocab_size == 0 { return bad("vocab_size must be at least 1".into()); }
        if !(0.0..1.0).contains(&self.dropout) {
            return bad(format!("dropout {} must be in [0, 1)", self.dropout));
        }
        if !(self.train_test_split > 0.0 && self.train_test_split <= 1.0) {
            return bad(format!("train_test_split {} must be in (0, 1]", self.train_test_split));
        }
        if self.batch_size == 0 { return bad("batch_size must be at least 1".into()); }
        if self.gradient_accumulation_steps == 0 {
            return bad("gradient_accumulation_steps must be at least 1".into());
        }
        if self.eval_interval == 0 { return bad("eval_interval must be at least 1".into()); }
        if self.eval_iters == 0 { return bad("eval_iters must be at least 1".into()); }
        if !(self.learning_rate > 0.0 && self.learning_rate.is_finite()) {
            return bad(format!("learning_rate {} must be positive", self.learning_rate));
        }
        Ok(())
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self> {
        let json = std::fs::read_to_string(path.as_ref())?;
        let cfg: GptConfig = serde_json::from_str(&json)?;
        cfg.validate()?;
        Ok(cfg)
    }

    pub fn to_json_file(&self, path: impl AsRef<Path>) -> Result<()> {
        std::fs::write(path, serde_json::to_string_pretty(self)?)?;
        Ok(())
    }

    // ── CPU presets ────────────────────────────────────────────────────

    pub fn ultra_tiny() -> Self {
        Self {
            dataset_size: 100,
            n_embd: 32,
            block_size: 16,
            max_iters: 200,
            batch_size: 2,
            gradient_accumulation_steps: 2,
            eval_interval: 50,
            ..Self::default()
        }
    }

    pub fn tiny() -> Self {
        Self {
            dataset_size: 200,
            block_size: 16,
            max_iters: 500,
            ..Self::default()
        }
    }

    pub fn small() -> Self {
        Self {
            dataset_size: 1000,
            n_layer: 3,
            n_head: 3,
            n_embd: 96,
            block_size: 24,
            max_iters: 800,
            learning_rate: 8e-4,
            ..Self::default()
        }
    }

    pub fn medium() -> Self {
        Self {
            dataset_size: 3000,
            n_layer: 3,
            n_head: 3,
            n_embd: 96,
            block_size: 32,
            max_iters: 1500,
            learning_rate: 5e-4,
            gradient_accumulation_steps: 8,
            eval_interval: 150,
            ..Self::default()
        }
    }

    pub fn large() -> Self {
        Self {
            dataset_size: 10000,
            n_layer: 4,
            n_head: 4,
            n_embd: 128,
            block_size: 32,
            max_iters: 2000,
            learning_rate: 3e-4,
            gradient_accumulation_steps: 8,
            eval_interval: 200,
            ..Self::default()
        }
    }

    // ── GPU presets (larger batches, meant for an accelerator) ─────────

    pub fn tiny_gpu() -> Self {
        Self {
            batch_size: 16,
            gradient_accumulation_steps: 2,
            use_accelerator: true,
            ..Self::tiny()
        }
    }

    pub fn medium_gpu() -> Self {
        Self {
            dataset_size: 5000,
            n_layer: 4,
            n_head: 4,
            n_embd: 128,
            block_size: 32,
            max_iters: 2000,
            batch_size: 16,
            learning_rate: 5e-4,
            gradient_accumulation_steps: 4,
            eval_interval: 200,
            use_accelerator: true,
            ..Self::default()
        }
    }

    pub fn large_gpu() -> Self {
        Self {
            dataset_size: 20000,
            n_layer: 6,
            n_head: 8,
            n_embd: 256,
            block_size: 64,
            max_iters: 5000,
            batch_size: 24,
            learning_rate: 3e-4,
            gradient_accumulation_steps: 4,
            eval_interval: 250,
            use_accelerator: true,
            ..Self::default()
        }
    }

    pub const PRESET_NAMES: &'static [&'static str] = &[
        "ultra_tiny", "tiny", "small", "medium", "large",
        "tiny_gpu", "medium_gpu", "large_gpu",
    ];

    pub fn preset(name: &str) -> Option<Self> {
        Some(match name {
            "ultra_tiny" => Self::ultra_tiny(),
            "tiny" => Self::tiny(),
            "small" => Self::small(),
            "medium" => Self::medium(),
            "large" => Self::large(),
            "tiny_gpu" => Self::tiny_gpu(),
            "medium_gpu" => Self::medium_gpu(),
            "large_gpu" => Self::large_gpu(),
            _ => return None,
        })
    }
}
