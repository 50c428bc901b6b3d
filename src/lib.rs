//! Small GPT-style language models trained on deliberately small corpora.
//!
//! The pipeline runs tokenizer → windowed dataset → causal transformer →
//! next-token training → autoregressive sampling. It is sized for CPU runs
//! that make the effect of dataset size on overfitting visible.
//!
//! ```no_run
//! use tinygpt::{generate_text, train_from_text, GenerationParams, GptConfig, Tokenizer, Codec};
//!
//! # fn main() -> tinygpt::Result<()> {
//! let text = tinygpt::sample_text(2);
//! let tokenizer = Tokenizer::from_text(&text);
//! let config = GptConfig { vocab_size: tokenizer.vocab_size(), ..GptConfig::tiny() };
//! let (model, tokenizer, report) = train_from_text(&text, &config, tokenizer, None)?;
//! println!("best val loss {:.3}", report.best_val_loss);
//! let params = GenerationParams::default_for(model.config().vocab_size);
//! println!("{}", generate_text(&model, &tokenizer, "The cat", &params)?);
//! # Ok(())
//! # }
//! ```

pub mod attention;
pub mod checkpoint;
pub mod config;
pub mod data;
pub mod device;
pub mod error;
pub mod experiment;
mod forward;
pub mod generate;
pub mod model;
pub mod ops;
pub mod optimizer;
pub mod rng;
pub mod tokenizer;
pub mod train;

pub use attention::{AttentionKernel, FusedSoftmax, MaskedSoftmax};
pub use checkpoint::{load_model, save_checkpoint, Checkpoint, CheckpointMeta};
pub use config::{AttentionKind, GptConfig};
pub use data::{get_batch, prepare_dataset, Batch, Dataset};
pub use device::select_device;
pub use error::{Error, Result};
pub use experiment::{
    compare_models, ladder, read_model_index, run_experiment, run_ladder, sample_text,
    write_comparison, write_model_index, Experiment, Level, ModelComparison, ModelIndexEntry,
    PromptOutput, NEW_TEST_PROMPTS, SAMPLE_TEXT, TEST_PROMPTS,
};
pub use generate::{generate_text, generate_timed, Generation, GenerationParams};
pub use model::Gpt;
pub use rng::Rng;
pub use tokenizer::{Codec, Tokenizer};
pub use train::{estimate_loss, train_from_text, EvalRecord, Trainer, TrainReport};
