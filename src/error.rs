/* ------------------------------------------------------------------ */
/* Crate error type                                                   */
/* ------------------------------------------------------------------ */

use std::path::PathBuf;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("tensor error: {0}")]
    Candle(#[from] candle_core::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("sequence length {len} exceeds block size {block_size}")]
    ContextOverflow { len: usize, block_size: usize },

    #[error("empty input: {0}")]
    EmptyInput(&'static str),

    #[error("insufficient data: have {have} tokens, need more than {need}")]
    InsufficientData { have: usize, need: usize },

    #[error("token {token} out of range for vocabulary of {vocab_size}")]
    TokenOutOfRange { token: u32, vocab_size: usize },

    #[error("invalid sampling parameters: {0}")]
    InvalidSampling(String),

    #[error("checkpoint {path}: {reason}")]
    Checkpoint { path: PathBuf, reason: String },
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    pub(crate) fn checkpoint(path: impl Into<PathBuf>, reason: impl Into<String>) -> Self {
        Error::Checkpoint { path: path.into(), reason: reason.into() }
    }
}
