/* ------------------------------------------------------------------ */
/* Dataset windowing: train/val split and random batch sampling      */
/* ------------------------------------------------------------------ */

use std::borrow::Cow;

use candle_core::{Device, Tensor};
use rayon::prelude::*;

use crate::config::GptConfig;
use crate::error::{Error, Result};
use crate::rng::Rng;

/// Contiguous train / validation token streams. No shuffling: the split is a
/// single cut point.
#[derive(Clone, Debug, Default)]
pub struct Dataset {
    pub train: Vec<u32>,
    pub val: Vec<u32>,
}

impl Dataset {
    pub fn total_tokens(&self) -> usize {
        self.train.len() + self.val.len()
    }
}

/// `[batch, block]` input ids and the same windows shifted right by one.
pub struct Batch {
    pub inputs: Tensor,
    pub targets: Tensor,
}

/// Truncate `tokens` to `dataset_size` and split at
/// `floor(len * train_test_split)`.
pub fn prepare_dataset(tokens: &[u32], config: &GptConfig) -> Result<Dataset> {
    if tokens.is_empty() {
        return Err(Error::EmptyInput("token stream"));
    }
    if let Some(&bad) = tokens.iter().find(|&&t| t as usize >= config.vocab_size) {
        return Err(Error::TokenOutOfRange { token: bad, vocab_size: config.vocab_size });
    }

    let used = if tokens.len() < config.dataset_size {
        log::warn!(
            "only {} tokens available, fewer than dataset_size {}; using all of them",
            tokens.len(),
            config.dataset_size
        );
        tokens
    } else {
        &tokens[..config.dataset_size]
    };

    let cut = (used.len() as f64 * config.train_test_split) as usize;
    let data = Dataset { train: used[..cut].to_vec(), val: used[cut..].to_vec() };
    log::info!(
        "dataset: {} tokens ({} train / {} val)",
        data.total_tokens(),
        data.train.len(),
        data.val.len()
    );
    Ok(data)
}

// Repeat `data` `block/len + 2` times so at least one full window plus its
// shifted target fits.
fn tile(data: &[u32], block_size: usize) -> Vec<u32> {
    let reps = block_size / data.len() + 2;
    data.iter().copied().cycle().take(data.len() * reps).collect()
}

/// Sample `batch_size` windows of `block_size` tokens.
///
/// Offsets are uniform over `[0, len - block_size)`. When the stream is not
/// longer than `block_size` and `tile_undersized` is set, it is cyclically
/// tiled first. Windows of such a tiny stream then wrap around its end, which
/// teaches the model a spurious last-to-first transition. Without tiling an
/// undersized stream is `InsufficientData`.
pub fn get_batch(
    data: &[u32],
    block_size: usize,
    batch_size: usize,
    tile_undersized: bool,
    rng: &mut Rng,
    device: &Device,
) -> Result<Batch> {
    if data.is_empty() {
        return Err(Error::EmptyInput("split"));
    }
    let data: Cow<[u32]> = if data.len() <= block_size {
        if !tile_undersized {
            return Err(Error::InsufficientData { have: data.len(), need: block_size });
        }
        Cow::Owned(tile(data, block_size))
    } else {
        Cow::Borrowed(data)
    };

    // Offsets drawn in order, then windows gathered in parallel.
    let span = data.len() - block_size;
    let offsets: Vec<usize> = (0..batch_size).map(|_| rng.choice(span)).collect();
    let (inputs, targets): (Vec<Vec<u32>>, Vec<Vec<u32>>) = offsets
        .par_iter()
        .map(|&i| (data[i..i + block_size].to_vec(), data[i + 1..i + 1 + block_size].to_vec()))
        .unzip();

    let inputs  = Tensor::from_vec(inputs.concat(), (batch_size, block_size), device)?;
    let targets = Tensor::from_vec(targets.concat(), (batch_size, block_size), device)?;
    Ok(Batch { inputs, targets })
}
