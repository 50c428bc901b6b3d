/* ------------------------------------------------------------------ */
/* Training loop and loss estimation                                 */
/* ------------------------------------------------------------------ */

use std::path::{Path, PathBuf};
use std::time::Instant;

use candle_core::DType;
use serde::Serialize;

use crate::checkpoint::{save_checkpoint, CheckpointMeta};
use crate::config::*;
use crate::data::{get_batch, prepare_dataset, Dataset};
use crate::device::select_device;
use crate::error::{Error, Result};
use crate::model::Gpt;
use crate::ops::clip_gradients;
use crate::optimizer::{get_learning_rate, AdamW, GradAccumulator};
use crate::rng::Rng;
use crate::tokenizer::Codec;

#[derive(Clone, Debug, PartialEq, Serialize)]
pub struct EvalRecord {
    pub iter: usize,
    pub train_loss: f32,
    pub val_loss: f32,
}

/// Outcome of one training run. `history` holds every periodic evaluation,
/// in order, for plotting.
#[derive(Clone, Debug, Serialize)]
pub struct TrainReport {
    pub final_train_loss: f32,
    pub final_val_loss: f32,
    pub best_val_loss: f32,
    pub best_iter: Option<usize>,
    pub history: Vec<EvalRecord>,
    pub optimizer_steps: usize,
    pub param_count: usize,
    pub dataset_size: usize,
    pub checkpoint: Option<PathBuf>,
    pub elapsed_secs: f64,
}

/* ------------------------------------------------------------------ */
/* Estimate loss on both splits                                       */
/* ------------------------------------------------------------------ */

// Mean eval-mode loss over min(eval_iters, max(1, len / block_size)) random
// batches. A split that cannot be windowed reports +inf.
fn split_loss(model: &Gpt, split: &[u32], rng: &mut Rng) -> Result<f32> {
    let cfg = model.config();
    if split.is_empty() || (!cfg.tile_undersized && split.len() <= cfg.block_size) {
        return Ok(f32::INFINITY);
    }
    let iters = cfg.eval_iters.min((split.len() / cfg.block_size).max(1));
    let mut total = 0.0f32;
    for _ in 0..iters {
        let batch = get_batch(split, cfg.block_size, cfg.batch_size, cfg.tile_undersized, rng, model.device())?;
        let (_, loss) = model.forward(&batch.inputs, Some(&batch.targets), None)?;
        total += scalar_loss(loss)?;
    }
    Ok(total / iters as f32)
}

fn scalar_loss(loss: Option<candle_core::Tensor>) -> Result<f32> {
    let loss = loss.ok_or_else(|| Error::InvalidConfig("forward pass returned no loss".into()))?;
    Ok(loss.to_dtype(DType::F32)?.to_scalar::<f32>()?)
}

/// (train, val) loss estimates. No gradients are computed.
pub fn estimate_loss(model: &Gpt, data: &Dataset, rng: &mut Rng) -> Result<(f32, f32)> {
    let train = split_loss(model, &data.train, rng)?;
    let val = split_loss(model, &data.val, rng)?;
    Ok((train, val))
}

/* ------------------------------------------------------------------ */
/* Trainer                                                            */
/* ------------------------------------------------------------------ */

pub struct Trainer {
    model: Gpt,
    data: Dataset,
    opt: AdamW,
    acc: GradAccumulator,
    rng: Rng,
    iter: usize,
    checkpoint: Option<(PathBuf, String)>,
}

impl Trainer {
    /// `rng` should be the generator that initialised `model`, so that one
    /// seed determines the whole run.
    pub fn new(model: Gpt, data: Dataset, rng: Rng) -> Result<Self> {
        let cfg = model.config();
        cfg.validate()?;
        if data.train.is_empty() {
            return Err(Error::EmptyInput("training split"));
        }
        if !cfg.tile_undersized && data.train.len() <= cfg.block_size {
            return Err(Error::InsufficientData { have: data.train.len(), need: cfg.block_size });
        }
        let opt = AdamW::new(model.vars(), cfg.learning_rate)?;
        let acc = GradAccumulator::new(opt.vars().len());
        Ok(Self { model, data, opt, acc, rng, iter: 0, checkpoint: None })
    }

    /// Write the best-so-far model to `path` whenever validation loss improves.
    pub fn with_checkpoint(mut self, path: impl Into<PathBuf>, label: &str) -> Self {
        self.checkpoint = Some((path.into(), label.to_string()));
        self
    }

    pub fn model(&self) -> &Gpt { &self.model }

    pub fn into_model(self) -> Gpt { self.model }

    pub fn optimizer_steps(&self) -> usize { self.opt.steps() }

    /// Micro-batches seen so far.
    pub fn iteration(&self) -> usize { self.iter }

    /// One micro-batch: forward, backward, accumulate. Runs the optimizer when
    /// this micro-batch closes an accumulation window. Returns the unscaled loss.
    pub fn train_step(&mut self) -> Result<f32> {
        let cfg = &self.model.config;
        let accum = cfg.gradient_accumulation_steps;
        let batch = get_batch(
            &self.data.train,
            cfg.block_size,
            cfg.batch_size,
            cfg.tile_undersized,
            &mut self.rng,
            &self.model.device,
        )?;

        let (_, loss) = self.model.forward(&batch.inputs, Some(&batch.targets), Some(&mut self.rng))?;
        let loss = loss.ok_or_else(|| Error::InvalidConfig("forward pass returned no loss".into()))?;
        let value = loss.to_dtype(DType::F32)?.to_scalar::<f32>()?;

        let grads = loss.affine(1.0 / accum as f64, 0.0)?.backward()?;
        self.acc.accumulate(self.opt.vars(), &grads)?;

        if (self.iter + 1) % accum == 0 {
            self.optimizer_step()?;
        }
        self.iter += 1;
        Ok(value)
    }

    fn optimizer_step(&mut self) -> Result<()> {
        let mut grads = self.acc.take(self.opt.vars())?;
        let norm = clip_gradients(&mut grads, GRAD_CLIP)?;
        let lr = get_learning_rate(self.opt.steps(), &self.model.config);
        self.opt.set_learning_rate(lr);
        self.opt.step(&grads)?;
        log::debug!("step {:5} | lr {:.2e} | grad norm {:.4}", self.opt.steps(), lr, norm);
        Ok(())
    }

    pub fn estimate_loss(&mut self) -> Result<(f32, f32)> {
        estimate_loss(&self.model, &self.data, &mut self.rng)
    }

    fn save(&self, path: &Path, label: &str, iter: usize, val_loss: f32) -> Result<()> {
        let meta = CheckpointMeta::new(label, &self.model, self.data.total_tokens(), iter, val_loss);
        save_checkpoint(&self.model, &meta, path)
    }

    /// Run `max_iters` micro-batches with periodic evaluation, then a final one.
    pub fn train(&mut self) -> Result<TrainReport> {
        let cfg = self.model.config.clone();
        let params = self.model.param_count();
        let tokens = self.data.total_tokens();

        log::info!(
            "training: {} iters | batch {} x accum {} (effective {}) | lr {} | warmup {}{}",
            cfg.max_iters,
            cfg.batch_size,
            cfg.gradient_accumulation_steps,
            cfg.effective_batch_size(),
            cfg.learning_rate,
            cfg.warmup_steps,
            if cfg.decay_lr { " | cosine decay" } else { "" },
        );
        log::info!(
            "data/parameter ratio: {:.5} ({} tokens / {} parameters)",
            tokens as f64 / params as f64,
            tokens,
            params
        );

        let t0 = Instant::now();
        let mut history = Vec::new();
        let mut best_val = f32::INFINITY;
        let mut best_iter = None;
        let mut wrote_checkpoint = false;

        for iter in 0..cfg.max_iters {
            if iter % cfg.eval_interval == 0 {
                let (train_loss, val_loss) = self.estimate_loss()?;
                history.push(EvalRecord { iter, train_loss, val_loss });
                log::info!(
                    "iter {:5} | train {:.4} | val {:.4} | lr {:.2e}",
                    iter, train_loss, val_loss, self.opt.learning_rate()
                );
                if val_loss < best_val {
                    best_val = val_loss;
                    best_iter = Some(iter);
                    if let Some((path, label)) = &self.checkpoint {
                        self.save(path, label, iter, val_loss)?;
                        wrote_checkpoint = true;
                        log::info!("  new best val loss {:.4}, saved {}", val_loss, path.display());
                    }
                }
            }
            let loss = self.train_step()?;
            log::debug!("iter {:5} | loss {:.4}", iter, loss);
        }

        let (final_train, final_val) = self.estimate_loss()?;
        let elapsed = t0.elapsed().as_secs_f64();
        log::info!(
            "training complete in {:.1}s | final train {:.4} | final val {:.4} | best val {:.4}",
            elapsed, final_train, final_val, best_val
        );

        let checkpoint = self.checkpoint.as_ref().map(|(p, _)| p.clone());
        if let (false, Some((path, label))) = (wrote_checkpoint, &self.checkpoint) {
            self.save(path, label, cfg.max_iters, final_val)?;
            log::info!("saved final model to {}", path.display());
        }

        Ok(TrainReport {
            final_train_loss: final_train,
            final_val_loss: final_val,
            best_val_loss: best_val,
            best_iter,
            history,
            optimizer_steps: self.opt.steps(),
            param_count: params,
            dataset_size: tokens,
            checkpoint,
            elapsed_secs: elapsed,
        })
    }
}

/// Tokenize → window → initialise → train. The codec is handed back with the
/// trained model so that callers can decode its output.
///
/// The best model is written to `checkpoint_path`, or to
/// [`BEST_CHECKPOINT_PATH`] in the working directory when none is given.
pub fn train_from_text<C: Codec>(
    text: &str,
    config: &GptConfig,
    codec: C,
    checkpoint_path: Option<&Path>,
) -> Result<(Gpt, C, TrainReport)> {
    train_labelled(text, config, codec, checkpoint_path, "tinygpt")
}

pub(crate) fn train_labelled<C: Codec>(
    text: &str,
    config: &GptConfig,
    codec: C,
    checkpoint_path: Option<&Path>,
    label: &str,
) -> Result<(Gpt, C, TrainReport)> {
    config.validate()?;
    if codec.vocab_size() > config.vocab_size {
        return Err(Error::InvalidConfig(format!(
            "tokenizer vocabulary of {} exceeds model vocab_size {}",
            codec.vocab_size(),
            config.vocab_size
        )));
    }

    let tokens = codec.encode(text);
    let data = prepare_dataset(&tokens, config)?;

    let device = select_device(config.use_accelerator);
    let mut rng = Rng::new(config.seed);
    let model = Gpt::new(config, &mut rng, &device)?;

    let path = checkpoint_path.unwrap_or_else(|| Path::new(BEST_CHECKPOINT_PATH));
    let mut trainer = Trainer::new(model, data, rng)?.with_checkpoint(path, label);
    let report = trainer.train()?;
    Ok((trainer.into_model(), codec, report))
}
