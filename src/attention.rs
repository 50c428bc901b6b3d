/* ------------------------------------------------------------------ */
/* Causal attention kernels                                          */
/* ------------------------------------------------------------------ */
//
// Both kernels turn per-head queries and keys [B, H, T, hd] into attention
// probabilities [B, H, T, T] under a strict lower-triangular mask: row i only
// has mass on columns j <= i. They are interchangeable and agree to float
// round-off on identical input.

use candle_core::{DType, Device, Tensor, D};

use crate::config::AttentionKind;
use crate::error::Result;

pub trait AttentionKernel: Send + Sync {
    fn name(&self) -> &'static str;

    /// `needs_grad` is true when the result feeds a backward pass.
    fn weights(&self, q: &Tensor, k: &Tensor, needs_grad: bool) -> Result<Tensor>;
}

pub fn build_kernel(
    kind: AttentionKind,
    block_size: usize,
    device: &Device,
) -> Result<Box<dyn AttentionKernel>> {
    Ok(match kind {
        AttentionKind::Masked => Box::new(MaskedSoftmax::new(block_size, device)?),
        AttentionKind::Fused  => Box::new(FusedSoftmax::new(block_size, device)?),
    })
}

// q · kᵀ / sqrt(hd)
fn scaled_scores(q: &Tensor, k: &Tensor) -> Result<Tensor> {
    let head_dim = q.dim(D::Minus1)?;
    let scores = q.matmul(&k.t()?.contiguous()?)?;
    Ok(scores.affine(1.0 / (head_dim as f64).sqrt(), 0.0)?)
}

/// Boolean lower-triangular mask, masked positions filled with -inf, then a
/// composed softmax.
pub struct MaskedSoftmax {
    mask: Tensor, // u8 [block, block], 1 where j <= i
}

impl MaskedSoftmax {
    pub fn new(block_size: usize, device: &Device) -> Result<Self> {
        let mask: Vec<u8> = (0..block_size)
            .flat_map(|i| (0..block_size).map(move |j| u8::from(j <= i)))
            .collect();
        let mask = Tensor::from_vec(mask, (block_size, block_size), device)?;
        Ok(Self { mask })
    }
}

impl AttentionKernel for MaskedSoftmax {
    fn name(&self) -> &'static str { "masked" }

    fn weights(&self, q: &Tensor, k: &Tensor, _needs_grad: bool) -> Result<Tensor> {
        let t = q.dim(2)?;
        let scores = scaled_scores(q, k)?;
        let mask = self.mask
            .narrow(0, 0, t)?
            .narrow(1, 0, t)?
            .broadcast_as(scores.shape())?;
        let neg_inf = Tensor::new(f32::NEG_INFINITY, scores.device())?
            .to_dtype(scores.dtype())?
            .broadcast_as(scores.shape())?;
        let masked = mask.where_cond(&scores, &neg_inf)?;
        Ok(candle_nn::ops::softmax(&masked, D::Minus1)?)
    }
}

/// Additive causal bias (0 / -inf) folded into the scores, normalised by the
/// fused last-dim softmax kernel. That kernel has no backward pass, so when
/// gradients are needed the same biased scores go through the composed softmax.
pub struct FusedSoftmax {
    bias: Tensor, // f32 [block, block]
}

impl FusedSoftmax {
    pub fn new(block_size: usize, device: &Device) -> Result<Self> {
        let bias: Vec<f32> = (0..block_size)
            .flat_map(|i| {
                (0..block_size).map(move |j| if j <= i { 0.0 } else { f32::NEG_INFINITY })
            })
            .collect();
        let bias = Tensor::from_vec(bias, (block_size, block_size), device)?;
        Ok(Self { bias })
    }
}

impl AttentionKernel for FusedSoftmax {
    fn name(&self) -> &'static str { "fused" }

    fn weights(&self, q: &Tensor, k: &Tensor, needs_grad: bool) -> Result<Tensor> {
        let t = q.dim(2)?;
        let scores = scaled_scores(q, k)?;
        let bias = self.bias
            .narrow(0, 0, t)?
            .narrow(1, 0, t)?
            .to_dtype(scores.dtype())?;
        let biased = scores.broadcast_add(&bias)?;
        if needs_grad {
            Ok(candle_nn::ops::softmax(&biased, D::Minus1)?)
        } else {
            Ok(candle_nn::ops::softmax_last_dim(&biased.contiguous()?)?)
        }
    }
}
