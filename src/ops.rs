/* ------------------------------------------------------------------ */
/* Math primitives: linear layers, norms, dropout, loss, sampling    */
/* ------------------------------------------------------------------ */

use candle_core::{DType, Tensor, D};

use crate::config::IGNORE_INDEX;
use crate::error::{Error, Result};
use crate::rng::Rng;

// Linear forward: y = x · Wᵀ + b, W stored [nout × nin].
// Leading batch dims of x are broadcast over the weight.
pub fn linear_fwd(x: &Tensor, w: &Tensor, b: Option<&Tensor>) -> Result<Tensor> {
    let wt = match *x.dims() {
        [b1, b2, _, _] => w.broadcast_left((b1, b2))?.t()?,
        [bsize, _, _] => w.broadcast_left(bsize)?.t()?,
        _ => w.t()?,
    };
    let y = x.matmul(&wt)?;
    match b {
        Some(b) => Ok(y.broadcast_add(b)?),
        None => Ok(y),
    }
}

// LayerNorm over the last axis. Composed from primitive ops so that it has a
// backward pass (the fused candle kernel does not).
pub fn layer_norm_fwd(x: &Tensor, w: &Tensor, b: Option<&Tensor>, eps: f64) -> Result<Tensor> {
    let mean = x.mean_keepdim(D::Minus1)?;
    let centered = x.broadcast_sub(&mean)?;
    let var = centered.sqr()?.mean_keepdim(D::Minus1)?;
    let normed = centered.broadcast_div(&(var + eps)?.sqrt()?)?;
    let out = normed.broadcast_mul(w)?;
    match b {
        Some(b) => Ok(out.broadcast_add(b)?),
        None => Ok(out),
    }
}

// Dropout: zero elements with probability `rate`, scale survivors by 1/(1-rate).
// No-op in eval mode (`rng == None`). The mask comes from the run's Rng so
// training is reproducible from the seed.
pub fn apply_dropout(x: &Tensor, rate: f32, rng: Option<&mut Rng>) -> Result<Tensor> {
    let rng = match rng {
        Some(r) if rate > 0.0 => r,
        _ => return Ok(x.clone()),
    };
    let scale = 1.0 / (1.0 - rate);
    let mask: Vec<f32> = (0..x.elem_count())
        .map(|_| if rng.uniform() >= rate as f64 { scale } else { 0.0 })
        .collect();
    let mask = Tensor::from_vec(mask, x.dims(), x.device())?.to_dtype(x.dtype())?;
    Ok(x.mul(&mask)?)
}

// Mean next-token cross-entropy over rows of `logits` [N, V].
// Rows whose target is IGNORE_INDEX do not contribute.
pub fn cross_entropy_loss(logits: &Tensor, targets: &Tensor) -> Result<Tensor> {
    let (n, _) = logits.dims2()?;
    let raw = targets.flatten_all()?.to_vec1::<u32>()?;
    if raw.len() != n {
        return Err(Error::InvalidConfig(format!(
            "{} targets for {} logit rows", raw.len(), n
        )));
    }

    let mut ids  = Vec::with_capacity(n);
    let mut keep = Vec::with_capacity(n);
    for &t in &raw {
        if t == IGNORE_INDEX {
            ids.push(0u32);
            keep.push(0.0f32);
        } else {
            ids.push(t);
            keep.push(1.0f32);
        }
    }
    let count = keep.iter().filter(|&&k| k > 0.0).count();
    if count == 0 {
        return Err(Error::EmptyInput("every target is the ignore sentinel"));
    }

    let device = logits.device();
    let log_probs = candle_nn::ops::log_softmax(logits, D::Minus1)?;
    let ids  = Tensor::from_vec(ids, (n, 1), device)?;
    let keep = Tensor::from_vec(keep, n, device)?.to_dtype(log_probs.dtype())?;
    let picked = log_probs.gather(&ids, 1)?.squeeze(1)?;
    Ok(picked.mul(&keep)?.sum_all()?.affine(-1.0 / count as f64, 0.0)?)
}

// Gradient clipping: global L2 norm across all tensors, same coefficient as
// torch's clip_grad_norm_. Returns the pre-clip norm.
pub fn clip_gradients(grads: &mut [Tensor], max_norm: f32) -> Result<f32> {
    let mut sq_sum = 0.0f32;
    for g in grads.iter() {
        sq_sum += g.sqr()?.sum_all()?.to_dtype(DType::F32)?.to_scalar::<f32>()?;
    }
    let norm = sq_sum.sqrt();
    let coef = max_norm / (norm + 1e-6);
    if coef < 1.0 {
        for g in grads.iter_mut() {
            *g = g.affine(coef as f64, 0.0)?;
        }
    }
    Ok(norm)
}

// Softmax with temperature, host side (sampling only).
// -inf logits come out as exact zeros.
pub fn softmax_fwd(logits: &[f32], probs: &mut [f32], temp: f32) {
    let n = logits.len();
    let mx = logits.iter().map(|&v| v / temp).fold(f32::NEG_INFINITY, f32::max);
    let mut sum = 0.0f32;
    for i in 0..n {
        probs[i] = ((logits[i] / temp) - mx).exp();
        sum += probs[i];
    }
    let inv = 1.0 / sum;
    for p in probs[..n].iter_mut() { *p *= inv; }
}

// Keep the k largest logits, push the rest to -inf. Ties with the k-th value survive.
pub fn top_k_filter(logits: &mut [f32], k: usize) {
    if k == 0 || k >= logits.len() { return; }
    let mut sorted = logits.to_vec();
    sorted.sort_unstable_by(|a, b| b.total_cmp(a));
    let threshold = sorted[k - 1];
    for v in logits.iter_mut() {
        if *v < threshold { *v = f32::NEG_INFINITY; }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::Device;

    #[test]
    fn softmax_with_temperature_sums_to_one() {
        let logits = [1.0, 2.0, 3.0, f32::NEG_INFINITY];
        let mut probs = [0.0; 4];
        softmax_fwd(&logits, &mut probs, 0.5);
        let sum: f32 = probs.iter().sum();
        assert!((sum - 1.0).abs() < 1e-6);
        assert_eq!(probs[3], 0.0);
        assert!(probs[2] > probs[1] && probs[1] > probs[0]);
    }

    #[test]
    fn top_k_keeps_k_largest() {
        let mut logits = [0.1, 5.0, -2.0, 3.0, 4.0];
        top_k_filter(&mut logits, 2);
        let kept: Vec<usize> = logits.iter().enumerate()
            .filter(|(_, v)| v.is_finite())
            .map(|(i, _)| i)
            .collect();
        assert_eq!(kept, vec![1, 4]);
    }

    #[test]
    fn layer_norm_zero_mean_unit_var() -> Result<()> {
        let dev = Device::Cpu;
        let x = Tensor::new(&[[1.0f32, 2.0, 3.0, 4.0], [10.0, 0.0, -10.0, 5.0]], &dev)?;
        let w = Tensor::ones(4, DType::F32, &dev)?;
        let b = Tensor::zeros(4, DType::F32, &dev)?;
        let y = layer_norm_fwd(&x, &w, Some(&b), 1e-5)?;
        for row in y.to_vec2::<f32>()? {
            let mean: f32 = row.iter().sum::<f32>() / 4.0;
            let var: f32 = row.iter().map(|v| (v - mean).powi(2)).sum::<f32>() / 4.0;
            assert!(mean.abs() < 1e-5);
            assert!((var - 1.0).abs() < 1e-3);
        }
        Ok(())
    }

    #[test]
    fn cross_entropy_skips_ignored_targets() -> Result<()> {
        let dev = Device::Cpu;
        let logits = Tensor::new(&[[0.0f32, 0.0], [100.0, -100.0]], &dev)?;
        // Row 0 has uniform logits -> ln 2. Row 1 is ignored.
        let targets = Tensor::new(&[1u32, IGNORE_INDEX], &dev)?;
        let loss = cross_entropy_loss(&logits, &targets)?.to_scalar::<f32>()?;
        assert!((loss - std::f32::consts::LN_2).abs() < 1e-5);
        Ok(())
    }

    #[test]
    fn clip_scales_to_max_norm() -> Result<()> {
        let dev = Device::Cpu;
        let mut grads = vec![
            Tensor::new(&[3.0f32, 0.0], &dev)?,
            Tensor::new(&[0.0f32, 4.0], &dev)?,
        ];
        let norm = clip_gradients(&mut grads, 1.0)?;
        assert!((norm - 5.0).abs() < 1e-5);
        let a = grads[0].to_vec1::<f32>()?;
        let b = grads[1].to_vec1::<f32>()?;
        let clipped = (a[0] * a[0] + b[1] * b[1]).sqrt();
        assert!((clipped - 1.0).abs() < 1e-4);
        Ok(())
    }

    #[test]
    fn dropout_is_identity_in_eval() -> Result<()> {
        let x = Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu)?;
        let y = apply_dropout(&x, 0.5, None)?;
        assert_eq!(x.to_vec1::<f32>()?, y.to_vec1::<f32>()?);
        Ok(())
    }
}
