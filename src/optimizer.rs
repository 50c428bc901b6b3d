/* ------------------------------------------------------------------ */
/* AdamW optimizer, gradient accumulation, LR schedule               */
/* ------------------------------------------------------------------ */

use candle_core::backprop::GradStore;
use candle_core::{Tensor, Var};

use crate::config::*;
use crate::error::Result;

// AdamW step: Adam with decoupled weight decay on every parameter.
//   m ← β1·m + (1-β1)·g
//   v ← β2·v + (1-β2)·g²
//   p ← p - lr·( m̂ / (sqrt(v̂) + eps) + wd·p )
// Bias corrections are computed once per step, not per parameter.
pub struct AdamW {
    vars: Vec<Var>,
    m: Vec<Tensor>,
    v: Vec<Tensor>,
    t: usize,
    lr: f64,
}

impl AdamW {
    pub fn new(vars: Vec<Var>, lr: f64) -> Result<Self> {
        let m = vars.iter().map(|v| v.as_tensor().zeros_like()).collect::<candle_core::Result<Vec<_>>>()?;
        let v = vars.iter().map(|v| v.as_tensor().zeros_like()).collect::<candle_core::Result<Vec<_>>>()?;
        Ok(Self { vars, m, v, t: 0, lr })
    }

    pub fn vars(&self) -> &[Var] { &self.vars }

    pub fn learning_rate(&self) -> f64 { self.lr }

    pub fn set_learning_rate(&mut self, lr: f64) { self.lr = lr; }

    /// Optimizer steps taken so far.
    pub fn steps(&self) -> usize { self.t }

    /// `grads[i]` belongs to `vars()[i]`.
    pub fn step(&mut self, grads: &[Tensor]) -> Result<()> {
        self.t += 1;
        let bc1 = 1.0 - BETA1.powi(self.t as i32);
        let bc2 = 1.0 - BETA2.powi(self.t as i32);

        for (i, var) in self.vars.iter().enumerate() {
            let g = grads[i].detach();
            let m = ((&self.m[i] * BETA1)? + (&g * (1.0 - BETA1))?)?;
            let v = ((&self.v[i] * BETA2)? + (g.sqr()? * (1.0 - BETA2))?)?;

            let m_hat = (&m / bc1)?;
            let v_hat = (&v / bc2)?;
            let p = var.as_tensor().detach();
            let update = (m_hat / (v_hat.sqrt()? + ADAM_EPS)?)?;
            let update = (update + (&p * WEIGHT_DECAY)?)?;
            var.set(&(p - (update * self.lr)?)?)?;

            self.m[i] = m;
            self.v[i] = v;
        }
        Ok(())
    }
}

/// Sums gradients over micro-batches until the next optimizer step.
pub struct GradAccumulator {
    sums: Vec<Option<Tensor>>,
    micro_steps: usize,
}

impl GradAccumulator {
    pub fn new(n_params: usize) -> Self {
        Self { sums: vec![None; n_params], micro_steps: 0 }
    }

    pub fn accumulate(&mut self, vars: &[Var], grads: &GradStore) -> Result<()> {
        for (sum, var) in self.sums.iter_mut().zip(vars) {
            let Some(g) = grads.get(var.as_tensor()) else { continue };
            let g = g.detach();
            *sum = Some(match sum.take() {
                Some(acc) => (acc + g)?,
                None => g,
            });
        }
        self.micro_steps += 1;
        Ok(())
    }

    pub fn micro_steps(&self) -> usize { self.micro_steps }

    /// Summed gradients aligned with `vars` (zeros where nothing flowed), and reset.
    pub fn take(&mut self, vars: &[Var]) -> Result<Vec<Tensor>> {
        let out = self
            .sums
            .iter_mut()
            .zip(vars)
            .map(|(sum, var)| match sum.take() {
                Some(g) => Ok(g),
                None => Ok(var.as_tensor().zeros_like()?),
            })
            .collect::<Result<Vec<_>>>()?;
        self.micro_steps = 0;
        Ok(out)
    }
}

// Learning rate at optimizer step `step` (0-based). Constant at the peak
// unless `warmup_steps` or `decay_lr` is set: optional linear warmup, then
// constant or cosine decay to MIN_LR_FRACTION of peak.
pub fn get_learning_rate(step: usize, config: &GptConfig) -> f64 {
    let peak = config.learning_rate;
    let warmup = config.warmup_steps;
    if step < warmup {
        return peak * (step + 1) as f64 / warmup as f64;
    }
    if !config.decay_lr {
        return peak;
    }
    let total = (config.max_iters / config.gradient_accumulation_steps).max(warmup + 1);
    let progress = ((step - warmup) as f64 / (total - warmup) as f64).min(1.0);
    let cosine = 0.5 * (1.0 + (progress * std::f64::consts::PI).cos());
    let floor = peak * MIN_LR_FRACTION;
    floor + (peak - floor) * cosine
}
