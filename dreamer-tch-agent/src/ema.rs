//! Running quantile normalization of return batches.
use anyhow::Result;
use log::{info, trace};
use std::path::Path;
use tch::{nn, no_grad, Device, Kind, Tensor};

/// Persisted state of [`RewardEma`]: low/high quantile estimates.
///
/// The buffer is owned by the caller and passed into every
/// [`RewardEma::call`], making the in-place update visible in the signature.
/// It lives in its own [`nn::VarStore`] so checkpoints include it; a resumed
/// run that dropped this buffer would silently renormalize from scratch.
pub struct EmaState {
    var_store: nn::VarStore,
    vals: Tensor,
}

impl EmaState {
    /// Zero-initialized state on the given device.
    pub fn new(device: Device) -> Self {
        let var_store = nn::VarStore::new(device);
        let vals = var_store.root().zeros_no_train("ema_vals", &[2]);
        Self { var_store, vals }
    }

    /// Low/high quantile estimates as plain numbers.
    pub fn values(&self) -> (f64, f64) {
        (self.vals.double_value(&[0]), self.vals.double_value(&[1]))
    }

    pub fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        self.var_store.save(&path)?;
        info!("Save EMA state to {:?}", path.as_ref());
        Ok(())
    }

    pub fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        self.var_store.load(&path)?;
        info!("Load EMA state from {:?}", path.as_ref());
        Ok(())
    }
}

/// Exponential moving average of two quantiles of a scalar batch.
///
/// Rescales advantage targets so the policy-gradient magnitude is invariant
/// to the reward scale of the task. The returned offset/scale are detached;
/// constant batches are covered by the `scale >= 1` floor rather than an
/// error.
pub struct RewardEma {
    alpha: f64,
    quantiles: (f64, f64),
}

impl RewardEma {
    pub fn new(alpha: f64) -> Self {
        Self {
            alpha,
            quantiles: (0.05, 0.95),
        }
    }

    /// Blends the batch quantiles of `x` into `state` and returns
    /// `(offset, scale)`.
    pub fn call(&self, x: &Tensor, state: &mut EmaState) -> (Tensor, Tensor) {
        let flat = x.detach().flatten(0, -1).to_kind(Kind::Float);
        let (sorted, _) = flat.sort(0, false);
        let q_low = Self::quantile(&sorted, self.quantiles.0);
        let q_high = Self::quantile(&sorted, self.quantiles.1);
        let q = Tensor::stack(&[q_low, q_high], 0);

        no_grad(|| {
            let blended: Tensor = self.alpha * &q + (1.0 - self.alpha) * &state.vals;
            state.vals.copy_(&blended);
        });
        trace!("ema_vals: {:?}", state.values());

        let offset = state.vals.get(0).detach();
        let scale = (state.vals.get(1) - state.vals.get(0))
            .clamp_min(1.0)
            .detach();
        (offset, scale)
    }

    /// Empirical quantile of an ascending-sorted vector, with linear
    /// interpolation between adjacent order statistics.
    fn quantile(sorted: &Tensor, q: f64) -> Tensor {
        let n = sorted.size()[0];
        let pos = q * (n - 1) as f64;
        let lo = pos.floor() as i64;
        let hi = pos.ceil() as i64;
        let frac = pos - lo as f64;
        (1.0 - frac) * sorted.get(lo) + frac * sorted.get(hi)
    }
}

impl Default for RewardEma {
    fn default() -> Self {
        Self::new(1e-2)
    }
}

#[cfg(test)]
mod tests {
    use super::{EmaState, RewardEma};
    use tch::{Device, Tensor};

    #[test]
    fn test_scale_floor_on_constant_batch() {
        let ema = RewardEma::default();
        let mut state = EmaState::new(Device::Cpu);
        let x = Tensor::from_slice(&[3f32; 64]);
        let (_, scale) = ema.call(&x, &mut state);
        assert!(scale.double_value(&[]) >= 1.0);
    }

    #[test]
    fn test_ema_blending() {
        let ema = RewardEma::new(0.5);
        let mut state = EmaState::new(Device::Cpu);
        let x = Tensor::from_slice(&(0..101).map(|i| i as f32).collect::<Vec<_>>());
        ema.call(&x, &mut state);
        let (lo, hi) = state.values();
        // quantiles of 0..=100 are 5 and 95; state starts at zero
        assert!((lo - 2.5).abs() < 1e-5);
        assert!((hi - 47.5).abs() < 1e-5);

        // a second identical batch moves the state halfway again
        ema.call(&x, &mut state);
        let (lo, hi) = state.values();
        assert!((lo - 3.75).abs() < 1e-5);
        assert!((hi - 71.25).abs() < 1e-5);
    }

    #[test]
    fn test_offset_and_scale_detached() {
        let ema = RewardEma::default();
        let mut state = EmaState::new(Device::Cpu);
        let x = Tensor::from_slice(&[0f32, 10.0]).set_requires_grad(true);
        let (offset, scale) = ema.call(&x, &mut state);
        assert!(!offset.requires_grad());
        assert!(!scale.requires_grad());
    }
}
