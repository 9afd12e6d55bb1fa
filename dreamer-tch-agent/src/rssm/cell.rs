//! Recurrent cell of the deterministic state path.
use tch::{nn, nn::Module, Tensor};

/// Layer-normalized GRU cell.
///
/// A single linear map produces reset/candidate/update parts from the
/// concatenated input and state; the update gate is biased towards keeping
/// the previous state (`sigmoid(u - 1)`).
pub struct GruCell {
    linear: nn::Linear,
    norm: nn::LayerNorm,
}

impl GruCell {
    pub fn new(p: &nn::Path, input_dim: i64, state_dim: i64) -> Self {
        let linear = nn::linear(
            p / "linear",
            input_dim + state_dim,
            3 * state_dim,
            nn::LinearConfig {
                bias: false,
                ..Default::default()
            },
        );
        let norm = nn::layer_norm(p / "norm", vec![3 * state_dim], Default::default());
        Self { linear, norm }
    }

    /// One cell update; returns the new state.
    pub fn forward(&self, input: &Tensor, state: &Tensor) -> Tensor {
        let parts = self
            .norm
            .forward(&self.linear.forward(&Tensor::cat(&[input, state], -1)));
        let chunks = parts.chunk(3, -1);
        let reset = chunks[0].sigmoid();
        let cand = (&reset * &chunks[1]).tanh();
        let update = (&chunks[2] - 1.0).sigmoid();
        &update * cand + (1.0 - &update) * state
    }
}

#[cfg(test)]
mod tests {
    use super::GruCell;
    use tch::{nn, Device, Kind, Tensor};

    #[test]
    fn test_state_shape_preserved() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let cell = GruCell::new(&vs.root(), 8, 16);
        let input = Tensor::randn(&[4, 8], (Kind::Float, Device::Cpu));
        let state = Tensor::zeros(&[4, 16], (Kind::Float, Device::Cpu));
        let next = cell.forward(&input, &state);
        assert_eq!(next.size(), vec![4, 16]);
    }

    #[test]
    fn test_batched_leading_dims() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let cell = GruCell::new(&vs.root(), 8, 16);
        let input = Tensor::randn(&[2, 5, 8], (Kind::Float, Device::Cpu));
        let state = Tensor::zeros(&[2, 5, 16], (Kind::Float, Device::Cpu));
        let next = cell.forward(&input, &state);
        assert_eq!(next.size(), vec![2, 5, 16]);
    }
}
