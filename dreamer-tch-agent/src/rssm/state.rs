//! Latent state of the state-space model.
use tch::Tensor;

/// Parameters of the stochastic component, selected once at model
/// construction: a diagonal Gaussian or a set of categorical groups.
pub enum StochParams {
    /// Mean and standard deviation of shape `(..., stoch)`.
    Gaussian { mean: Tensor, std: Tensor },

    /// Unnormalized logits of shape `(..., stoch, classes)`.
    Categorical { logits: Tensor },
}

impl StochParams {
    /// Applies `f` to every parameter tensor.
    pub fn map(&self, f: &dyn Fn(&Tensor) -> Tensor) -> Self {
        match self {
            StochParams::Gaussian { mean, std } => StochParams::Gaussian {
                mean: f(mean),
                std: f(std),
            },
            StochParams::Categorical { logits } => StochParams::Categorical { logits: f(logits) },
        }
    }

    pub fn detach(&self) -> Self {
        self.map(&|t| t.detach())
    }

    /// Stacks parameter-wise along `dim`. All elements must carry the same
    /// representation.
    pub fn stack(params: &[&StochParams], dim: i64) -> Self {
        match params[0] {
            StochParams::Gaussian { .. } => {
                let means: Vec<_> = params
                    .iter()
                    .map(|p| match p {
                        StochParams::Gaussian { mean, .. } => mean.shallow_clone(),
                        _ => panic!("mixed stochastic representations"),
                    })
                    .collect();
                let stds: Vec<_> = params
                    .iter()
                    .map(|p| match p {
                        StochParams::Gaussian { std, .. } => std.shallow_clone(),
                        _ => panic!("mixed stochastic representations"),
                    })
                    .collect();
                StochParams::Gaussian {
                    mean: Tensor::stack(&means, dim),
                    std: Tensor::stack(&stds, dim),
                }
            }
            StochParams::Categorical { .. } => {
                let logits: Vec<_> = params
                    .iter()
                    .map(|p| match p {
                        StochParams::Categorical { logits } => logits.shallow_clone(),
                        _ => panic!("mixed stochastic representations"),
                    })
                    .collect();
                StochParams::Categorical {
                    logits: Tensor::stack(&logits, dim),
                }
            }
        }
    }
}

/// Latent state of the dynamics model.
///
/// The stochastic sample and the deterministic recurrent vector evolve
/// jointly through [`Rssm::obs_step`](super::Rssm::obs_step) and
/// [`Rssm::img_step`](super::Rssm::img_step); `params` are the distribution
/// parameters the sample was drawn from. Leading dimensions are arbitrary, so
/// the same type represents a single step `(batch, ...)` and a stacked
/// sequence `(batch, time, ...)`.
pub struct LatentState {
    /// Stochastic sample, `(..., stoch)` or `(..., stoch, classes)`.
    pub stoch: Tensor,

    /// Deterministic recurrent vector, `(..., deter)`.
    pub deter: Tensor,

    /// Distribution parameters of `stoch`.
    pub params: StochParams,
}

impl LatentState {
    /// Applies `f` to every tensor of the state.
    pub fn map(&self, f: &dyn Fn(&Tensor) -> Tensor) -> Self {
        Self {
            stoch: f(&self.stoch),
            deter: f(&self.deter),
            params: self.params.map(f),
        }
    }

    /// Severs the state from the gradient graph, e.g. before reusing it as a
    /// rollout seed.
    pub fn detach(&self) -> Self {
        self.map(&|t| t.detach())
    }

    /// Merges the leading `(batch, time)` dimensions into one.
    pub fn flatten_batch_time(&self) -> Self {
        self.map(&|t| t.flatten(0, 1))
    }

    /// Swaps the leading batch and time dimensions.
    pub fn swap_batch_time(&self) -> Self {
        self.map(&|t| t.transpose(0, 1))
    }

    /// Stacks states along `dim`, e.g. collecting a scan into a sequence.
    pub fn stack(states: &[LatentState], dim: i64) -> Self {
        let stoch: Vec<_> = states.iter().map(|s| s.stoch.shallow_clone()).collect();
        let deter: Vec<_> = states.iter().map(|s| s.deter.shallow_clone()).collect();
        let params: Vec<_> = states.iter().map(|s| &s.params).collect();
        Self {
            stoch: Tensor::stack(&stoch, dim),
            deter: Tensor::stack(&deter, dim),
            params: StochParams::stack(&params, dim),
        }
    }
}
