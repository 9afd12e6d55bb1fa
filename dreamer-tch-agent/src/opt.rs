//! Optimizers.
use anyhow::Result;
use dreamer_core::record::{Record, RecordValue};
use serde::{Deserialize, Serialize};
use tch::{
    nn::{Adam, AdamW, Optimizer as Optimizer_, OptimizerConfig as OptimizerConfig_, VarStore},
    Tensor,
};

/// Configures an optimizer for training neural networks in the learning core.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
pub enum OptimizerConfig {
    /// Adam optimizer.
    Adam {
        /// Learning rate.
        lr: f64,

        /// Maximum gradient norm, applied before each step when set.
        grad_clip: Option<f64>,
    },

    AdamW {
        lr: f64,
        beta1: f64,
        beta2: f64,
        wd: f64,
        eps: f64,
        amsgrad: bool,
        grad_clip: Option<f64>,
    },
}

impl OptimizerConfig {
    /// Constructs an optimizer.
    pub fn build(&self, vs: &VarStore) -> Result<Optimizer> {
        match &self {
            OptimizerConfig::Adam { lr, grad_clip } => {
                let opt = Adam::default().build(vs, *lr)?;
                Ok(Optimizer {
                    opt,
                    grad_clip: *grad_clip,
                })
            }
            OptimizerConfig::AdamW {
                lr,
                beta1,
                beta2,
                wd,
                eps,
                amsgrad,
                grad_clip,
            } => {
                let opt = AdamW {
                    beta1: *beta1,
                    beta2: *beta2,
                    wd: *wd,
                    eps: *eps,
                    amsgrad: *amsgrad,
                }
                .build(vs, *lr)?;
                Ok(Optimizer {
                    opt,
                    grad_clip: *grad_clip,
                })
            }
        }
    }

    /// Adam with the given learning rate and no gradient clipping.
    pub fn adam(lr: f64) -> Self {
        Self::Adam {
            lr,
            grad_clip: None,
        }
    }
}

impl Default for OptimizerConfig {
    fn default() -> Self {
        Self::Adam {
            lr: 3e-4,
            grad_clip: Some(100.0),
        }
    }
}

/// A thin wrapper of [tch::nn::Optimizer] with gradient-norm clipping.
///
/// [tch::nn::Optimizer]: https://docs.rs/tch/0.16.0/tch/nn/struct.Optimizer.html
pub struct Optimizer {
    opt: Optimizer_,
    grad_clip: Option<f64>,
}

impl Optimizer {
    /// Applies a backward pass and one update step.
    pub fn backward_step(&mut self, loss: &Tensor) {
        match self.grad_clip {
            None => self.opt.backward_step(loss),
            Some(clip) => {
                self.opt.zero_grad();
                loss.backward();
                self.opt.clip_grad_norm(clip);
                self.opt.step();
            }
        }
    }

    /// Zeroes the gradients of the tracked variables.
    ///
    /// Use together with [`Optimizer::step`] when one loss drives several
    /// optimizers: zero all of them, run a single backward pass on the loss,
    /// then step each optimizer.
    pub fn zero_grad(&mut self) {
        self.opt.zero_grad();
    }

    /// One update step from already accumulated gradients.
    pub fn step(&mut self) {
        if let Some(clip) = self.grad_clip {
            self.opt.clip_grad_norm(clip);
        }
        self.opt.step();
    }

    /// Backward pass, update step and a metrics record under the given name.
    pub fn backward_step_record(&mut self, loss: &Tensor, name: &str) -> Record {
        self.backward_step(loss);
        Record::from_slice(&[(
            format!("{}_loss", name),
            RecordValue::Scalar(loss.double_value(&[]) as f32),
        )])
    }
}
