//! Value network.
use crate::{
    dist::{Dist, Normal},
    mlp::{Mlp, MlpConfig},
    model::{ModelBase, SubModel},
    opt::{Optimizer, OptimizerConfig},
};
use anyhow::Result;
use log::{info, trace};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tch::{nn, Device, Tensor};

/// Configuration of [`Critic`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct CriticConfig {
    pub(crate) in_dim: i64,
    pub(crate) units: Vec<i64>,
    pub(crate) opt_config: OptimizerConfig,
}

impl CriticConfig {
    pub fn new(in_dim: i64, units: Vec<i64>) -> Self {
        Self {
            in_dim,
            units,
            opt_config: OptimizerConfig::default(),
        }
    }

    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }
}

/// State-value function over a feature vector.
///
/// Predicts a unit-variance Gaussian, so the negative log-likelihood at a
/// target reduces to a scaled squared error. Cloning builds a slow target:
/// an independent [`nn::VarStore`] initialized with a copy of the live
/// parameters, updated only through [`track`](crate::util::track).
pub struct Critic {
    device: Device,
    config: CriticConfig,
    var_store: nn::VarStore,
    mlp: Mlp,
    opt: Optimizer,
}

impl Critic {
    /// Constructs [Critic].
    pub fn build(config: CriticConfig, device: Device) -> Result<Critic> {
        let var_store = nn::VarStore::new(device);
        let mlp = Mlp::build(
            &var_store,
            MlpConfig::new(config.in_dim, config.units.clone(), 1),
        );
        let opt = config.opt_config.build(&var_store)?;

        Ok(Critic {
            device,
            config,
            var_store,
            mlp,
            opt,
        })
    }

    /// Value distribution given features with arbitrary leading batch
    /// dimensions; `mode()`/`mean()` of the result is the value estimate of
    /// shape `(..., 1)`.
    pub fn forward(&self, feat: &Tensor) -> Dist {
        let mean = self.mlp.forward(&feat.to(self.device));
        Dist::Normal(Normal::new(mean.shallow_clone(), mean.ones_like(), 1))
    }

    /// One optimizer step from already accumulated gradients; used when a
    /// shared loss drives both twin critics with a single backward pass.
    pub fn opt_mut(&mut self) -> &mut Optimizer {
        &mut self.opt
    }
}

impl Clone for Critic {
    fn clone(&self) -> Self {
        let mut cloned =
            Self::build(self.config.clone(), self.device).expect("clone critic");
        cloned
            .var_store
            .copy(&self.var_store)
            .expect("copy critic parameters");
        cloned
    }
}

impl ModelBase for Critic {
    fn backward_step(&mut self, loss: &Tensor) {
        self.opt.backward_step(loss);
    }

    fn get_var_store_mut(&mut self) -> &mut nn::VarStore {
        &mut self.var_store
    }

    fn get_var_store(&self) -> &nn::VarStore {
        &self.var_store
    }

    fn save<T: AsRef<Path>>(&self, path: T) -> Result<()> {
        self.var_store.save(&path)?;
        info!("Save critic to {:?}", path.as_ref());
        let vs = self.var_store.variables();
        for (name, _) in vs.iter() {
            trace!("Save variable {}", name);
        }
        Ok(())
    }

    fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        self.var_store.load(&path)?;
        info!("Load critic from {:?}", path.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{Critic, CriticConfig};
    use crate::util::track;
    use tch::{Device, Kind, Tensor};

    #[test]
    fn test_clone_matches_and_tracks() {
        tch::manual_seed(0);
        let critic = Critic::build(CriticConfig::new(6, vec![8]), Device::Cpu).unwrap();
        let slow = critic.clone();

        let feat = Tensor::randn(&[4, 6], (Kind::Float, Device::Cpu));
        let v = critic.forward(&feat).mode();
        let v_slow = slow.forward(&feat).mode();
        assert!(v.allclose(&v_slow, 1e-6, 1e-6, false));

        // after a full blend the slow copy matches the live critic again
        let mut slow = slow;
        let mut critic = critic;
        tch::no_grad(|| {
            for (_, var) in critic.get_var_store_mut().variables().iter_mut() {
                var.copy_(&(&*var + 1.0));
            }
        });
        track(&mut slow, &critic, 1.0);
        let v = critic.forward(&feat).mode();
        let v_slow = slow.forward(&feat).mode();
        assert!(v.allclose(&v_slow, 1e-6, 1e-6, false));
    }
}
