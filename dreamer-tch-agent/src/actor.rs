//! Policy network.
use crate::{
    dist::{Dist, Normal, OneHotCategorical},
    mlp::{Mlp, MlpConfig},
    model::{ModelBase, SubModel},
    opt::{Optimizer, OptimizerConfig},
};
use anyhow::Result;
use log::{info, trace};
use serde::{Deserialize, Serialize};
use std::path::Path;
use tch::{nn, Device, Kind, Tensor};

/// Action-distribution family of the actor.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum ActionDistKind {
    /// Tanh-squashed mean with standard deviation bounded to
    /// `[min_std, max_std]`; actions live in `[-1, 1]^n`.
    Normal { min_std: f64, max_std: f64 },

    /// One-hot categorical with a uniform exploration-mixing ratio.
    OneHot { unimix_ratio: f64 },
}

/// Configuration of [`Actor`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ActorConfig {
    pub(crate) in_dim: i64,
    pub(crate) units: Vec<i64>,
    pub(crate) num_actions: i64,
    pub(crate) dist: ActionDistKind,
    pub(crate) opt_config: OptimizerConfig,
}

impl ActorConfig {
    pub fn new(in_dim: i64, units: Vec<i64>, num_actions: i64) -> Self {
        Self {
            in_dim,
            units,
            num_actions,
            dist: ActionDistKind::Normal {
                min_std: 0.1,
                max_std: 1.0,
            },
            opt_config: OptimizerConfig::default(),
        }
    }

    pub fn dist(mut self, v: ActionDistKind) -> Self {
        self.dist = v;
        self
    }

    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }
}

/// Stochastic policy over a feature vector.
///
/// Owns its own [`nn::VarStore`] and optimizer, so the actor's parameter
/// group is disjoint from every critic and from the world model by
/// construction.
pub struct Actor {
    device: Device,
    var_store: nn::VarStore,
    mlp: Mlp,
    dist: ActionDistKind,
    num_actions: i64,
    opt: Optimizer,
}

impl Actor {
    /// Constructs [Actor].
    pub fn build(config: ActorConfig, device: Device) -> Result<Actor> {
        let var_store = nn::VarStore::new(device);
        let out_dim = match config.dist {
            ActionDistKind::Normal { .. } => 2 * config.num_actions,
            ActionDistKind::OneHot { .. } => config.num_actions,
        };
        let mlp = Mlp::build(
            &var_store,
            MlpConfig::new(config.in_dim, config.units.clone(), out_dim),
        );
        let opt = config.opt_config.build(&var_store)?;

        Ok(Actor {
            device,
            var_store,
            mlp,
            dist: config.dist,
            num_actions: config.num_actions,
            opt,
        })
    }

    /// Action distribution given features with arbitrary leading batch
    /// dimensions.
    pub fn forward(&self, feat: &Tensor) -> Dist {
        let out = self.mlp.forward(&feat.to(self.device));
        match &self.dist {
            ActionDistKind::Normal { min_std, max_std } => {
                let chunks = out.chunk(2, -1);
                let mean = chunks[0].tanh();
                let std: Tensor =
                    (*max_std - *min_std) * (&chunks[1] + 2.0).sigmoid() + *min_std;
                Dist::Normal(Normal::new(mean, std, 1))
            }
            ActionDistKind::OneHot { unimix_ratio } => Dist::OneHot(
                OneHotCategorical::with_unimix(out, *unimix_ratio, 0),
            ),
        }
    }

    pub fn num_actions(&self) -> i64 {
        self.num_actions
    }

    /// Entropy of the policy, one value per batch element.
    pub fn entropy(&self, feat: &Tensor) -> Tensor {
        self.forward(feat).entropy().to_kind(Kind::Float)
    }
}

impl ModelBase for Actor {
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
        info!("Save actor to {:?}", path.as_ref());
        let vs = self.var_store.variables();
        for (name, _) in vs.iter() {
            trace!("Save variable {}", name);
        }
        Ok(())
    }

    fn load<T: AsRef<Path>>(&mut self, path: T) -> Result<()> {
        self.var_store.load(&path)?;
        info!("Load actor from {:?}", path.as_ref());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::{ActionDistKind, Actor, ActorConfig};
    use tch::{Device, Kind, Tensor};

    #[test]
    fn test_normal_actions_bounded() {
        tch::manual_seed(0);
        let actor = Actor::build(ActorConfig::new(6, vec![8], 3), Device::Cpu).unwrap();
        let feat = Tensor::randn(&[10, 6], (Kind::Float, Device::Cpu));
        let dist = actor.forward(&feat);
        let mode = dist.mode();
        assert_eq!(mode.size(), vec![10, 3]);
        assert!(mode.abs().max().double_value(&[]) <= 1.0);
    }

    #[test]
    fn test_one_hot_actions() {
        tch::manual_seed(0);
        let config = ActorConfig::new(6, vec![8], 4)
            .dist(ActionDistKind::OneHot { unimix_ratio: 0.01 });
        let actor = Actor::build(config, Device::Cpu).unwrap();
        let feat = Tensor::randn(&[10, 6], (Kind::Float, Device::Cpu));
        let action = actor.forward(&feat).sample().detach();
        assert_eq!(action.size(), vec![10, 4]);
        let sums = action.sum_dim_intlist(-1, false, Kind::Float);
        assert!(sums.allclose(&sums.ones_like(), 1e-6, 1e-6, false));
    }
}
