//! Configuration of the imagination behavior.
use crate::{actor::ActorConfig, critic::CriticConfig};
use anyhow::Result;
use dreamer_core::DreamerError;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
    str::FromStr,
};

/// How the actor loss propagates gradients.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum ImagGradient {
    /// Backpropagate the normalized advantage through the imagined dynamics
    /// path.
    Dynamics,

    /// Score-function estimator; no dynamics gradient.
    Reinforce,

    /// Linear mix of the two, weighted by `imag_gradient_mix`.
    Both,
}

impl FromStr for ImagGradient {
    type Err = DreamerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dynamics" => Ok(Self::Dynamics),
            "reinforce" => Ok(Self::Reinforce),
            "both" => Ok(Self::Both),
            _ => Err(DreamerError::UnknownGradMode(s.to_string())),
        }
    }
}

/// Configuration of [ImagBehavior](super::ImagBehavior).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct ImagBehaviorConfig {
    /// Actor network; `in_dim` is overridden with the feature width when the
    /// behavior is built.
    pub(super) actor: ActorConfig,

    /// Critic network; `in_dim` is overridden likewise.
    pub(super) critic: CriticConfig,

    /// Length of the imagined horizon.
    pub(super) horizon: i64,

    pub(super) discount: f64,
    pub(super) discount_lambda: f64,

    /// Entropy bonus coefficient.
    pub(super) actor_entropy: f64,

    pub(super) imag_gradient: ImagGradient,

    /// Mixing fraction of the `Both` gradient mode.
    pub(super) imag_gradient_mix: f64,

    /// Discount from the continuation head's predicted mean; a constant
    /// discount is used when disabled.
    pub(super) use_cont_head: bool,

    /// Normalize advantages with the running quantile EMA.
    pub(super) reward_ema: bool,
    pub(super) ema_alpha: f64,

    pub(super) slow_target: bool,
    pub(super) slow_target_update: usize,
    pub(super) slow_target_fraction: f64,

    /// Regularize the policy towards an externally supplied model-free
    /// policy.
    pub(super) mf_reg: bool,
    pub(super) mf_reg_scale: f64,
}

impl Default for ImagBehaviorConfig {
    fn default() -> Self {
        Self {
            actor: ActorConfig::new(1, vec![256, 256], 1),
            critic: CriticConfig::new(1, vec![256, 256]),
            horizon: 15,
            discount: 0.997,
            discount_lambda: 0.95,
            actor_entropy: 3e-4,
            imag_gradient: ImagGradient::Dynamics,
            imag_gradient_mix: 0.5,
            use_cont_head: true,
            reward_ema: true,
            ema_alpha: 1e-2,
            slow_target: true,
            slow_target_update: 1,
            slow_target_fraction: 0.02,
            mf_reg: false,
            mf_reg_scale: 1.0,
        }
    }
}

impl ImagBehaviorConfig {
    pub fn actor(mut self, v: ActorConfig) -> Self {
        self.actor = v;
        self
    }

    pub fn critic(mut self, v: CriticConfig) -> Self {
        self.critic = v;
        self
    }

    pub fn horizon(mut self, v: i64) -> Self {
        self.horizon = v;
        self
    }

    pub fn discount_factor(mut self, v: f64) -> Self {
        self.discount = v;
        self
    }

    pub fn discount_lambda(mut self, v: f64) -> Self {
        self.discount_lambda = v;
        self
    }

    pub fn actor_entropy(mut self, v: f64) -> Self {
        self.actor_entropy = v;
        self
    }

    pub fn imag_gradient(mut self, v: ImagGradient) -> Self {
        self.imag_gradient = v;
        self
    }

    pub fn imag_gradient_mix(mut self, v: f64) -> Self {
        self.imag_gradient_mix = v;
        self
    }

    pub fn use_cont_head(mut self, v: bool) -> Self {
        self.use_cont_head = v;
        self
    }

    pub fn reward_ema(mut self, v: bool) -> Self {
        self.reward_ema = v;
        self
    }

    pub fn slow_target(mut self, v: bool) -> Self {
        self.slow_target = v;
        self
    }

    pub fn slow_target_update(mut self, v: usize) -> Self {
        self.slow_target_update = v;
        self
    }

    pub fn slow_target_fraction(mut self, v: f64) -> Self {
        self.slow_target_fraction = v;
        self
    }

    pub fn mf_reg(mut self, v: bool) -> Self {
        self.mf_reg = v;
        self
    }

    pub fn mf_reg_scale(mut self, v: f64) -> Self {
        self.mf_reg_scale = v;
        self
    }

    /// Constructs [ImagBehaviorConfig] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!(
            "Load config of imagination behavior from {}",
            path_.to_str().unwrap()
        );
        Ok(b)
    }

    /// Saves [ImagBehaviorConfig].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!(
            "Save config of imagination behavior into {}",
            path_.to_str().unwrap()
        );
        Ok(())
    }
}
