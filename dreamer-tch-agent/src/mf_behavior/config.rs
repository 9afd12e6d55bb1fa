//! Configuration of the model-free behavior.
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

/// How the model-free actor loss propagates gradients.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum MfGradient {
    /// Normalized advantage through the one-step look-ahead.
    Dynamics,

    /// Score-function estimator valued with critic 1.
    Reinforce,

    /// Linear mix of the two, weighted by `gradient_mix`.
    Both,

    /// Deterministic policy gradient through one dynamics step into
    /// critic 1; no entropy or EMA terms.
    Td3,
}

impl FromStr for MfGradient {
    type Err = DreamerError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "dynamics" => Ok(Self::Dynamics),
            "reinforce" => Ok(Self::Reinforce),
            "both" => Ok(Self::Both),
            "td3" => Ok(Self::Td3),
            _ => Err(DreamerError::UnknownGradMode(s.to_string())),
        }
    }
}

/// Configuration of [MfBehavior](super::MfBehavior).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct MfBehaviorConfig {
    /// Actor network; `in_dim` is overridden with the feature width when the
    /// behavior is built.
    pub(super) actor: ActorConfig,

    /// Twin critic networks; `in_dim` is overridden likewise.
    pub(super) critic: CriticConfig,

    pub(super) discount_lambda: f64,
    pub(super) actor_entropy: f64,
    pub(super) mf_gradient: MfGradient,

    /// Mixing fraction of the `Both` gradient mode.
    pub(super) gradient_mix: f64,

    /// The actor loss is only computed every `mf_policy_freq`-th call.
    pub(super) mf_policy_freq: usize,

    /// Scale of the uniform noise added to the speculative action.
    pub(super) mf_noise_scale: f64,

    pub(super) reward_ema: bool,
    pub(super) ema_alpha: f64,

    pub(super) slow_target: bool,
    pub(super) slow_target_update: usize,
    pub(super) slow_target_fraction: f64,
}

impl Default for MfBehaviorConfig {
    fn default() -> Self {
        Self {
            actor: ActorConfig::new(1, vec![256, 256], 1),
            critic: CriticConfig::new(1, vec![256, 256]),
            discount_lambda: 0.95,
            actor_entropy: 3e-4,
            mf_gradient: MfGradient::Td3,
            gradient_mix: 0.5,
            mf_policy_freq: 2,
            mf_noise_scale: 0.2,
            reward_ema: true,
            ema_alpha: 1e-2,
            slow_target: true,
            slow_target_update: 1,
            slow_target_fraction: 0.02,
        }
    }
}

impl MfBehaviorConfig {
    pub fn actor(mut self, v: ActorConfig) -> Self {
        self.actor = v;
        self
    }

    pub fn critic(mut self, v: CriticConfig) -> Self {
        self.critic = v;
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

    pub fn mf_gradient(mut self, v: MfGradient) -> Self {
        self.mf_gradient = v;
        self
    }

    pub fn gradient_mix(mut self, v: f64) -> Self {
        self.gradient_mix = v;
        self
    }

    pub fn mf_policy_freq(mut self, v: usize) -> Self {
        self.mf_policy_freq = v;
        self
    }

    pub fn mf_noise_scale(mut self, v: f64) -> Self {
        self.mf_noise_scale = v;
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

    /// Constructs [MfBehaviorConfig] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!(
            "Load config of model-free behavior from {}",
            path_.to_str().unwrap()
        );
        Ok(b)
    }

    /// Saves [MfBehaviorConfig].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!(
            "Save config of model-free behavior into {}",
            path_.to_str().unwrap()
        );
        Ok(())
    }
}
