//! Configuration of the world model.
use crate::{
    head::HeadConfig,
    opt::OptimizerConfig,
    rssm::RssmConfig,
};
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [WorldModel](super::WorldModel).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct WorldModelConfig {
    /// Observation modalities: batch key and per-step shape.
    pub(super) obs_shapes: Vec<(String, Vec<i64>)>,

    /// Width of the action vector.
    pub(super) num_actions: i64,

    /// Hidden layers of the encoder.
    pub(super) encoder_units: Vec<i64>,

    /// Width of the observation embedding.
    pub(super) embed_dim: i64,

    /// Dynamics model configuration. `embed_dim` and `num_actions` are
    /// overridden from this struct when the model is built.
    pub(super) rssm: RssmConfig,

    /// Hidden layers of the per-modality decoder heads.
    pub(super) decoder_units: Vec<i64>,

    pub(super) reward_head: HeadConfig,
    pub(super) cont_head: HeadConfig,

    /// Additional scalar heads trained against the batch key they are named
    /// after.
    pub(super) extra_heads: Vec<(String, HeadConfig)>,

    /// Heads whose gradients flow into the dynamics model; the others
    /// receive detached features.
    pub(super) grad_heads: Vec<String>,

    /// KL free bits.
    pub(super) kl_free: f64,
    pub(super) dyn_scale: f64,
    pub(super) rep_scale: f64,

    /// Global discount factor, folded into the `discount` batch field during
    /// preprocessing.
    pub(super) discount: f64,

    pub(super) opt_config: OptimizerConfig,

    pub device: Option<crate::Device>,
}

impl WorldModelConfig {
    pub fn new(obs_shapes: Vec<(String, Vec<i64>)>, num_actions: i64) -> Self {
        Self {
            obs_shapes,
            num_actions,
            encoder_units: vec![256, 256],
            embed_dim: 256,
            rssm: RssmConfig::default(),
            decoder_units: vec![256, 256],
            reward_head: HeadConfig::scalar(vec![256, 256]),
            cont_head: HeadConfig::binary(vec![256, 256]),
            extra_heads: vec![],
            grad_heads: vec!["decoder".into(), "reward".into(), "cont".into()],
            kl_free: 1.0,
            dyn_scale: 0.5,
            rep_scale: 0.1,
            discount: 0.997,
            opt_config: OptimizerConfig::Adam {
                lr: 1e-4,
                grad_clip: Some(1000.0),
            },
            device: None,
        }
    }

    pub fn encoder_units(mut self, v: Vec<i64>) -> Self {
        self.encoder_units = v;
        self
    }

    pub fn embed_dim(mut self, v: i64) -> Self {
        self.embed_dim = v;
        self
    }

    pub fn rssm(mut self, v: RssmConfig) -> Self {
        self.rssm = v;
        self
    }

    pub fn decoder_units(mut self, v: Vec<i64>) -> Self {
        self.decoder_units = v;
        self
    }

    pub fn reward_head(mut self, v: HeadConfig) -> Self {
        self.reward_head = v;
        self
    }

    pub fn cont_head(mut self, v: HeadConfig) -> Self {
        self.cont_head = v;
        self
    }

    pub fn extra_head(mut self, key: impl Into<String>, v: HeadConfig) -> Self {
        self.extra_heads.push((key.into(), v));
        self
    }

    pub fn grad_heads(mut self, v: Vec<String>) -> Self {
        self.grad_heads = v;
        self
    }

    pub fn kl_free(mut self, v: f64) -> Self {
        self.kl_free = v;
        self
    }

    pub fn dyn_scale(mut self, v: f64) -> Self {
        self.dyn_scale = v;
        self
    }

    pub fn rep_scale(mut self, v: f64) -> Self {
        self.rep_scale = v;
        self
    }

    /// Discount factor.
    pub fn discount_factor(mut self, v: f64) -> Self {
        self.discount = v;
        self
    }

    pub fn opt_config(mut self, v: OptimizerConfig) -> Self {
        self.opt_config = v;
        self
    }

    /// Device.
    pub fn device(mut self, device: tch::Device) -> Self {
        self.device = Some(device.into());
        self
    }

    pub fn discount(&self) -> f64 {
        self.discount
    }

    /// Width of the flattened observation vector fed to the encoder.
    pub(super) fn obs_dim(&self) -> i64 {
        self.obs_shapes
            .iter()
            .map(|(_, shape)| shape.iter().product::<i64>())
            .sum()
    }

    /// Constructs [WorldModelConfig] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!(
            "Load config of world model from {}",
            path_.to_str().unwrap()
        );
        Ok(b)
    }

    /// Saves [WorldModelConfig].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!(
            "Save config of world model into {}",
            path_.to_str().unwrap()
        );
        Ok(())
    }
}
