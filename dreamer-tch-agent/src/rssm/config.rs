//! Configuration of the recurrent state-space model.
use anyhow::Result;
use log::info;
use serde::{Deserialize, Serialize};
use std::{
    fs::File,
    io::{BufReader, Write},
    path::Path,
};

/// Configuration of [Rssm](super::Rssm).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct RssmConfig {
    /// Width of the stochastic latent (number of categorical groups when
    /// `discrete` is set, vector width otherwise).
    pub(super) stoch: i64,

    /// Width of the deterministic recurrent vector.
    pub(super) deter: i64,

    /// Width of hidden layers.
    pub(super) hidden: i64,

    /// Number of stacked recurrent sub-steps per timestep.
    pub(super) rec_depth: usize,

    /// Number of classes per categorical group; `None` selects the
    /// continuous Gaussian representation.
    pub(super) discrete: Option<i64>,

    /// Floor of the Gaussian standard deviation.
    pub(super) min_std: f64,

    /// Uniform mixing ratio of the categorical representation.
    pub(super) unimix_ratio: f64,

    /// Width of the action vector.
    pub(super) num_actions: i64,

    /// Width of the observation embedding.
    pub(super) embed_dim: i64,
}

impl Default for RssmConfig {
    fn default() -> Self {
        Self {
            stoch: 32,
            deter: 512,
            hidden: 512,
            rec_depth: 1,
            discrete: Some(32),
            min_std: 0.1,
            unimix_ratio: 0.01,
            num_actions: 1,
            embed_dim: 1024,
        }
    }
}

impl RssmConfig {
    pub fn stoch(mut self, v: i64) -> Self {
        self.stoch = v;
        self
    }

    pub fn deter(mut self, v: i64) -> Self {
        self.deter = v;
        self
    }

    pub fn hidden(mut self, v: i64) -> Self {
        self.hidden = v;
        self
    }

    pub fn rec_depth(mut self, v: usize) -> Self {
        self.rec_depth = v;
        self
    }

    /// Selects the categorical representation with `v` classes per group.
    pub fn discrete(mut self, v: i64) -> Self {
        self.discrete = Some(v);
        self
    }

    /// Selects the continuous Gaussian representation.
    pub fn continuous(mut self) -> Self {
        self.discrete = None;
        self
    }

    pub fn min_std(mut self, v: f64) -> Self {
        self.min_std = v;
        self
    }

    pub fn unimix_ratio(mut self, v: f64) -> Self {
        self.unimix_ratio = v;
        self
    }

    pub fn num_actions(mut self, v: i64) -> Self {
        self.num_actions = v;
        self
    }

    pub fn embed_dim(mut self, v: i64) -> Self {
        self.embed_dim = v;
        self
    }

    /// Width of the feature vector consumed by downstream heads.
    pub fn feat_dim(&self) -> i64 {
        match self.discrete {
            Some(classes) => self.stoch * classes + self.deter,
            None => self.stoch + self.deter,
        }
    }

    /// Constructs [RssmConfig] from YAML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path_ = path.as_ref().to_owned();
        let file = File::open(path)?;
        let rdr = BufReader::new(file);
        let b = serde_yaml::from_reader(rdr)?;
        info!("Load config of RSSM from {}", path_.to_str().unwrap());
        Ok(b)
    }

    /// Saves [RssmConfig].
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path_ = path.as_ref().to_owned();
        let mut file = File::create(path)?;
        file.write_all(serde_yaml::to_string(&self)?.as_bytes())?;
        info!("Save config of RSSM into {}", path_.to_str().unwrap());
        Ok(())
    }
}
