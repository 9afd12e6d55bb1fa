//! Prediction heads of the world model.
use crate::{
    dist::{Bernoulli, Dist, Normal},
    mlp::{Mlp, MlpConfig},
    model::SubModel,
};
use serde::{Deserialize, Serialize};
use tch::{nn, Tensor};

/// Distribution family a head predicts.
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub enum HeadDistKind {
    /// Unit-variance Gaussian; negative log-likelihood is a scaled squared
    /// error.
    Gaussian,

    /// Bernoulli over logits, for the continuation head.
    Bernoulli,
}

/// Configuration of a [`Head`].
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct HeadConfig {
    pub(crate) units: Vec<i64>,
    pub(crate) dist: HeadDistKind,

    /// Shape of one predicted event, e.g. `[1]` for reward or the
    /// observation shape for a decoder head.
    pub(crate) event_shape: Vec<i64>,

    /// Weight of this head's loss in the world-model objective.
    pub(crate) loss_scale: f64,
}

impl HeadConfig {
    pub fn new(units: Vec<i64>, dist: HeadDistKind, event_shape: Vec<i64>) -> Self {
        Self {
            units,
            dist,
            event_shape,
            loss_scale: 1.0,
        }
    }

    pub fn loss_scale(mut self, v: f64) -> Self {
        self.loss_scale = v;
        self
    }

    /// Scalar Gaussian head, e.g. for rewards or values.
    pub fn scalar(units: Vec<i64>) -> Self {
        Self::new(units, HeadDistKind::Gaussian, vec![1])
    }

    /// Bernoulli head for continuation flags.
    pub fn binary(units: Vec<i64>) -> Self {
        Self::new(units, HeadDistKind::Bernoulli, vec![1])
    }
}

/// Maps a feature vector to a distribution over a prediction target.
pub struct Head {
    mlp: Mlp,
    dist: HeadDistKind,
    event_shape: Vec<i64>,
    loss_scale: f64,
}

impl Head {
    pub fn build(var_store: &nn::VarStore, in_dim: i64, config: HeadConfig) -> Self {
        let out_dim = config.event_shape.iter().product();
        let mlp = Mlp::build(
            var_store,
            MlpConfig::new(in_dim, config.units.clone(), out_dim),
        );
        Self {
            mlp,
            dist: config.dist,
            event_shape: config.event_shape,
            loss_scale: config.loss_scale,
        }
    }

    pub fn loss_scale(&self) -> f64 {
        self.loss_scale
    }

    /// Predicts the target distribution given features with arbitrary
    /// leading batch dimensions.
    pub fn forward(&self, feat: &Tensor) -> Dist {
        let out = self.mlp.forward(feat);
        let mut shape = out.size();
        shape.pop();
        shape.extend_from_slice(&self.event_shape);
        let out = out.reshape(shape.as_slice());
        match self.dist {
            HeadDistKind::Gaussian => Dist::Normal(Normal::new(
                out.shallow_clone(),
                out.ones_like(),
                self.event_shape.len(),
            )),
            HeadDistKind::Bernoulli => {
                Dist::Bernoulli(Bernoulli::new(out, self.event_shape.len()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::{Head, HeadConfig};
    use tch::{nn, Device, Kind, Tensor};

    #[test]
    fn test_scalar_head_log_prob_shape() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let head = Head::build(&vs, 6, HeadConfig::scalar(vec![8]));
        let feat = Tensor::randn(&[2, 5, 6], (Kind::Float, Device::Cpu));
        let dist = head.forward(&feat);
        let target = Tensor::zeros(&[2, 5, 1], (Kind::Float, Device::Cpu));
        assert_eq!(dist.log_prob(&target).size(), vec![2, 5]);
    }

    #[test]
    fn test_decoder_head_event_shape() {
        tch::manual_seed(0);
        let vs = nn::VarStore::new(Device::Cpu);
        let config = HeadConfig::new(
            vec![8],
            super::HeadDistKind::Gaussian,
            vec![3, 4],
        );
        let head = Head::build(&vs, 6, config);
        let feat = Tensor::randn(&[2, 5, 6], (Kind::Float, Device::Cpu));
        let dist = head.forward(&feat);
        assert_eq!(dist.mode().size(), vec![2, 5, 3, 4]);
        let target = Tensor::zeros(&[2, 5, 3, 4], (Kind::Float, Device::Cpu));
        assert_eq!(dist.log_prob(&target).size(), vec![2, 5]);
    }
}
