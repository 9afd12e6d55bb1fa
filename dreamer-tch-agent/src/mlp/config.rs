use crate::util::OutDim;
use serde::{Deserialize, Serialize};

/// Configuration of [Mlp](super::Mlp).
#[derive(Debug, Deserialize, Serialize, PartialEq, Clone)]
pub struct MlpConfig {
    pub(super) in_dim: i64,
    pub(super) units: Vec<i64>,
    pub(super) out_dim: i64,
    pub(super) layer_norm: bool,
}

impl MlpConfig {
    pub fn new(in_dim: i64, units: Vec<i64>, out_dim: i64) -> Self {
        Self {
            in_dim,
            units,
            out_dim,
            layer_norm: true,
        }
    }

    /// Disables layer normalization of hidden layers.
    pub fn without_layer_norm(mut self) -> Self {
        self.layer_norm = false;
        self
    }
}

impl OutDim for MlpConfig {
    fn get_out_dim(&self) -> i64 {
        self.out_dim
    }

    fn set_out_dim(&mut self, out_dim: i64) {
        self.out_dim = out_dim;
    }
}
