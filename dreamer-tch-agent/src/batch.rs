//! In-memory trajectory batch contract.
use dreamer_core::DreamerError;
use std::collections::HashMap;
use tch::Tensor;

/// A batch of trajectory segments keyed by field name.
///
/// Each value is one tensor whose first two dimensions are `(batch, time)`
/// and match across keys. The learning core requires `action`, `reward`,
/// `discount`, `is_first` and `is_terminal`, plus at least one observation
/// modality (e.g. `image` or `obs`). Missing required keys are programmer
/// errors, not transient failures.
pub struct Batch(HashMap<String, Tensor>);

impl Batch {
    pub fn new() -> Self {
        Self(HashMap::new())
    }

    pub fn from_pairs(pairs: Vec<(&str, Tensor)>) -> Self {
        Self(pairs.into_iter().map(|(k, v)| (k.to_string(), v)).collect())
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Tensor) {
        self.0.insert(key.into(), value);
    }

    pub fn get(&self, key: &str) -> Option<&Tensor> {
        self.0.get(key)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    /// Returns the tensor under `key`, or the missing-key error.
    pub fn require(&self, key: &str) -> Result<&Tensor, DreamerError> {
        self.0
            .get(key)
            .ok_or_else(|| DreamerError::MissingBatchKey(key.to_string()))
    }

    /// Removes and returns the tensor under `key`.
    pub fn remove(&mut self, key: &str) -> Result<Tensor, DreamerError> {
        self.0
            .remove(key)
            .ok_or_else(|| DreamerError::MissingBatchKey(key.to_string()))
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &Tensor)> {
        self.0.iter()
    }

    /// `(batch, time)` leading dimensions, taken from any entry.
    pub fn leading_dims(&self) -> (i64, i64) {
        let t = self.0.values().next().expect("batch is not empty");
        let size = t.size();
        (size[0], size[1])
    }
}

impl Default for Batch {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::Batch;
    use dreamer_core::DreamerError;
    use tch::{Device, Kind, Tensor};

    #[test]
    fn test_require_missing_key() {
        let batch = Batch::from_pairs(vec![(
            "reward",
            Tensor::zeros(&[2, 3], (Kind::Float, Device::Cpu)),
        )]);
        assert!(batch.require("reward").is_ok());
        match batch.require("is_first") {
            Err(DreamerError::MissingBatchKey(k)) => assert_eq!(k, "is_first"),
            _ => panic!("expected missing-key error"),
        }
    }

    #[test]
    fn test_leading_dims() {
        let batch = Batch::from_pairs(vec![(
            "obs",
            Tensor::zeros(&[4, 8, 5], (Kind::Float, Device::Cpu)),
        )]);
        assert_eq!(batch.leading_dims(), (4, 8));
    }
}
