//! Records for reporting training metrics.
use crate::error::DreamerError;
use chrono::prelude::{DateTime, Local};
use std::{
    collections::{
        hash_map::{IntoIter, Iter, Keys},
        HashMap,
    },
    convert::Into,
    iter::IntoIterator,
};

/// Represents possible types of values in a [`Record`].
#[derive(Debug, Clone)]
pub enum RecordValue {
    /// Scalar, e.g., metrics.
    Scalar(f32),

    /// DateTime.
    DateTime(DateTime<Local>),

    /// A 1-dimensional array.
    Array1(Vec<f32>),

    /// String.
    String(String),
}

/// Represents a record, a collection of named [`RecordValue`]s.
///
/// Every training step of the learning core returns one of these, carrying
/// losses, entropies and whatever else the step measured.
#[derive(Debug)]
pub struct Record(HashMap<String, RecordValue>);

impl Record {
    /// Construct empty record.
    pub fn empty() -> Self {
        Self { 0: HashMap::new() }
    }

    /// Create `Record` from slice of `(Into<String>, RecordValue)`.
    pub fn from_slice<K: Into<String> + Clone>(s: &[(K, RecordValue)]) -> Self {
        Self(
            s.iter()
                .map(|(k, v)| (k.clone().into(), v.clone()))
                .collect(),
        )
    }

    /// Create `Record` containing a single scalar value.
    pub fn from_scalar(name: impl Into<String>, value: f32) -> Self {
        Self {
            0: HashMap::from([(name.into(), RecordValue::Scalar(value))]),
        }
    }

    /// Get keys.
    pub fn keys(&self) -> Keys<String, RecordValue> {
        self.0.keys()
    }

    /// Insert a key-value pair into the record.
    pub fn insert(&mut self, k: impl Into<String>, v: RecordValue) {
        self.0.insert(k.into(), v);
    }

    /// Return an iterator over key-value pairs in the record.
    pub fn iter(&self) -> Iter<'_, String, RecordValue> {
        self.0.iter()
    }

    /// Return an iterator consuming the record.
    pub fn into_iter_in_record(self) -> IntoIter<String, RecordValue> {
        self.0.into_iter()
    }

    /// Get the value of the given key.
    pub fn get(&self, k: &str) -> Option<&RecordValue> {
        self.0.get(k)
    }

    /// Merge records, the second record overwrites the first on key collision.
    pub fn merge(self, record: Record) -> Self {
        Record(self.0.into_iter().chain(record.0).collect())
    }

    /// Merge a record in place.
    pub fn merge_inplace(&mut self, record: Record) {
        for (k, v) in record.iter() {
            self.0.insert(k.clone(), v.clone());
        }
    }

    /// Get scalar value.
    pub fn get_scalar(&self, k: &str) -> Result<f32, DreamerError> {
        if let Some(v) = self.0.get(k) {
            match v {
                RecordValue::Scalar(v) => Ok(*v as _),
                _ => Err(DreamerError::RecordValueTypeError("Scalar".to_string())),
            }
        } else {
            Err(DreamerError::RecordKeyError(k.to_string()))
        }
    }

    /// Get Array1 value.
    pub fn get_array1(&self, k: &str) -> Result<Vec<f32>, DreamerError> {
        if let Some(v) = self.0.get(k) {
            match v {
                RecordValue::Array1(v) => Ok(v.clone()),
                _ => Err(DreamerError::RecordValueTypeError("Array1".to_string())),
            }
        } else {
            Err(DreamerError::RecordKeyError(k.to_string()))
        }
    }

    /// Get String value.
    pub fn get_string(&self, k: &str) -> Result<String, DreamerError> {
        if let Some(v) = self.0.get(k) {
            match v {
                RecordValue::String(s) => Ok(s.clone()),
                _ => Err(DreamerError::RecordValueTypeError("String".to_string())),
            }
        } else {
            Err(DreamerError::RecordKeyError(k.to_string()))
        }
    }

    /// Returns true if the record is empty.
    pub fn is_empty(&self) -> bool {
        self.0.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::{Record, RecordValue};

    #[test]
    fn test_merge_overwrites() {
        let mut r1 = Record::from_scalar("loss", 0.5);
        let r2 = Record::from_slice(&[
            ("loss", RecordValue::Scalar(0.25)),
            ("kl", RecordValue::Scalar(1.0)),
        ]);
        r1.merge_inplace(r2);
        assert_eq!(r1.get_scalar("loss").unwrap(), 0.25);
        assert_eq!(r1.get_scalar("kl").unwrap(), 1.0);
    }

    #[test]
    fn test_type_mismatch() {
        let r = Record::from_slice(&[("name", RecordValue::String("actor".into()))]);
        assert!(r.get_scalar("name").is_err());
        assert!(r.get_scalar("missing").is_err());
    }
}
