//! Utilities.
use crate::model::ModelBase;
use dreamer_core::record::{Record, RecordValue};
use log::trace;
use tch::{Kind, Tensor};

/// Apply soft update on variables.
///
/// Variables are identified by their names.
///
/// dest = tau * src + (1.0 - tau) * dest
pub fn track<M: ModelBase>(dest: &mut M, src: &M, tau: f64) {
    let src = &src.get_var_store().variables();
    let dest = &mut dest.get_var_store_mut().variables();
    debug_assert_eq!(src.len(), dest.len());

    let names = src.keys();
    tch::no_grad(|| {
        for name in names {
            let src = src.get(name).unwrap();
            let dest = dest.get_mut(name).unwrap();
            dest.copy_(&(tau * src + (1.0 - tau) * &*dest));
        }
    });
    trace!("soft update");
}

/// Interface for handling output dimensions.
pub trait OutDim {
    /// Returns the output dimension.
    fn get_out_dim(&self) -> i64;

    /// Sets the output dimension.
    fn set_out_dim(&mut self, v: i64);
}

/// Summary statistics of a tensor for metrics records.
///
/// Produces `{name}_mean`, `{name}_std`, `{name}_min` and `{name}_max`.
pub fn tensorstats(t: &Tensor, name: &str) -> Record {
    let t = t.detach().to_kind(Kind::Float);
    Record::from_slice(&[
        (
            format!("{}_mean", name),
            RecordValue::Scalar(t.mean(Kind::Float).double_value(&[]) as f32),
        ),
        (
            format!("{}_std", name),
            RecordValue::Scalar(t.std(false).double_value(&[]) as f32),
        ),
        (
            format!("{}_min", name),
            RecordValue::Scalar(t.min().double_value(&[]) as f32),
        ),
        (
            format!("{}_max", name),
            RecordValue::Scalar(t.max().double_value(&[]) as f32),
        ),
    ])
}

/// Reshapes `mask` of shape `(batch,)` so it broadcasts against `like`,
/// appending singleton dimensions up to the rank of `like`.
pub fn broadcast_mask(mask: &Tensor, like: &Tensor) -> Tensor {
    let mut shape = mask.size();
    while shape.len() < like.size().len() {
        shape.push(1);
    }
    mask.reshape(shape.as_slice())
}

#[cfg(test)]
mod tests {
    use super::broadcast_mask;
    use tch::{Device, Kind, Tensor};

    #[test]
    fn test_broadcast_mask() {
        let mask = Tensor::from_slice(&[1f32, 0., 1.]);
        let like = Tensor::zeros(&[3, 4, 5], (Kind::Float, Device::Cpu));
        let m = broadcast_mask(&mask, &like);
        assert_eq!(m.size(), vec![3, 1, 1]);
        let masked = &like + &m;
        assert_eq!(masked.size(), vec![3, 4, 5]);
    }
}
