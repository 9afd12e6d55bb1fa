//! Latent world-model reinforcement learning implemented with [tch](https://crates.io/crates/tch).
//!
//! The crate provides the learning core of a model-based RL agent:
//!
//! * [`Rssm`](rssm::Rssm) — a recurrent stochastic state-space model with
//!   `observe` (filtering posterior) and `imagine` (prior rollout) protocols
//!   and a KL-balanced variational loss,
//! * [`WorldModel`](world_model::WorldModel) — encoder, dynamics and
//!   prediction heads trained jointly from replayed trajectory batches,
//! * [`ImagBehavior`](imag_behavior::ImagBehavior) — an actor-critic trained
//!   on rollouts imagined by the dynamics model,
//! * [`MfBehavior`](mf_behavior::MfBehavior) — a model-free actor with twin
//!   critics trained on replayed trajectories with a one-step noisy
//!   look-ahead through the dynamics model.
//!
//! Environment interaction, replay buffers and the outer training loop are
//! out of scope; the entry points of this crate consume in-memory trajectory
//! batches (see [`batch::Batch`]) and return [`Record`]s of metrics.
//!
//! [`Record`]: dreamer_core::record::Record
pub mod actor;
pub mod batch;
pub mod critic;
pub mod dist;
pub mod ema;
pub mod head;
pub mod imag_behavior;
pub mod mf_behavior;
mod mlp;
mod model;
mod opt;
pub mod returns;
pub mod rssm;
pub mod util;
pub mod world_model;

pub use mlp::{Mlp, MlpConfig};
pub use model::{ModelBase, SubModel};
pub use opt::{Optimizer, OptimizerConfig};

/// Device for training.
///
/// This enum is a wrapper of [`tch::Device`] with serialization support.
#[derive(Clone, Debug, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
pub enum Device {
    /// The main CPU device.
    Cpu,

    /// The main GPU device.
    Cuda(usize),
}

impl From<tch::Device> for Device {
    fn from(device: tch::Device) -> Self {
        match device {
            tch::Device::Cpu => Self::Cpu,
            tch::Device::Cuda(n) => Self::Cuda(n),
            _ => panic!("Unsupported device: {:?}", device),
        }
    }
}

impl From<Device> for tch::Device {
    fn from(device: Device) -> Self {
        match device {
            Device::Cpu => Self::Cpu,
            Device::Cuda(n) => Self::Cuda(n),
        }
    }
}
