//! Model-free actor-critic trained on replayed trajectories.
mod base;
mod config;
pub use base::MfBehavior;
pub use config::{MfBehaviorConfig, MfGradient};
