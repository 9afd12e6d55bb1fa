//! Actor-critic trained on imagined rollouts.
mod base;
mod config;
pub use base::ImagBehavior;
pub use config::{ImagBehaviorConfig, ImagGradient};
