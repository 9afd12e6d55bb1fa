//! World model: encoder, latent dynamics and prediction heads.
mod base;
mod config;
pub use base::{Context, WorldModel};
pub use config::WorldModelConfig;

#[cfg(test)]
pub(crate) use base::tests;
