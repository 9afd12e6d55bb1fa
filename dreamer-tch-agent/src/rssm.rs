//! Recurrent stochastic state-space model.
mod base;
mod cell;
mod config;
mod state;
pub use base::Rssm;
pub use cell::GruCell;
pub use config::RssmConfig;
pub use state::{LatentState, StochParams};
