//! Backend-agnostic support types for the dreamer workspace.
//!
//! This crate carries the pieces of the learning core that do not depend on a
//! tensor backend: the [`Record`](record::Record) container used to report
//! training metrics, and the crate-wide error type.
pub mod error;
pub mod record;

pub use error::DreamerError;
