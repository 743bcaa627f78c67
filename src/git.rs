//! Git operations exposed by the control plane.

pub mod clone;

pub use clone::{clone_repository, CloneOutcome};
