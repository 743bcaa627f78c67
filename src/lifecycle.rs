//! Sandbox lifecycle: the per-id singleton owning the managers, the
//! activity deadline that drives sleep-on-inactivity, the keep-alive ticker,
//! and the small persisted metadata KV.

pub mod metadata;
pub mod registry;
pub mod sandbox;

pub use metadata::{MetadataStore, SandboxMetadata};
pub use registry::SandboxRegistry;
pub use sandbox::Sandbox;
