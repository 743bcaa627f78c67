//! Error handling module root.
//!
//! Every fallible domain has its own error enum in [`types`]; the HTTP layer
//! converts any of them into an [`types::ApiError`] carrying the stable wire
//! code and status.

pub mod types;

pub use types::*;
