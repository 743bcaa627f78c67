//! Filesystem operations exposed by the control plane.
//!
//! The filesystem is shared across sessions by design; these operations act
//! on absolute container paths. Errors classify onto the filesystem taxonomy
//! via [`crate::error_handling::types::FileError::from_io`].

pub mod operations;
pub mod stream_read;

pub use operations::{Encoding, ExistsResult, FsEntry, ReadResult};
pub use stream_read::FileStreamEvent;
