//! Server-sent-events transport.
//!
//! Every event on the wire is a single `data: <one-line JSON>` block; a
//! literal `data: [DONE]` block marks logical end-of-stream. [`transport`]
//! holds the encoder, the chunk-tolerant parser, and the warp reply adapter;
//! [`hub`] tracks live sinks so sandbox teardown can end them.

pub mod hub;
pub mod transport;

pub use hub::SseHub;
pub use transport::{SseFrame, SseParser, DONE_SENTINEL};
