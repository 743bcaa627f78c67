//! Exposed-port registry and the in-container proxy.
//!
//! Exposing a port makes a user program inside the sandbox addressable
//! through the front-end router; the proxy leg here forwards HTTP requests
//! and WebSocket upgrades to `127.0.0.1:<port>`.

pub mod proxy;
pub mod registry;

pub use registry::{ExposedPortInfo, PortRegistry};
