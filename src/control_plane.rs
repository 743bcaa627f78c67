//! The in-sandbox HTTP control plane.
//!
//! One warp server on the reserved control port. Every endpoint resolves the
//! sandbox from the `X-Sandbox-Id` header (creating it lazily), renews the
//! activity deadline, and dispatches to the owning manager. Requests carrying
//! a proxy-port header are forwarded to the exposed user port instead.

pub mod handlers;
pub mod responses;
pub mod routes;
pub mod server;

pub use server::{AppState, ControlPlane};
