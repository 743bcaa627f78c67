//! Session management core module.
//!
//! A session is a named bundle of shell state inside one sandbox: a
//! persistent shell child, the environment and working directory it has
//! accumulated, and the commands currently in flight against it.

use serde::Serialize;

pub mod pending;
pub mod session;
pub mod session_manager;

pub use session::{ExecResult, ExecStreamEvent, Session};
pub use session_manager::SessionManager;

/// Per-session lifecycle state.
///
/// Transitions are total: `Initializing → Ready → Terminated`, never
/// backwards. Operations against a terminated session fail with
/// `SESSION_TERMINATED`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionState {
    Initializing,
    Ready,
    Terminated,
}
