//! Background process registry.
//!
//! Processes started here are detached from any session: they outlive the
//! request that started them and are listed sandbox-wide. Each one captures
//! stdout/stderr into growing buffers that log readers snapshot or follow.

pub mod background_process;
pub mod process_manager;

pub use background_process::{BackgroundProcess, ProcessInfo, ProcessLogEvent, ProcessStatus};
pub use process_manager::ProcessManager;
