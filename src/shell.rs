//! Persistent shell supervision and the file-based command IPC.
//!
//! A session drives exactly one long-lived `bash --norc` child. Commands are
//! dispatched by writing a generated script to the shell's stdin; the script
//! sources the user command from a temp file with stdout/stderr redirected to
//! per-command temp files, records the exit code in a fourth file, and echoes
//! a completion marker on the shell's own stdout. Decoupling output from the
//! shell's stdout keeps the marker channel clean no matter what the command
//! prints.

pub mod shell_host;
pub mod temp_files;

pub use shell_host::{CompletionMarker, ShellHost, ShellLiveness};
pub use temp_files::{CommandFiles, TempFileStore};
