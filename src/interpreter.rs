//! Per-language code interpreter contexts.
//!
//! Each context owns a long-lived kernel child (python3 / node / Rscript)
//! running an embedded runner script. The runner keeps the persistent
//! namespace, reads requests from stdin, and emits typed execution events as
//! JSON lines on stdout. Bindings persist across executions within one
//! context; contexts never share state.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

pub mod context;
pub mod events;
pub mod kernel;
pub mod manager;
pub mod runners;

pub use context::InterpreterContext;
pub use events::{InterpreterEvent, RichResult, RunCodeResult};
pub use manager::InterpreterManager;

/// Supported kernel languages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Language {
    Python,
    Javascript,
    R,
}

impl Language {
    pub fn as_str(&self) -> &'static str {
        match self {
            Language::Python => "python",
            Language::Javascript => "javascript",
            Language::R => "r",
        }
    }

    /// Interpreter binary and fixed arguments for the runner.
    pub fn program(&self) -> (&'static str, &'static [&'static str]) {
        match self {
            Language::Python => ("python3", &["-u"]),
            Language::Javascript => ("node", &[]),
            Language::R => ("Rscript", &["--vanilla"]),
        }
    }

    pub fn runner_suffix(&self) -> &'static str {
        match self {
            Language::Python => ".py",
            Language::Javascript => ".js",
            Language::R => ".R",
        }
    }
}

impl FromStr for Language {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "python" | "python3" | "py" => Ok(Language::Python),
            "javascript" | "js" | "node" => Ok(Language::Javascript),
            "r" => Ok(Language::R),
            other => Err(other.to_string()),
        }
    }
}

impl std::fmt::Display for Language {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn language_aliases_parse() {
        assert_eq!("python".parse::<Language>().unwrap(), Language::Python);
        assert_eq!("js".parse::<Language>().unwrap(), Language::Javascript);
        assert_eq!("R".parse::<Language>().unwrap(), Language::R);
        assert!("cobol".parse::<Language>().is_err());
    }
}
