use chrono::{DateTime, SecondsFormat, Utc};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use crate::error_handling::types::InterpreterError;
use crate::interpreter::kernel::Kernel;
use crate::interpreter::Language;

/// Wire snapshot of a context.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ContextInfo {
    pub id: String,
    pub language: Language,
    pub cwd: String,
    pub created_at: String,
    pub last_used: String,
}

/// One interpreter context: a kernel plus its metadata.
pub struct InterpreterContext {
    pub id: String,
    pub language: Language,
    pub cwd: PathBuf,
    pub created_at: DateTime<Utc>,
    last_used: Mutex<DateTime<Utc>>,
    kernel: Kernel,
}

impl InterpreterContext {
    pub fn create(
        id: &str,
        language: Language,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> Result<InterpreterContext, InterpreterError> {
        let kernel = Kernel::spawn(language, cwd, env)?;
        let now = Utc::now();
        Ok(InterpreterContext {
            id: id.to_string(),
            language,
            cwd: cwd.to_path_buf(),
            created_at: now,
            last_used: Mutex::new(now),
            kernel,
        })
    }

    pub fn kernel(&self) -> &Kernel {
        &self.kernel
    }

    pub fn touch(&self) {
        *self.last_used.lock().unwrap() = Utc::now();
    }

    pub fn info(&self) -> ContextInfo {
        ContextInfo {
            id: self.id.clone(),
            language: self.language,
            cwd: self.cwd.display().to_string(),
            created_at: self.created_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            last_used: self
                .last_used
                .lock()
                .unwrap()
                .to_rfc3339_opts(SecondsFormat::Millis, true),
        }
    }

    pub fn shutdown(&self) {
        self.kernel.shutdown();
    }
}
