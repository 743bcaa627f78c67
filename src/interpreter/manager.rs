use log::{debug, info, warn};
use rand::Rng;
use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, Mutex};
use uuid::Uuid;

use crate::configuration::Config;
use crate::error_handling::types::InterpreterError;
use crate::interpreter::context::{ContextInfo, InterpreterContext};
use crate::interpreter::events::{
    ExecutionErrorInfo, InterpreterEvent, RunCodeLogs, RunCodeResult,
};
use crate::interpreter::Language;

/// Not-ready retry policy: 3 tries, 1 s base doubling, up to 1 s jitter.
const NOT_READY_ATTEMPTS: u32 = 3;
const NOT_READY_BASE_MS: u64 = 1_000;
const NOT_READY_JITTER_MS: u64 = 1_000;

/// Registry of interpreter contexts for one sandbox.
pub struct InterpreterManager {
    contexts: Mutex<HashMap<String, Arc<InterpreterContext>>>,
    config: Arc<Config>,
}

impl InterpreterManager {
    pub fn new(config: Arc<Config>) -> Self {
        InterpreterManager {
            contexts: Mutex::new(HashMap::new()),
            config,
        }
    }

    /// Creates a context for `language`, spawning its kernel.
    pub async fn create_context(
        &self,
        language: &str,
        cwd: Option<PathBuf>,
        env_vars: Option<HashMap<String, String>>,
    ) -> Result<ContextInfo, InterpreterError> {
        let language = Language::from_str(language)
            .map_err(InterpreterError::InvalidLanguage)?;
        let id = format!("ctx-{}", Uuid::new_v4());
        let cwd = cwd.unwrap_or_else(|| self.config.workspace_root.clone());

        let context = InterpreterContext::create(
            &id,
            language,
            &cwd,
            &env_vars.unwrap_or_default(),
        )?;
        let info = context.info();
        self.contexts
            .lock()
            .await
            .insert(id.clone(), Arc::new(context));
        info!("Created {} context {}", language, id);
        Ok(info)
    }

    pub async fn list_contexts(&self) -> Vec<ContextInfo> {
        let mut infos: Vec<ContextInfo> = self
            .contexts
            .lock()
            .await
            .values()
            .map(|c| c.info())
            .collect();
        infos.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        infos
    }

    pub async fn delete_context(&self, id: &str) -> Result<(), InterpreterError> {
        let context = self
            .contexts
            .lock()
            .await
            .remove(id)
            .ok_or_else(|| InterpreterError::ContextNotFound(id.to_string()))?;
        context.shutdown();
        info!("Deleted context {}", id);
        Ok(())
    }

    async fn get(&self, id: &str) -> Result<Arc<InterpreterContext>, InterpreterError> {
        self.contexts
            .lock()
            .await
            .get(id)
            .cloned()
            .ok_or_else(|| InterpreterError::ContextNotFound(id.to_string()))
    }

    /// Runs `code` in the context, aggregating the event stream.
    ///
    /// User-code failures come back inside the result, not as an `Err`.
    pub async fn run_code(
        &self,
        context_id: &str,
        code: &str,
        timeout_ms: Option<u64>,
    ) -> Result<RunCodeResult, InterpreterError> {
        let events = self.start_execution(context_id, code).await?;
        let timeout_ms = timeout_ms.unwrap_or(self.config.command_timeout_ms);
        Ok(aggregate_events(events, timeout_ms).await)
    }

    /// Streaming variant: the caller drains the raw event stream.
    pub async fn run_code_stream(
        &self,
        context_id: &str,
        code: &str,
    ) -> Result<mpsc::UnboundedReceiver<InterpreterEvent>, InterpreterError> {
        self.start_execution(context_id, code).await
    }

    /// Looks up the context and submits the code, retrying a not-ready
    /// kernel with exponential backoff plus jitter. An unknown context is
    /// never retried.
    async fn start_execution(
        &self,
        context_id: &str,
        code: &str,
    ) -> Result<mpsc::UnboundedReceiver<InterpreterEvent>, InterpreterError> {
        let context = self.get(context_id).await?;
        context.touch();

        let mut attempt = 0;
        loop {
            match context.kernel().run(code).await {
                Ok(events) => return Ok(events),
                Err(InterpreterError::NotReady(lang)) => {
                    attempt += 1;
                    if attempt >= NOT_READY_ATTEMPTS {
                        warn!(
                            "Kernel for context {} still not ready after {} attempts",
                            context_id, attempt
                        );
                        return Err(InterpreterError::NotReady(lang));
                    }
                    let backoff = NOT_READY_BASE_MS * 2u64.pow(attempt - 1);
                    let jitter = rand::rng().random_range(0..NOT_READY_JITTER_MS);
                    debug!(
                        "Kernel not ready (attempt {}), retrying in {}ms",
                        attempt,
                        backoff + jitter
                    );
                    tokio::time::sleep(Duration::from_millis(backoff + jitter)).await;
                }
                Err(other) => return Err(other),
            }
        }
    }

    /// Teardown: stop every kernel and drop the registry.
    pub async fn shutdown_all(&self) {
        let mut contexts = self.contexts.lock().await;
        for (id, context) in contexts.drain() {
            debug!("Stopping kernel for context {}", id);
            context.shutdown();
        }
    }
}

/// Collects one execution's events into the aggregate result shape.
async fn aggregate_events(
    mut events: mpsc::UnboundedReceiver<InterpreterEvent>,
    timeout_ms: u64,
) -> RunCodeResult {
    let mut result = RunCodeResult {
        logs: RunCodeLogs::default(),
        error: None,
        results: Vec::new(),
    };
    let deadline = tokio::time::Instant::now() + Duration::from_millis(timeout_ms);

    loop {
        let event = match tokio::time::timeout_at(deadline, events.recv()).await {
            Ok(Some(event)) => event,
            Ok(None) => {
                // Kernel died mid-execution.
                if result.error.is_none() {
                    result.error = Some(ExecutionErrorInfo {
                        ename: "KernelError".to_string(),
                        evalue: "interpreter exited before completing execution".to_string(),
                        traceback: Vec::new(),
                    });
                }
                break;
            }
            Err(_) => {
                result.error = Some(ExecutionErrorInfo {
                    ename: "TimeoutError".to_string(),
                    evalue: format!("execution timed out after {}ms", timeout_ms),
                    traceback: Vec::new(),
                });
                break;
            }
        };

        match event {
            InterpreterEvent::Stdout { text, .. } => result.logs.stdout.push(text),
            InterpreterEvent::Stderr { text, .. } => result.logs.stderr.push(text),
            InterpreterEvent::Result { payload } => result.results.push(payload),
            InterpreterEvent::Error {
                ename,
                evalue,
                traceback,
            } => {
                result.error = Some(ExecutionErrorInfo {
                    ename,
                    evalue,
                    traceback,
                });
            }
            InterpreterEvent::ExecutionComplete { .. } => break,
            InterpreterEvent::Ready => {}
        }
    }

    result
}

#[cfg(test)]
mod tests {
    use super::*;

    fn python_available() -> bool {
        std::process::Command::new("python3")
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    fn manager_for(dir: &tempfile::TempDir) -> InterpreterManager {
        let mut config = Config::default();
        config.workspace_root = dir.path().to_path_buf();
        InterpreterManager::new(Arc::new(config))
    }

    #[tokio::test]
    async fn invalid_language_is_rejected() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = manager_for(&dir);
        let err = manager.create_context("fortran", None, None).await;
        assert!(matches!(err, Err(InterpreterError::InvalidLanguage(_))));
    }

    #[tokio::test]
    async fn unknown_context_is_not_found_and_not_retried() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = manager_for(&dir);
        let started = std::time::Instant::now();
        let err = manager.run_code("ctx-missing", "1", None).await;
        assert!(matches!(err, Err(InterpreterError::ContextNotFound(_))));
        // No backoff sleeps on the lookup failure path.
        assert!(started.elapsed() < Duration::from_millis(500));
    }

    #[tokio::test]
    async fn state_persists_within_a_context_but_not_across() {
        if !python_available() {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let manager = manager_for(&dir);

        let first = manager.create_context("python", None, None).await.unwrap();
        let second = manager.create_context("python", None, None).await.unwrap();

        let assign = manager.run_code(&first.id, "x = 42", None).await.unwrap();
        assert!(assign.error.is_none());

        let read_back = manager
            .run_code(&first.id, "print(x + 1)", None)
            .await
            .unwrap();
        let stdout = read_back.logs.stdout.join("");
        assert!(stdout.contains("43"));

        let isolated = manager
            .run_code(&second.id, "print(x)", None)
            .await
            .unwrap();
        let error = isolated.error.expect("x must be unbound in second context");
        assert_eq!(error.ename, "NameError");

        manager.shutdown_all().await;
    }

    #[tokio::test]
    async fn delete_context_then_lookup_fails() {
        if !python_available() {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let manager = manager_for(&dir);

        let ctx = manager.create_context("python", None, None).await.unwrap();
        assert_eq!(manager.list_contexts().await.len(), 1);

        manager.delete_context(&ctx.id).await.unwrap();
        assert!(manager.list_contexts().await.is_empty());
        assert!(matches!(
            manager.delete_context(&ctx.id).await,
            Err(InterpreterError::ContextNotFound(_))
        ));
    }
}
