use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, watch};
use uuid::Uuid;

use crate::error_handling::types::InterpreterError;
use crate::interpreter::events::{InterpreterEvent, KernelLine};
use crate::interpreter::{runners, Language};

type Executions = Arc<Mutex<HashMap<String, mpsc::UnboundedSender<InterpreterEvent>>>>;

/// One long-lived language runtime child.
///
/// The kernel is "ready" once its runner has printed the boot event; run
/// requests before that fail with the retryable not-ready error. Events are
/// routed to the requesting execution by id; `execution_complete` closes the
/// routing entry.
pub struct Kernel {
    language: Language,
    stdin: tokio::sync::Mutex<ChildStdin>,
    ready: watch::Receiver<bool>,
    executions: Executions,
    pid: Option<u32>,
    _runner_file: tempfile::TempPath,
}

impl Kernel {
    /// Writes the runner script and spawns the interpreter on it.
    pub fn spawn(
        language: Language,
        cwd: &Path,
        env: &HashMap<String, String>,
    ) -> Result<Kernel, InterpreterError> {
        let source = match language {
            Language::Python => runners::PYTHON_RUNNER,
            Language::Javascript => runners::JAVASCRIPT_RUNNER,
            Language::R => runners::R_RUNNER,
        };

        let mut runner = tempfile::Builder::new()
            .prefix("ruche-kernel-")
            .suffix(language.runner_suffix())
            .tempfile()
            .map_err(|e| InterpreterError::KernelDied(format!("runner file: {}", e)))?;
        std::io::Write::write_all(&mut runner, source.as_bytes())
            .map_err(|e| InterpreterError::KernelDied(format!("runner file: {}", e)))?;
        let runner_path = runner.into_temp_path();

        if !cwd.exists() {
            std::fs::create_dir_all(cwd)
                .map_err(|e| InterpreterError::KernelDied(format!("kernel cwd: {}", e)))?;
        }

        let (program, args) = language.program();
        let mut child = Command::new(program)
            .args(args)
            .arg(&runner_path)
            .envs(env)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                InterpreterError::KernelDied(format!("failed to spawn {}: {}", program, e))
            })?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| InterpreterError::KernelDied("kernel stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| InterpreterError::KernelDied("kernel stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| InterpreterError::KernelDied("kernel stderr not piped".to_string()))?;

        let (ready_tx, ready_rx) = watch::channel(false);
        let executions: Executions = Arc::new(Mutex::new(HashMap::new()));

        // Kernel stderr carries interpreter noise (warnings, prompts); the
        // runner sends real command stderr as typed events.
        {
            let mut reader = BufReader::new(stderr).lines();
            let lang = language;
            tokio::spawn(async move {
                while let Ok(Some(line)) = reader.next_line().await {
                    debug!("[kernel:{}][stderr] {}", lang, line);
                }
            });
        }

        {
            let executions = executions.clone();
            let lang = language;
            tokio::spawn(async move {
                let mut reader = BufReader::new(stdout).lines();
                while let Ok(Some(line)) = reader.next_line().await {
                    let trimmed = line.trim();
                    if trimmed.is_empty() {
                        continue;
                    }
                    let parsed: Result<KernelLine, _> = serde_json::from_str(trimmed);
                    let parsed = match parsed {
                        Ok(parsed) => parsed,
                        Err(err) => {
                            debug!("[kernel:{}] unparsable line ({}): {}", lang, err, trimmed);
                            continue;
                        }
                    };

                    match (&parsed.event, &parsed.id) {
                        (InterpreterEvent::Ready, _) => {
                            info!("Kernel {} is ready", lang);
                            let _ = ready_tx.send(true);
                        }
                        (event, Some(id)) => {
                            let is_final =
                                matches!(event, InterpreterEvent::ExecutionComplete { .. });
                            let sender = {
                                let mut executions = executions.lock().unwrap();
                                if is_final {
                                    executions.remove(id)
                                } else {
                                    executions.get(id).cloned()
                                }
                            };
                            match sender {
                                Some(tx) => {
                                    let _ = tx.send(parsed.event);
                                }
                                None => debug!(
                                    "[kernel:{}] event for unknown execution {}",
                                    lang, id
                                ),
                            }
                        }
                        (_, None) => {
                            debug!("[kernel:{}] event without execution id", lang);
                        }
                    }
                }

                // EOF: the interpreter died. Dropping the senders ends every
                // in-flight execution stream.
                warn!("Kernel {} exited", lang);
                let _ = child.wait().await;
                let _ = ready_tx.send(false);
                executions.lock().unwrap().clear();
            });
        }

        Ok(Kernel {
            language,
            stdin: tokio::sync::Mutex::new(stdin),
            ready: ready_rx,
            executions,
            pid,
            _runner_file: runner_path,
        })
    }

    pub fn is_ready(&self) -> bool {
        *self.ready.borrow()
    }

    /// Submits `code` and returns the raw event stream for this execution.
    pub async fn run(
        &self,
        code: &str,
    ) -> Result<mpsc::UnboundedReceiver<InterpreterEvent>, InterpreterError> {
        if !self.is_ready() {
            return Err(InterpreterError::NotReady(self.language.to_string()));
        }

        let execution_id = Uuid::new_v4().to_string();
        let (tx, rx) = mpsc::unbounded_channel();
        self.executions
            .lock()
            .unwrap()
            .insert(execution_id.clone(), tx);

        let request = runners::encode_request(self.language, &execution_id, code);
        let mut stdin = self.stdin.lock().await;
        if let Err(err) = stdin.write_all(request.as_bytes()).await {
            self.executions.lock().unwrap().remove(&execution_id);
            return Err(InterpreterError::KernelDied(format!(
                "{}: {}",
                self.language, err
            )));
        }
        if let Err(err) = stdin.flush().await {
            self.executions.lock().unwrap().remove(&execution_id);
            return Err(InterpreterError::KernelDied(format!(
                "{}: {}",
                self.language, err
            )));
        }

        debug!("Submitted execution {} to {}", execution_id, self.language);
        Ok(rx)
    }

    /// Terminates the kernel child.
    pub fn shutdown(&self) {
        if let Some(pid) = self.pid {
            debug!("Stopping kernel {} (pid {})", self.language, pid);
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    /// Waits until the runner reports ready or `timeout` elapses.
    pub async fn wait_ready(&self, timeout: std::time::Duration) -> bool {
        let mut ready = self.ready.clone();
        tokio::time::timeout(timeout, async {
            while !*ready.borrow() {
                if ready.changed().await.is_err() {
                    return false;
                }
            }
            true
        })
        .await
        .unwrap_or(false)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    pub(crate) fn language_available(language: Language) -> bool {
        let (program, _) = language.program();
        std::process::Command::new(program)
            .arg("--version")
            .output()
            .map(|o| o.status.success())
            .unwrap_or(false)
    }

    async fn collect_events(
        mut rx: mpsc::UnboundedReceiver<InterpreterEvent>,
    ) -> Vec<InterpreterEvent> {
        let mut events = Vec::new();
        loop {
            match tokio::time::timeout(Duration::from_secs(10), rx.recv()).await {
                Ok(Some(event)) => {
                    let done = matches!(event, InterpreterEvent::ExecutionComplete { .. });
                    events.push(event);
                    if done {
                        break;
                    }
                }
                _ => break,
            }
        }
        events
    }

    #[tokio::test]
    async fn python_kernel_persists_bindings() {
        if !language_available(Language::Python) {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let kernel = Kernel::spawn(Language::Python, dir.path(), &HashMap::new()).unwrap();
        assert!(kernel.wait_ready(Duration::from_secs(15)).await);

        let events = collect_events(kernel.run("x = 42").await.unwrap()).await;
        assert!(events
            .iter()
            .any(|e| matches!(e, InterpreterEvent::ExecutionComplete { .. })));

        let events = collect_events(kernel.run("print(x + 1)").await.unwrap()).await;
        let stdout: String = events
            .iter()
            .filter_map(|e| match e {
                InterpreterEvent::Stdout { text, .. } => Some(text.as_str()),
                _ => None,
            })
            .collect();
        assert!(stdout.contains("43"));
        kernel.shutdown();
    }

    #[tokio::test]
    async fn python_kernel_reports_name_errors() {
        if !language_available(Language::Python) {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let kernel = Kernel::spawn(Language::Python, dir.path(), &HashMap::new()).unwrap();
        assert!(kernel.wait_ready(Duration::from_secs(15)).await);

        let events = collect_events(kernel.run("print(nope)").await.unwrap()).await;
        let error = events.iter().find_map(|e| match e {
            InterpreterEvent::Error { ename, .. } => Some(ename.clone()),
            _ => None,
        });
        assert_eq!(error.as_deref(), Some("NameError"));
        kernel.shutdown();
    }

    #[tokio::test]
    async fn python_kernel_emits_trailing_expression_as_result() {
        if !language_available(Language::Python) {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let kernel = Kernel::spawn(Language::Python, dir.path(), &HashMap::new()).unwrap();
        assert!(kernel.wait_ready(Duration::from_secs(15)).await);

        let events = collect_events(kernel.run("2 + 2").await.unwrap()).await;
        let result = events.iter().find_map(|e| match e {
            InterpreterEvent::Result { payload } => payload.text.clone(),
            _ => None,
        });
        assert_eq!(result.as_deref(), Some("4"));
        kernel.shutdown();
    }

    #[tokio::test]
    async fn run_before_ready_is_not_ready() {
        if !language_available(Language::Python) {
            return;
        }
        let dir = tempfile::TempDir::new().unwrap();
        let kernel = Kernel::spawn(Language::Python, dir.path(), &HashMap::new()).unwrap();
        // No wait: boot takes longer than this call.
        let err = kernel.run("1").await;
        if !kernel.is_ready() {
            assert!(matches!(err, Err(InterpreterError::NotReady(_))));
        }
        kernel.shutdown();
    }
}
