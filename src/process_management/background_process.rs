use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;

use crate::error_handling::types::ProcessError;

/// Lifecycle of a background process. Transitions only
/// `running → {completed | killed | failed}`; terminal states are final.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ProcessStatus {
    Running,
    Completed,
    Killed,
    Failed,
}

impl ProcessStatus {
    pub fn is_terminal(&self) -> bool {
        *self != ProcessStatus::Running
    }
}

/// Wire snapshot of a process.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ProcessInfo {
    pub id: String,
    pub status: ProcessStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    pub command: String,
    pub start_time: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub end_time: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub exit_code: Option<i32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub session_id: Option<String>,
}

/// Log streaming events, in wire shape.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ProcessLogEvent {
    Stdout { data: String, timestamp: String },
    Stderr { data: String, timestamp: String },
    Exit { code: Option<i32>, timestamp: String },
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// A detached long-running child with captured logs.
#[derive(Debug)]
pub struct BackgroundProcess {
    pub id: String,
    pub command: String,
    pub pid: Option<u32>,
    pub session_id: Option<String>,
    pub start_time: DateTime<Utc>,
    status: Mutex<ProcessStatus>,
    end_time: Mutex<Option<DateTime<Utc>>>,
    exit_code: Arc<Mutex<Option<i32>>>,
    stdout: Arc<Mutex<Vec<u8>>>,
    stderr: Arc<Mutex<Vec<u8>>>,
    kill_requested: AtomicBool,
    done: watch::Receiver<bool>,
}

impl BackgroundProcess {
    /// Spawns `command` under `bash -c` with captured stdio.
    pub fn spawn(
        id: &str,
        command: &str,
        session_id: Option<String>,
    ) -> Result<Arc<BackgroundProcess>, ProcessError> {
        let mut child = Command::new("bash")
            .arg("-c")
            .arg(command)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .map_err(|e| ProcessError::SpawnFailed(e.to_string()))?;

        let pid = child.id();
        let stdout_buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let stderr_buf: Arc<Mutex<Vec<u8>>> = Arc::new(Mutex::new(Vec::new()));
        let (done_tx, done_rx) = watch::channel(false);

        let stdout_pipe = child.stdout.take();
        let stderr_pipe = child.stderr.take();

        let process = Arc::new(BackgroundProcess {
            id: id.to_string(),
            command: command.to_string(),
            pid,
            session_id,
            start_time: Utc::now(),
            status: Mutex::new(ProcessStatus::Running),
            end_time: Mutex::new(None),
            exit_code: Arc::new(Mutex::new(None)),
            stdout: stdout_buf.clone(),
            stderr: stderr_buf.clone(),
            kill_requested: AtomicBool::new(false),
            done: done_rx,
        });

        let stdout_reader = spawn_capture(stdout_pipe, stdout_buf);
        let stderr_reader = spawn_capture(stderr_pipe, stderr_buf);

        // Waiter: reap the child, let the capture tasks drain the pipes,
        // then publish the terminal state.
        {
            let process = process.clone();
            tokio::spawn(async move {
                let exit = child.wait().await;
                let _ = stdout_reader.await;
                let _ = stderr_reader.await;

                let code = match exit {
                    Ok(status) => status.code(),
                    Err(err) => {
                        warn!("Failed to reap process {}: {}", process.id, err);
                        None
                    }
                };

                let status = if process.kill_requested.load(Ordering::SeqCst) {
                    ProcessStatus::Killed
                } else if code == Some(0) {
                    ProcessStatus::Completed
                } else {
                    ProcessStatus::Failed
                };

                *process.exit_code.lock().unwrap() = code;
                *process.end_time.lock().unwrap() = Some(Utc::now());
                *process.status.lock().unwrap() = status;
                info!(
                    "Process {} finished with code {:?} ({:?})",
                    process.id, code, status
                );
                let _ = done_tx.send(true);
            });
        }

        debug!("Started background process {} (pid {:?})", id, pid);
        Ok(process)
    }

    pub fn status(&self) -> ProcessStatus {
        *self.status.lock().unwrap()
    }

    pub fn exit_code(&self) -> Option<i32> {
        *self.exit_code.lock().unwrap()
    }

    /// Resolves when the process reaches a terminal state.
    pub async fn wait_done(&self) {
        let mut done = self.done.clone();
        while !*done.borrow() {
            if done.changed().await.is_err() {
                break;
            }
        }
    }

    pub fn info(&self) -> ProcessInfo {
        ProcessInfo {
            id: self.id.clone(),
            status: self.status(),
            pid: self.pid,
            command: self.command.clone(),
            start_time: self.start_time.to_rfc3339_opts(SecondsFormat::Millis, true),
            end_time: self
                .end_time
                .lock()
                .unwrap()
                .map(|t| t.to_rfc3339_opts(SecondsFormat::Millis, true)),
            exit_code: self.exit_code(),
            session_id: self.session_id.clone(),
        }
    }

    /// Snapshot of the captured logs so far.
    pub fn logs(&self) -> (String, String) {
        let stdout = String::from_utf8_lossy(&self.stdout.lock().unwrap()).into_owned();
        let stderr = String::from_utf8_lossy(&self.stderr.lock().unwrap()).into_owned();
        (stdout, stderr)
    }

    /// Requests termination with SIGTERM. Idempotent once terminal.
    pub fn kill(&self) {
        if self.status().is_terminal() {
            debug!("Kill on terminal process {} is a no-op", self.id);
            return;
        }
        self.kill_requested.store(true, Ordering::SeqCst);
        if let Some(pid) = self.pid {
            info!("Sending SIGTERM to process {} (pid {})", self.id, pid);
            unsafe {
                libc::kill(pid as i32, libc::SIGTERM);
            }
        }
    }

    /// Follows the log buffers with per-subscriber cursors, emitting only
    /// new bytes per poll, and ends with exactly one `exit` event.
    pub fn stream_logs(&self) -> tokio::sync::mpsc::Receiver<ProcessLogEvent> {
        let (tx, rx) = tokio::sync::mpsc::channel(256);
        let stdout = self.stdout.clone();
        let stderr = self.stderr.clone();
        let exit_code = self.exit_code.clone();
        let mut done = self.done.clone();
        let process_id = self.id.clone();

        tokio::spawn(async move {
            let mut out_pos = 0usize;
            let mut err_pos = 0usize;
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(100));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

            loop {
                let finished = *done.borrow();
                if pump_buffers(&stdout, &stderr, &mut out_pos, &mut err_pos, &tx).await {
                    debug!("Log stream consumer for {} went away", process_id);
                    return;
                }
                if finished {
                    break;
                }
                tokio::select! {
                    _ = ticker.tick() => {}
                    changed = done.changed() => {
                        if changed.is_err() {
                            break;
                        }
                    }
                }
            }

            // Final drain, then the terminal event.
            let _ = pump_buffers(&stdout, &stderr, &mut out_pos, &mut err_pos, &tx).await;
            let code = *exit_code.lock().unwrap();
            let _ = tx
                .send(ProcessLogEvent::Exit {
                    code,
                    timestamp: now_iso(),
                })
                .await;
        });

        rx
    }
}

fn spawn_capture(
    pipe: Option<impl tokio::io::AsyncRead + Unpin + Send + 'static>,
    buffer: Arc<Mutex<Vec<u8>>>,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let Some(mut pipe) = pipe else {
            return;
        };
        let mut buf = [0u8; 4096];
        loop {
            match pipe.read(&mut buf).await {
                Ok(0) | Err(_) => break,
                Ok(n) => buffer.lock().unwrap().extend_from_slice(&buf[..n]),
            }
        }
    })
}

/// Emits bytes appended since the cursors. Returns `true` when the consumer
/// is gone.
async fn pump_buffers(
    stdout: &Arc<Mutex<Vec<u8>>>,
    stderr: &Arc<Mutex<Vec<u8>>>,
    out_pos: &mut usize,
    err_pos: &mut usize,
    tx: &tokio::sync::mpsc::Sender<ProcessLogEvent>,
) -> bool {
    let out_chunk = {
        let buf = stdout.lock().unwrap();
        if buf.len() > *out_pos {
            let chunk = String::from_utf8_lossy(&buf[*out_pos..]).into_owned();
            *out_pos = buf.len();
            Some(chunk)
        } else {
            None
        }
    };
    if let Some(data) = out_chunk {
        if tx
            .send(ProcessLogEvent::Stdout {
                data,
                timestamp: now_iso(),
            })
            .await
            .is_err()
        {
            return true;
        }
    }

    let err_chunk = {
        let buf = stderr.lock().unwrap();
        if buf.len() > *err_pos {
            let chunk = String::from_utf8_lossy(&buf[*err_pos..]).into_owned();
            *err_pos = buf.len();
            Some(chunk)
        } else {
            None
        }
    };
    if let Some(data) = err_chunk {
        if tx
            .send(ProcessLogEvent::Stderr {
                data,
                timestamp: now_iso(),
            })
            .await
            .is_err()
        {
            return true;
        }
    }

    tx.is_closed()
}
