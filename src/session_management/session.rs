use chrono::{SecondsFormat, Utc};
use log::{debug, info, warn};
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error_handling::types::{CommandError, ShellError};
use crate::session_management::pending::PendingCommand;
use crate::session_management::SessionState;
use crate::shell::shell_host::{CompletionMarker, ShellHost, ShellLiveness};
use crate::shell::temp_files::{CommandFiles, TempFileStore};

/// Aggregate result of a completed command.
#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct ExecResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    pub success: bool,
}

/// Streaming exec events, in wire shape.
///
/// Guarantees: `start` is first; every `stdout`/`stderr` byte precedes the
/// terminal event; exactly one of `complete` | `error` ends the stream.
#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum ExecStreamEvent {
    Start {
        command: String,
        timestamp: String,
    },
    Stdout {
        data: String,
        timestamp: String,
    },
    Stderr {
        data: String,
        timestamp: String,
    },
    Complete {
        #[serde(rename = "exitCode")]
        exit_code: i32,
        result: ExecResult,
        timestamp: String,
    },
    Error {
        error: String,
        timestamp: String,
    },
}

fn now_iso() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

enum Outcome {
    Completed,
    TimedOut,
    ShellDied,
}

/// One shell session: a persistent shell child plus the env/cwd state it has
/// accumulated and the commands in flight against it.
pub struct Session {
    pub id: String,
    shell: Arc<ShellHost>,
    files: Arc<TempFileStore>,
    env: Mutex<HashMap<String, String>>,
    cwd: Mutex<PathBuf>,
    state: Arc<Mutex<SessionState>>,
    pending: Arc<tokio::sync::Mutex<HashMap<String, PendingCommand>>>,
    default_timeout_ms: u64,
    pub created_at: chrono::DateTime<Utc>,
}

impl Session {
    /// Spawns the session shell and wires the death watcher.
    pub async fn open(
        id: &str,
        env: HashMap<String, String>,
        cwd: &Path,
        default_timeout_ms: u64,
        files: Arc<TempFileStore>,
    ) -> Result<Arc<Session>, ShellError> {
        let state = Arc::new(Mutex::new(SessionState::Initializing));
        let shell = ShellHost::start(&env, cwd).await?;
        let pending: Arc<tokio::sync::Mutex<HashMap<String, PendingCommand>>> =
            Arc::new(tokio::sync::Mutex::new(HashMap::new()));

        *state.lock().unwrap() = SessionState::Ready;
        info!("Session {} ready (cwd {})", id, cwd.display());

        // Death watcher: a shell that exits terminates the session and
        // reclaims whatever its pending commands left on disk.
        {
            let state = state.clone();
            let pending = pending.clone();
            let mut liveness = shell.watch_liveness();
            let session_id = id.to_string();
            tokio::spawn(async move {
                while *liveness.borrow() == ShellLiveness::Alive {
                    if liveness.changed().await.is_err() {
                        break;
                    }
                }
                warn!("Session {} shell terminated unexpectedly", session_id);
                *state.lock().unwrap() = SessionState::Terminated;
                let mut pending = pending.lock().await;
                for (_, entry) in pending.drain() {
                    entry.files.cleanup();
                }
            });
        }

        Ok(Arc::new(Session {
            id: id.to_string(),
            shell,
            files,
            env: Mutex::new(env),
            cwd: Mutex::new(cwd.to_path_buf()),
            state,
            pending,
            default_timeout_ms,
            created_at: Utc::now(),
        }))
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }

    fn ensure_ready(&self) -> Result<(), CommandError> {
        match self.state() {
            SessionState::Terminated => Err(CommandError::SessionTerminated(self.id.clone())),
            _ => Ok(()),
        }
    }

    /// Runs `command` to completion or timeout.
    pub async fn exec(
        &self,
        command: &str,
        timeout_ms: Option<u64>,
    ) -> Result<ExecResult, CommandError> {
        self.ensure_ready()?;
        let timeout_ms = timeout_ms.unwrap_or(self.default_timeout_ms);
        let command_id = Uuid::new_v4().to_string();
        let files = self.files.command_files(&command_id)?;
        std::fs::write(&files.cmd, command).map_err(ShellError::from)?;

        let rx = self.shell.register_completion(&command_id);
        self.pending.lock().await.insert(
            command_id.clone(),
            PendingCommand::new(&command_id, files.clone(), timeout_ms, false),
        );

        if let Err(err) = self
            .shell
            .dispatch(&command_id, None, CompletionMarker::Done, &files)
            .await
        {
            self.pending.lock().await.remove(&command_id);
            files.cleanup();
            return Err(err.into());
        }

        let outcome = self.await_outcome(rx, &command_id, timeout_ms).await;
        self.pending.lock().await.remove(&command_id);

        match outcome {
            Outcome::Completed => {
                let result = read_result(&files).await;
                files.cleanup();
                result
            }
            Outcome::TimedOut => {
                files.cleanup();
                Err(CommandError::Timeout(timeout_ms))
            }
            Outcome::ShellDied => {
                files.cleanup();
                Err(CommandError::ShellTerminated(self.shell.exit_code()))
            }
        }
    }

    /// Starts `command` and returns the finite event stream.
    ///
    /// The driver polls the growing out/err files every 100 ms, forwarding
    /// new bytes; the poller dies with the completion, the timeout, or the
    /// consumer going away, whichever comes first.
    pub async fn exec_stream(
        &self,
        command: &str,
    ) -> Result<mpsc::Receiver<ExecStreamEvent>, CommandError> {
        self.ensure_ready()?;
        let timeout_ms = self.default_timeout_ms;
        let command_id = Uuid::new_v4().to_string();
        let files = self.files.command_files(&command_id)?;
        std::fs::write(&files.cmd, command).map_err(ShellError::from)?;

        let rx = self.shell.register_completion(&command_id);
        self.pending.lock().await.insert(
            command_id.clone(),
            PendingCommand::new(&command_id, files.clone(), timeout_ms, true),
        );

        if let Err(err) = self
            .shell
            .dispatch(&command_id, None, CompletionMarker::StreamDone, &files)
            .await
        {
            self.pending.lock().await.remove(&command_id);
            files.cleanup();
            return Err(err.into());
        }

        let (tx, events) = mpsc::channel(256);
        let _ = tx
            .send(ExecStreamEvent::Start {
                command: command.to_string(),
                timestamp: now_iso(),
            })
            .await;

        let shell = self.shell.clone();
        let pending = self.pending.clone();
        let exit_code_on_death = self.shell.clone();
        tokio::spawn(async move {
            let mut out_pos = 0u64;
            let mut err_pos = 0u64;
            let mut ticker = tokio::time::interval(std::time::Duration::from_millis(100));
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            let deadline =
                tokio::time::Instant::now() + std::time::Duration::from_millis(timeout_ms);
            let timeout_sleep = tokio::time::sleep_until(deadline);
            tokio::pin!(timeout_sleep);
            let mut rx = rx;

            let outcome = loop {
                tokio::select! {
                    res = &mut rx => {
                        break match res {
                            Ok(()) => Outcome::Completed,
                            Err(_) => Outcome::ShellDied,
                        };
                    }
                    _ = &mut timeout_sleep => {
                        if shell.cancel_completion(&command_id) {
                            break Outcome::TimedOut;
                        }
                        // The marker raced in just ahead of the deadline.
                        break Outcome::Completed;
                    }
                    _ = ticker.tick() => {
                        let aborted = pump_output(&files, &mut out_pos, &mut err_pos, &tx).await;
                        if aborted {
                            debug!("Stream consumer for {} went away", command_id);
                            shell.cancel_completion(&command_id);
                            pending.lock().await.remove(&command_id);
                            files.cleanup();
                            return;
                        }
                    }
                }
            };

            // Deliver every byte written before the terminal event.
            pump_output(&files, &mut out_pos, &mut err_pos, &tx).await;

            match outcome {
                Outcome::Completed => {
                    let event = match read_result(&files).await {
                        Ok(result) => ExecStreamEvent::Complete {
                            exit_code: result.exit_code,
                            result,
                            timestamp: now_iso(),
                        },
                        Err(err) => ExecStreamEvent::Error {
                            error: err.to_string(),
                            timestamp: now_iso(),
                        },
                    };
                    let _ = tx.send(event).await;
                }
                Outcome::TimedOut => {
                    let _ = tx
                        .send(ExecStreamEvent::Error {
                            error: CommandError::Timeout(timeout_ms).to_string(),
                            timestamp: now_iso(),
                        })
                        .await;
                }
                Outcome::ShellDied => {
                    let _ = tx
                        .send(ExecStreamEvent::Error {
                            error: CommandError::ShellTerminated(exit_code_on_death.exit_code())
                                .to_string(),
                            timestamp: now_iso(),
                        })
                        .await;
                }
            }

            pending.lock().await.remove(&command_id);
            files.cleanup();
        });

        Ok(events)
    }

    /// Applies `patch` to the session environment, durably for subsequent
    /// commands.
    pub async fn set_env(&self, patch: &HashMap<String, String>) -> Result<(), CommandError> {
        if patch.is_empty() {
            return Ok(());
        }
        let mut script = String::new();
        for (key, value) in patch {
            if !is_valid_env_name(key) {
                return Err(CommandError::ExecutionError(format!(
                    "invalid environment variable name: {}",
                    key
                )));
            }
            let quoted = shlex::try_quote(value)
                .map_err(|_| CommandError::ExecutionError(format!("unquotable value for {}", key)))?;
            script.push_str(&format!("export {}={}\n", key, quoted));
        }

        let result = self.exec(&script, None).await?;
        if result.exit_code != 0 {
            return Err(CommandError::ExecutionError(result.stderr));
        }
        self.env.lock().unwrap().extend(patch.clone());
        Ok(())
    }

    pub fn env_snapshot(&self) -> HashMap<String, String> {
        self.env.lock().unwrap().clone()
    }

    /// Asks the shell for its live working directory.
    pub async fn get_cwd(&self) -> Result<String, CommandError> {
        let result = self.exec("pwd", None).await?;
        if result.exit_code != 0 {
            return Err(CommandError::ExecutionError(result.stderr));
        }
        Ok(result.stdout.trim_end().to_string())
    }

    /// Changes the shell's working directory durably.
    pub async fn set_cwd(&self, path: &Path) -> Result<(), CommandError> {
        let quoted = quote_path(path)?;
        let result = self.exec(&format!("cd {}", quoted), None).await?;
        if result.exit_code != 0 {
            return Err(CommandError::ExecutionError(format!(
                "cannot change directory to {}: {}",
                path.display(),
                result.stderr.trim_end()
            )));
        }
        *self.cwd.lock().unwrap() = path.to_path_buf();
        Ok(())
    }

    pub fn cwd_snapshot(&self) -> PathBuf {
        self.cwd.lock().unwrap().clone()
    }

    /// Terminates the session: kills the shell and reclaims pending files.
    pub async fn terminate(&self) {
        {
            let mut state = self.state.lock().unwrap();
            if *state == SessionState::Terminated {
                return;
            }
            *state = SessionState::Terminated;
        }
        info!("Terminating session {}", self.id);
        self.shell.kill(libc::SIGTERM);
        let mut pending = self.pending.lock().await;
        for (_, entry) in pending.drain() {
            entry.files.cleanup();
        }
    }

    async fn await_outcome(
        &self,
        rx: tokio::sync::oneshot::Receiver<()>,
        command_id: &str,
        timeout_ms: u64,
    ) -> Outcome {
        tokio::select! {
            res = rx => match res {
                Ok(()) => Outcome::Completed,
                Err(_) => Outcome::ShellDied,
            },
            _ = tokio::time::sleep(std::time::Duration::from_millis(timeout_ms)) => {
                if self.shell.cancel_completion(command_id) {
                    Outcome::TimedOut
                } else {
                    Outcome::Completed
                }
            }
        }
    }
}

pub(crate) fn quote_path(path: &Path) -> Result<String, CommandError> {
    let raw = path
        .to_str()
        .ok_or_else(|| CommandError::ExecutionError(format!("non-utf8 path: {:?}", path)))?;
    shlex::try_quote(raw)
        .map(|quoted| quoted.into_owned())
        .map_err(|_| CommandError::ExecutionError(format!("unquotable path: {}", raw)))
}

fn is_valid_env_name(name: &str) -> bool {
    let mut chars = name.chars();
    match chars.next() {
        Some(c) if c.is_ascii_alphabetic() || c == '_' => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_alphanumeric() || c == '_')
}

/// Reads the aggregate result from the command file set.
async fn read_result(files: &CommandFiles) -> Result<ExecResult, CommandError> {
    let exit_raw = tokio::fs::read_to_string(&files.exit)
        .await
        .map_err(|e| ShellError::IpcReadError(e.to_string()))?;
    let exit_code: i32 = exit_raw
        .trim()
        .parse()
        .map_err(|_| ShellError::IpcReadError(format!("bad exit marker: {:?}", exit_raw)))?;

    let stdout = tokio::fs::read(&files.out)
        .await
        .map_err(|e| ShellError::IpcReadError(e.to_string()))?;
    let stderr = tokio::fs::read(&files.err)
        .await
        .map_err(|e| ShellError::IpcReadError(e.to_string()))?;

    Ok(ExecResult {
        stdout: String::from_utf8_lossy(&stdout).into_owned(),
        stderr: String::from_utf8_lossy(&stderr).into_owned(),
        exit_code,
        success: exit_code == 0,
    })
}

/// Forwards bytes appended to the out/err files since the last poll.
/// Returns `true` when the consumer has gone away.
async fn pump_output(
    files: &CommandFiles,
    out_pos: &mut u64,
    err_pos: &mut u64,
    tx: &mpsc::Sender<ExecStreamEvent>,
) -> bool {
    if let Some(chunk) = read_from(&files.out, out_pos).await {
        if !chunk.is_empty()
            && tx
                .send(ExecStreamEvent::Stdout {
                    data: chunk,
                    timestamp: now_iso(),
                })
                .await
                .is_err()
        {
            return true;
        }
    }
    if let Some(chunk) = read_from(&files.err, err_pos).await {
        if !chunk.is_empty()
            && tx
                .send(ExecStreamEvent::Stderr {
                    data: chunk,
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

async fn read_from(path: &Path, pos: &mut u64) -> Option<String> {
    let mut file = tokio::fs::File::open(path).await.ok()?;
    file.seek(std::io::SeekFrom::Start(*pos)).await.ok()?;
    let mut buf = Vec::new();
    file.read_to_end(&mut buf).await.ok()?;
    *pos += buf.len() as u64;
    Some(String::from_utf8_lossy(&buf).into_owned())
}
