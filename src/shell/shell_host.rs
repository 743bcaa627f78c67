use log::{debug, info, warn};
use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use tokio::io::{AsyncBufReadExt, AsyncReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::sync::{mpsc, oneshot, watch};

use crate::error_handling::types::ShellError;
use crate::shell::temp_files::CommandFiles;

/// Marker echoed on the shell's stdout when a dispatched command finishes.
/// The wire form is `<marker>:<commandId>`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CompletionMarker {
    Done,
    StreamDone,
}

impl CompletionMarker {
    pub const DONE: &'static str = "DONE";
    pub const STREAM_DONE: &'static str = "STREAM_DONE";

    pub fn as_str(&self) -> &'static str {
        match self {
            CompletionMarker::Done => Self::DONE,
            CompletionMarker::StreamDone => Self::STREAM_DONE,
        }
    }
}

/// Whether the shell child is still running, and its exit code once gone.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ShellLiveness {
    Alive,
    Dead(Option<i32>),
}

type Completions = Arc<Mutex<HashMap<String, oneshot::Sender<()>>>>;
type Observers = Arc<Mutex<HashMap<u64, mpsc::UnboundedSender<String>>>>;

/// Supervises one persistent `bash --norc` child.
///
/// The host owns the child's stdin and a reader task over its stdout. The
/// reader forwards every chunk to registered observers and scans complete
/// lines for completion markers, firing the matching one-shot completion.
/// A marker for an id with no registered completion is ignored; that is the
/// idempotency guard against late markers for commands that already timed
/// out.
pub struct ShellHost {
    stdin: tokio::sync::Mutex<ChildStdin>,
    pid: Option<u32>,
    liveness: watch::Receiver<ShellLiveness>,
    completions: Completions,
    observers: Observers,
    next_observer: AtomicU64,
}

impl ShellHost {
    /// Spawns the shell with `env` layered over the inherited environment,
    /// rooted at `cwd`.
    pub async fn start(
        env: &HashMap<String, String>,
        cwd: &Path,
    ) -> Result<Arc<ShellHost>, ShellError> {
        if !cwd.exists() {
            std::fs::create_dir_all(cwd)?;
        }

        let mut child = Command::new("bash")
            .arg("--norc")
            .envs(env)
            .current_dir(cwd)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ShellError::SpawnFailed(e.to_string()))?;

        let pid = child.id();
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ShellError::SpawnFailed("shell stdin not piped".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ShellError::SpawnFailed("shell stdout not piped".to_string()))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| ShellError::SpawnFailed("shell stderr not piped".to_string()))?;

        let (liveness_tx, liveness_rx) = watch::channel(ShellLiveness::Alive);
        let completions: Completions = Arc::new(Mutex::new(HashMap::new()));
        let observers: Observers = Arc::new(Mutex::new(HashMap::new()));

        // Shell stderr is chatter (bash warnings, job control noise), not
        // command output; command stderr goes through the temp files.
        {
            let mut reader = BufReader::new(stderr).lines();
            tokio::spawn(async move {
                while let Ok(Some(line)) = reader.next_line().await {
                    debug!("[shell:stderr] {}", line);
                }
            });
        }

        {
            let completions = completions.clone();
            let observers = observers.clone();
            tokio::spawn(async move {
                let mut stdout = stdout;
                let mut buf = [0u8; 4096];
                let mut line_buf = String::new();

                loop {
                    match stdout.read(&mut buf).await {
                        Ok(0) | Err(_) => break,
                        Ok(n) => {
                            let chunk = String::from_utf8_lossy(&buf[..n]).into_owned();
                            notify_observers(&observers, &chunk);
                            line_buf.push_str(&chunk);
                            while let Some(pos) = line_buf.find('\n') {
                                let line: String = line_buf.drain(..pos + 1).collect();
                                scan_marker_line(&completions, line.trim_end());
                            }
                        }
                    }
                }

                let exit_code = match child.wait().await {
                    Ok(status) => status.code(),
                    Err(err) => {
                        warn!("Failed to reap shell child: {}", err);
                        None
                    }
                };
                info!("Shell child exited with code {:?}", exit_code);

                // Dropping the senders fails every pending completion, which
                // the awaiting execs surface as SHELL_TERMINATED_UNEXPECTEDLY.
                completions.lock().unwrap().clear();
                observers.lock().unwrap().clear();
                let _ = liveness_tx.send(ShellLiveness::Dead(exit_code));
            });
        }

        debug!("Shell child started (pid {:?})", pid);
        Ok(Arc::new(ShellHost {
            stdin: tokio::sync::Mutex::new(stdin),
            pid,
            liveness: liveness_rx,
            completions,
            observers,
            next_observer: AtomicU64::new(0),
        }))
    }

    pub fn liveness(&self) -> ShellLiveness {
        self.liveness.borrow().clone()
    }

    pub fn watch_liveness(&self) -> watch::Receiver<ShellLiveness> {
        self.liveness.clone()
    }

    pub fn exit_code(&self) -> Option<i32> {
        match self.liveness() {
            ShellLiveness::Alive => None,
            ShellLiveness::Dead(code) => code,
        }
    }

    /// Registers the completion one-shot for `command_id`. Must happen
    /// before the dispatch so the marker can never race past us.
    pub fn register_completion(&self, command_id: &str) -> oneshot::Receiver<()> {
        let (tx, rx) = oneshot::channel();
        self.completions
            .lock()
            .unwrap()
            .insert(command_id.to_string(), tx);
        rx
    }

    /// Withdraws the completion for `command_id`. Returns `true` when this
    /// call actually removed it. This is the arbitration primitive of the
    /// timeout-vs-marker race: whoever removes the sender wins.
    pub fn cancel_completion(&self, command_id: &str) -> bool {
        self.completions.lock().unwrap().remove(command_id).is_some()
    }

    /// Subscribes to raw stdout chunks. Drop the receiver and call
    /// [`ShellHost::unobserve`] with the token to unregister.
    pub fn observe_stdout(&self) -> (u64, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let token = self.next_observer.fetch_add(1, Ordering::SeqCst);
        self.observers.lock().unwrap().insert(token, tx);
        (token, rx)
    }

    pub fn unobserve(&self, token: u64) {
        self.observers.lock().unwrap().remove(&token);
    }

    /// Writes the command script to the shell's stdin.
    ///
    /// The caller has already written the user command into `files.cmd`.
    /// When `override_cwd` is given the script saves and restores the
    /// shell's directory, so only commands without it can mutate session
    /// state (`cd`, `export`) durably.
    pub async fn dispatch(
        &self,
        command_id: &str,
        override_cwd: Option<&Path>,
        marker: CompletionMarker,
        files: &CommandFiles,
    ) -> Result<(), ShellError> {
        if self.liveness() != ShellLiveness::Alive {
            return Err(ShellError::NotAlive);
        }

        let script = build_script(command_id, override_cwd, marker, files)?;
        let mut stdin = self.stdin.lock().await;
        stdin
            .write_all(script.as_bytes())
            .await
            .map_err(|_| ShellError::NotAlive)?;
        stdin.flush().await.map_err(|_| ShellError::NotAlive)?;
        debug!("Dispatched command {} ({})", command_id, marker.as_str());
        Ok(())
    }

    /// Sends `signal` to the shell child. Terminal; the reader task observes
    /// the exit and flips liveness.
    pub fn kill(&self, signal: i32) {
        if let Some(pid) = self.pid {
            unsafe {
                libc::kill(pid as i32, signal);
            }
        }
    }
}

fn notify_observers(observers: &Observers, chunk: &str) {
    let mut dead = Vec::new();
    {
        let observers = observers.lock().unwrap();
        for (token, tx) in observers.iter() {
            if tx.send(chunk.to_string()).is_err() {
                dead.push(*token);
            }
        }
    }
    if !dead.is_empty() {
        let mut observers = observers.lock().unwrap();
        for token in dead {
            observers.remove(&token);
        }
    }
}

fn scan_marker_line(completions: &Completions, line: &str) {
    let id = if let Some(rest) = line.strip_prefix("STREAM_DONE:") {
        rest
    } else if let Some(rest) = line.strip_prefix("DONE:") {
        rest
    } else {
        return;
    };

    match completions.lock().unwrap().remove(id) {
        Some(tx) => {
            let _ = tx.send(());
        }
        // Late marker for a command that already timed out.
        None => debug!("Ignoring stale completion marker for {}", id),
    }
}

fn quote(path: &Path) -> Result<String, ShellError> {
    let raw = path
        .to_str()
        .ok_or_else(|| ShellError::IpcReadError(format!("non-utf8 path: {:?}", path)))?;
    shlex::try_quote(raw)
        .map(|quoted| quoted.into_owned())
        .map_err(|_| ShellError::IpcReadError(format!("unquotable path: {}", raw)))
}

fn build_script(
    command_id: &str,
    override_cwd: Option<&Path>,
    marker: CompletionMarker,
    files: &CommandFiles,
) -> Result<String, ShellError> {
    let cmd = quote(&files.cmd)?;
    let out = quote(&files.out)?;
    let err = quote(&files.err)?;
    let exit = quote(&files.exit)?;
    let marker_line = format!("echo {}:{}", marker.as_str(), command_id);

    let script = match override_cwd {
        Some(dir) => {
            let dir_q = quote(dir)?;
            format!(
                "__ruche_prev_dir=\"$PWD\"\n\
                 if cd {dir_q}; then\n\
                 source {cmd} > {out} 2> {err}\n\
                 echo $? > {exit}\n\
                 cd \"$__ruche_prev_dir\"\n\
                 else\n\
                 echo 'cannot change to requested directory' > {err}\n\
                 echo 1 > {exit}\n\
                 fi\n\
                 {marker_line}\n",
                dir_q = dir_q,
                cmd = cmd,
                out = out,
                err = err,
                exit = exit,
                marker_line = marker_line,
            )
        }
        None => format!(
            "source {cmd} > {out} 2> {err}\n\
             echo $? > {exit}\n\
             {marker_line}\n",
            cmd = cmd,
            out = out,
            err = err,
            exit = exit,
            marker_line = marker_line,
        ),
    };

    Ok(script)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::shell::temp_files::TempFileStore;
    use std::time::Duration;

    async fn start_host(dir: &tempfile::TempDir) -> (Arc<ShellHost>, Arc<TempFileStore>) {
        let store = Arc::new(TempFileStore::new(dir.path()).unwrap());
        let host = ShellHost::start(&HashMap::new(), dir.path()).await.unwrap();
        (host, store)
    }

    async fn run_to_completion(
        host: &ShellHost,
        store: &TempFileStore,
        id: &str,
        command: &str,
    ) -> CommandFiles {
        let files = store.command_files(id).unwrap();
        std::fs::write(&files.cmd, command).unwrap();
        let rx = host.register_completion(id);
        host.dispatch(id, None, CompletionMarker::Done, &files)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("marker within 10s")
            .expect("completion fired");
        files
    }

    #[tokio::test]
    async fn dispatch_writes_output_and_marker_fires() {
        let dir = tempfile::TempDir::new().unwrap();
        let (host, store) = start_host(&dir).await;

        let files = run_to_completion(&host, &store, "c1", "echo hello").await;

        let out = std::fs::read_to_string(&files.out).unwrap();
        let exit = std::fs::read_to_string(&files.exit).unwrap();
        assert_eq!(out, "hello\n");
        assert_eq!(exit.trim(), "0");
        files.cleanup();
    }

    #[tokio::test]
    async fn shell_state_survives_between_dispatches() {
        let dir = tempfile::TempDir::new().unwrap();
        let (host, store) = start_host(&dir).await;

        run_to_completion(&host, &store, "c1", "RUCHE_PROBE=42").await;
        let files = run_to_completion(&host, &store, "c2", "echo $RUCHE_PROBE").await;

        let out = std::fs::read_to_string(&files.out).unwrap();
        assert_eq!(out, "42\n");
    }

    #[tokio::test]
    async fn override_cwd_is_restored_afterwards() {
        let dir = tempfile::TempDir::new().unwrap();
        let (host, store) = start_host(&dir).await;
        let sub = dir.path().join("sub");
        std::fs::create_dir(&sub).unwrap();

        // Command sees the override directory...
        let files = store.command_files("c1").unwrap();
        std::fs::write(&files.cmd, "pwd").unwrap();
        let rx = host.register_completion("c1");
        host.dispatch("c1", Some(&sub), CompletionMarker::Done, &files)
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .unwrap()
            .unwrap();
        let seen = std::fs::read_to_string(&files.out).unwrap();
        assert!(seen.trim_end().ends_with("sub"));

        // ...and the next command is back in the session directory.
        let files = run_to_completion(&host, &store, "c2", "pwd").await;
        let restored = std::fs::read_to_string(&files.out).unwrap();
        assert!(!restored.trim_end().ends_with("sub"));
    }

    #[tokio::test]
    async fn cancel_completion_wins_exactly_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let (host, _store) = start_host(&dir).await;

        let _rx = host.register_completion("t1");
        assert!(host.cancel_completion("t1"));
        assert!(!host.cancel_completion("t1"));
    }

    #[tokio::test]
    async fn stale_marker_is_ignored() {
        let dir = tempfile::TempDir::new().unwrap();
        let (host, store) = start_host(&dir).await;

        // Nothing registered for this id; the marker line must be a no-op.
        let files = store.command_files("ghost").unwrap();
        std::fs::write(&files.cmd, "true").unwrap();
        host.dispatch("ghost", None, CompletionMarker::Done, &files)
            .await
            .unwrap();

        // A later command still completes normally.
        run_to_completion(&host, &store, "live", "true").await;
    }

    #[tokio::test]
    async fn dead_shell_rejects_dispatch_and_reports_exit() {
        let dir = tempfile::TempDir::new().unwrap();
        let (host, store) = start_host(&dir).await;

        let files = store.command_files("quit").unwrap();
        std::fs::write(&files.cmd, "exit 3").unwrap();
        let rx = host.register_completion("quit");
        host.dispatch("quit", None, CompletionMarker::Done, &files)
            .await
            .unwrap();
        // `exit` kills the shell before the marker line runs; the pending
        // completion fails instead.
        assert!(tokio::time::timeout(Duration::from_secs(10), rx)
            .await
            .expect("liveness resolves within 10s")
            .is_err());

        let mut liveness = host.watch_liveness();
        tokio::time::timeout(Duration::from_secs(5), async {
            while *liveness.borrow() == ShellLiveness::Alive {
                liveness.changed().await.unwrap();
            }
        })
        .await
        .unwrap();
        assert_eq!(host.liveness(), ShellLiveness::Dead(Some(3)));

        let files = store.command_files("after").unwrap();
        std::fs::write(&files.cmd, "true").unwrap();
        let err = host
            .dispatch("after", None, CompletionMarker::Done, &files)
            .await
            .unwrap_err();
        assert!(matches!(err, ShellError::NotAlive));
    }

    #[tokio::test]
    async fn observers_see_marker_traffic() {
        let dir = tempfile::TempDir::new().unwrap();
        let (host, store) = start_host(&dir).await;

        let (token, mut rx) = host.observe_stdout();
        run_to_completion(&host, &store, "obs", "true").await;

        let mut seen = String::new();
        while let Ok(chunk) = rx.try_recv() {
            seen.push_str(&chunk);
        }
        assert!(seen.contains("DONE:obs"));
        host.unobserve(token);
    }
}
