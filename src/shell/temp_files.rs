use log::{debug, warn};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, SystemTime};

use crate::error_handling::types::ShellError;

/// Per-process store for command IPC temp files.
///
/// The directory is created 0700 and every file inside it 0600; only the
/// owning process reads command output through it. A periodic sweep removes
/// files nothing references anymore (crashed handlers, abandoned streams).
pub struct TempFileStore {
    root: PathBuf,
}

/// The four temp files backing one dispatched command.
#[derive(Debug, Clone)]
pub struct CommandFiles {
    pub cmd: PathBuf,
    pub out: PathBuf,
    pub err: PathBuf,
    pub exit: PathBuf,
}

impl TempFileStore {
    /// Creates the per-process directory under `parent`.
    pub fn new(parent: &Path) -> Result<Self, ShellError> {
        let root = parent.join(format!("ruche-shell-{}", std::process::id()));
        std::fs::create_dir_all(parent)?;

        if !root.exists() {
            use std::os::unix::fs::DirBuilderExt;
            std::fs::DirBuilder::new().mode(0o700).create(&root)?;
        }

        debug!("Command IPC directory ready at {}", root.display());
        Ok(TempFileStore { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Creates the cmd/out/err/exit file set for `command_id`.
    ///
    /// out/err/exit are pre-created empty so pollers can read them before the
    /// shell has written anything.
    pub fn command_files(&self, command_id: &str) -> Result<CommandFiles, ShellError> {
        let files = CommandFiles {
            cmd: self.root.join(format!("{}.cmd", command_id)),
            out: self.root.join(format!("{}.out", command_id)),
            err: self.root.join(format!("{}.err", command_id)),
            exit: self.root.join(format!("{}.exit", command_id)),
        };
        for path in [&files.cmd, &files.out, &files.err, &files.exit] {
            create_private(path)?;
        }
        Ok(files)
    }

    /// Removes files older than `max_age` from the store directory only.
    ///
    /// Returns the number of files removed. In-flight commands are protected
    /// by the age floor; anything older than it is orphaned by definition.
    pub fn sweep(&self, max_age: Duration) -> usize {
        let entries = match std::fs::read_dir(&self.root) {
            Ok(entries) => entries,
            Err(err) => {
                warn!("Temp sweep could not list {}: {}", self.root.display(), err);
                return 0;
            }
        };

        let now = SystemTime::now();
        let mut removed = 0;
        for entry in entries.flatten() {
            let path = entry.path();
            let stale = entry
                .metadata()
                .and_then(|m| m.modified())
                .ok()
                .and_then(|modified| now.duration_since(modified).ok())
                .map(|age| age > max_age)
                .unwrap_or(false);
            if stale && std::fs::remove_file(&path).is_ok() {
                removed += 1;
            }
        }

        if removed > 0 {
            debug!("Temp sweep removed {} stale files", removed);
        }
        removed
    }

    /// Spawns the periodic sweeper. Aborted via the returned handle.
    pub fn spawn_sweeper(
        self: &Arc<Self>,
        interval: Duration,
        max_age: Duration,
    ) -> tokio::task::JoinHandle<()> {
        let store = Arc::clone(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                store.sweep(max_age);
            }
        })
    }
}

impl CommandFiles {
    /// Removes the file set: rename first, then unlink, so a concurrent
    /// late write lands on the doomed name instead of resurrecting the
    /// original. Missing files are tolerated on both steps.
    pub fn cleanup(&self) {
        for path in [&self.cmd, &self.out, &self.err, &self.exit] {
            let mut doomed = path.as_os_str().to_os_string();
            doomed.push(".del");
            let doomed = PathBuf::from(doomed);
            match std::fs::rename(path, &doomed) {
                Ok(()) => {
                    if let Err(err) = std::fs::remove_file(&doomed) {
                        if err.kind() != std::io::ErrorKind::NotFound {
                            warn!("Failed to unlink {}: {}", doomed.display(), err);
                        }
                    }
                }
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => {}
                Err(err) => warn!("Failed to rename {}: {}", path.display(), err),
            }
        }
    }
}

fn create_private(path: &Path) -> Result<(), ShellError> {
    use std::os::unix::fs::OpenOptionsExt;
    std::fs::OpenOptions::new()
        .create(true)
        .write(true)
        .truncate(true)
        .mode(0o600)
        .open(path)?;
    Ok(())
}
