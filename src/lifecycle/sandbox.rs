use chrono::{DateTime, Utc};
use log::{debug, info, warn};
use std::str::FromStr;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::task::JoinHandle;

use crate::configuration::types::SleepAfter;
use crate::configuration::Config;
use crate::error_handling::types::ShellError;
use crate::interpreter::InterpreterManager;
use crate::lifecycle::metadata::{MetadataStore, SandboxMetadata};
use crate::ports::PortRegistry;
use crate::process_management::ProcessManager;
use crate::session_management::SessionManager;
use crate::shell::temp_files::TempFileStore;
use crate::sse::SseHub;

/// Renewal floor: streaming traffic must not renew the deadline per chunk.
const RENEWAL_FLOOR: Duration = Duration::from_secs(5);

/// One sandbox instance: the per-id singleton owning every manager.
pub struct Sandbox {
    pub id: String,
    config: Arc<Config>,
    pub sessions: Arc<SessionManager>,
    pub processes: Arc<ProcessManager>,
    pub interpreters: Arc<InterpreterManager>,
    pub ports: Arc<PortRegistry>,
    pub sse: Arc<SseHub>,
    metadata: Mutex<SandboxMetadata>,
    meta_store: Arc<MetadataStore>,
    activity_deadline: Mutex<Option<DateTime<Utc>>>,
    last_renewal: Mutex<Option<Instant>>,
    keepalive: Mutex<Option<JoinHandle<()>>>,
    sweeper: Mutex<Option<JoinHandle<()>>>,
}

impl Sandbox {
    /// Initializes a sandbox: temp store, sweeper, persisted metadata, and
    /// the manager singletons. Called lazily on the first request for an id.
    pub fn init(
        id: &str,
        config: Arc<Config>,
        meta_store: Arc<MetadataStore>,
    ) -> Result<Arc<Sandbox>, ShellError> {
        let files = Arc::new(TempFileStore::new(&config.temp_dir)?);
        let sweeper = files.spawn_sweeper(
            Duration::from_millis(config.cleanup_interval_ms),
            Duration::from_millis(config.temp_file_max_age_ms),
        );

        let metadata = meta_store.load(id);
        let sandbox = Arc::new(Sandbox {
            id: id.to_string(),
            sessions: Arc::new(SessionManager::new(config.clone(), files.clone())),
            processes: Arc::new(ProcessManager::new()),
            interpreters: Arc::new(InterpreterManager::new(config.clone())),
            ports: Arc::new(PortRegistry::new(config.control_port)),
            sse: Arc::new(SseHub::new()),
            metadata: Mutex::new(metadata.clone()),
            meta_store,
            activity_deadline: Mutex::new(None),
            last_renewal: Mutex::new(None),
            keepalive: Mutex::new(None),
            sweeper: Mutex::new(Some(sweeper)),
            config,
        });

        sandbox.renew_deadline();
        if metadata.keep_alive.unwrap_or(sandbox.config.keep_alive) {
            sandbox.set_keep_alive(true);
        }
        info!("Sandbox {} initialized", id);
        Ok(sandbox)
    }

    /// Effective sleep-after: persisted override first, config second.
    pub fn sleep_after(&self) -> SleepAfter {
        let stored = self.metadata.lock().unwrap().sleep_after.clone();
        stored
            .and_then(|raw| SleepAfter::from_str(&raw).ok())
            .unwrap_or(self.config.sleep_after)
    }

    pub fn metadata(&self) -> SandboxMetadata {
        self.metadata.lock().unwrap().clone()
    }

    pub fn update_metadata(&self, update: impl FnOnce(&mut SandboxMetadata)) {
        let snapshot = {
            let mut metadata = self.metadata.lock().unwrap();
            update(&mut metadata);
            metadata.clone()
        };
        if let Err(err) = self.meta_store.save(&self.id, &snapshot) {
            warn!("Cannot persist metadata for {}: {}", self.id, err);
        }
    }

    /// Renews the activity deadline, throttled to one renewal per 5 s.
    pub fn touch(&self) {
        {
            let last = self.last_renewal.lock().unwrap();
            if let Some(last) = *last {
                if last.elapsed() < RENEWAL_FLOOR {
                    return;
                }
            }
        }
        self.renew_deadline();
    }

    fn renew_deadline(&self) {
        *self.last_renewal.lock().unwrap() = Some(Instant::now());
        let deadline = self.sleep_after().as_duration().map(|window| {
            Utc::now() + chrono::Duration::from_std(window).unwrap_or(chrono::Duration::zero())
        });
        *self.activity_deadline.lock().unwrap() = deadline;
    }

    pub fn activity_deadline(&self) -> Option<DateTime<Utc>> {
        *self.activity_deadline.lock().unwrap()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        match self.activity_deadline() {
            Some(deadline) => now > deadline,
            None => false,
        }
    }

    pub fn keep_alive_enabled(&self) -> bool {
        self.keepalive.lock().unwrap().is_some()
    }

    /// Starts or stops the keep-alive ticker, which renews the deadline at
    /// half the sleep-after period.
    pub fn set_keep_alive(self: &Arc<Self>, enabled: bool) {
        {
            let mut slot = self.keepalive.lock().unwrap();
            if enabled {
                if slot.is_some() {
                    return;
                }
                let Some(window) = self.sleep_after().as_duration() else {
                    debug!("Keep-alive unnecessary for {} (sleep_after=never)", self.id);
                    return;
                };
                let period = window / 2;
                let sandbox = Arc::downgrade(self);
                *slot = Some(tokio::spawn(async move {
                    let mut ticker = tokio::time::interval(period);
                    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
                    loop {
                        ticker.tick().await;
                        match sandbox.upgrade() {
                            Some(sandbox) => sandbox.renew_deadline(),
                            None => break,
                        }
                    }
                }));
                info!("Keep-alive ticker started for sandbox {}", self.id);
            } else {
                match slot.take() {
                    Some(handle) => {
                        handle.abort();
                        info!("Keep-alive ticker stopped for sandbox {}", self.id);
                    }
                    None => return,
                }
            }
        }
        self.update_metadata(|meta| meta.keep_alive = Some(enabled));
    }

    /// Stops the container: every manager is torn down and volatile state
    /// dropped. The persisted metadata file goes too.
    pub async fn destroy(&self) {
        info!("Destroying sandbox {}", self.id);
        if let Some(handle) = self.keepalive.lock().unwrap().take() {
            handle.abort();
        }
        if let Some(handle) = self.sweeper.lock().unwrap().take() {
            handle.abort();
        }
        self.sse.shutdown_all();
        self.sessions.terminate_all().await;
        self.processes.shutdown();
        self.interpreters.shutdown_all().await;
        self.ports.clear();
        self.meta_store.remove(&self.id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;

    fn test_config(dir: &tempfile::TempDir) -> Arc<Config> {
        let mut config = Config::default();
        config.temp_dir = dir.path().to_path_buf();
        config.state_dir = dir.path().join("state");
        config.workspace_root = dir.path().to_path_buf();
        config.sleep_after = SleepAfter::Duration(Duration::from_secs(60));
        Arc::new(config)
    }

    #[tokio::test]
    #[serial]
    async fn deadline_renews_and_throttles() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = Arc::new(MetadataStore::new(&config.state_dir));
        let sandbox = Sandbox::init("sb1", config, store).unwrap();

        let first = sandbox.activity_deadline().unwrap();
        // Within the renewal floor, touch must not move the deadline.
        sandbox.touch();
        assert_eq!(sandbox.activity_deadline().unwrap(), first);
        assert!(!sandbox.is_expired(Utc::now()));
        sandbox.destroy().await;
    }

    #[tokio::test]
    #[serial]
    async fn never_sleeping_sandbox_has_no_deadline() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.temp_dir = dir.path().to_path_buf();
        config.state_dir = dir.path().join("state");
        config.sleep_after = SleepAfter::Never;
        let store = Arc::new(MetadataStore::new(&config.state_dir));
        let sandbox = Sandbox::init("sb2", Arc::new(config), store).unwrap();

        assert!(sandbox.activity_deadline().is_none());
        assert!(!sandbox.is_expired(Utc::now()));
        sandbox.destroy().await;
    }

    #[tokio::test]
    #[serial]
    async fn keep_alive_toggle_persists_to_metadata() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = Arc::new(MetadataStore::new(&config.state_dir));
        let sandbox = Sandbox::init("sb3", config, store.clone()).unwrap();

        sandbox.set_keep_alive(true);
        assert!(sandbox.keep_alive_enabled());
        assert_eq!(store.load("sb3").keep_alive, Some(true));

        sandbox.set_keep_alive(false);
        assert!(!sandbox.keep_alive_enabled());
        assert_eq!(store.load("sb3").keep_alive, Some(false));
        sandbox.destroy().await;
    }

    #[tokio::test]
    #[serial]
    async fn destroy_removes_metadata_and_ends_sinks() {
        let dir = tempfile::TempDir::new().unwrap();
        let config = test_config(&dir);
        let store = Arc::new(MetadataStore::new(&config.state_dir));
        let sandbox = Sandbox::init("sb4", config, store.clone()).unwrap();

        sandbox.update_metadata(|meta| meta.sandbox_name = Some("gone-soon".to_string()));
        assert_eq!(store.load("sb4").sandbox_name.as_deref(), Some("gone-soon"));

        sandbox.destroy().await;
        assert_eq!(store.load("sb4"), SandboxMetadata::default());
        assert_eq!(sandbox.sse.active_sinks(), 0);
    }
}
