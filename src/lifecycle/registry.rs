use chrono::Utc;
use log::{error, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;

use crate::configuration::Config;
use crate::error_handling::types::ApiError;
use crate::lifecycle::metadata::MetadataStore;
use crate::lifecycle::sandbox::Sandbox;

/// Process-wide map of sandbox singletons, keyed by opaque id.
///
/// Sandboxes come into existence on first request and leave by explicit
/// destroy or by activity-deadline expiry (the reaper).
pub struct SandboxRegistry {
    sandboxes: Mutex<HashMap<String, Arc<Sandbox>>>,
    config: Arc<Config>,
    meta_store: Arc<MetadataStore>,
}

impl SandboxRegistry {
    pub fn new(config: Arc<Config>) -> Self {
        let meta_store = Arc::new(MetadataStore::new(&config.state_dir));
        SandboxRegistry {
            sandboxes: Mutex::new(HashMap::new()),
            config,
            meta_store,
        }
    }

    /// Lazy instantiation on first request.
    pub async fn get_or_create(&self, id: &str) -> Result<Arc<Sandbox>, ApiError> {
        let mut sandboxes = self.sandboxes.lock().await;
        if let Some(sandbox) = sandboxes.get(id) {
            return Ok(sandbox.clone());
        }
        let sandbox = Sandbox::init(id, self.config.clone(), self.meta_store.clone())
            .map_err(|e| ApiError::internal(format!("sandbox init failed: {}", e)))?;
        sandboxes.insert(id.to_string(), sandbox.clone());
        Ok(sandbox)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Sandbox>> {
        self.sandboxes.lock().await.get(id).cloned()
    }

    /// Explicit teardown. Unknown ids are a no-op: the caller wanted it
    /// gone and it is.
    pub async fn destroy(&self, id: &str) {
        let sandbox = self.sandboxes.lock().await.remove(id);
        if let Some(sandbox) = sandbox {
            sandbox.destroy().await;
        }
    }

    pub async fn destroy_all(&self) {
        let drained: Vec<Arc<Sandbox>> = {
            let mut sandboxes = self.sandboxes.lock().await;
            sandboxes.drain().map(|(_, s)| s).collect()
        };
        for sandbox in drained {
            sandbox.destroy().await;
        }
    }

    /// Periodically tears down sandboxes whose activity deadline passed.
    pub fn spawn_reaper(self: &Arc<Self>, interval: Duration) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let expired: Vec<String> = {
                    let sandboxes = registry.sandboxes.lock().await;
                    let now = Utc::now();
                    sandboxes
                        .iter()
                        .filter(|(_, sandbox)| sandbox.is_expired(now))
                        .map(|(id, _)| id.clone())
                        .collect()
                };
                for id in expired {
                    info!("Sandbox {} passed its activity deadline, tearing down", id);
                    registry.destroy(&id).await;
                }
            }
        })
    }
}

impl Drop for SandboxRegistry {
    fn drop(&mut self) {
        let remaining = self.sandboxes.try_lock().map(|m| m.len()).unwrap_or(0);
        if remaining > 0 {
            error!("SandboxRegistry dropped with {} live sandboxes", remaining);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::configuration::types::SleepAfter;
    use serial_test::serial;

    fn registry_for(dir: &tempfile::TempDir) -> Arc<SandboxRegistry> {
        let mut config = Config::default();
        config.temp_dir = dir.path().to_path_buf();
        config.state_dir = dir.path().join("state");
        config.workspace_root = dir.path().to_path_buf();
        Arc::new(SandboxRegistry::new(Arc::new(config)))
    }

    #[tokio::test]
    #[serial]
    async fn sandboxes_are_created_lazily_and_cached() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry_for(&dir);

        assert!(registry.get("sb1").await.is_none());
        let first = registry.get_or_create("sb1").await.unwrap();
        let second = registry.get_or_create("sb1").await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));

        registry.destroy_all().await;
    }

    #[tokio::test]
    #[serial]
    async fn destroy_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let registry = registry_for(&dir);

        registry.get_or_create("sb2").await.unwrap();
        registry.destroy("sb2").await;
        assert!(registry.get("sb2").await.is_none());
        registry.destroy("sb2").await;
    }

    #[tokio::test]
    #[serial]
    async fn reaper_collects_expired_sandboxes() {
        let dir = tempfile::TempDir::new().unwrap();
        let mut config = Config::default();
        config.temp_dir = dir.path().to_path_buf();
        config.state_dir = dir.path().join("state");
        config.sleep_after = SleepAfter::Duration(Duration::from_millis(50));
        let registry = Arc::new(SandboxRegistry::new(Arc::new(config)));

        registry.get_or_create("doomed").await.unwrap();
        let reaper = registry.spawn_reaper(Duration::from_millis(50));

        for _ in 0..100 {
            tokio::time::sleep(Duration::from_millis(50)).await;
            if registry.get("doomed").await.is_none() {
                break;
            }
        }
        assert!(registry.get("doomed").await.is_none());
        reaper.abort();
    }
}
