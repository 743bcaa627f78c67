use log::{debug, info};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;

use crate::configuration::Config;
use crate::error_handling::types::{ApiError, ShellError};
use crate::session_management::session::Session;
use crate::shell::temp_files::TempFileStore;

/// Options accepted by `POST /api/session/create`.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSessionOptions {
    pub id: Option<String>,
    pub env: Option<HashMap<String, String>>,
    pub cwd: Option<PathBuf>,
}

/// Registry of shell sessions for one sandbox.
///
/// Creation runs under the registry lock, which doubles as the single-flight
/// guard: two concurrent first requests cannot both spawn the default
/// session's shell.
pub struct SessionManager {
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    files: Arc<TempFileStore>,
    config: Arc<Config>,
}

impl SessionManager {
    pub fn new(config: Arc<Config>, files: Arc<TempFileStore>) -> Self {
        SessionManager {
            sessions: Mutex::new(HashMap::new()),
            files,
            config,
        }
    }

    /// Creates a session, generating an id when none is given. Creating an
    /// id that already exists returns the existing session.
    pub async fn create_session(
        &self,
        opts: CreateSessionOptions,
    ) -> Result<Arc<Session>, ApiError> {
        let id = opts
            .id
            .unwrap_or_else(|| format!("session-{}", uuid::Uuid::new_v4()));
        let mut sessions = self.sessions.lock().await;
        if let Some(existing) = sessions.get(&id) {
            debug!("Session {} already exists, reusing", id);
            return Ok(existing.clone());
        }

        let cwd = opts
            .cwd
            .unwrap_or_else(|| self.config.workspace_root.clone());
        let session = Session::open(
            &id,
            opts.env.unwrap_or_default(),
            &cwd,
            self.config.command_timeout_ms,
            self.files.clone(),
        )
        .await
        .map_err(ApiError::from)?;

        sessions.insert(id.clone(), session.clone());
        info!("Created session {}", id);
        Ok(session)
    }

    pub async fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.sessions.lock().await.get(id).cloned()
    }

    /// Resolves the session for a request: the named one when the header is
    /// present, else the sandbox default (created on first use).
    pub async fn resolve(&self, session_id: Option<&str>) -> Result<Arc<Session>, ApiError> {
        match session_id {
            Some(id) => {
                let mut sessions = self.sessions.lock().await;
                if let Some(session) = sessions.get(id) {
                    return Ok(session.clone());
                }
                // A named session that does not exist yet is created with
                // defaults, matching the lazy default-session behavior.
                let session = self.open_locked(&mut sessions, id).await?;
                Ok(session)
            }
            None => {
                let id = self.config.default_session_name();
                let mut sessions = self.sessions.lock().await;
                if let Some(session) = sessions.get(&id) {
                    return Ok(session.clone());
                }
                let session = self.open_locked(&mut sessions, &id).await?;
                Ok(session)
            }
        }
    }

    async fn open_locked(
        &self,
        sessions: &mut HashMap<String, Arc<Session>>,
        id: &str,
    ) -> Result<Arc<Session>, ShellError> {
        let cwd = self
            .config
            .default_session_cwd
            .clone()
            .unwrap_or_else(|| self.config.workspace_root.clone());
        let session = Session::open(
            id,
            HashMap::new(),
            &cwd,
            self.config.command_timeout_ms,
            self.files.clone(),
        )
        .await?;
        sessions.insert(id.to_string(), session.clone());
        info!("Created session {} on first use", id);
        Ok(session)
    }

    pub async fn session_ids(&self) -> Vec<String> {
        self.sessions.lock().await.keys().cloned().collect()
    }

    /// Terminates every session. Used by sandbox teardown.
    pub async fn terminate_all(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.lock().await;
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.terminate().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager_with_tempdir(dir: &tempfile::TempDir) -> SessionManager {
        let mut config = Config::default();
        config.workspace_root = dir.path().to_path_buf();
        config.sandbox_name = Some("unit".to_string());
        let store = Arc::new(TempFileStore::new(dir.path()).unwrap());
        SessionManager::new(Arc::new(config), store)
    }

    #[tokio::test]
    async fn default_session_is_created_once() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = manager_with_tempdir(&dir);

        let first = manager.resolve(None).await.unwrap();
        let second = manager.resolve(None).await.unwrap();
        assert_eq!(first.id, "sandbox-unit");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(manager.session_ids().await.len(), 1);
    }

    #[tokio::test]
    async fn create_with_explicit_id_is_idempotent() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = manager_with_tempdir(&dir);

        let opts = CreateSessionOptions {
            id: Some("workbench".to_string()),
            ..Default::default()
        };
        let first = manager.create_session(opts.clone()).await.unwrap();
        let second = manager.create_session(opts).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
    }

    #[tokio::test]
    async fn sessions_do_not_share_cwd_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = manager_with_tempdir(&dir);
        let sub = dir.path().join("only-for-a");
        std::fs::create_dir(&sub).unwrap();

        let a = manager.resolve(Some("a")).await.unwrap();
        let b = manager.resolve(Some("b")).await.unwrap();

        a.set_cwd(&sub).await.unwrap();
        let a_pwd = a.get_cwd().await.unwrap();
        let b_pwd = b.get_cwd().await.unwrap();
        assert!(a_pwd.ends_with("only-for-a"));
        assert!(!b_pwd.ends_with("only-for-a"));
    }

    #[tokio::test]
    async fn sessions_do_not_share_env_state() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = manager_with_tempdir(&dir);

        let a = manager.resolve(Some("a")).await.unwrap();
        let b = manager.resolve(Some("b")).await.unwrap();

        let mut patch = HashMap::new();
        patch.insert("ONLY_A".to_string(), "yes".to_string());
        a.set_env(&patch).await.unwrap();

        let from_a = a.exec("echo ${ONLY_A:-unset}", None).await.unwrap();
        let from_b = b.exec("echo ${ONLY_A:-unset}", None).await.unwrap();
        assert_eq!(from_a.stdout, "yes\n");
        assert_eq!(from_b.stdout, "unset\n");
    }

    #[tokio::test]
    async fn terminate_all_clears_the_registry() {
        let dir = tempfile::TempDir::new().unwrap();
        let manager = manager_with_tempdir(&dir);

        manager.resolve(Some("x")).await.unwrap();
        manager.resolve(Some("y")).await.unwrap();
        manager.terminate_all().await;
        assert!(manager.session_ids().await.is_empty());
    }
}
