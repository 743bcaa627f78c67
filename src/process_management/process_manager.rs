use log::{debug, info};
use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

use crate::error_handling::types::ProcessError;
use crate::process_management::background_process::{
    BackgroundProcess, ProcessInfo, ProcessLogEvent,
};

/// Sandbox-wide registry of background processes.
///
/// Entries are owned here, not by the session that started them; listing is
/// deliberately unfiltered so any caller sees every process in the sandbox.
pub struct ProcessManager {
    processes: Mutex<HashMap<String, Arc<BackgroundProcess>>>,
}

impl ProcessManager {
    pub fn new() -> Self {
        ProcessManager {
            processes: Mutex::new(HashMap::new()),
        }
    }

    /// Starts a detached process. A caller-supplied id must be unused.
    pub fn start(
        &self,
        command: &str,
        session_id: Option<String>,
        process_id: Option<String>,
    ) -> Result<Arc<BackgroundProcess>, ProcessError> {
        let id = process_id.unwrap_or_else(|| format!("proc-{}", Uuid::new_v4()));

        let mut processes = self.processes.lock().unwrap();
        if processes.contains_key(&id) {
            return Err(ProcessError::IdInUse(id));
        }

        let process = BackgroundProcess::spawn(&id, command, session_id)?;
        processes.insert(id.clone(), process.clone());
        info!("Registered background process {}", id);
        Ok(process)
    }

    pub fn get(&self, id: &str) -> Result<Arc<BackgroundProcess>, ProcessError> {
        self.processes
            .lock()
            .unwrap()
            .get(id)
            .cloned()
            .ok_or_else(|| ProcessError::NotFound(id.to_string()))
    }

    /// Snapshot of every process in the sandbox, oldest first.
    pub fn list(&self) -> Vec<ProcessInfo> {
        let mut infos: Vec<ProcessInfo> = self
            .processes
            .lock()
            .unwrap()
            .values()
            .map(|p| p.info())
            .collect();
        infos.sort_by(|a, b| a.start_time.cmp(&b.start_time));
        infos
    }

    /// SIGTERMs the process. Success on an already-terminal process.
    pub fn kill(&self, id: &str) -> Result<(), ProcessError> {
        let process = self.get(id)?;
        process.kill();
        Ok(())
    }

    /// Kills everything still running; returns how many were signalled.
    pub fn kill_all(&self) -> usize {
        let running: Vec<Arc<BackgroundProcess>> = self
            .processes
            .lock()
            .unwrap()
            .values()
            .filter(|p| !p.status().is_terminal())
            .cloned()
            .collect();

        for process in &running {
            process.kill();
        }
        debug!("kill-all signalled {} processes", running.len());
        running.len()
    }

    pub fn logs(&self, id: &str) -> Result<(String, String), ProcessError> {
        Ok(self.get(id)?.logs())
    }

    pub fn stream_logs(
        &self,
        id: &str,
    ) -> Result<tokio::sync::mpsc::Receiver<ProcessLogEvent>, ProcessError> {
        Ok(self.get(id)?.stream_logs())
    }

    /// Teardown: kill everything and drop the registry.
    pub fn shutdown(&self) {
        let count = self.kill_all();
        if count > 0 {
            info!("Teardown killed {} running processes", count);
        }
        self.processes.lock().unwrap().clear();
    }
}

impl Default for ProcessManager {
    fn default() -> Self {
        ProcessManager::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::process_management::background_process::ProcessStatus;
    use std::time::Duration;

    #[tokio::test]
    async fn start_list_kill_roundtrip() {
        let manager = ProcessManager::new();
        let process = manager.start("sleep 60", None, None).unwrap();

        let listed = manager.list();
        assert_eq!(listed.len(), 1);
        assert_eq!(listed[0].id, process.id);
        assert_eq!(listed[0].status, ProcessStatus::Running);

        manager.kill(&process.id).unwrap();
        tokio::time::timeout(Duration::from_secs(10), process.wait_done())
            .await
            .unwrap();

        let listed = manager.list();
        assert_ne!(listed[0].status, ProcessStatus::Running);
    }

    #[tokio::test]
    async fn duplicate_id_is_rejected() {
        let manager = ProcessManager::new();
        manager
            .start("sleep 60", None, Some("fixed".to_string()))
            .unwrap();
        let err = manager
            .start("sleep 60", None, Some("fixed".to_string()))
            .unwrap_err();
        assert!(matches!(err, ProcessError::IdInUse(_)));
        manager.shutdown();
    }

    #[tokio::test]
    async fn unknown_id_is_not_found() {
        let manager = ProcessManager::new();
        assert!(matches!(
            manager.kill("ghost"),
            Err(ProcessError::NotFound(_))
        ));
        assert!(matches!(
            manager.logs("ghost"),
            Err(ProcessError::NotFound(_))
        ));
        assert!(manager.get("ghost").is_err());
    }

    #[tokio::test]
    async fn kill_all_counts_only_running() {
        let manager = ProcessManager::new();
        let finished = manager.start("true", None, None).unwrap();
        tokio::time::timeout(Duration::from_secs(10), finished.wait_done())
            .await
            .unwrap();

        let a = manager.start("sleep 60", None, None).unwrap();
        let b = manager.start("sleep 60", None, None).unwrap();

        assert_eq!(manager.kill_all(), 2);
        tokio::time::timeout(Duration::from_secs(10), a.wait_done())
            .await
            .unwrap();
        tokio::time::timeout(Duration::from_secs(10), b.wait_done())
            .await
            .unwrap();

        // Nothing left running; a second sweep signals nobody.
        assert_eq!(manager.kill_all(), 0);
    }
}
