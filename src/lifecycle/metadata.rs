use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Persisted per-sandbox metadata. This is the whole durable surface:
/// command, process, and log state is volatile by design.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SandboxMetadata {
    pub sandbox_name: Option<String>,
    pub base_url: Option<String>,
    pub sleep_after: Option<String>,
    pub keep_alive: Option<bool>,
}

/// JSON-file-per-sandbox store under the configured state directory.
pub struct MetadataStore {
    dir: PathBuf,
}

impl MetadataStore {
    pub fn new(dir: &Path) -> Self {
        MetadataStore {
            dir: dir.to_path_buf(),
        }
    }

    fn path_for(&self, sandbox_id: &str) -> PathBuf {
        self.dir.join(format!("{}.json", sandbox_id))
    }

    /// Loads metadata; a missing or unreadable file is an empty record.
    pub fn load(&self, sandbox_id: &str) -> SandboxMetadata {
        let path = self.path_for(sandbox_id);
        let raw = match std::fs::read_to_string(&path) {
            Ok(raw) => raw,
            Err(err) => {
                if err.kind() != std::io::ErrorKind::NotFound {
                    warn!("Cannot read metadata {}: {}", path.display(), err);
                }
                return SandboxMetadata::default();
            }
        };
        match serde_json::from_str(&raw) {
            Ok(meta) => meta,
            Err(err) => {
                warn!("Corrupt metadata {}: {}", path.display(), err);
                SandboxMetadata::default()
            }
        }
    }

    pub fn save(&self, sandbox_id: &str, metadata: &SandboxMetadata) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.dir)?;
        let path = self.path_for(sandbox_id);
        let raw = serde_json::to_string_pretty(metadata)
            .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidData, e))?;
        std::fs::write(&path, raw)?;
        debug!("Saved metadata for sandbox {}", sandbox_id);
        Ok(())
    }

    pub fn remove(&self, sandbox_id: &str) {
        let path = self.path_for(sandbox_id);
        if let Err(err) = std::fs::remove_file(&path) {
            if err.kind() != std::io::ErrorKind::NotFound {
                warn!("Cannot remove metadata {}: {}", path.display(), err);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn save_load_remove_roundtrip() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());

        assert_eq!(store.load("sb1"), SandboxMetadata::default());

        let meta = SandboxMetadata {
            sandbox_name: Some("demo".to_string()),
            base_url: Some("https://example.dev".to_string()),
            sleep_after: Some("10m".to_string()),
            keep_alive: Some(true),
        };
        store.save("sb1", &meta).unwrap();
        assert_eq!(store.load("sb1"), meta);

        store.remove("sb1");
        assert_eq!(store.load("sb1"), SandboxMetadata::default());
    }

    #[test]
    fn corrupt_metadata_degrades_to_default() {
        let dir = tempfile::TempDir::new().unwrap();
        let store = MetadataStore::new(dir.path());
        std::fs::create_dir_all(dir.path()).unwrap();
        std::fs::write(dir.path().join("sb2.json"), "{not json").unwrap();
        assert_eq!(store.load("sb2"), SandboxMetadata::default());
    }
}
