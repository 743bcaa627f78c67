use log::{info, warn};
use serde::Deserialize;
use std::path::{Path, PathBuf};

use crate::configuration::types::SleepAfter;
use crate::error_handling::types::ConfigError;

fn default_control_port() -> u16 {
    3000
}

fn default_router_port() -> u16 {
    8787
}

fn default_workspace_root() -> PathBuf {
    PathBuf::from("/workspace")
}

fn default_command_timeout_ms() -> u64 {
    30_000
}

fn default_cleanup_interval_ms() -> u64 {
    60_000
}

fn default_temp_file_max_age_ms() -> u64 {
    60_000
}

fn default_temp_dir() -> PathBuf {
    std::env::temp_dir()
}

fn default_state_dir() -> PathBuf {
    std::env::temp_dir().join("ruche-state")
}

fn default_reserved_apexes() -> Vec<String> {
    vec!["workers.dev".to_string()]
}

/// Runtime configuration for the control plane and the front-end router.
///
/// Loaded from a TOML file ([`Config::from_file`]) and then overridden by the
/// environment surface ([`Config::apply_env`]): `COMMAND_TIMEOUT_MS`,
/// `CLEANUP_INTERVAL_MS`, `TEMP_FILE_MAX_AGE_MS`, `TEMP_DIR`, `SESSION_ID`,
/// `SESSION_CWD`.
#[derive(Debug, Clone, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    /// Port the in-sandbox control plane listens on. Not exposable.
    pub control_port: u16,
    /// Port the front-end router listens on (local dev mode).
    pub router_port: u16,
    /// Working directory new sessions start in.
    pub workspace_root: PathBuf,
    /// Human-readable sandbox name; also seeds the default session id.
    pub sandbox_name: Option<String>,
    /// Base preview URL, e.g. `https://example.dev`. When unset, preview
    /// URLs use the localhost dev form.
    pub base_url: Option<String>,
    pub sleep_after: SleepAfter,
    pub keep_alive: bool,
    pub command_timeout_ms: u64,
    pub cleanup_interval_ms: u64,
    pub temp_file_max_age_ms: u64,
    /// Parent for the per-process 0700 command IPC directory.
    pub temp_dir: PathBuf,
    /// Directory for the persisted per-sandbox metadata files.
    pub state_dir: PathBuf,
    /// Hostname apexes where wildcard preview DNS is unavailable; exposure
    /// against them fails CUSTOM_DOMAIN_REQUIRED.
    pub reserved_apexes: Vec<String>,
    /// Forced id for the default session (`SESSION_ID`).
    pub default_session_id: Option<String>,
    /// Forced working directory for the default session (`SESSION_CWD`).
    pub default_session_cwd: Option<PathBuf>,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            control_port: default_control_port(),
            router_port: default_router_port(),
            workspace_root: default_workspace_root(),
            sandbox_name: None,
            base_url: None,
            sleep_after: SleepAfter::default(),
            keep_alive: false,
            command_timeout_ms: default_command_timeout_ms(),
            cleanup_interval_ms: default_cleanup_interval_ms(),
            temp_file_max_age_ms: default_temp_file_max_age_ms(),
            temp_dir: default_temp_dir(),
            state_dir: default_state_dir(),
            reserved_apexes: default_reserved_apexes(),
            default_session_id: None,
            default_session_cwd: None,
        }
    }
}

impl Config {
    /// Loads the TOML config at `path` and applies the env overrides.
    pub fn from_file(path: &Path) -> Result<Config, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config =
            toml::from_str(&raw).map_err(|e| ConfigError::TomlError(e.to_string()))?;
        config.validate()?;
        config.apply_env();
        info!("Configuration loaded from {}", path.display());
        Ok(config)
    }

    /// Default config with env overrides applied; used when no file is given.
    pub fn from_env() -> Config {
        let mut config = Config::default();
        config.apply_env();
        config
    }

    fn validate(&self) -> Result<(), ConfigError> {
        if self.control_port == 0 {
            return Err(ConfigError::InvalidValue(
                "control_port must be non-zero".to_string(),
            ));
        }
        if self.command_timeout_ms == 0 {
            return Err(ConfigError::InvalidValue(
                "command_timeout_ms must be positive".to_string(),
            ));
        }
        Ok(())
    }

    /// Applies the environment variable surface on top of the current values.
    pub fn apply_env(&mut self) {
        if let Some(v) = read_env_u64("COMMAND_TIMEOUT_MS") {
            self.command_timeout_ms = v;
        }
        if let Some(v) = read_env_u64("CLEANUP_INTERVAL_MS") {
            self.cleanup_interval_ms = v;
        }
        if let Some(v) = read_env_u64("TEMP_FILE_MAX_AGE_MS") {
            self.temp_file_max_age_ms = v;
        }
        if let Ok(v) = std::env::var("TEMP_DIR") {
            if !v.is_empty() {
                self.temp_dir = PathBuf::from(v);
            }
        }
        if let Ok(v) = std::env::var("SESSION_ID") {
            if !v.is_empty() {
                self.default_session_id = Some(v);
            }
        }
        if let Ok(v) = std::env::var("SESSION_CWD") {
            if !v.is_empty() {
                self.default_session_cwd = Some(PathBuf::from(v));
            }
        }
    }

    /// Id of the sandbox-scoped default session.
    pub fn default_session_name(&self) -> String {
        if let Some(id) = &self.default_session_id {
            return id.clone();
        }
        match &self.sandbox_name {
            Some(name) => format!("sandbox-{}", name),
            None => "sandbox-default".to_string(),
        }
    }
}

fn read_env_u64(key: &str) -> Option<u64> {
    match std::env::var(key) {
        Ok(raw) => match raw.parse::<u64>() {
            Ok(v) => Some(v),
            Err(_) => {
                warn!("Ignoring non-numeric {}={}", key, raw);
                None
            }
        },
        Err(_) => None,
    }
}
