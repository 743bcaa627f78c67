use chrono::{DateTime, SecondsFormat, Utc};
use log::{debug, info};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Mutex;

use crate::configuration::Config;
use crate::error_handling::types::PortError;

const MIN_USER_PORT: u16 = 1024;

/// Wire shape of one exposed port.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ExposedPortInfo {
    pub port: u16,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    pub exposed_at: String,
    pub url: String,
}

#[derive(Debug, Clone)]
struct ExposedPort {
    name: Option<String>,
    exposed_at: DateTime<Utc>,
}

/// The set of user ports currently exposed for one sandbox.
///
/// At most one entry per port; the control-plane port is never exposable.
pub struct PortRegistry {
    ports: Mutex<HashMap<u16, ExposedPort>>,
    control_port: u16,
}

impl PortRegistry {
    pub fn new(control_port: u16) -> Self {
        PortRegistry {
            ports: Mutex::new(HashMap::new()),
            control_port,
        }
    }

    fn validate(&self, port: u16) -> Result<(), PortError> {
        if port < MIN_USER_PORT {
            return Err(PortError::InvalidPort(port));
        }
        if port == self.control_port {
            return Err(PortError::Reserved(port));
        }
        Ok(())
    }

    pub fn expose(
        &self,
        port: u16,
        name: Option<String>,
        config: &Config,
        sandbox_id: &str,
    ) -> Result<ExposedPortInfo, PortError> {
        self.validate(port)?;

        let mut ports = self.ports.lock().unwrap();
        if ports.contains_key(&port) {
            return Err(PortError::AlreadyExposed(port));
        }

        let entry = ExposedPort {
            name: name.clone(),
            exposed_at: Utc::now(),
        };
        let info = self.info_for(port, &entry, config, sandbox_id)?;
        ports.insert(port, entry);
        info!("Exposed port {} as {}", port, info.url);
        Ok(info)
    }

    pub fn unexpose(&self, port: u16) -> Result<(), PortError> {
        match self.ports.lock().unwrap().remove(&port) {
            Some(_) => {
                info!("Unexposed port {}", port);
                Ok(())
            }
            None => Err(PortError::NotExposed(port)),
        }
    }

    pub fn is_exposed(&self, port: u16) -> bool {
        self.ports.lock().unwrap().contains_key(&port)
    }

    pub fn list(&self, config: &Config, sandbox_id: &str) -> Vec<ExposedPortInfo> {
        let ports = self.ports.lock().unwrap();
        let mut infos: Vec<ExposedPortInfo> = ports
            .iter()
            .filter_map(|(port, entry)| self.info_for(*port, entry, config, sandbox_id).ok())
            .collect();
        infos.sort_by_key(|info| info.port);
        infos
    }

    pub fn clear(&self) {
        let mut ports = self.ports.lock().unwrap();
        if !ports.is_empty() {
            debug!("Clearing {} exposed ports", ports.len());
        }
        ports.clear();
    }

    fn info_for(
        &self,
        port: u16,
        entry: &ExposedPort,
        config: &Config,
        sandbox_id: &str,
    ) -> Result<ExposedPortInfo, PortError> {
        Ok(ExposedPortInfo {
            port,
            name: entry.name.clone(),
            exposed_at: entry.exposed_at.to_rfc3339_opts(SecondsFormat::Millis, true),
            url: build_preview_url(config, sandbox_id, port)?,
        })
    }
}

/// Builds the externally routable URL for an exposed port.
///
/// With a configured base URL the subdomain form is used; hostnames whose
/// apex is on the reserved list cannot carry wildcard preview DNS and are
/// rejected. Without a base URL the localhost dev path form is used.
pub fn build_preview_url(
    config: &Config,
    sandbox_id: &str,
    port: u16,
) -> Result<String, PortError> {
    match &config.base_url {
        Some(base) => {
            let parsed = url::Url::parse(base)
                .map_err(|_| PortError::CustomDomainRequired(base.clone()))?;
            let host = parsed
                .host_str()
                .ok_or_else(|| PortError::CustomDomainRequired(base.clone()))?;

            for apex in &config.reserved_apexes {
                if host == apex || host.ends_with(&format!(".{}", apex)) {
                    return Err(PortError::CustomDomainRequired(host.to_string()));
                }
            }

            Ok(format!(
                "{}://{}-{}.{}/",
                parsed.scheme(),
                port,
                sandbox_id,
                host
            ))
        }
        None => Ok(format!(
            "http://localhost:{}/preview/{}/{}/",
            config.router_port, port, sandbox_id
        )),
    }
}
