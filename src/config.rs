use crate::{error::utils::config_error, Result};
use serde::{Deserialize, Serialize};
use std::{fs, net::SocketAddr, path::{Path, PathBuf}, time::Duration};

#[derive(Debug, Serialize, Deserialize, Clone, PartialEq)]
#[serde(default)]
pub struct RouterConfig {
    /// Data-plane listener
    pub proxy_addr: SocketAddr,
    /// Admin listener
    pub admin_addr: SocketAddr,
    /// Directory holding sv.json, vr.json and rp.json
    pub data_dir: PathBuf,
    pub probe_timeout_ms: u64,
    /// Prometheus exporter listener; metrics are not exported when unset
    pub metrics_addr: Option<SocketAddr>,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            proxy_addr: SocketAddr::from(([0, 0, 0, 0], 2000)),
            admin_addr: SocketAddr::from(([0, 0, 0, 0], 2001)),
            data_dir: PathBuf::from("data"),
            probe_timeout_ms: 2000,
            metrics_addr: None,
        }
    }
}

impl RouterConfig {
    pub fn probe_timeout(&self) -> Duration {
        Duration::from_millis(self.probe_timeout_ms)
    }

    pub fn validate(&self) -> Result<()> {
        if self.probe_timeout_ms == 0 {
            return Err(config_error("probe_timeout_ms must be greater than zero"));
        }
        if self.proxy_addr == self.admin_addr && self.proxy_addr.port() != 0 {
            return Err(config_error(format!(
                "proxy_addr and admin_addr must differ (both {})",
                self.proxy_addr
            )));
        }
        Ok(())
    }
}

pub fn load_config<P: AsRef<Path>>(path: P) -> Result<RouterConfig> {
    let path = path.as_ref();
    let content = fs::read_to_string(path)
        .map_err(|e| config_error(format!("Failed to read config {}: {}", path.display(), e)))?;
    let config: RouterConfig = serde_yaml::from_str(&content)
        .map_err(|e| config_error(format!("Failed to parse config {}: {}", path.display(), e)))?;
    config.validate()?;
    Ok(config)
}
