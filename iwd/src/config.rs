use iw_client::PortConfig;
use serde::Deserialize;
use serde_json::Value;
use std::path::{Path, PathBuf};

use crate::DaemonError;

/// One entry of the daemon's `modules` list
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModuleConfig {
    /// Component type, e.g. `udp-discovery`
    pub component: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Lower tiers start first
    #[serde(default)]
    pub priority: i64,
    /// Event the tier waits for after `start` returns
    #[serde(default, rename = "await")]
    pub await_event: Option<String>,
    #[serde(default)]
    pub config: Value,
}

impl ModuleConfig {
    pub fn label(&self) -> String {
        match &self.name {
            Some(name) => format!("{} ({})", self.component, name),
            None => self.component.clone(),
        }
    }
}

/// Config handed to the orchestrator's own `start`
#[derive(Debug, Clone, Default, Deserialize)]
pub struct ApplicationConfig {
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

/// Top level daemon config file
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DaemonConfig {
    /// Directory for the daily rolling log, stdout when unset
    #[serde(default)]
    pub log_dir: Option<PathBuf>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    /// Friendly name used for the node's broker client
    #[serde(default)]
    pub friendly_name: Option<String>,
    /// Seconds between reconnect attempts
    #[serde(default)]
    pub reconnect_delay: Option<u64>,
    /// Present on the node hosting the broker
    #[serde(default)]
    pub server: Option<PortConfig>,
    #[serde(default)]
    pub modules: Vec<ModuleConfig>,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl DaemonConfig {
    pub fn load(path: &Path) -> Result<Self, DaemonError> {
        let raw = std::fs::read_to_string(path)?;
        Ok(serde_json::from_str(&raw)?)
    }
}
