//! Orchestrator configuration

use serde::{Deserialize, Serialize};
use skein_common::{Error, Result};
use skein_provider::resources::NetworkMode;
use std::path::{Path, PathBuf};

/// Orchestrator configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct OrchestratorConfig {
    /// Store directory path
    pub store_path: PathBuf,

    /// Validity of every CA generation
    pub ca_validity_hours: i64,

    /// Validity of endpoint certificates
    pub leaf_validity_days: i64,

    /// Allocator backend
    pub ipam: IpamConfig,

    /// Certificate issuer
    pub certs: CertsConfig,

    /// Agent deployment settings
    pub agent: AgentSettings,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            store_path: skein_common::default_store_path(),
            ca_validity_hours: 168,
            leaf_validity_days: 365,
            ipam: IpamConfig::default(),
            certs: CertsConfig::default(),
            agent: AgentSettings::default(),
        }
    }
}

/// Where allocation state lives
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum IpamConfig {
    /// SQLite tables in the state database
    #[default]
    Local,
    /// `skein-ipam` on a declared host
    Remote {
        /// Host name from the declaration
        host: String,
        #[serde(default = "default_ipam_binary")]
        binary: String,
    },
}

fn default_ipam_binary() -> String {
    "/opt/skein/bin/skein-ipam".to_string()
}

/// How certificates are produced
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "backend", rename_all = "lowercase")]
pub enum CertsConfig {
    #[default]
    Builtin,
    /// Local `skein-certs` binary
    Subprocess {
        #[serde(default = "default_certs_binary")]
        binary: PathBuf,
    },
}

fn default_certs_binary() -> PathBuf {
    PathBuf::from("skein-certs")
}

/// Mesh agent deployment settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct AgentSettings {
    /// Remote directory for rendered agent configs
    pub config_dir: String,

    /// Prefix of agent service names
    pub service_prefix: String,

    /// Log level written to every agent config
    pub log_level: String,

    pub network_mode: NetworkMode,
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            config_dir: "/etc/skein".to_string(),
            service_prefix: "skein-".to_string(),
            log_level: "info".to_string(),
            network_mode: NetworkMode::Host,
        }
    }
}

impl OrchestratorConfig {
    /// Load configuration from file, or defaults if it does not exist
    pub fn load(path: &Path) -> Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: Self = toml::from_str(&content)
                .map_err(|e| Error::Config(format!("{}: {}", path.display(), e)))?;
            config.validate()?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Save configuration to file
    pub fn save(&self, path: &Path) -> Result<()> {
        let content = toml::to_string_pretty(self).map_err(|e| Error::Config(e.to_string()))?;
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(path, content)?;
        Ok(())
    }

    pub fn validate(&self) -> Result<()> {
        if self.ca_validity_hours <= 0 {
            return Err(Error::Config("ca_validity_hours must be positive".into()));
        }
        if self.leaf_validity_days <= 0 {
            return Err(Error::Config("leaf_validity_days must be positive".into()));
        }
        if self.agent.config_dir.trim().is_empty() {
            return Err(Error::Config("agent.config_dir is empty".into()));
        }
        Ok(())
    }

    /// Get the database path
    pub fn db_path(&self) -> PathBuf {
        self.store_path.join("state.db")
    }
}
