//! CLI Commands

pub mod config;
pub mod deploy;
pub mod render;
pub mod state;

use crate::output::OutputFormat;
use anyhow::Context as _;
use skein_common::Database;
use skein_orchestrator::OrchestratorConfig;
use std::path::PathBuf;

/// Settings every command runs with
pub struct Context {
    pub config: OrchestratorConfig,
    pub config_path: PathBuf,
    pub format: OutputFormat,
}

impl Context {
    /// Open the state database named by the configuration
    pub fn open_db(&self) -> anyhow::Result<Database> {
        let path = self.config.db_path();
        Database::open(&path).with_context(|| format!("cannot open state database {}", path.display()))
    }
}
