//! Configuration Commands

use super::Context;
use crate::output::{print_success, print_value, OutputFormat};
use anyhow::{bail, Result};
use clap::Subcommand;

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Print the effective configuration
    Show,

    /// Write the effective configuration to the config file
    Init {
        /// Overwrite an existing file
        #[arg(long)]
        force: bool,
    },
}

pub async fn execute(cmd: ConfigCommands, ctx: &Context) -> Result<()> {
    match cmd {
        ConfigCommands::Show => match ctx.format {
            OutputFormat::Table => print!("{}", toml::to_string_pretty(&ctx.config)?),
            format => print_value(&ctx.config, format)?,
        },

        ConfigCommands::Init { force } => {
            if ctx.config_path.exists() && !force {
                bail!(
                    "{} already exists; pass --force to overwrite",
                    ctx.config_path.display()
                );
            }
            ctx.config.save(&ctx.config_path)?;
            print_success(&format!("Wrote {}", ctx.config_path.display()));
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use skein_orchestrator::OrchestratorConfig;
    use tempfile::TempDir;

    fn context(dir: &TempDir) -> Context {
        Context {
            config: OrchestratorConfig {
                store_path: dir.path().join("store"),
                ..OrchestratorConfig::default()
            },
            config_path: dir.path().join("config.toml"),
            format: OutputFormat::Table,
        }
    }

    #[tokio::test]
    async fn test_init_writes_loadable_config() {
        let dir = TempDir::new().unwrap();
        let ctx = context(&dir);

        execute(ConfigCommands::Init { force: false }, &ctx).await.unwrap();
        let loaded = OrchestratorConfig::load(&ctx.config_path).unwrap();
        assert_eq!(loaded, ctx.config);

        assert!(execute(ConfigCommands::Init { force: false }, &ctx).await.is_err());
        execute(ConfigCommands::Init { force: true }, &ctx).await.unwrap();
    }
}
