//! State Commands

use super::Context;
use crate::output::{print_list, print_value, OutputFormat, TableDisplay};
use anyhow::{anyhow, Result};
use clap::Subcommand;
use serde::Serialize;
use serde_json::Value;
use skein_common::ResourceRecord;
use skein_orchestrator::StateStore;

/// Output fields that never leave the store unmasked
const SECRET_FIELDS: &[&str] = &["private_key", "password"];

#[derive(Subcommand)]
pub enum StateCommands {
    /// List recorded resources
    List {
        /// Only resources of this kind
        #[arg(short, long)]
        kind: Option<String>,
    },

    /// Show one recorded resource
    Show {
        /// Resource URN
        urn: String,
    },
}

#[derive(Serialize)]
pub struct RecordDisplay {
    pub urn: String,
    pub kind: String,
    pub id: String,
    pub generation: i64,
    pub updated_at: i64,
}

impl From<&ResourceRecord> for RecordDisplay {
    fn from(record: &ResourceRecord) -> Self {
        Self {
            urn: record.urn.clone(),
            kind: record.kind.clone(),
            id: record.id.clone(),
            generation: record.generation,
            updated_at: record.updated_at,
        }
    }
}

impl TableDisplay for RecordDisplay {
    fn headers() -> Vec<&'static str> {
        vec!["URN", "Kind", "ID", "Gen", "Updated"]
    }

    fn row(&self) -> Vec<String> {
        let updated = chrono::DateTime::from_timestamp(self.updated_at, 0)
            .map(|t| t.format("%Y-%m-%d %H:%M:%S").to_string())
            .unwrap_or_else(|| self.updated_at.to_string());
        vec![
            self.urn.clone(),
            self.kind.clone(),
            self.id.chars().take(36).collect(),
            self.generation.to_string(),
            updated,
        ]
    }
}

/// Mask credentials and key material anywhere in `value`
pub fn redact(value: &mut Value) {
    match value {
        Value::Object(map) => {
            for (key, field) in map.iter_mut() {
                if SECRET_FIELDS.contains(&key.as_str()) && !field.is_null() {
                    *field = Value::String("<redacted>".to_string());
                } else {
                    redact(field);
                }
            }
        }
        Value::Array(items) => items.iter_mut().for_each(redact),
        _ => {}
    }
}

pub async fn execute(cmd: StateCommands, ctx: &Context) -> Result<()> {
    let state = StateStore::new(ctx.open_db()?);

    match cmd {
        StateCommands::List { kind } => {
            let records = match kind {
                Some(kind) => state.list_kind(&kind)?,
                None => state.list()?,
            };
            let displays: Vec<RecordDisplay> = records.iter().map(RecordDisplay::from).collect();
            print_list(&displays, ctx.format)?;
        }

        StateCommands::Show { urn } => {
            let mut record = state
                .get(&urn)?
                .ok_or_else(|| anyhow!("no resource recorded under {}", urn))?;
            redact(&mut record.outputs);
            let format = match ctx.format {
                OutputFormat::Table => OutputFormat::Yaml,
                other => other,
            };
            print_value(&record, format)?;
        }
    }

    Ok(())
}
