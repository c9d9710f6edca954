//! Recorded resource state

use serde::de::DeserializeOwned;
use serde::Serialize;
use skein_common::{Database, Error, ResourceRecord, Result};
use tracing::debug;

/// Last-applied outputs of every reconciled resource
#[derive(Clone)]
pub struct StateStore {
    db: Database,
}

impl StateStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Get database
    pub fn db(&self) -> &Database {
        &self.db
    }

    pub fn get(&self, urn: &str) -> Result<Option<ResourceRecord>> {
        self.db.get_record(urn)
    }

    /// Record and its outputs decoded as `T`
    pub fn get_typed<T: DeserializeOwned>(&self, urn: &str) -> Result<Option<(ResourceRecord, T)>> {
        match self.db.get_record(urn)? {
            Some(record) => {
                let outputs = decode(&record)?;
                Ok(Some((record, outputs)))
            }
            None => Ok(None),
        }
    }

    /// Outputs of a resource that must already exist
    pub fn outputs<T: DeserializeOwned>(&self, urn: &str) -> Result<T> {
        self.get_typed(urn)?
            .map(|(_, outputs)| outputs)
            .ok_or_else(|| Error::NotFound {
                kind: "resource".into(),
                id: urn.to_string(),
            })
    }

    pub fn put<T: Serialize>(&self, urn: &str, kind: &str, id: &str, outputs: &T, dependencies: Vec<String>) -> Result<ResourceRecord> {
        let outputs = serde_json::to_value(outputs)?;
        let record = match self.db.get_record(urn)? {
            Some(mut existing) if existing.id == id && existing.kind == kind => {
                existing.outputs = outputs;
                existing.dependencies = dependencies;
                existing.touch();
                existing
            }
            _ => ResourceRecord::new(urn, kind, id, outputs).with_dependencies(dependencies),
        };
        self.db.put_record(&record)?;
        debug!("Recorded {} ({} {}), generation {}", urn, kind, id, record.generation);
        Ok(record)
    }

    pub fn remove(&self, urn: &str) -> Result<bool> {
        self.db.delete_record(urn)
    }

    pub fn list(&self) -> Result<Vec<ResourceRecord>> {
        self.db.list_records()
    }

    pub fn list_kind(&self, kind: &str) -> Result<Vec<ResourceRecord>> {
        Ok(self
            .db
            .list_records()?
            .into_iter()
            .filter(|r| r.kind == kind)
            .collect())
    }
}

/// Decode the outputs of a record
pub fn decode<T: DeserializeOwned>(record: &ResourceRecord) -> Result<T> {
    serde_json::from_value(record.outputs.clone()).map_err(|e| {
        Error::Internal(format!(
            "recorded outputs of {} do not match {}: {}",
            record.urn, record.kind, e
        ))
    })
}
