//! SQLite database for Skein state persistence

use crate::types::ResourceRecord;
use crate::Result;
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension, Transaction, TransactionBehavior};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};

/// How long a writer waits for another process holding the write lock
const BUSY_TIMEOUT: Duration = Duration::from_secs(30);

/// Database wrapper for state persistence
#[derive(Clone)]
pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    /// Expose the underlying connection for internal subsystems that need to manage
    /// their own tables within the shared state DB.
    pub fn connection(&self) -> Arc<Mutex<Connection>> {
        self.conn.clone()
    }
}

impl Database {
    /// Open or create database at path
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        if let Some(parent) = path.as_ref().parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open(path.as_ref())?;

        // WAL lets readers proceed while one writer holds the lock
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        conn.busy_timeout(BUSY_TIMEOUT)?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        info!("Opened database at {:?}", path.as_ref());
        Ok(db)
    }

    /// Open in-memory database (for testing)
    pub fn open_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };
        db.init_schema()?;
        Ok(db)
    }

    /// Initialize database schema
    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock();

        conn.execute_batch(
            r#"
            -- Last-applied state of reconciled resources
            CREATE TABLE IF NOT EXISTS resources (
                urn TEXT PRIMARY KEY,
                kind TEXT NOT NULL,
                id TEXT NOT NULL,
                outputs TEXT NOT NULL,
                dependencies TEXT NOT NULL DEFAULT '[]',
                created_at INTEGER NOT NULL,
                updated_at INTEGER NOT NULL,
                generation INTEGER NOT NULL DEFAULT 1
            );
            CREATE INDEX IF NOT EXISTS idx_resources_kind ON resources(kind);
            "#,
        )?;

        debug!("Database schema initialized");
        Ok(())
    }

    /// Run `f` inside a `BEGIN IMMEDIATE` transaction.
    ///
    /// The write lock is taken up front, so concurrent writers (in this or
    /// another process) queue behind it instead of racing on reads.
    pub fn immediate<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&Transaction<'_>) -> Result<T>,
    {
        let mut conn = self.conn.lock();
        let tx = conn.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let value = f(&tx)?;
        tx.commit()?;
        Ok(value)
    }

    // ========================================================================
    // Resource records
    // ========================================================================

    /// Insert or replace the record stored under `record.urn`
    pub fn put_record(&self, record: &ResourceRecord) -> Result<()> {
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO resources (urn, kind, id, outputs, dependencies, created_at, updated_at, generation)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(urn) DO UPDATE SET
                kind = excluded.kind,
                id = excluded.id,
                outputs = excluded.outputs,
                dependencies = excluded.dependencies,
                updated_at = excluded.updated_at,
                generation = excluded.generation",
            params![
                record.urn,
                record.kind,
                record.id,
                serde_json::to_string(&record.outputs)?,
                serde_json::to_string(&record.dependencies)?,
                record.created_at,
                record.updated_at,
                record.generation,
            ],
        )?;
        debug!("Stored {} record {}", record.kind, record.urn);
        Ok(())
    }

    /// Get a record by URN
    pub fn get_record(&self, urn: &str) -> Result<Option<ResourceRecord>> {
        let conn = self.conn.lock();
        let row = conn
            .query_row(
                "SELECT urn, kind, id, outputs, dependencies, created_at, updated_at, generation
                 FROM resources WHERE urn = ?1",
                params![urn],
                RawRecord::from_row,
            )
            .optional()?;

        row.map(RawRecord::parse).transpose()
    }

    /// List all records in creation order
    pub fn list_records(&self) -> Result<Vec<ResourceRecord>> {
        let conn = self.conn.lock();
        let mut stmt = conn.prepare(
            "SELECT urn, kind, id, outputs, dependencies, created_at, updated_at, generation
             FROM resources ORDER BY created_at ASC, rowid ASC",
        )?;

        let rows = stmt.query_map([], RawRecord::from_row)?;

        let mut results = Vec::new();
        for row in rows {
            results.push(row?.parse()?);
        }
        Ok(results)
    }

    /// Delete a record
    pub fn delete_record(&self, urn: &str) -> Result<bool> {
        let conn = self.conn.lock();
        let rows = conn.execute("DELETE FROM resources WHERE urn = ?1", params![urn])?;
        if rows > 0 {
            debug!("Deleted record {}", urn);
        }
        Ok(rows > 0)
    }
}

/// Raw database row before JSON decoding
struct RawRecord {
    urn: String,
    kind: String,
    id: String,
    outputs: String,
    dependencies: String,
    created_at: i64,
    updated_at: i64,
    generation: i64,
}

impl RawRecord {
    fn from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<Self> {
        Ok(Self {
            urn: row.get(0)?,
            kind: row.get(1)?,
            id: row.get(2)?,
            outputs: row.get(3)?,
            dependencies: row.get(4)?,
            created_at: row.get(5)?,
            updated_at: row.get(6)?,
            generation: row.get(7)?,
        })
    }

    fn parse(self) -> Result<ResourceRecord> {
        Ok(ResourceRecord {
            urn: self.urn,
            kind: self.kind,
            id: self.id,
            outputs: serde_json::from_str(&self.outputs)?,
            dependencies: serde_json::from_str(&self.dependencies)?,
            created_at: self.created_at,
            updated_at: self.updated_at,
            generation: self.generation,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_record_crud() {
        let db = Database::open_memory().unwrap();

        let record = ResourceRecord::new("endpoint/web", "endpoint", "abc", json!({"ip": "10.0.0.1"}))
            .with_dependencies(vec!["network/mesh".into()]);
        db.put_record(&record).unwrap();

        let fetched = db.get_record("endpoint/web").unwrap().unwrap();
        assert_eq!(fetched.id, "abc");
        assert_eq!(fetched.outputs["ip"], "10.0.0.1");
        assert_eq!(fetched.dependencies, vec!["network/mesh"]);

        let mut updated = fetched.clone();
        updated.outputs = json!({"ip": "10.0.0.2"});
        updated.touch();
        db.put_record(&updated).unwrap();

        let fetched = db.get_record("endpoint/web").unwrap().unwrap();
        assert_eq!(fetched.generation, 2);
        assert_eq!(fetched.outputs["ip"], "10.0.0.2");

        assert_eq!(db.list_records().unwrap().len(), 1);
        assert!(db.delete_record("endpoint/web").unwrap());
        assert!(!db.delete_record("endpoint/web").unwrap());
        assert!(db.get_record("endpoint/web").unwrap().is_none());
    }

    #[test]
    fn test_records_listed_in_insertion_order() {
        let db = Database::open_memory().unwrap();
        for urn in ["a", "b", "c"] {
            db.put_record(&ResourceRecord::new(urn, "k", urn, json!({}))).unwrap();
        }
        let urns: Vec<_> = db.list_records().unwrap().into_iter().map(|r| r.urn).collect();
        assert_eq!(urns, vec!["a", "b", "c"]);
    }

    #[test]
    fn test_immediate_rolls_back_on_error() {
        let db = Database::open_memory().unwrap();
        let result: Result<()> = db.immediate(|tx| {
            tx.execute(
                "INSERT INTO resources (urn, kind, id, outputs, created_at, updated_at)
                 VALUES ('port:mesh:a', 'port', 'p1', '{}', 0, 0)",
                [],
            )?;
            Err(crate::Error::Internal("abort".into()))
        });
        assert!(result.is_err());
        assert!(db.get_record("port:mesh:a").unwrap().is_none());
    }

    #[test]
    fn test_file_database_persists() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("nested").join("state.db");
        {
            let db = Database::open(&path).unwrap();
            db.put_record(&ResourceRecord::new("ca_epoch:mesh:3", "ca_epoch", "ca3", json!({"epoch": 3})))
                .unwrap();
        }
        let db = Database::open(&path).unwrap();
        let record = db.get_record("ca_epoch:mesh:3").unwrap().unwrap();
        assert_eq!(record.outputs["epoch"], 3);
    }
}
