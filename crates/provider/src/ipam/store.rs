//! SQLite-backed allocator
//!
//! Tables:
//! - ipam_networks / ipam_hosts: scope bounds (inclusive)
//! - ipam_addresses / ipam_ports: id -> value bindings, unique per scope
//!
//! Mutations run in `BEGIN IMMEDIATE` transactions, so concurrent writers
//! against the same database file are serialized by SQLite's write lock.

use super::{first_fit, AddressRange, Allocator, PortRange};
use async_trait::async_trait;
use rusqlite::{params, Connection, OptionalExtension};
use skein_common::{Database, Error, Result};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use tracing::{debug, info};

/// Table pair backing one family of scopes
#[derive(Debug, Clone, Copy)]
struct ScopeTables {
    scopes: &'static str,
    bindings: &'static str,
    scope_noun: &'static str,
    value_noun: &'static str,
}

const ADDRESSES: ScopeTables = ScopeTables {
    scopes: "ipam_networks",
    bindings: "ipam_addresses",
    scope_noun: "network",
    value_noun: "address",
};

const PORTS: ScopeTables = ScopeTables {
    scopes: "ipam_hosts",
    bindings: "ipam_ports",
    scope_noun: "host",
    value_noun: "port",
};

/// Allocator whose state lives in the shared state database
#[derive(Clone)]
pub struct SqliteAllocator {
    db: Database,
}

impl SqliteAllocator {
    pub fn new(db: Database) -> Result<Self> {
        let allocator = Self { db };
        allocator.init_schema()?;
        Ok(allocator)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.db.connection();
        let conn = conn.lock();
        for tables in [ADDRESSES, PORTS] {
            conn.execute_batch(&format!(
                r#"
                CREATE TABLE IF NOT EXISTS {scopes} (
                    scope_id TEXT PRIMARY KEY,
                    description TEXT NOT NULL,
                    lower INTEGER NOT NULL,
                    upper INTEGER NOT NULL,
                    created_at INTEGER NOT NULL
                );
                CREATE TABLE IF NOT EXISTS {bindings} (
                    scope_id TEXT NOT NULL,
                    binding_id TEXT NOT NULL,
                    value INTEGER NOT NULL,
                    created_at INTEGER NOT NULL,
                    PRIMARY KEY (scope_id, binding_id),
                    UNIQUE (scope_id, value)
                );
                "#,
                scopes = tables.scopes,
                bindings = tables.bindings,
            ))?;
        }
        debug!("IPAM schema initialized");
        Ok(())
    }

    fn create_scope(&self, tables: ScopeTables, scope_id: &str, description: &str, lower: u32, upper: u32) -> Result<()> {
        self.db.immediate(|tx| {
            if let Some(existing) = bounds(tx, tables, scope_id)? {
                if existing == (lower, upper) {
                    debug!("{} {} already exists", tables.scope_noun, scope_id);
                    return Ok(());
                }
                return Err(Error::AlreadyExists {
                    kind: tables.scope_noun.to_string(),
                    id: scope_id.to_string(),
                });
            }
            tx.execute(
                &format!(
                    "INSERT INTO {} (scope_id, description, lower, upper, created_at) VALUES (?1, ?2, ?3, ?4, ?5)",
                    tables.scopes
                ),
                params![scope_id, description, lower, upper, chrono::Utc::now().timestamp()],
            )?;
            info!("Created {} scope {} ({})", tables.scope_noun, scope_id, description);
            Ok(())
        })
    }

    fn destroy_scope(&self, tables: ScopeTables, scope_id: &str) -> Result<()> {
        self.db.immediate(|tx| {
            let released = tx.execute(
                &format!("DELETE FROM {} WHERE scope_id = ?1", tables.bindings),
                params![scope_id],
            )?;
            let removed = tx.execute(
                &format!("DELETE FROM {} WHERE scope_id = ?1", tables.scopes),
                params![scope_id],
            )?;
            if removed > 0 {
                info!(
                    "Destroyed {} scope {} ({} binding(s) released)",
                    tables.scope_noun, scope_id, released
                );
            }
            Ok(())
        })
    }

    fn allocate(&self, tables: ScopeTables, scope_id: &str, binding_id: &str) -> Result<u32> {
        self.db.immediate(|tx| {
            let (lower, upper) = require_bounds(tx, tables, scope_id)?;

            if let Some(value) = binding(tx, tables, scope_id, binding_id)? {
                debug!("{} {} already bound in {}", tables.value_noun, binding_id, scope_id);
                return Ok(value);
            }

            let mut stmt = tx.prepare(&format!(
                "SELECT value FROM {} WHERE scope_id = ?1 AND value BETWEEN ?2 AND ?3",
                tables.bindings
            ))?;
            let taken = stmt
                .query_map(params![scope_id, lower, upper], |row| row.get::<_, u32>(0))?
                .collect::<rusqlite::Result<BTreeSet<u32>>>()?;

            let value = first_fit(lower, upper, &taken).ok_or_else(|| Error::Exhaustion {
                scope: scope_id.to_string(),
                resource: tables.value_noun.to_string(),
            })?;

            tx.execute(
                &format!(
                    "INSERT INTO {} (scope_id, binding_id, value, created_at) VALUES (?1, ?2, ?3, ?4)",
                    tables.bindings
                ),
                params![scope_id, binding_id, value, chrono::Utc::now().timestamp()],
            )?;
            Ok(value)
        })
    }

    fn free(&self, tables: ScopeTables, scope_id: &str, binding_id: &str) -> Result<()> {
        self.db.immediate(|tx| {
            let removed = tx.execute(
                &format!(
                    "DELETE FROM {} WHERE scope_id = ?1 AND binding_id = ?2",
                    tables.bindings
                ),
                params![scope_id, binding_id],
            )?;
            if removed == 0 {
                debug!("{} {} not bound in {}", tables.value_noun, binding_id, scope_id);
            }
            Ok(())
        })
    }

    fn claim(&self, tables: ScopeTables, scope_id: &str, binding_id: &str, value: u32) -> Result<()> {
        self.db.immediate(|tx| {
            let (lower, upper) = require_bounds(tx, tables, scope_id)?;
            if value < lower || value > upper {
                return Err(Error::Validation(format!(
                    "{} {} is outside {} {}",
                    tables.value_noun, value, tables.scope_noun, scope_id
                )));
            }

            match binding(tx, tables, scope_id, binding_id)? {
                Some(existing) if existing == value => return Ok(()),
                Some(existing) => {
                    return Err(Error::Validation(format!(
                        "{} is bound to {} {}, not {}",
                        binding_id, tables.value_noun, existing, value
                    )))
                }
                None => {}
            }

            let holder: Option<String> = tx
                .query_row(
                    &format!(
                        "SELECT binding_id FROM {} WHERE scope_id = ?1 AND value = ?2",
                        tables.bindings
                    ),
                    params![scope_id, value],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(holder) = holder {
                return Err(Error::Validation(format!(
                    "{} {} is already held by {}",
                    tables.value_noun, value, holder
                )));
            }

            tx.execute(
                &format!(
                    "INSERT INTO {} (scope_id, binding_id, value, created_at) VALUES (?1, ?2, ?3, ?4)",
                    tables.bindings
                ),
                params![scope_id, binding_id, value, chrono::Utc::now().timestamp()],
            )?;
            Ok(())
        })
    }

    fn list(&self, tables: ScopeTables, scope_id: &str) -> Result<Vec<(String, u32)>> {
        let conn = self.db.connection();
        let conn = conn.lock();
        require_bounds(&conn, tables, scope_id)?;

        let mut stmt = conn.prepare(&format!(
            "SELECT binding_id, value FROM {} WHERE scope_id = ?1 ORDER BY value",
            tables.bindings
        ))?;
        let rows = stmt
            .query_map(params![scope_id], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<(String, u32)>>>()?;
        Ok(rows)
    }
}

fn bounds(conn: &Connection, tables: ScopeTables, scope_id: &str) -> Result<Option<(u32, u32)>> {
    Ok(conn
        .query_row(
            &format!("SELECT lower, upper FROM {} WHERE scope_id = ?1", tables.scopes),
            params![scope_id],
            |row| Ok((row.get(0)?, row.get(1)?)),
        )
        .optional()?)
}

fn require_bounds(conn: &Connection, tables: ScopeTables, scope_id: &str) -> Result<(u32, u32)> {
    bounds(conn, tables, scope_id)?.ok_or_else(|| Error::NotFound {
        kind: tables.scope_noun.to_string(),
        id: scope_id.to_string(),
    })
}

fn binding(conn: &Connection, tables: ScopeTables, scope_id: &str, binding_id: &str) -> Result<Option<u32>> {
    Ok(conn
        .query_row(
            &format!(
                "SELECT value FROM {} WHERE scope_id = ?1 AND binding_id = ?2",
                tables.bindings
            ),
            params![scope_id, binding_id],
            |row| row.get(0),
        )
        .optional()?)
}

fn to_port(value: u32) -> Result<u16> {
    u16::try_from(value).map_err(|_| Error::Internal(format!("stored port {} out of range", value)))
}

#[async_trait]
impl Allocator for SqliteAllocator {
    async fn create_network(&self, network_id: &str, cidr: &str) -> Result<AddressRange> {
        let range = AddressRange::from_cidr(cidr)?;
        self.create_scope(
            ADDRESSES,
            network_id,
            cidr,
            u32::from(range.lower),
            u32::from(range.upper),
        )?;
        Ok(range)
    }

    async fn destroy_network(&self, network_id: &str) -> Result<()> {
        self.destroy_scope(ADDRESSES, network_id)
    }

    async fn allocate_address(&self, network_id: &str, address_id: &str) -> Result<Ipv4Addr> {
        let value = self.allocate(ADDRESSES, network_id, address_id)?;
        let address = Ipv4Addr::from(value);
        info!("Allocated {} to {} in network {}", address, address_id, network_id);
        Ok(address)
    }

    async fn free_address(&self, network_id: &str, address_id: &str) -> Result<()> {
        self.free(ADDRESSES, network_id, address_id)
    }

    async fn list_addresses(&self, network_id: &str) -> Result<Vec<(String, Ipv4Addr)>> {
        Ok(self
            .list(ADDRESSES, network_id)?
            .into_iter()
            .map(|(id, value)| (id, Ipv4Addr::from(value)))
            .collect())
    }

    async fn claim_address(&self, network_id: &str, address_id: &str, address: Ipv4Addr) -> Result<()> {
        self.claim(ADDRESSES, network_id, address_id, u32::from(address))
    }

    async fn create_host(&self, host_id: &str, range: PortRange) -> Result<()> {
        self.create_scope(
            PORTS,
            host_id,
            &range.to_string(),
            u32::from(range.start),
            u32::from(range.last()),
        )
    }

    async fn delete_host(&self, host_id: &str) -> Result<()> {
        self.destroy_scope(PORTS, host_id)
    }

    async fn allocate_port(&self, host_id: &str, port_id: &str) -> Result<u16> {
        let port = to_port(self.allocate(PORTS, host_id, port_id)?)?;
        info!("Allocated port {} to {} on host {}", port, port_id, host_id);
        Ok(port)
    }

    async fn free_port(&self, host_id: &str, port_id: &str) -> Result<()> {
        self.free(PORTS, host_id, port_id)
    }

    async fn list_ports(&self, host_id: &str) -> Result<Vec<(String, u16)>> {
        self.list(PORTS, host_id)?
            .into_iter()
            .map(|(id, value)| Ok((id, to_port(value)?)))
            .collect()
    }

    async fn claim_port(&self, host_id: &str, port_id: &str, port: u16) -> Result<()> {
        self.claim(PORTS, host_id, port_id, u32::from(port))
    }
}
