//! Allocator driven over SSH
//!
//! Runs `skein-ipam` on a designated host, which keeps the authoritative
//! state for every orchestration run that targets it. Calls from this
//! process are additionally queued behind one lock.

use super::protocol::{EXIT_EXHAUSTED, EXIT_INVALID, EXIT_NOT_FOUND};
use super::{AddressRange, Allocator, PortRange};
use crate::ssh::{shell_quote, Connector};
use async_trait::async_trait;
use skein_common::{ConnectionParams, Error, Result};
use std::net::Ipv4Addr;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

pub struct RemoteAllocator {
    connector: Arc<dyn Connector>,
    connection: ConnectionParams,
    binary: String,
    serial: Mutex<()>,
}

impl RemoteAllocator {
    pub fn new(connector: Arc<dyn Connector>, connection: ConnectionParams, binary: impl Into<String>) -> Self {
        Self {
            connector,
            connection,
            binary: binary.into(),
            serial: Mutex::new(()),
        }
    }

    async fn invoke(&self, args: &[&str]) -> Result<String> {
        let command = std::iter::once(self.binary.as_str())
            .chain(args.iter().copied())
            .map(shell_quote)
            .collect::<Vec<_>>()
            .join(" ");

        let _guard = self.serial.lock().await;
        debug!("IPAM on {}: {}", self.connection.host, command);

        let mut session = self.connector.connect(&self.connection).await?;
        let result = session.exec(&command).await;
        if let Err(e) = session.close().await {
            debug!("Closing IPAM session failed: {}", e);
        }
        let output = result?;

        if output.success() {
            return Ok(output.stdout.trim().to_string());
        }

        let stderr = output.stderr.trim().to_string();
        let scope = args.get(1).copied().unwrap_or_default().to_string();
        Err(match output.exit_code {
            EXIT_EXHAUSTED => Error::Exhaustion {
                scope,
                resource: if args[0].ends_with("port") { "port" } else { "address" }.to_string(),
            },
            EXIT_INVALID => Error::Validation(stderr),
            EXIT_NOT_FOUND => Error::NotFound {
                kind: "allocation scope".to_string(),
                id: scope,
            },
            exit_code => Error::Provisioning {
                command,
                exit_code,
                stderr,
            },
        })
    }

    fn parse<T: std::str::FromStr>(output: &str, what: &str) -> Result<T> {
        output
            .parse()
            .map_err(|_| Error::Internal(format!("allocator returned invalid {}: {:?}", what, output)))
    }

    fn parse_listing<T: std::str::FromStr>(output: &str, what: &str) -> Result<Vec<(String, T)>> {
        output
            .lines()
            .filter(|line| !line.trim().is_empty())
            .map(|line| {
                let (id, value) = line
                    .split_once(' ')
                    .ok_or_else(|| Error::Internal(format!("malformed listing line: {:?}", line)))?;
                Ok((id.to_string(), Self::parse(value.trim(), what)?))
            })
            .collect()
    }
}

#[async_trait]
impl Allocator for RemoteAllocator {
    async fn create_network(&self, network_id: &str, cidr: &str) -> Result<AddressRange> {
        // validate locally before touching the remote host
        let range = AddressRange::from_cidr(cidr)?;
        self.invoke(&["create-network", network_id, cidr]).await?;
        Ok(range)
    }

    async fn destroy_network(&self, network_id: &str) -> Result<()> {
        self.invoke(&["destroy-network", network_id]).await.map(|_| ())
    }

    async fn allocate_address(&self, network_id: &str, address_id: &str) -> Result<Ipv4Addr> {
        let output = self.invoke(&["allocate-address", network_id, address_id]).await?;
        Self::parse(&output, "address")
    }

    async fn free_address(&self, network_id: &str, address_id: &str) -> Result<()> {
        self.invoke(&["free-address", network_id, address_id]).await.map(|_| ())
    }

    async fn list_addresses(&self, network_id: &str) -> Result<Vec<(String, Ipv4Addr)>> {
        let output = self.invoke(&["list-allocations", network_id]).await?;
        Self::parse_listing(&output, "address")
    }

    async fn claim_address(&self, network_id: &str, address_id: &str, address: Ipv4Addr) -> Result<()> {
        let address = address.to_string();
        self.invoke(&["claim-address", network_id, address_id, &address])
            .await
            .map(|_| ())
    }

    async fn create_host(&self, host_id: &str, range: PortRange) -> Result<()> {
        let start = range.start.to_string();
        let end = range.end.to_string();
        self.invoke(&["create-host", host_id, &start, &end]).await.map(|_| ())
    }

    async fn delete_host(&self, host_id: &str) -> Result<()> {
        self.invoke(&["delete-host", host_id]).await.map(|_| ())
    }

    async fn allocate_port(&self, host_id: &str, port_id: &str) -> Result<u16> {
        let output = self.invoke(&["allocate-port", host_id, port_id]).await?;
        Self::parse(&output, "port")
    }

    async fn free_port(&self, host_id: &str, port_id: &str) -> Result<()> {
        self.invoke(&["free-port", host_id, port_id]).await.map(|_| ())
    }

    async fn list_ports(&self, host_id: &str) -> Result<Vec<(String, u16)>> {
        let output = self.invoke(&["list-ports", host_id]).await?;
        Self::parse_listing(&output, "port")
    }

    async fn claim_port(&self, host_id: &str, port_id: &str, port: u16) -> Result<()> {
        let port = port.to_string();
        self.invoke(&["claim-port", host_id, port_id, &port]).await.map(|_| ())
    }
}
