//! Declared hosts, networks and endpoints
//!
//! The declaration is a TOML document:
//!
//! ```toml
//! [hosts.node1]
//! host = "203.0.113.7"
//! user = "root"
//! private_key_file = "/root/.ssh/id_ed25519"
//!
//! [networks.mesh]
//! cidr = "10.0.1.0/24"
//! epoch = 1
//! lighthouses = ["node1"]
//!
//! [endpoints.backend]
//! network = "mesh"
//! host = "node1"
//! groups = ["app"]
//! firewall = { inbound = [{ host = "any", port = 80 }], outbound = [] }
//! ```

use serde::{Deserialize, Serialize};
use skein_common::{ConnectionParams, Error, FirewallPolicy, Result};
use skein_provider::ipam::{AddressRange, PortRange};
use skein_provider::resources::port::DEFAULT_PORT_RANGE;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// Default DNS domain of a network
pub const DEFAULT_DOMAIN: &str = "skein.internal";

fn default_ssh_port() -> u16 {
    22
}

fn default_domain() -> String {
    DEFAULT_DOMAIN.to_string()
}

fn default_port_range() -> (u16, u32) {
    DEFAULT_PORT_RANGE
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct Declaration {
    #[serde(default)]
    pub hosts: BTreeMap<String, HostDecl>,
    #[serde(default)]
    pub networks: BTreeMap<String, NetworkDecl>,
    #[serde(default)]
    pub endpoints: BTreeMap<String, EndpointDecl>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostDecl {
    /// Address the host is reached at, also its underlay address
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct NetworkDecl {
    pub cidr: String,
    pub epoch: u64,
    #[serde(default = "default_domain")]
    pub domain: String,
    /// Hosts that run a lighthouse, in order
    pub lighthouses: Vec<String>,
    /// Underlay ports each enrolled host may use, `[start, end)`
    #[serde(default = "default_port_range")]
    pub underlay_ports: (u16, u32),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EndpointDecl {
    pub network: String,
    pub host: String,
    /// Defaults to the endpoint's name
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub hostname: Option<String>,
    #[serde(default)]
    pub groups: Vec<String>,
    #[serde(default)]
    pub firewall: FirewallPolicy,
}

impl HostDecl {
    /// Resolve credentials into connection parameters
    pub fn connection(&self, name: &str) -> Result<ConnectionParams> {
        let private_key = match (&self.private_key, &self.private_key_file) {
            (Some(_), Some(_)) => {
                return Err(Error::Config(format!(
                    "host {} sets both private_key and private_key_file",
                    name
                )))
            }
            (Some(key), None) => Some(key.clone()),
            (None, Some(path)) => Some(std::fs::read_to_string(path).map_err(|e| {
                Error::Config(format!(
                    "host {}: cannot read {}: {}",
                    name,
                    path.display(),
                    e
                ))
            })?),
            (None, None) => None,
        };

        let params = ConnectionParams {
            host: self.host.clone(),
            port: self.port,
            user: self.user.clone(),
            password: self.password.clone(),
            private_key,
        };
        params
            .validate()
            .map_err(|e| Error::Config(format!("host {}: {}", name, e)))?;
        Ok(params)
    }
}

impl EndpointDecl {
    pub fn hostname<'a>(&'a self, name: &'a str) -> &'a str {
        self.hostname.as_deref().unwrap_or(name)
    }
}

impl Declaration {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        let declaration: Self =
            toml::from_str(content).map_err(|e| Error::Config(format!("malformed declaration: {}", e)))?;
        declaration.validate()?;
        Ok(declaration)
    }

    fn require_host(&self, name: &str, referrer: &str) -> Result<&HostDecl> {
        self.hosts
            .get(name)
            .ok_or_else(|| Error::Config(format!("{} refers to unknown host {}", referrer, name)))
    }

    pub fn validate(&self) -> Result<()> {
        for (name, host) in &self.hosts {
            host.connection(name)?;
        }

        for (name, network) in &self.networks {
            let referrer = format!("network {}", name);
            AddressRange::from_cidr(&network.cidr)
                .map_err(|e| Error::Validation(format!("{}: {}", referrer, e)))?;
            if network.epoch == 0 {
                return Err(Error::Validation(format!("{}: epoch must be at least 1", referrer)));
            }
            if network.lighthouses.is_empty() {
                return Err(Error::Validation(format!("{} has no lighthouses", referrer)));
            }
            if network.domain.trim().is_empty() {
                return Err(Error::Validation(format!("{} has an empty domain", referrer)));
            }
            let (start, end) = network.underlay_ports;
            PortRange::new(start, end)?;
            for host in &network.lighthouses {
                self.require_host(host, &referrer)?;
            }
        }

        for (name, endpoint) in &self.endpoints {
            let referrer = format!("endpoint {}", name);
            if name.is_empty()
                || !name
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
            {
                return Err(Error::Validation(format!(
                    "{}: names may only contain letters, digits, '-' and '_'",
                    referrer
                )));
            }
            if !self.networks.contains_key(&endpoint.network) {
                return Err(Error::Config(format!(
                    "{} refers to unknown network {}",
                    referrer, endpoint.network
                )));
            }
            self.require_host(&endpoint.host, &referrer)?;
            if endpoint.hostname(name).trim().is_empty() {
                return Err(Error::Validation(format!("{} has an empty hostname", referrer)));
            }
        }
        Ok(())
    }

    /// Connection parameters of a declared host
    pub fn connection(&self, host: &str) -> Result<ConnectionParams> {
        self.require_host(host, "declaration")?.connection(host)
    }

    /// Endpoints of one network
    pub fn endpoints_in<'a>(&'a self, network: &'a str) -> impl Iterator<Item = (&'a String, &'a EndpointDecl)> {
        self.endpoints.iter().filter(move |(_, e)| e.network == network)
    }
}
