//! Core types for Skein

use crate::{Error, Result};
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use std::net::Ipv4Addr;

/// Group every lighthouse belongs to
pub const LIGHTHOUSE_GROUP: &str = "lighthouses";

/// Port the lighthouse DNS resolver listens on
pub const DNS_PORT: u16 = 53;

fn default_ssh_port() -> u16 {
    22
}

// ============================================================================
// Connection parameters
// ============================================================================

/// SSH connection descriptor for a remote host
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionParams {
    pub host: String,
    #[serde(default = "default_ssh_port")]
    pub port: u16,
    pub user: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key: Option<String>,
}

/// How a session authenticates
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Credentials<'a> {
    Password(&'a str),
    PrivateKey(&'a str),
}

impl ConnectionParams {
    pub fn with_password(host: impl Into<String>, user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            user: user.into(),
            password: Some(password.into()),
            private_key: None,
        }
    }

    pub fn with_private_key(host: impl Into<String>, user: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: default_ssh_port(),
            user: user.into(),
            password: None,
            private_key: Some(key.into()),
        }
    }

    /// `host:port` for socket connection
    pub fn address(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }

    /// Check that the descriptor is complete and unambiguous
    pub fn validate(&self) -> Result<()> {
        if self.host.trim().is_empty() {
            return Err(Error::Config("connection host is empty".into()));
        }
        if self.user.trim().is_empty() {
            return Err(Error::Config(format!("connection to {} has no user", self.host)));
        }
        if self.port == 0 {
            return Err(Error::Config(format!("connection to {} has port 0", self.host)));
        }
        self.credentials().map(|_| ())
    }

    pub fn credentials(&self) -> Result<Credentials<'_>> {
        match (&self.password, &self.private_key) {
            (Some(password), None) => Ok(Credentials::Password(password)),
            (None, Some(key)) => Ok(Credentials::PrivateKey(key)),
            (Some(_), Some(_)) => Err(Error::Config(format!(
                "connection to {} sets both password and private key",
                self.host
            ))),
            (None, None) => Err(Error::Config(format!(
                "connection to {} needs a password or a private key",
                self.host
            ))),
        }
    }
}

impl std::fmt::Debug for ConnectionParams {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionParams")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("private_key", &self.private_key.as_ref().map(|_| "<redacted>"))
            .finish()
    }
}

// ============================================================================
// Actions
// ============================================================================

/// One remote step of a reconciled resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Action {
    Command {
        create: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        delete: Option<String>,
    },
    Upload {
        content: String,
        remote_path: String,
    },
}

impl Action {
    pub fn command(create: impl Into<String>) -> Self {
        Action::Command {
            create: create.into(),
            delete: None,
        }
    }

    pub fn reversible(create: impl Into<String>, delete: impl Into<String>) -> Self {
        Action::Command {
            create: create.into(),
            delete: Some(delete.into()),
        }
    }

    pub fn upload(content: impl Into<String>, remote_path: impl Into<String>) -> Self {
        Action::Upload {
            content: content.into(),
            remote_path: remote_path.into(),
        }
    }
}

// ============================================================================
// Firewall
// ============================================================================

/// Port selector of a firewall rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum Port {
    #[default]
    Any,
    Number(u16),
}

impl Serialize for Port {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        match self {
            Port::Any => serializer.serialize_str("any"),
            Port::Number(n) => serializer.serialize_u16(*n),
        }
    }
}

impl<'de> Deserialize<'de> for Port {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Number(u16),
            Text(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Number(n) => Ok(Port::Number(n)),
            Raw::Text(s) if s == "any" => Ok(Port::Any),
            Raw::Text(s) => s
                .parse::<u16>()
                .map(Port::Number)
                .map_err(|_| serde::de::Error::custom(format!("invalid port: {}", s))),
        }
    }
}

impl std::fmt::Display for Port {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Port::Any => write!(f, "any"),
            Port::Number(n) => write!(f, "{}", n),
        }
    }
}

/// Transport protocol of a firewall rule
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Proto {
    Any,
    Tcp,
    Udp,
    Icmp,
}

impl Default for Proto {
    fn default() -> Self {
        Self::Any
    }
}

impl std::fmt::Display for Proto {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Proto::Any => write!(f, "any"),
            Proto::Tcp => write!(f, "tcp"),
            Proto::Udp => write!(f, "udp"),
            Proto::Icmp => write!(f, "icmp"),
        }
    }
}

/// Rule targeting one peer by hostname, or every peer with `any`
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct HostRule {
    pub host: String,
    pub port: Port,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<Proto>,
}

/// Rule targeting peers holding all of the listed groups
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct GroupRule {
    pub groups: Vec<String>,
    pub port: Port,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub proto: Option<Proto>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum FirewallRule {
    Host(HostRule),
    Group(GroupRule),
}

impl FirewallRule {
    pub fn host(host: impl Into<String>, port: Port) -> Self {
        FirewallRule::Host(HostRule {
            host: host.into(),
            port,
            proto: None,
        })
    }

    pub fn groups<I, S>(groups: I, port: Port) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        FirewallRule::Group(GroupRule {
            groups: groups.into_iter().map(Into::into).collect(),
            port,
            proto: None,
        })
    }

    /// Outbound rule letting every endpoint reach lighthouse DNS
    pub fn lighthouse_dns() -> Self {
        Self::groups([LIGHTHOUSE_GROUP], Port::Number(DNS_PORT))
    }
}

/// Stateful firewall policy of an endpoint
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FirewallPolicy {
    #[serde(default)]
    pub inbound: Vec<FirewallRule>,
    #[serde(default)]
    pub outbound: Vec<FirewallRule>,
}

impl FirewallPolicy {
    /// Add the implicit outbound lighthouse DNS rule unless already present
    pub fn with_lighthouse_dns(mut self) -> Self {
        let rule = FirewallRule::lighthouse_dns();
        if !self.outbound.contains(&rule) {
            self.outbound.insert(0, rule);
        }
        self
    }
}

// ============================================================================
// Identities
// ============================================================================

/// Certificate authority generation of a network
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CaIdentity {
    pub epoch: u64,
    pub private_key: String,
    pub certificate: String,
}

impl std::fmt::Debug for CaIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CaIdentity")
            .field("epoch", &self.epoch)
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

/// Keypair and certificate of one endpoint
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LeafIdentity {
    pub private_key: String,
    pub certificate: String,
}

impl std::fmt::Debug for LeafIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LeafIdentity")
            .field("certificate", &self.certificate)
            .finish_non_exhaustive()
    }
}

/// Rendezvous point of a network, as seen by other endpoints
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lighthouse {
    pub overlay_ip: Ipv4Addr,
    pub underlay_host: String,
    pub underlay_port: u16,
}

impl Lighthouse {
    pub fn underlay_address(&self) -> String {
        format!("{}:{}", self.underlay_host, self.underlay_port)
    }
}

// ============================================================================
// Persisted resource records
// ============================================================================

/// Last-applied state of one reconciled resource
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResourceRecord {
    pub urn: String,
    pub kind: String,
    pub id: String,
    pub outputs: serde_json::Value,
    #[serde(default)]
    pub dependencies: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
    pub generation: i64,
}

impl ResourceRecord {
    pub fn new(urn: impl Into<String>, kind: impl Into<String>, id: impl Into<String>, outputs: serde_json::Value) -> Self {
        let now = chrono::Utc::now().timestamp();
        Self {
            urn: urn.into(),
            kind: kind.into(),
            id: id.into(),
            outputs,
            dependencies: Vec::new(),
            created_at: now,
            updated_at: now,
            generation: 1,
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<String>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn touch(&mut self) {
        self.updated_at = chrono::Utc::now().timestamp();
        self.generation += 1;
    }
}
