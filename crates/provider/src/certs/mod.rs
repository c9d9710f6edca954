//! Certificate issuance
//!
//! CA keys are Ed25519, endpoint keys X25519. Both issuers produce the same
//! PEM material; [`LocalIssuer`] does it in-process, [`SubprocessIssuer`]
//! shells out to `skein-certs` using the environment protocol.

pub mod protocol;
pub mod subprocess;

pub use subprocess::SubprocessIssuer;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use ipnetwork::Ipv4Network;
use serde::{Deserialize, Serialize};
use skein_common::cert::{CertificateDetails, MeshCertificate};
use skein_common::{CaIdentity, Error, ExchangeKeyPair, KeyPair, LeafIdentity, Result};
use tracing::info;

/// Parameters of a self-signed CA certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CaConfig {
    pub name: String,
    pub valid_not_before: DateTime<Utc>,
    pub valid_not_after: DateTime<Utc>,
}

/// Parameters of an endpoint certificate
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CertConfig {
    pub hostname: String,
    /// Overlay address with prefix, e.g. `10.0.1.2/24`
    pub network: String,
    pub groups: Vec<String>,
    pub valid_not_before: DateTime<Utc>,
    pub valid_not_after: DateTime<Utc>,
}

fn check_window(not_before: DateTime<Utc>, not_after: DateTime<Utc>) -> Result<()> {
    if not_after <= not_before {
        return Err(Error::Validation(format!(
            "validity window ends ({}) before it starts ({})",
            not_after, not_before
        )));
    }
    Ok(())
}

/// New PEM-encoded CA signing key
pub fn generate_ca_key() -> String {
    KeyPair::generate().to_pem()
}

/// New PEM-encoded endpoint key
pub fn generate_host_key() -> String {
    ExchangeKeyPair::generate().to_pem()
}

/// Self-sign a CA certificate
pub fn sign_ca(ca_key: &str, config: &CaConfig) -> Result<String> {
    check_window(config.valid_not_before, config.valid_not_after)?;
    let key = KeyPair::from_pem(ca_key)?;
    let details = CertificateDetails {
        name: config.name.clone(),
        ips: Vec::new(),
        subnets: Vec::new(),
        groups: Vec::new(),
        not_before: config.valid_not_before,
        not_after: config.valid_not_after,
        public_key: key.public_key_bytes().to_vec(),
        is_ca: true,
        issuer: String::new(),
    };
    MeshCertificate::sign(details, &key)?.to_pem()
}

/// Sign an endpoint certificate with a CA
pub fn sign_host(ca_key: &str, ca_cert: &str, host_key: &str, config: &CertConfig) -> Result<String> {
    check_window(config.valid_not_before, config.valid_not_after)?;
    let key = KeyPair::from_pem(ca_key)?;
    let ca = MeshCertificate::from_pem(ca_cert)?;
    if !ca.details.is_ca {
        return Err(Error::Crypto(format!("{} is not a CA certificate", ca.details.name)));
    }
    if ca.details.public_key != key.public_key_bytes() {
        return Err(Error::Crypto("CA key does not match CA certificate".into()));
    }

    let network: Ipv4Network = config
        .network
        .parse()
        .map_err(|e| Error::Validation(format!("invalid network {}: {}", config.network, e)))?;
    let host = ExchangeKeyPair::from_pem(host_key)?;

    let details = CertificateDetails {
        name: config.hostname.clone(),
        ips: vec![network],
        subnets: Vec::new(),
        groups: config.groups.clone(),
        not_before: config.valid_not_before,
        not_after: config.valid_not_after,
        public_key: host.public_key_bytes().to_vec(),
        is_ca: false,
        issuer: ca.fingerprint()?,
    };
    MeshCertificate::sign(details, &key)?.to_pem()
}

/// Produces CA and endpoint identities
#[async_trait]
pub trait CertIssuer: Send + Sync {
    /// Fresh keypair plus self-signed certificate
    async fn create_ca(&self, epoch: u64, config: &CaConfig) -> Result<CaIdentity>;

    /// Fresh keypair plus certificate signed by `ca`
    async fn issue(&self, ca: &CaIdentity, config: &CertConfig) -> Result<LeafIdentity>;
}

/// In-process issuer
#[derive(Debug, Clone, Default)]
pub struct LocalIssuer;

impl LocalIssuer {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl CertIssuer for LocalIssuer {
    async fn create_ca(&self, epoch: u64, config: &CaConfig) -> Result<CaIdentity> {
        let private_key = generate_ca_key();
        let certificate = sign_ca(&private_key, config)?;
        info!("Created CA {} for epoch {}", config.name, epoch);
        Ok(CaIdentity {
            epoch,
            private_key,
            certificate,
        })
    }

    async fn issue(&self, ca: &CaIdentity, config: &CertConfig) -> Result<LeafIdentity> {
        let private_key = generate_host_key();
        let certificate = sign_host(&ca.private_key, &ca.certificate, &private_key, config)?;
        info!("Issued certificate for {} ({})", config.hostname, config.network);
        Ok(LeafIdentity {
            private_key,
            certificate,
        })
    }
}
