//! `endpoint`: one identity in an overlay network
//!
//! Creating an endpoint allocates an overlay address and issues a leaf
//! certificate for it from the network's current CA. The certificate embeds
//! the address, prefix, groups and qualified hostname, so a change to any of
//! them replaces the whole endpoint. Firewall changes only refresh the
//! recorded outputs.

use super::ca_epoch::CLOCK_SKEW_MINUTES;
use super::{changed_fields, Created, Diff, ResourceKind};
use crate::certs::{CertConfig, CertIssuer};
use crate::ipam::Allocator;
use async_trait::async_trait;
use chrono::{Duration, Utc};
use serde::{Deserialize, Serialize};
use skein_common::{CaIdentity, FirewallPolicy, Result};
use std::collections::BTreeSet;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::{info, warn};
use uuid::Uuid;

/// Fields whose change replaces the endpoint, besides `groups`
const IDENTITY: &[&str] = &["network_id", "network_prefix_len", "domain", "hostname"];

/// Sorted, deduplicated group membership
pub fn group_set(groups: &[String]) -> Vec<String> {
    let set: BTreeSet<&String> = groups.iter().collect();
    set.into_iter().cloned().collect()
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointInputs {
    pub network_id: String,
    pub network_prefix_len: u8,
    pub domain: String,
    /// Label qualified with `domain` in the certificate
    pub hostname: String,
    pub groups: Vec<String>,
    #[serde(default)]
    pub firewall: FirewallPolicy,
    /// Current CA of the network
    pub ca: CaIdentity,
    pub leaf_validity_days: i64,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EndpointOutputs {
    pub endpoint_id: String,
    pub network_id: String,
    pub network_prefix_len: u8,
    pub domain: String,
    pub hostname: String,
    pub groups: Vec<String>,
    /// Declared policy plus the implicit lighthouse DNS rule
    pub firewall: FirewallPolicy,
    pub overlay_ip: Ipv4Addr,
    pub private_key: String,
    pub certificate: String,
    pub signing_epoch: u64,
}

impl EndpointOutputs {
    /// Fully qualified name, also the certificate name
    pub fn fqdn(&self) -> String {
        format!("{}.{}", self.hostname, self.domain)
    }

    /// Overlay address with network prefix, e.g. `10.0.1.2/24`
    pub fn overlay_cidr(&self) -> String {
        format!("{}/{}", self.overlay_ip, self.network_prefix_len)
    }
}

pub struct EndpointResource {
    allocator: Arc<dyn Allocator>,
    issuer: Arc<dyn CertIssuer>,
}

impl EndpointResource {
    pub fn new(allocator: Arc<dyn Allocator>, issuer: Arc<dyn CertIssuer>) -> Self {
        Self { allocator, issuer }
    }
}

#[async_trait]
impl ResourceKind for EndpointResource {
    type Inputs = EndpointInputs;
    type Outputs = EndpointOutputs;

    fn type_name() -> &'static str {
        "endpoint"
    }

    async fn create(&self, inputs: &EndpointInputs) -> Result<Created<EndpointOutputs>> {
        let endpoint_id = Uuid::new_v4().to_string();
        let overlay_ip = self
            .allocator
            .allocate_address(&inputs.network_id, &endpoint_id)
            .await?;

        let fqdn = format!("{}.{}", inputs.hostname, inputs.domain);
        let now = Utc::now();
        let config = CertConfig {
            hostname: fqdn.clone(),
            network: format!("{}/{}", overlay_ip, inputs.network_prefix_len),
            groups: group_set(&inputs.groups),
            valid_not_before: now - Duration::minutes(CLOCK_SKEW_MINUTES),
            valid_not_after: now + Duration::days(inputs.leaf_validity_days),
        };

        let leaf = match self.issuer.issue(&inputs.ca, &config).await {
            Ok(leaf) => leaf,
            Err(e) => {
                if let Err(free_err) = self
                    .allocator
                    .free_address(&inputs.network_id, &endpoint_id)
                    .await
                {
                    warn!("Releasing {} for {} failed: {}", overlay_ip, fqdn, free_err);
                }
                return Err(e);
            }
        };

        info!(
            "Endpoint {} is {} (CA epoch {})",
            fqdn, overlay_ip, inputs.ca.epoch
        );

        Ok(Created {
            id: endpoint_id.clone(),
            outputs: EndpointOutputs {
                endpoint_id,
                network_id: inputs.network_id.clone(),
                network_prefix_len: inputs.network_prefix_len,
                domain: inputs.domain.clone(),
                hostname: inputs.hostname.clone(),
                groups: group_set(&inputs.groups),
                firewall: inputs.firewall.clone().with_lighthouse_dns(),
                overlay_ip,
                private_key: leaf.private_key,
                certificate: leaf.certificate,
                signing_epoch: inputs.ca.epoch,
            },
        })
    }

    fn diff(&self, _id: &str, old: &EndpointOutputs, new: &EndpointInputs) -> Result<Diff> {
        let mut replace_keys = changed_fields(old, new, IDENTITY)?;
        if group_set(&old.groups) != group_set(&new.groups) {
            replace_keys.push("groups".to_string());
        }

        if old.signing_epoch + 1 < new.ca.epoch {
            warn!(
                "Certificate of {} was signed at epoch {}, no longer trusted at epoch {}; reissuing",
                old.fqdn(),
                old.signing_epoch,
                new.ca.epoch
            );
            replace_keys.push("signing_epoch".to_string());
        }

        let mut changed = replace_keys.clone();
        if old.firewall != new.firewall.clone().with_lighthouse_dns() {
            changed.push("firewall".to_string());
        }
        Ok(Diff { changed, replace_keys })
    }

    async fn refresh(&self, _id: &str, old: &EndpointOutputs, new: &EndpointInputs) -> Result<EndpointOutputs> {
        Ok(EndpointOutputs {
            firewall: new.firewall.clone().with_lighthouse_dns(),
            ..old.clone()
        })
    }

    /// The replacement gets a fresh address while the old one is still held.
    ///
    /// This departs from the delete-then-create order every other kind uses:
    /// with first-fit allocation, freeing first would hand the replacement
    /// the same address again, and a hostname change must yield a new one.
    /// Create-then-delete is also the usual replace order of declarative
    /// provisioning engines such as Pulumi, so state migrated from one keeps
    /// the same address history. A range with no free address left therefore cannot replace an
    /// endpoint and fails with `Exhaustion`.
    fn create_before_delete(&self) -> bool {
        true
    }

    async fn delete(&self, id: &str, outputs: &EndpointOutputs) -> Result<()> {
        self.allocator.free_address(&outputs.network_id, id).await?;
        info!("Released {} of endpoint {}", outputs.overlay_ip, outputs.fqdn());
        Ok(())
    }
}
