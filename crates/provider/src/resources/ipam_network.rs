//! `ipam_network`: the address scope of one overlay network
//!
//! Creating it generates the network id everything else in the network
//! refers to.

use super::{changed_fields, Created, Diff, ResourceKind};
use crate::ipam::{AddressRange, Allocator};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skein_common::Result;
use std::net::Ipv4Addr;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamNetworkInputs {
    pub name: String,
    pub cidr: String,
    pub domain: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IpamNetworkOutputs {
    pub network_id: String,
    pub name: String,
    pub cidr: String,
    pub domain: String,
    pub lower: Ipv4Addr,
    pub upper: Ipv4Addr,
    pub prefix_len: u8,
}

pub struct IpamNetworkResource {
    allocator: Arc<dyn Allocator>,
}

impl IpamNetworkResource {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self { allocator }
    }
}

#[async_trait]
impl ResourceKind for IpamNetworkResource {
    type Inputs = IpamNetworkInputs;
    type Outputs = IpamNetworkOutputs;

    fn type_name() -> &'static str {
        "ipam_network"
    }

    async fn create(&self, inputs: &IpamNetworkInputs) -> Result<Created<IpamNetworkOutputs>> {
        // reject bad ranges before an id is minted
        AddressRange::from_cidr(&inputs.cidr)?;

        let network_id = Uuid::new_v4().to_string();
        let range = self.allocator.create_network(&network_id, &inputs.cidr).await?;
        info!("Network {} ({}) gets id {}", inputs.name, inputs.cidr, network_id);

        Ok(Created {
            id: network_id.clone(),
            outputs: IpamNetworkOutputs {
                network_id,
                name: inputs.name.clone(),
                cidr: inputs.cidr.clone(),
                domain: inputs.domain.clone(),
                lower: range.lower,
                upper: range.upper,
                prefix_len: range.prefix_len,
            },
        })
    }

    fn diff(&self, _id: &str, old: &IpamNetworkOutputs, new: &IpamNetworkInputs) -> Result<Diff> {
        let changed = changed_fields(old, new, &["name", "cidr", "domain"])?;
        let replace_keys = changed.iter().filter(|k| *k == "cidr").cloned().collect();
        Ok(Diff { changed, replace_keys })
    }

    async fn refresh(&self, _id: &str, old: &IpamNetworkOutputs, new: &IpamNetworkInputs) -> Result<IpamNetworkOutputs> {
        Ok(IpamNetworkOutputs {
            name: new.name.clone(),
            domain: new.domain.clone(),
            ..old.clone()
        })
    }

    async fn delete(&self, id: &str, _outputs: &IpamNetworkOutputs) -> Result<()> {
        self.allocator.destroy_network(id).await
    }
}
