//! Port scopes and port bindings
//!
//! A host enrolled in a network gets a `port_range` scope; each endpoint on
//! it holds one `port` binding from that scope for underlay traffic.

use super::{changed_fields, Created, Diff, ResourceKind};
use crate::ipam::{Allocator, PortRange};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use skein_common::Result;
use std::sync::Arc;
use tracing::info;
use uuid::Uuid;

/// Default underlay port range, `[start, end)`
pub const DEFAULT_PORT_RANGE: (u16, u32) = (30000, 31000);

/// Scope id of a host enrolled in a network with the range `[start, end)`.
///
/// The range is part of the id: a new range is a new scope, and every port
/// bound in the old one moves with it.
pub fn enrollment_scope(network: &str, host: &str, start: u16, end: u32) -> String {
    format!("{}:{}:{}-{}", network, host, start, end)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortRangeInputs {
    pub scope: String,
    pub start: u16,
    pub end: u32,
}

pub struct PortRangeResource {
    allocator: Arc<dyn Allocator>,
}

impl PortRangeResource {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self { allocator }
    }
}

#[async_trait]
impl ResourceKind for PortRangeResource {
    type Inputs = PortRangeInputs;
    type Outputs = PortRangeInputs;

    fn type_name() -> &'static str {
        "port_range"
    }

    async fn create(&self, inputs: &PortRangeInputs) -> Result<Created<PortRangeInputs>> {
        let range = PortRange::new(inputs.start, inputs.end)?;
        self.allocator.create_host(&inputs.scope, range).await?;
        Ok(Created {
            id: inputs.scope.clone(),
            outputs: inputs.clone(),
        })
    }

    fn diff(&self, _id: &str, old: &PortRangeInputs, new: &PortRangeInputs) -> Result<Diff> {
        Ok(Diff::replace_all(changed_fields(old, new, &["scope", "start", "end"])?))
    }

    async fn delete(&self, id: &str, _outputs: &PortRangeInputs) -> Result<()> {
        self.allocator.delete_host(id).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortInputs {
    pub scope: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PortOutputs {
    pub scope: String,
    pub port_id: String,
    pub port: u16,
}

pub struct PortResource {
    allocator: Arc<dyn Allocator>,
}

impl PortResource {
    pub fn new(allocator: Arc<dyn Allocator>) -> Self {
        Self { allocator }
    }
}

#[async_trait]
impl ResourceKind for PortResource {
    type Inputs = PortInputs;
    type Outputs = PortOutputs;

    fn type_name() -> &'static str {
        "port"
    }

    async fn create(&self, inputs: &PortInputs) -> Result<Created<PortOutputs>> {
        let port_id = Uuid::new_v4().to_string();
        let port = self.allocator.allocate_port(&inputs.scope, &port_id).await?;
        info!("Port {} on {} bound to {}", port, inputs.scope, port_id);
        Ok(Created {
            id: port_id.clone(),
            outputs: PortOutputs {
                scope: inputs.scope.clone(),
                port_id,
                port,
            },
        })
    }

    fn diff(&self, _id: &str, old: &PortOutputs, new: &PortInputs) -> Result<Diff> {
        Ok(Diff::replace_all(changed_fields(old, new, &["scope"])?))
    }

    async fn delete(&self, id: &str, outputs: &PortOutputs) -> Result<()> {
        self.allocator.free_port(&outputs.scope, id).await
    }
}
