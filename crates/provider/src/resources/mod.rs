//! Resource kinds
//!
//! Every kind implements the same create/diff/delete contract. There is no
//! update: the reconciler either leaves a resource alone, refreshes its
//! recorded outputs without remote effect, or deletes and recreates it.

pub mod attachment;
pub mod ca_epoch;
pub mod endpoint;
pub mod ipam_network;
pub mod port;
pub mod run_actions;

pub use attachment::{attach, AttachTarget, NetworkMode};
pub use ca_epoch::{epoch_window, CaEpochInputs, CaEpochOutputs, CaEpochResource, NetworkCas};
pub use endpoint::{EndpointInputs, EndpointOutputs, EndpointResource};
pub use ipam_network::{IpamNetworkInputs, IpamNetworkOutputs, IpamNetworkResource};
pub use port::{PortInputs, PortOutputs, PortRangeInputs, PortRangeResource, PortResource};
pub use run_actions::RunActionsResource;

use async_trait::async_trait;
use serde::de::DeserializeOwned;
use serde::Serialize;
use skein_common::{Error, Result};

/// Result of a successful create
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Created<O> {
    pub id: String,
    pub outputs: O,
}

/// Comparison of recorded outputs against newly declared inputs
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Diff {
    /// Every tracked field that differs
    pub changed: Vec<String>,
    /// The subset of `changed` that forces delete-then-create
    pub replace_keys: Vec<String>,
}

impl Diff {
    pub fn unchanged() -> Self {
        Self::default()
    }

    /// All changed fields force replacement
    pub fn replace_all(changed: Vec<String>) -> Self {
        Self {
            replace_keys: changed.clone(),
            changed,
        }
    }

    pub fn is_noop(&self) -> bool {
        self.changed.is_empty()
    }

    pub fn requires_replace(&self) -> bool {
        !self.replace_keys.is_empty()
    }
}

/// Trait for resource kinds
#[async_trait]
pub trait ResourceKind: Send + Sync {
    type Inputs: Serialize + DeserializeOwned + Clone + Send + Sync;
    type Outputs: Serialize + DeserializeOwned + Clone + Send + Sync;

    /// Resource type name, recorded with every resource
    fn type_name() -> &'static str;

    /// Create the resource
    async fn create(&self, inputs: &Self::Inputs) -> Result<Created<Self::Outputs>>;

    /// Compare recorded outputs with new inputs
    fn diff(&self, id: &str, old: &Self::Outputs, new: &Self::Inputs) -> Result<Diff>;

    /// Take over changed fields that do not force replacement
    async fn refresh(&self, id: &str, _old: &Self::Outputs, _new: &Self::Inputs) -> Result<Self::Outputs> {
        Err(Error::Internal(format!(
            "{} {} cannot be refreshed in place",
            Self::type_name(),
            id
        )))
    }

    /// Delete the resource
    async fn delete(&self, id: &str, outputs: &Self::Outputs) -> Result<()>;

    /// Whether a replacement is created before the old resource is deleted.
    ///
    /// Kinds whose identity is fixed by their inputs (a file path, a scope
    /// id) must delete first.
    fn create_before_delete(&self) -> bool {
        false
    }
}

/// Names of `fields` whose serialized values differ between `old` and `new`
pub fn changed_fields<O: Serialize, N: Serialize>(old: &O, new: &N, fields: &[&str]) -> Result<Vec<String>> {
    let old = serde_json::to_value(old)?;
    let new = serde_json::to_value(new)?;
    Ok(fields
        .iter()
        .filter(|field| old.get(**field) != new.get(**field))
        .map(|field| field.to_string())
        .collect())
}
