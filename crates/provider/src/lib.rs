//! Skein provider
//!
//! Everything that touches the outside world on behalf of a reconciled
//! resource: the SSH transport and action executor, the address and port
//! allocators, certificate issuance, the agent config compiler and the
//! resource kinds built from them.

pub mod agent_config;
pub mod certs;
pub mod executor;
pub mod ipam;
pub mod resources;
pub mod ssh;

pub use executor::{ActionExecutor, ActionSet};
pub use resources::{Created, Diff, ResourceKind};
