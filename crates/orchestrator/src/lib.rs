//! Skein orchestrator
//!
//! Reads a declaration of hosts, networks and endpoints, builds the resource
//! dependency graph and reconciles it against recorded state.

pub mod config;
pub mod declaration;
pub mod deploy;
pub mod graph;
pub mod host;
pub mod reconciler;
pub mod state;

pub use config::OrchestratorConfig;
pub use declaration::Declaration;
pub use deploy::{Deployment, Report, ResourceChange};
pub use reconciler::{Change, Reconciler};
pub use state::StateStore;
