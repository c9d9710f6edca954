//! Skein CLI
//!
//! Command-line front end over the orchestrator: apply, plan and destroy
//! declarations, inspect recorded state and render deployed agent configs.

pub mod commands;
pub mod logging;
pub mod output;
