//! Declared hosts and their setup tasks
//!
//! A setup task is a named `run_actions` resource. Each host hands out a
//! task only the first time it is requested during a run, so a host shared
//! by several networks is set up once.

use parking_lot::Mutex;
use skein_common::{Action, ConnectionParams};
use skein_provider::ActionSet;
use std::collections::HashSet;

/// Creates the directories agents and binaries live in
pub const BASE_DIRS_TASK: &str = "base-dirs";

pub fn base_dirs_actions() -> Vec<Action> {
    vec![Action::command("mkdir -p /etc/skein && mkdir -p /opt/skein")]
}

/// URN of a host setup task
pub fn task_urn(host: &str, task: &str) -> String {
    format!("host_task:{}:{}", host, task)
}

/// A setup task to reconcile
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HostTask {
    pub urn: String,
    pub actions: ActionSet,
}

pub struct Host {
    name: String,
    connection: ConnectionParams,
    tasks: Mutex<HashSet<String>>,
}

impl Host {
    pub fn new(name: impl Into<String>, connection: ConnectionParams) -> Self {
        Self {
            name: name.into(),
            connection,
            tasks: Mutex::new(HashSet::new()),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn connection(&self) -> &ConnectionParams {
        &self.connection
    }

    /// The task named `task`, or `None` if it was already handed out
    pub fn ensure_task(&self, task: &str, actions: Vec<Action>) -> Option<HostTask> {
        if !self.tasks.lock().insert(task.to_string()) {
            return None;
        }
        Some(HostTask {
            urn: task_urn(&self.name, task),
            actions: ActionSet::new(self.connection.clone(), actions),
        })
    }
}
