//! Action Executor
//!
//! Runs an ordered list of [`Action`]s over one SSH session. `apply` walks the
//! list forward and stops at the first failing command; `teardown` walks it
//! backwards, running compensating deletes and never failing.

use crate::ssh::{shell_quote, Connector, RemoteSession};
use serde::{Deserialize, Serialize};
use skein_common::crypto::sha256_hex;
use skein_common::{Action, ConnectionParams, Error, Result};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};

/// The tuple whose change forces a `run_actions` resource to be replaced
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ActionSet {
    pub connection: ConnectionParams,
    pub actions: Vec<Action>,
    /// Opaque fingerprints of content the actions depend on indirectly
    #[serde(default)]
    pub triggers: Vec<String>,
}

impl ActionSet {
    pub fn new(connection: ConnectionParams, actions: Vec<Action>) -> Self {
        Self {
            connection,
            actions,
            triggers: Vec::new(),
        }
    }

    pub fn with_trigger(mut self, trigger: impl Into<String>) -> Self {
        self.triggers.push(trigger.into());
        self
    }

    /// SHA-256 of the canonical JSON encoding
    pub fn fingerprint(&self) -> Result<String> {
        Ok(sha256_hex(&serde_json::to_vec(self)?))
    }
}

/// Fingerprint of content an action depends on
pub fn trigger_digest(content: &[u8]) -> String {
    sha256_hex(content)
}

fn parent_dir(remote_path: &str) -> Option<String> {
    Path::new(remote_path)
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .filter(|p| !p.is_empty() && p != "/")
}

#[derive(Clone)]
pub struct ActionExecutor {
    connector: Arc<dyn Connector>,
}

impl ActionExecutor {
    pub fn new(connector: Arc<dyn Connector>) -> Self {
        Self { connector }
    }

    pub fn connector(&self) -> Arc<dyn Connector> {
        self.connector.clone()
    }

    /// Execute `actions` in order on `connection`.
    ///
    /// A non-zero exit aborts the remaining actions; already executed ones
    /// are left in place.
    pub async fn apply(&self, connection: &ConnectionParams, actions: &[Action]) -> Result<()> {
        let mut session = self.connector.connect(connection).await?;
        let result = run_forward(session.as_mut(), actions).await;
        if let Err(e) = session.close().await {
            debug!("Closing session to {} failed: {}", connection.host, e);
        }
        result
    }

    /// Undo `actions` in reverse order, logging and swallowing failures
    pub async fn teardown(&self, connection: &ConnectionParams, actions: &[Action]) {
        let mut session = match self.connector.connect(connection).await {
            Ok(session) => session,
            Err(e) => {
                warn!("Teardown on {} skipped: {}", connection.host, e);
                return;
            }
        };

        for action in actions.iter().rev() {
            let command = match action {
                Action::Command { delete: Some(delete), .. } => delete.clone(),
                Action::Command { delete: None, .. } => continue,
                Action::Upload { remote_path, .. } => format!("rm -f {}", shell_quote(remote_path)),
            };

            match session.exec(&command).await {
                Ok(output) if output.success() => {
                    debug!("Teardown `{}` on {} done", command, connection.host);
                }
                Ok(output) => warn!(
                    "Teardown `{}` on {} exited with {}: {}",
                    command,
                    connection.host,
                    output.exit_code,
                    output.stderr.trim()
                ),
                Err(e) => warn!("Teardown `{}` on {} failed: {}", command, connection.host, e),
            }
        }

        if let Err(e) = session.close().await {
            debug!("Closing session to {} failed: {}", connection.host, e);
        }
    }
}

async fn run_command(session: &mut dyn RemoteSession, command: &str) -> Result<()> {
    debug!("Running `{}`", command);
    let output = session.exec(command).await?;
    if !output.success() {
        return Err(Error::Provisioning {
            command: command.to_string(),
            exit_code: output.exit_code,
            stderr: output.stderr.trim().to_string(),
        });
    }
    Ok(())
}

async fn run_forward(session: &mut dyn RemoteSession, actions: &[Action]) -> Result<()> {
    for action in actions {
        match action {
            Action::Command { create, .. } => run_command(session, create).await?,
            Action::Upload {
                content,
                remote_path,
            } => {
                if let Some(dir) = parent_dir(remote_path) {
                    run_command(session, &format!("mkdir -p {}", shell_quote(&dir))).await?;
                }
                debug!("Uploading {} bytes to {}", content.len(), remote_path);
                session.upload(content.as_bytes(), remote_path).await?;
            }
        }
    }
    info!("Applied {} action(s)", actions.len());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::MemoryConnector;

    fn setup() -> (MemoryConnector, ActionExecutor, ConnectionParams) {
        let connector = MemoryConnector::new();
        let executor = ActionExecutor::new(Arc::new(connector.clone()));
        let params = ConnectionParams::with_password("node1", "root", "pw");
        (connector, executor, params)
    }

    #[tokio::test]
    async fn test_apply_runs_in_order() {
        let (connector, executor, params) = setup();
        let actions = vec![
            Action::command("echo one"),
            Action::upload("hello", "/etc/skein/hello.txt"),
            Action::command("echo two"),
        ];

        executor.apply(&params, &actions).await.unwrap();

        assert_eq!(
            connector.commands("node1:22"),
            vec!["echo one", "mkdir -p /etc/skein", "echo two"]
        );
        assert_eq!(
            connector.file("node1:22", "/etc/skein/hello.txt").as_deref(),
            Some("hello")
        );
        assert_eq!(connector.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_failure_aborts_remaining_actions() {
        let (connector, executor, params) = setup();
        connector.fail_command("systemctl", 5, "unit not found\n");

        let actions = vec![
            Action::command("echo one"),
            Action::command("systemctl restart agent"),
            Action::command("echo never"),
        ];
        let err = executor.apply(&params, &actions).await.unwrap_err();

        match err {
            Error::Provisioning {
                command,
                exit_code,
                stderr,
            } => {
                assert_eq!(command, "systemctl restart agent");
                assert_eq!(exit_code, 5);
                assert_eq!(stderr, "unit not found");
            }
            other => panic!("unexpected error {:?}", other),
        }
        assert!(!connector.commands("node1:22").contains(&"echo never".to_string()));
        // session released on the error path too
        assert_eq!(connector.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_teardown_reverses_and_swallows_failures() {
        let (connector, executor, params) = setup();
        let actions = vec![
            Action::reversible("create a", "delete a"),
            Action::command("create b"),
            Action::upload("x", "/opt/skein/c"),
            Action::reversible("create d", "delete d"),
        ];
        executor.apply(&params, &actions).await.unwrap();
        connector.fail_command("delete d", 1, "nope");

        executor.teardown(&params, &actions).await;

        let commands = connector.commands("node1:22");
        // create a, create b, mkdir, create d
        let teardown: Vec<_> = commands.iter().skip(4).cloned().collect();
        assert_eq!(teardown, vec!["delete d", "rm -f /opt/skein/c", "delete a"]);
        assert!(connector.file("node1:22", "/opt/skein/c").is_none());
        assert_eq!(connector.open_sessions(), 0);
    }

    #[tokio::test]
    async fn test_teardown_on_unreachable_host_does_not_fail() {
        let (connector, executor, params) = setup();
        connector.set_unreachable("node1:22", true);
        executor
            .teardown(&params, &[Action::reversible("a", "b")])
            .await;
        assert!(connector.commands("node1:22").is_empty());
    }

    #[test]
    fn test_fingerprint_tracks_triggers() {
        let params = ConnectionParams::with_password("node1", "root", "pw");
        let base = ActionSet::new(params, vec![Action::command("true")]);
        let triggered = base.clone().with_trigger(trigger_digest(b"config v2"));

        assert_ne!(base.fingerprint().unwrap(), triggered.fingerprint().unwrap());
        assert_eq!(base.fingerprint().unwrap(), base.clone().fingerprint().unwrap());
    }
}
