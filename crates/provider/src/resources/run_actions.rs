//! `run_actions`: an ordered list of remote actions on one host
//!
//! Applied through the [`ActionExecutor`]. Any change to the connection, the
//! actions or the triggers replaces the resource: the old list is torn down
//! and the new one applied.

use super::{changed_fields, Created, Diff, ResourceKind};
use crate::executor::{ActionExecutor, ActionSet};
use async_trait::async_trait;
use skein_common::Result;
use tracing::info;

const TRACKED: &[&str] = &["connection", "actions", "triggers"];

pub struct RunActionsResource {
    executor: ActionExecutor,
}

impl RunActionsResource {
    pub fn new(executor: ActionExecutor) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl ResourceKind for RunActionsResource {
    type Inputs = ActionSet;
    type Outputs = ActionSet;

    fn type_name() -> &'static str {
        "run_actions"
    }

    async fn create(&self, inputs: &ActionSet) -> Result<Created<ActionSet>> {
        self.executor.apply(&inputs.connection, &inputs.actions).await?;
        let id = inputs.fingerprint()?;
        info!(
            "Applied {} action(s) on {} ({})",
            inputs.actions.len(),
            inputs.connection.host,
            &id[..12]
        );
        Ok(Created {
            id,
            outputs: inputs.clone(),
        })
    }

    fn diff(&self, _id: &str, old: &ActionSet, new: &ActionSet) -> Result<Diff> {
        Ok(Diff::replace_all(changed_fields(old, new, TRACKED)?))
    }

    async fn delete(&self, _id: &str, outputs: &ActionSet) -> Result<()> {
        self.executor.teardown(&outputs.connection, &outputs.actions).await;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ssh::MemoryConnector;
    use skein_common::{Action, ConnectionParams};
    use std::sync::Arc;

    fn resource(connector: &MemoryConnector) -> RunActionsResource {
        RunActionsResource::new(ActionExecutor::new(Arc::new(connector.clone())))
    }

    fn set() -> ActionSet {
        ActionSet::new(
            ConnectionParams::with_password("node1", "root", "pw"),
            vec![
                Action::reversible("touch /tmp/a", "rm /tmp/a"),
                Action::upload("hello", "/etc/skein/hello.txt"),
            ],
        )
    }

    #[tokio::test]
    async fn test_create_and_delete() {
        let connector = MemoryConnector::new();
        let kind = resource(&connector);

        let created = kind.create(&set()).await.unwrap();
        assert_eq!(created.id, set().fingerprint().unwrap());
        assert_eq!(
            connector.file("node1:22", "/etc/skein/hello.txt").as_deref(),
            Some("hello")
        );

        kind.delete(&created.id, &created.outputs).await.unwrap();
        assert!(connector.file("node1:22", "/etc/skein/hello.txt").is_none());
        assert_eq!(connector.commands("node1:22").last().unwrap(), "rm /tmp/a");
    }

    #[tokio::test]
    async fn test_trigger_change_replaces() {
        let connector = MemoryConnector::new();
        let kind = resource(&connector);
        let old = set().with_trigger("v1");

        assert!(kind.diff("x", &old, &old).unwrap().is_noop());

        let diff = kind.diff("x", &old, &set().with_trigger("v2")).unwrap();
        assert_eq!(diff.replace_keys, vec!["triggers"]);

        let mut moved = old.clone();
        moved.connection.host = "node2".into();
        let diff = kind.diff("x", &old, &moved).unwrap();
        assert_eq!(diff.replace_keys, vec!["connection"]);
    }
}
