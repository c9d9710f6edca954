//! Generic reconciler
//!
//! Compares the recorded outputs of a resource with its declared inputs and
//! decides between create, no-op, refresh and replace. Replacement deletes
//! the old resource first unless its kind asks for create-before-delete.
//! Failures deleting the old resource are logged and otherwise ignored.

use crate::state::{decode, StateStore};
use serde::Serialize;
use skein_common::{Error, ResourceRecord, Result};
use skein_provider::ResourceKind;
use tracing::{debug, info, warn};

/// What reconciling a resource does (or did)
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum Change {
    Create,
    Replace { keys: Vec<String> },
    Refresh { fields: Vec<String> },
    NoOp,
    /// Depends on a resource that has not been created yet
    Pending,
    Destroy,
}

impl std::fmt::Display for Change {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Change::Create => write!(f, "create"),
            Change::Replace { keys } => write!(f, "replace ({})", keys.join(", ")),
            Change::Refresh { fields } => write!(f, "refresh ({})", fields.join(", ")),
            Change::NoOp => write!(f, "no-op"),
            Change::Pending => write!(f, "pending"),
            Change::Destroy => write!(f, "destroy"),
        }
    }
}

/// Outcome of one resource
#[derive(Debug, Clone)]
pub struct Reconciled<O> {
    pub change: Change,
    /// Current outputs; `None` while planning a create or replace
    pub outputs: Option<O>,
}

#[derive(Clone)]
pub struct Reconciler {
    state: StateStore,
    dry_run: bool,
}

impl Reconciler {
    pub fn new(state: StateStore) -> Self {
        Self {
            state,
            dry_run: false,
        }
    }

    /// Reconciler that only reports what it would do
    pub fn planner(state: StateStore) -> Self {
        Self {
            state,
            dry_run: true,
        }
    }

    pub fn is_dry_run(&self) -> bool {
        self.dry_run
    }

    pub fn state(&self) -> &StateStore {
        &self.state
    }

    /// Bring the resource at `urn` in line with `inputs`
    pub async fn reconcile<K: ResourceKind>(
        &self,
        kind: &K,
        urn: &str,
        inputs: &K::Inputs,
        dependencies: Vec<String>,
    ) -> Result<Reconciled<K::Outputs>> {
        self.reconcile_inner(kind, urn, inputs, dependencies)
            .await
            .map_err(|e| e.for_resource(urn))
    }

    async fn reconcile_inner<K: ResourceKind>(
        &self,
        kind: &K,
        urn: &str,
        inputs: &K::Inputs,
        dependencies: Vec<String>,
    ) -> Result<Reconciled<K::Outputs>> {
        let record = match self.state.get(urn)? {
            Some(record) => record,
            None => {
                if self.dry_run {
                    return Ok(Reconciled {
                        change: Change::Create,
                        outputs: None,
                    });
                }
                let outputs = self.create(kind, urn, inputs, dependencies).await?;
                return Ok(Reconciled {
                    change: Change::Create,
                    outputs: Some(outputs),
                });
            }
        };

        if record.kind != K::type_name() {
            return Err(Error::Validation(format!(
                "recorded as {}, declared as {}",
                record.kind,
                K::type_name()
            )));
        }

        let old: K::Outputs = decode(&record)?;
        let diff = kind.diff(&record.id, &old, inputs)?;

        if diff.is_noop() {
            if !self.dry_run && record.dependencies != dependencies {
                self.state
                    .put(urn, K::type_name(), &record.id, &old, dependencies)?;
            }
            debug!("{} is up to date", urn);
            return Ok(Reconciled {
                change: Change::NoOp,
                outputs: Some(old),
            });
        }

        if diff.requires_replace() {
            let change = Change::Replace {
                keys: diff.replace_keys.clone(),
            };
            if self.dry_run {
                return Ok(Reconciled {
                    change,
                    outputs: None,
                });
            }
            info!("Replacing {}: {} changed", urn, diff.replace_keys.join(", "));
            let outputs = if kind.create_before_delete() {
                let outputs = self.create(kind, urn, inputs, dependencies).await?;
                if let Err(e) = kind.delete(&record.id, &old).await {
                    warn!("Deleting replaced {} ({}) failed: {}", urn, record.id, e);
                }
                outputs
            } else {
                self.delete(kind, &record, &old).await?;
                self.create(kind, urn, inputs, dependencies).await?
            };
            return Ok(Reconciled {
                change,
                outputs: Some(outputs),
            });
        }

        let change = Change::Refresh {
            fields: diff.changed.clone(),
        };
        if self.dry_run {
            return Ok(Reconciled {
                change,
                outputs: Some(old),
            });
        }
        info!("Refreshing {}: {} changed", urn, diff.changed.join(", "));
        let outputs = kind.refresh(&record.id, &old, inputs).await?;
        self.state
            .put(urn, K::type_name(), &record.id, &outputs, dependencies)?;
        Ok(Reconciled {
            change,
            outputs: Some(outputs),
        })
    }

    async fn create<K: ResourceKind>(
        &self,
        kind: &K,
        urn: &str,
        inputs: &K::Inputs,
        dependencies: Vec<String>,
    ) -> Result<K::Outputs> {
        let created = kind.create(inputs).await?;
        self.state
            .put(urn, K::type_name(), &created.id, &created.outputs, dependencies)?;
        info!("Created {} ({})", urn, created.id);
        Ok(created.outputs)
    }

    /// Delete and forget; remote failures are logged, not returned
    async fn delete<K: ResourceKind>(&self, kind: &K, record: &ResourceRecord, outputs: &K::Outputs) -> Result<()> {
        if let Err(e) = kind.delete(&record.id, outputs).await {
            warn!("Deleting {} failed, forgetting it anyway: {}", record.urn, e);
        }
        self.state.remove(&record.urn)?;
        Ok(())
    }

    /// Destroy a recorded resource of kind `K`
    pub async fn destroy<K: ResourceKind>(&self, kind: &K, record: &ResourceRecord) -> Result<Change> {
        if self.dry_run {
            return Ok(Change::Destroy);
        }
        match decode::<K::Outputs>(record) {
            Ok(outputs) => self.delete(kind, record, &outputs).await?,
            Err(e) => {
                warn!("Forgetting {} without deleting it: {}", record.urn, e);
                self.state.remove(&record.urn)?;
            }
        }
        info!("Destroyed {}", record.urn);
        Ok(Change::Destroy)
    }
}
