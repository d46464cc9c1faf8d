//! Online re-encryption driver seam.
//!
//! The physical migration worker is external; the controller only consumes
//! the `Migrator` contract. The shipped implementation drives migrations
//! through the cluster's `migration.k8s.io/v1alpha1 StorageVersionMigration`
//! API: one migration object per (resource, write key) pair, with the
//! external migrator tool doing the storage rewrite. This controller never
//! reads stored data itself.
//!
//! Contract for the two failure channels:
//! - `MigrationAttempt::failure` is the terminal outcome recorded on a
//!   finished run. It is permanent for that run and only reconsidered after
//!   the caller prunes and re-ensures.
//! - `Err` from the trait methods is a transport or API error reaching the
//!   migration machinery and is always worth an immediate retry.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use jiff::Timestamp;
use kube::api::{Api, DeleteParams, ListParams, PostParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::{Client, CustomResource};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::controller::error::{Error, Result};
use crate::secrets::COMPONENT_LABEL;
use crate::state::GroupResource;

/// Labels stamped on migration objects so they can be found per GR.
const GROUP_LABEL: &str = "encryption-operator.io/group";
const RESOURCE_LABEL: &str = "encryption-operator.io/resource";

/// Outcome of one idempotent `ensure_migration` call.
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MigrationAttempt {
    /// Whether the run has reached a terminal state.
    pub finished: bool,
    /// Terminal failure of a finished run; None means success.
    pub failure: Option<String>,
    /// When the run reached its terminal state.
    pub finished_at: Option<Timestamp>,
}

/// Executes online re-encryption for one resource against a specified write
/// key and reports progress.
#[async_trait]
pub trait Migrator: Send + Sync {
    /// Idempotent per `(gr, write_key_name)`: starts the migration when
    /// absent, otherwise reports its current state.
    async fn ensure_migration(
        &self,
        gr: &GroupResource,
        write_key_name: &str,
    ) -> Result<MigrationAttempt>;

    /// Cancel and discard any in-flight or recorded work for `gr`.
    /// Best-effort; must be safe to call when nothing is running.
    async fn prune_migration(&self, gr: &GroupResource) -> Result<()>;

    /// Wakes the sync loop when a migration makes progress.
    fn changed(&self) -> BoxStream<'static, ()>;
}

/// `StorageVersionMigration` is an external API served by the cluster's
/// storage-version-migrator; declared locally as an API client type. The
/// migrator tool resolves the storage version itself, so the spec carries
/// only group and resource.
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "migration.k8s.io",
    version = "v1alpha1",
    kind = "StorageVersionMigration",
    plural = "storageversionmigrations",
    status = "StorageVersionMigrationStatus"
)]
#[serde(rename_all = "camelCase")]
pub struct StorageVersionMigrationSpec {
    pub resource: MigrationGroupVersionResource,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationGroupVersionResource {
    #[serde(default)]
    pub group: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    pub resource: String,
}

#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageVersionMigrationStatus {
    #[serde(default)]
    pub conditions: Vec<MigrationCondition>,
}

#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MigrationCondition {
    pub r#type: String,
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_update_time: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

const CONDITION_SUCCEEDED: &str = "Succeeded";
const CONDITION_FAILED: &str = "Failed";

/// Migrator backed by `StorageVersionMigration` objects.
pub struct StorageVersionMigrationMigrator {
    client: Client,
    component: String,
}

impl StorageVersionMigrationMigrator {
    pub fn new(client: Client, component: &str) -> Self {
        Self {
            client,
            component: component.to_string(),
        }
    }

    fn api(&self) -> Api<StorageVersionMigration> {
        Api::all(self.client.clone())
    }

    fn gr_selector(&self, gr: &GroupResource) -> String {
        format!(
            "{}={},{}={},{}={}",
            COMPONENT_LABEL,
            self.component,
            GROUP_LABEL,
            group_label_value(gr),
            RESOURCE_LABEL,
            gr.resource
        )
    }

    fn new_migration(&self, gr: &GroupResource, write_key_name: &str) -> StorageVersionMigration {
        let mut migration = StorageVersionMigration::new(
            &migration_name(gr, write_key_name),
            StorageVersionMigrationSpec {
                resource: MigrationGroupVersionResource {
                    group: gr.group.clone(),
                    version: None,
                    resource: gr.resource.clone(),
                },
            },
        );
        migration.metadata.labels = Some(
            [
                (COMPONENT_LABEL.to_string(), self.component.clone()),
                (GROUP_LABEL.to_string(), group_label_value(gr).to_string()),
                (RESOURCE_LABEL.to_string(), gr.resource.clone()),
            ]
            .into(),
        );
        migration
    }
}

fn group_label_value(gr: &GroupResource) -> &str {
    if gr.group.is_empty() {
        "core"
    } else {
        &gr.group
    }
}

/// Deterministic per-(gr, write key) object name, so re-ensuring is a read
/// and a changed write key starts a fresh migration.
fn migration_name(gr: &GroupResource, write_key_name: &str) -> String {
    format!(
        "{}-{}-{}",
        gr.resource,
        group_label_value(gr).replace('.', "-"),
        write_key_name
    )
}

fn condition_time(condition: &MigrationCondition) -> Option<Timestamp> {
    condition
        .last_update_time
        .as_deref()
        .and_then(|raw| raw.parse().ok())
}

fn attempt_from_status(migration: &StorageVersionMigration) -> MigrationAttempt {
    let conditions = migration
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();

    if let Some(failed) = conditions
        .iter()
        .find(|c| c.r#type == CONDITION_FAILED && c.status == "True")
    {
        return MigrationAttempt {
            finished: true,
            failure: Some(
                failed
                    .message
                    .clone()
                    .unwrap_or_else(|| "storage migration failed".to_string()),
            ),
            finished_at: condition_time(failed),
        };
    }

    if let Some(succeeded) = conditions
        .iter()
        .find(|c| c.r#type == CONDITION_SUCCEEDED && c.status == "True")
    {
        return MigrationAttempt {
            finished: true,
            failure: None,
            finished_at: condition_time(succeeded),
        };
    }

    MigrationAttempt::default()
}

#[async_trait]
impl Migrator for StorageVersionMigrationMigrator {
    async fn ensure_migration(
        &self,
        gr: &GroupResource,
        write_key_name: &str,
    ) -> Result<MigrationAttempt> {
        let api = self.api();
        let name = migration_name(gr, write_key_name);

        match api.get(&name).await {
            Ok(existing) => Ok(attempt_from_status(&existing)),
            Err(e) => {
                let err = Error::from(e);
                if !err.is_not_found() {
                    return Err(err);
                }
                let created = api
                    .create(&PostParams::default(), &self.new_migration(gr, write_key_name))
                    .await;
                match created {
                    Ok(_) => {
                        info!(gr = %gr, write_key = write_key_name, "started storage migration");
                        Ok(MigrationAttempt::default())
                    }
                    // lost a create race: the run exists and is in flight
                    Err(kube::Error::Api(api_err)) if api_err.code == 409 => {
                        Ok(MigrationAttempt::default())
                    }
                    Err(e) => Err(e.into()),
                }
            }
        }
    }

    async fn prune_migration(&self, gr: &GroupResource) -> Result<()> {
        let api = self.api();
        let params = ListParams::default().labels(&self.gr_selector(gr));
        let migrations = api.list(&params).await?;
        for migration in migrations {
            let Some(name) = migration.metadata.name.as_deref() else {
                continue;
            };
            match api.delete(name, &DeleteParams::default()).await {
                Ok(_) => debug!(gr = %gr, name, "pruned storage migration"),
                Err(e) => {
                    let err = Error::from(e);
                    if !err.is_not_found() {
                        return Err(err);
                    }
                }
            }
        }
        Ok(())
    }

    fn changed(&self) -> BoxStream<'static, ()> {
        let config = watcher::Config::default()
            .labels(&format!("{}={}", COMPONENT_LABEL, self.component));
        watcher(self.api(), config)
            .touched_objects()
            .map(|_| ())
            .boxed()
    }
}
