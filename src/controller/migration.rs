//! The migration driver: migrates resources to a new write key and stamps
//! the write-key secret afterwards with the migrated GRs.
//!
//! Per sync it
//! - computes the desired encryption config from the live key-secrets and
//!   compares it with the config the deployer vouches for,
//! - stops when they differ or while the fleet is mid-rollout: one API
//!   server using a write key another has not observed would store data not
//!   every replica can decrypt,
//! - otherwise walks the GRs in deterministic order, starting, reaping, and
//!   retrying migrations through the Migrator seam,
//! - records completed migrations on the write-key secret under
//!   compare-and-swap.
//!
//! Every step is idempotent; the durable truth is the annotations on the
//! key-secrets, not anything held in memory.

use std::sync::Arc;
use std::time::Duration;

use jiff::Timestamp;
use tracing::{debug, info, warn};

use crate::controller::error::{Error, Result};
use crate::controller::provider::{PreconditionsFulfilled, Provider};
use crate::deploy::Deployer;
use crate::encryptionconfig;
use crate::migration::{MigrationAttempt, Migrator};
use crate::secrets::{KeySecretStore, SecretClient};
use crate::state::{self, GroupResource};

/// Re-check delay while the fleet is mid-rollout or the deployed config
/// lags the desired one.
pub const STABILITY_REQUEUE: Duration = Duration::from_secs(2 * 60);

/// How long to wait until a migration that failed with unknown errors is
/// pruned and retried.
const MIGRATION_RETRY_SECS: i64 = 5 * 60;

/// Addressing for one sync: which component, and where its key-secrets live.
#[derive(Clone, Debug)]
pub struct SyncTarget {
    pub component: String,
    pub managed_namespace: String,
}

/// What one completed sync observed and did.
#[derive(Debug, Default)]
pub struct MigrationOutcome {
    /// GRs with a migration still running, in deterministic order.
    pub migrating: Vec<GroupResource>,
    /// GRs whose migration was stamped onto the write key this sync.
    pub migrated: Vec<GroupResource>,
    /// Re-check delay requested by a gate.
    pub requeue_after: Option<Duration>,
    /// Aggregated per-GR errors.
    pub error: Option<Error>,
}

/// Result of a sync attempt.
#[derive(Debug)]
pub enum SyncOutcome {
    /// Preconditions or the provider switch said not to run: no conditions,
    /// no error.
    Skipped,
    /// The driver ran; conditions must reflect the outcome.
    Completed(MigrationOutcome),
}

/// The controller body. All collaborators are injected seams.
pub struct MigrationDriver {
    pub secrets: Arc<dyn SecretClient>,
    pub deployer: Arc<dyn Deployer>,
    pub migrator: Arc<dyn Migrator>,
    pub provider: Arc<dyn Provider>,
    pub preconditions: PreconditionsFulfilled,
}

impl MigrationDriver {
    /// One idempotent sync pass. May be re-entered at any cadence.
    ///
    /// A precondition error propagates without producing an outcome so the
    /// caller leaves the conditions untouched; the next successful sync
    /// restores them.
    pub async fn sync(&self, target: &SyncTarget) -> Result<SyncOutcome> {
        if !(self.preconditions)()? {
            debug!(component = %target.component, "preconditions not fulfilled, skipping");
            return Ok(SyncOutcome::Skipped);
        }
        if !self.provider.should_run_encryption_controllers()? {
            debug!(component = %target.component, "encryption controllers disabled, skipping");
            return Ok(SyncOutcome::Skipped);
        }

        let store = KeySecretStore::new(
            self.secrets.clone(),
            &target.managed_namespace,
            &target.component,
        );
        Ok(SyncOutcome::Completed(
            self.migrate_keys_if_revision_stable(&store).await,
        ))
    }

    /// The gated migration pass: no storage migration during revision
    /// changes, none until the deployed config matches the desired one.
    async fn migrate_keys_if_revision_stable(&self, store: &KeySecretStore) -> MigrationOutcome {
        let encrypted_grs = self.provider.encrypted_grs();

        let config_and_state = match state::get_encryption_config_and_state(
            self.deployer.as_ref(),
            store,
            &encrypted_grs,
        )
        .await
        {
            Ok(result) => result,
            Err(e) => {
                return MigrationOutcome {
                    error: Some(e),
                    ..Default::default()
                };
            }
        };

        if let Some(reason) = &config_and_state.transitional_reason {
            debug!(reason = %reason, "fleet is mid-rollout, delaying migration");
            return MigrationOutcome {
                requeue_after: Some(STABILITY_REQUEUE),
                ..Default::default()
            };
        }
        let Some(current_config) = &config_and_state.current_config else {
            debug!("no deployed encryption config yet, delaying migration");
            return MigrationOutcome {
                requeue_after: Some(STABILITY_REQUEUE),
                ..Default::default()
            };
        };

        let current_state =
            encryptionconfig::to_encryption_state(current_config, &config_and_state.key_states);
        let desired_config = encryptionconfig::from_encryption_state(&config_and_state.desired_state);

        if current_config.resources != desired_config.resources {
            // The new write key is not yet observed by all replicas: stop
            // all running migrations and wait for the config to settle.
            for gr in current_state.keys() {
                if let Err(e) = self.migrator.prune_migration(gr).await {
                    warn!(gr = %gr, error = %e, "failed to interrupt migration");
                }
            }
            return MigrationOutcome {
                requeue_after: Some(STABILITY_REQUEUE),
                ..Default::default()
            };
        }

        // sort by gr to get deterministic condition strings
        let mut grs: Vec<GroupResource> = current_state.keys().cloned().collect();
        grs.sort_by_key(|gr| gr.to_string());

        let mut errors: Vec<Error> = Vec::new();
        let mut migrating: Vec<GroupResource> = Vec::new();
        let mut migrated: Vec<GroupResource> = Vec::new();

        for gr in grs {
            let Some(gr_keys) = current_state.get(&gr) else {
                continue;
            };
            let Some(write_key) = gr_keys.write_key() else {
                continue; // no write key to migrate to
            };
            if write_key.is_migrated_for(&gr) {
                continue;
            }

            let mut attempt = match self.migrator.ensure_migration(&gr, &write_key.key.name).await
            {
                Ok(attempt) => attempt,
                Err(e) => {
                    errors.push(e);
                    continue;
                }
            };

            if attempt.finished && attempt.failure.is_some() && retry_window_elapsed(&attempt) {
                // the last failure is far enough in the past: prune and retry
                if let Err(e) = self.migrator.prune_migration(&gr).await {
                    errors.push(e);
                    continue;
                }
                attempt = match self.migrator.ensure_migration(&gr, &write_key.key.name).await {
                    Ok(attempt) => attempt,
                    Err(e) => {
                        errors.push(e);
                        continue;
                    }
                };
            }

            if !attempt.finished {
                migrating.push(gr);
                continue;
            }
            if let Some(message) = attempt.failure {
                // a recent terminal failure: go degraded, wait out the window
                errors.push(Error::Migration {
                    gr: gr.clone(),
                    message,
                });
                continue;
            }

            // success: record it durably on the write-key secret
            match store.record_migrated(&gr, &write_key.key.name).await {
                Ok(changed) => {
                    if changed {
                        info!(gr = %gr, write_key = %write_key.key.name, "resource migrated to new write key");
                        migrated.push(gr);
                    }
                }
                Err(e) => errors.push(e),
            }
        }

        MigrationOutcome {
            migrating,
            migrated,
            requeue_after: None,
            error: Error::aggregate(errors),
        }
    }
}

/// Whether a recorded failure is old enough to prune and retry. A failure
/// of unknown age counts as old enough.
fn retry_window_elapsed(attempt: &MigrationAttempt) -> bool {
    match attempt.finished_at {
        Some(at) => Timestamp::now().as_second() - at.as_second() > MIGRATION_RETRY_SECS,
        None => true,
    }
}
