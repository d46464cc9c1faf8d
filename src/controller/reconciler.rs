//! Reconciliation loop for StorageEncryption.
//!
//! The reconcile function runs the migration driver and then reflects its
//! outcome on the status object. The status update runs even when the sync
//! collected errors, so the conditions always describe the terminal state —
//! except in the precondition-failure path, where both conditions are left
//! untouched to avoid oscillation.

use std::sync::Arc;
use std::time::{Duration, Instant};

use kube::{Api, ResourceExt, runtime::controller::Action};
use tracing::{debug, error, warn};

use crate::controller::{
    context::Context,
    error::Error,
    migration::{SyncOutcome, SyncTarget},
    status,
};
use crate::crd::{Condition, StorageEncryption};
use crate::state::grs_to_human_readable;

/// Fixed re-sync interval.
const RESYNC: Duration = Duration::from_secs(60);

/// Reconcile a StorageEncryption
pub async fn reconcile(obj: Arc<StorageEncryption>, ctx: Arc<Context>) -> Result<Action, Error> {
    let start_time = Instant::now();
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    debug!(name = %name, namespace = %namespace, "Reconciling StorageEncryption");

    let target = SyncTarget {
        component: obj.spec.component.clone(),
        managed_namespace: obj.spec.managed_namespace.clone(),
    };

    let outcome = match ctx.driver.sync(&target).await {
        // surface the error without touching conditions so the next
        // successful sync can restore them
        Err(e) => return Err(e),
        Ok(SyncOutcome::Skipped) => return Ok(Action::requeue(RESYNC)),
        Ok(SyncOutcome::Completed(outcome)) => outcome,
    };

    let generation = obj.metadata.generation;
    let degraded = match &outcome.error {
        Some(e) => Condition::degraded(true, "Error", &e.to_string(), generation),
        None => Condition::degraded(false, "AsExpected", "", generation),
    };
    let progressing = if outcome.migrating.is_empty() {
        Condition::progressing(false, "AsExpected", "", generation)
    } else {
        Condition::progressing(
            true,
            "Migrating",
            &format!(
                "migrating resources to a new write key: {}",
                grs_to_human_readable(&outcome.migrating)
            ),
            generation,
        )
    };

    if !outcome.migrated.is_empty() {
        ctx.publish_normal_event(
            &obj,
            "ResourceMigrated",
            "Migrating",
            Some(format!(
                "completed migration to a new write key: {}",
                grs_to_human_readable(&outcome.migrated)
            )),
        )
        .await;
    }
    if let Some(e) = &outcome.error {
        ctx.publish_warning_event(&obj, "MigrationError", "Migrating", Some(e.to_string()))
            .await;
    }

    // deferred finalizer: a failed status write replaces the sync error so
    // the work item is re-queued
    let api: Api<StorageEncryption> = Api::namespaced(ctx.client.clone(), &namespace);
    if let Err(status_error) =
        status::publish_conditions(&api, &obj, vec![degraded, progressing]).await
    {
        return Err(status_error);
    }

    if let Some(ref health_state) = ctx.health_state {
        let duration = start_time.elapsed().as_secs_f64();
        health_state
            .metrics
            .record_reconcile(&namespace, &name, duration);
        health_state.metrics.set_resources_migrating(
            &namespace,
            &name,
            outcome.migrating.len() as i64,
        );
    }

    if let Some(e) = outcome.error {
        return Err(e);
    }
    Ok(Action::requeue(outcome.requeue_after.unwrap_or(RESYNC)))
}

/// Error policy for the controller
pub fn error_policy(obj: Arc<StorageEncryption>, error: &Error, ctx: Arc<Context>) -> Action {
    let name = obj.name_any();
    let namespace = obj.namespace().unwrap_or_else(|| "default".to_string());

    // Record error metric
    if let Some(ref health_state) = ctx.health_state {
        health_state.metrics.record_error(&namespace, &name);
    }

    if error.is_not_found() {
        debug!(name = %name, "Resource not found (likely deleted)");
        return Action::await_change();
    }

    if error.is_retryable() {
        warn!(name = %name, error = %error, "Retryable error, will retry");
    } else {
        error!(name = %name, error = %error, "Non-retryable error");
    }
    Action::requeue(error.requeue_after())
}
