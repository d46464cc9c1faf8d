//! encryption-operator library crate
//!
//! This module exports the migration controller, the CRD definition, and the
//! collaborator seams (deployer, migrator, provider, key-secret store).

pub mod controller;
pub mod crd;
pub mod deploy;
pub mod encryptionconfig;
pub mod health;
pub mod migration;
pub mod secrets;
pub mod state;

pub use health::HealthState;

use std::sync::Arc;

use futures::StreamExt;
use k8s_openapi::api::core::v1::Secret;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::{Controller, WatchStreamExt, watcher};
use kube::{Api, Client};
use tracing::{debug, error, info};

use controller::{context::Context, reconciler::reconcile};
use crd::StorageEncryption;

/// Create the default watcher configuration for all watches.
///
/// `any_semantic()`: more reliable resource discovery in test environments
fn default_watcher_config() -> WatcherConfig {
    WatcherConfig::default().any_semantic()
}

/// Adapts a `Send`-only stream to satisfy `reconcile_all_on`'s `Send + Sync`
/// bound. The stream is only ever polled from the single task that owns it,
/// so sharing a `&AssertSyncStream` across threads never actually happens;
/// the bound is required by `kube-runtime`'s signature but not by any real
/// access pattern here.
struct AssertSyncStream<S>(S);

unsafe impl<S> Sync for AssertSyncStream<S> {}

impl<S: futures::Stream + Unpin> futures::Stream for AssertSyncStream<S> {
    type Item = S::Item;

    fn poll_next(
        mut self: std::pin::Pin<&mut Self>,
        cx: &mut std::task::Context<'_>,
    ) -> std::task::Poll<Option<Self::Item>> {
        self.0.poll_next_unpin(cx)
    }
}

/// Run the migration controller.
///
/// The controller watches StorageEncryption resources cluster-wide and
/// re-enters the sync on (i) the fixed resync interval, (ii) any secret
/// change in the managed namespace, (iii) operator-status changes through
/// the primary watch, and (iv) signals from the migrator and deployer, so
/// progress notifications wake the loop promptly. The work queue inside the
/// kube runtime collapses duplicate wakeups, and reconciliations for one
/// object never run concurrently.
pub async fn run_controller(client: Client, ctx: Arc<Context>, managed_namespace: &str) {
    info!(
        namespace = %managed_namespace,
        "Starting controller for StorageEncryption resources"
    );

    // Mark as ready once we start the controller
    if let Some(ref state) = ctx.health_state {
        state.set_ready(true).await;
    }

    let storage_encryptions: Api<StorageEncryption> = Api::all(client.clone());
    let secrets: Api<Secret> = Api::namespaced(client.clone(), managed_namespace);

    let watcher_config = default_watcher_config();

    // every key-secret event wakes the sync, alongside migrator progress and
    // operand rollouts
    let secret_events = watcher(secrets, watcher_config.clone())
        .touched_objects()
        .map(|_| ())
        .boxed();
    let external_wakeups = futures::stream::select(
        secret_events,
        futures::stream::select(ctx.driver.migrator.changed(), ctx.driver.deployer.changed()),
    );

    Controller::new(storage_encryptions, watcher_config)
        .reconcile_all_on(AssertSyncStream(external_wakeups))
        .run(reconcile, controller::reconciler::error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok((obj, _action)) => {
                    debug!("Reconciled: {}", obj.name);
                }
                Err(e) => {
                    // ObjectNotFound/NotFound errors are expected after deletion when
                    // related watch events trigger reconciliation for a deleted object.
                    // Log these at debug level instead of error.
                    let is_not_found = match &e {
                        kube::runtime::controller::Error::ObjectNotFound(_) => true,
                        kube::runtime::controller::Error::ReconcilerFailed(err, _) => {
                            err.is_not_found()
                        }
                        _ => false,
                    };
                    if is_not_found {
                        debug!("Object no longer exists (likely deleted): {:?}", e);
                    } else {
                        error!("Reconciliation error: {:?}", e);
                    }
                }
            }
        })
        .await;

    // This should never complete in normal operation
    error!("Controller stream ended unexpectedly");
}
