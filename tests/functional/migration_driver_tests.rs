//! Functional tests for the migration driver.
//!
//! These drive full sync passes against in-memory fakes: the gating
//! sequence, the per-resource migration loop, annotation stamping, and the
//! idempotence and determinism guarantees.

use std::sync::Arc;
use std::time::Duration;

use encryption_operator::controller::migration::{
    MigrationDriver, MigrationOutcome, SyncOutcome,
};
use encryption_operator::state::GroupResource;

use crate::fakes::{Harness, api_error, failure_aged, running};

fn secrets_gr() -> GroupResource {
    GroupResource::new("", "secrets")
}

fn deployments_gr() -> GroupResource {
    GroupResource::new("apps", "deployments")
}

fn expect_completed(outcome: SyncOutcome) -> MigrationOutcome {
    match outcome {
        SyncOutcome::Completed(outcome) => outcome,
        SyncOutcome::Skipped => panic!("expected a completed sync, got a skipped one"),
    }
}

// ============================================================================
// Boundary scenarios
// ============================================================================

#[tokio::test]
async fn test_initial_rollout_stamps_write_key() {
    let harness = Harness::new(vec![secrets_gr()]);
    let key = harness.add_key(1);
    harness.deploy_aligned_config().await;

    let outcome = expect_completed(harness.sync().await.unwrap());

    assert!(outcome.error.is_none());
    assert!(outcome.migrating.is_empty());
    assert_eq!(outcome.migrated, vec![secrets_gr()]);

    let (timestamp, resources) = harness.migrated_annotations(&key);
    assert!(timestamp.is_some());
    assert!(resources.contains(&secrets_gr()));
}

#[tokio::test]
async fn test_mid_rollout_requeues_without_invoking_migrator() {
    let harness = Harness::new(vec![secrets_gr()]);
    harness.add_key(1);
    harness.deployer.set_converged(false);

    let outcome = expect_completed(harness.sync().await.unwrap());

    assert!(outcome.error.is_none());
    assert!(outcome.migrating.is_empty());
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(120)));
    assert_eq!(harness.migrator.ensure_call_count(), 0);
}

#[tokio::test]
async fn test_no_deployed_config_requeues() {
    let harness = Harness::new(vec![secrets_gr()]);
    harness.add_key(1);
    // converged fleet that has never deployed an encryption config

    let outcome = expect_completed(harness.sync().await.unwrap());

    assert!(outcome.error.is_none());
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(120)));
    assert_eq!(harness.migrator.ensure_call_count(), 0);
}

#[tokio::test]
async fn test_config_divergence_prunes_and_requeues() {
    let harness = Harness::new(vec![secrets_gr()]);
    harness.add_key(1);
    harness.deploy_aligned_config().await;
    // a new key appears: the desired config now differs from the deployed one
    harness.add_key(2);

    let outcome = expect_completed(harness.sync().await.unwrap());

    assert!(outcome.error.is_none());
    assert_eq!(outcome.requeue_after, Some(Duration::from_secs(120)));
    // migration is never attempted while configs differ
    assert_eq!(harness.migrator.ensure_call_count(), 0);
    assert_eq!(
        harness.migrator.prune_calls.lock().unwrap().clone(),
        vec![secrets_gr()]
    );
}

#[tokio::test]
async fn test_long_migration_reports_progressing_and_reinvokes() {
    let harness = Harness::new(vec![deployments_gr()]);
    let key = harness.add_key(1);
    harness.deploy_aligned_config().await;
    harness
        .migrator
        .script(&deployments_gr(), &key, vec![Ok(running())]);

    let outcome = expect_completed(harness.sync().await.unwrap());
    assert!(outcome.error.is_none());
    assert_eq!(outcome.migrating, vec![deployments_gr()]);

    // no annotation write happened
    let (timestamp, resources) = harness.migrated_annotations(&key);
    assert!(timestamp.is_none());
    assert!(resources.resources.is_empty());

    // the next sync re-invokes with the same arguments
    let outcome = expect_completed(harness.sync().await.unwrap());
    assert_eq!(outcome.migrating, vec![deployments_gr()]);
    let calls = harness.migrator.ensure_calls.lock().unwrap().clone();
    assert_eq!(calls.len(), 2);
    assert_eq!(calls[0], calls[1]);
}

#[tokio::test]
async fn test_stale_failure_is_pruned_and_retried() {
    let harness = Harness::new(vec![secrets_gr()]);
    let key = harness.add_key(1);
    harness.deploy_aligned_config().await;
    harness.migrator.script(
        &secrets_gr(),
        &key,
        vec![Ok(failure_aged("etcd unavailable", 600)), Ok(running())],
    );

    let outcome = expect_completed(harness.sync().await.unwrap());

    // a failure past the cool-down is pruned and re-ensured
    assert_eq!(harness.migrator.prune_call_count(), 1);
    assert_eq!(harness.migrator.ensure_call_count(), 2);
    assert!(outcome.error.is_none());
    assert_eq!(outcome.migrating, vec![secrets_gr()]);
}

#[tokio::test]
async fn test_recent_failure_is_surfaced_without_prune() {
    let harness = Harness::new(vec![secrets_gr()]);
    let key = harness.add_key(1);
    harness.deploy_aligned_config().await;
    harness.migrator.script(
        &secrets_gr(),
        &key,
        vec![Ok(failure_aged("etcd unavailable", 60))],
    );

    let outcome = expect_completed(harness.sync().await.unwrap());

    assert_eq!(harness.migrator.prune_call_count(), 0);
    assert_eq!(harness.migrator.ensure_call_count(), 1);
    let error = outcome.error.expect("a recent failure goes degraded");
    assert!(error.to_string().contains("etcd unavailable"));
    assert!(error.to_string().contains("core/secrets"));
}

#[tokio::test]
async fn test_annotation_conflict_is_retried_invisibly() {
    let harness = Harness::new(vec![secrets_gr()]);
    let key = harness.add_key(1);
    harness.deploy_aligned_config().await;
    harness.secrets.fail_next_applies_with_conflict(1);

    let outcome = expect_completed(harness.sync().await.unwrap());

    // final state identical to success on the first attempt
    assert!(outcome.error.is_none());
    assert_eq!(outcome.migrated, vec![secrets_gr()]);
    let (timestamp, resources) = harness.migrated_annotations(&key);
    assert!(timestamp.is_some());
    assert!(resources.contains(&secrets_gr()));
    assert_eq!(harness.secrets.write_count(), 1);
}

// ============================================================================
// Invariants
// ============================================================================

#[tokio::test]
async fn test_second_sync_is_a_no_op() {
    let harness = Harness::new(vec![secrets_gr(), deployments_gr()]);
    harness.add_key(1);
    harness.deploy_aligned_config().await;

    let first = expect_completed(harness.sync().await.unwrap());
    assert!(first.error.is_none());
    let writes_after_first = harness.secrets.write_count();
    let calls_after_first = harness.migrator.ensure_call_count();

    let second = expect_completed(harness.sync().await.unwrap());

    assert!(second.error.is_none());
    assert!(second.migrating.is_empty());
    assert!(second.migrated.is_empty());
    // no secret writes and no migrator work on the second pass
    assert_eq!(harness.secrets.write_count(), writes_after_first);
    assert_eq!(harness.migrator.ensure_call_count(), calls_after_first);
}

#[tokio::test]
async fn test_migrating_resources_are_sorted_by_human_readable_gr() {
    let harness = Harness::new(vec![secrets_gr(), deployments_gr()]);
    let key = harness.add_key(1);
    harness.deploy_aligned_config().await;
    harness
        .migrator
        .script(&secrets_gr(), &key, vec![Ok(running())]);
    harness
        .migrator
        .script(&deployments_gr(), &key, vec![Ok(running())]);

    let outcome = expect_completed(harness.sync().await.unwrap());

    // "apps/deployments" sorts before "core/secrets"
    assert_eq!(outcome.migrating, vec![deployments_gr(), secrets_gr()]);
}

#[tokio::test]
async fn test_every_encrypted_gr_with_write_key_ends_up_annotated() {
    let harness = Harness::new(vec![secrets_gr(), deployments_gr()]);
    let key = harness.add_key(1);
    harness.deploy_aligned_config().await;

    let outcome = expect_completed(harness.sync().await.unwrap());
    assert!(outcome.error.is_none());
    assert!(outcome.migrating.is_empty());

    let (_, resources) = harness.migrated_annotations(&key);
    assert!(resources.contains(&secrets_gr()));
    assert!(resources.contains(&deployments_gr()));
}

#[tokio::test]
async fn test_identity_only_gr_is_skipped() {
    // no keys at all: the deployed config is identity-only
    let harness = Harness::new(vec![secrets_gr()]);
    harness.deploy_aligned_config().await;

    let outcome = expect_completed(harness.sync().await.unwrap());

    assert!(outcome.error.is_none());
    assert!(outcome.migrating.is_empty());
    assert!(outcome.migrated.is_empty());
    assert_eq!(harness.migrator.ensure_call_count(), 0);
}

#[tokio::test]
async fn test_already_stamped_key_is_not_migrated_again() {
    let harness = Harness::new(vec![secrets_gr()]);
    harness.add_key_with_migrated(1, &[secrets_gr()]);
    harness.deploy_aligned_config().await;

    let outcome = expect_completed(harness.sync().await.unwrap());

    assert!(outcome.error.is_none());
    assert!(outcome.migrated.is_empty());
    assert_eq!(harness.migrator.ensure_call_count(), 0);
    assert_eq!(harness.secrets.write_count(), 0);
}

#[tokio::test]
async fn test_migrator_transport_error_aggregates() {
    let harness = Harness::new(vec![secrets_gr(), deployments_gr()]);
    let key = harness.add_key(1);
    harness.deploy_aligned_config().await;
    harness.migrator.script(
        &deployments_gr(),
        &key,
        vec![Err(api_error(500, "InternalError"))],
    );

    let outcome = expect_completed(harness.sync().await.unwrap());

    // the failing GR degrades the sync, the healthy GR still completes
    assert!(outcome.error.is_some());
    assert_eq!(outcome.migrated, vec![secrets_gr()]);
}

// ============================================================================
// Preconditions
// ============================================================================

#[tokio::test]
async fn test_disabled_provider_skips_without_conditions() {
    let harness = Harness::new(vec![secrets_gr()]);
    harness.add_key(1);
    harness.deploy_aligned_config().await;
    harness.provider.set_enabled(false);

    let outcome = harness.sync().await.unwrap();
    assert!(matches!(outcome, SyncOutcome::Skipped));
    assert_eq!(harness.migrator.ensure_call_count(), 0);
}

#[tokio::test]
async fn test_precondition_error_propagates() {
    let harness = Harness::new(vec![secrets_gr()]);
    let driver = MigrationDriver {
        secrets: harness.secrets.clone(),
        deployer: harness.deployer.clone(),
        migrator: harness.migrator.clone(),
        provider: harness.provider.clone(),
        preconditions: Arc::new(|| Err(api_error(500, "InternalError"))),
    };

    assert!(driver.sync(&harness.target()).await.is_err());
    assert_eq!(harness.migrator.ensure_call_count(), 0);
}
