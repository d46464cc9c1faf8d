//! Status management: publishing the Degraded and Progressing conditions.
//!
//! The status patch is skipped when nothing changed so that back-to-back
//! syncs with identical outcomes produce no writes, and an unchanged
//! condition keeps its original transition time.

use kube::api::{Patch, PatchParams};
use kube::{Api, ResourceExt};
use tracing::debug;

use crate::controller::context::FIELD_MANAGER;
use crate::controller::error::Result;
use crate::crd::{Condition, StorageEncryption, StorageEncryptionStatus};

/// Merge desired conditions into the existing set. An existing condition
/// with identical status, reason, and message is left untouched, preserving
/// its last transition time. Returns the merged list and whether anything
/// changed.
pub fn merge_conditions(
    existing: &[Condition],
    desired: Vec<Condition>,
) -> (Vec<Condition>, bool) {
    let mut merged: Vec<Condition> = existing.to_vec();
    let mut changed = false;

    for condition in desired {
        match merged.iter_mut().find(|c| c.r#type == condition.r#type) {
            Some(current) if conditions_match(current, &condition) => {
                if current.observed_generation != condition.observed_generation {
                    current.observed_generation = condition.observed_generation;
                    changed = true;
                }
            }
            Some(current) => {
                *current = condition;
                changed = true;
            }
            None => {
                merged.push(condition);
                changed = true;
            }
        }
    }

    (merged, changed)
}

fn conditions_match(a: &Condition, b: &Condition) -> bool {
    a.status == b.status && a.reason == b.reason && a.message == b.message
}

/// Check if a condition type is true
pub fn is_condition_true(conditions: &[Condition], condition_type: &str) -> bool {
    conditions
        .iter()
        .find(|c| c.r#type == condition_type)
        .is_some_and(|c| c.status == "True")
}

/// Patch the conditions onto the object's status, skipping the write when
/// the merged set equals what is already there.
pub async fn publish_conditions(
    api: &Api<StorageEncryption>,
    obj: &StorageEncryption,
    desired: Vec<Condition>,
) -> Result<()> {
    let existing = obj
        .status
        .as_ref()
        .map(|s| s.conditions.as_slice())
        .unwrap_or_default();
    let (merged, mut changed) = merge_conditions(existing, desired);

    let generation = obj.metadata.generation;
    if obj.status.as_ref().and_then(|s| s.observed_generation) != generation {
        changed = true;
    }

    if !changed {
        debug!(name = %obj.name_any(), "status unchanged, skipping update");
        return Ok(());
    }

    let status = StorageEncryptionStatus {
        observed_generation: generation,
        conditions: merged,
    };
    let patch = serde_json::json!({ "status": status });
    api.patch_status(
        &obj.name_any(),
        &PatchParams::apply(FIELD_MANAGER),
        &Patch::Merge(&patch),
    )
    .await?;

    Ok(())
}
