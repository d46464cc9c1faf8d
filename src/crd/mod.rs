//! Custom Resource Definitions for encryption-operator.
//!
//! - `StorageEncryption`: one managed storage-encryption domain; its status
//!   carries the conditions the migration controller publishes.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

/// Condition type set while a sync aggregated migration errors.
pub const DEGRADED_CONDITION: &str = "EncryptionMigrationControllerDegraded";

/// Condition type set while resources are still migrating to a new write key.
pub const PROGRESSING_CONDITION: &str = "EncryptionMigrationControllerProgressing";

/// StorageEncryption configures key-lifecycle management for one component.
///
/// Example:
/// ```yaml
/// apiVersion: encryption-operator.io/v1alpha1
/// kind: StorageEncryption
/// metadata:
///   name: apiserver
/// spec:
///   component: apiserver
///   managedNamespace: encryption-managed
/// ```
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[kube(
    group = "encryption-operator.io",
    version = "v1alpha1",
    kind = "StorageEncryption",
    plural = "storageencryptions",
    shortname = "senc",
    status = "StorageEncryptionStatus",
    namespaced,
    printcolumn = r#"{"name":"Component", "type":"string", "jsonPath":".spec.component"}"#,
    printcolumn = r#"{"name":"Age", "type":"date", "jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct StorageEncryptionSpec {
    /// Component whose key-secrets this object manages. Key-secrets are
    /// named `encryption-key-<component>-<id>` and carry the component
    /// label.
    pub component: String,

    /// Namespace holding the component's key-secrets (default:
    /// encryption-managed).
    #[serde(default = "default_managed_namespace")]
    pub managed_namespace: String,
}

fn default_managed_namespace() -> String {
    "encryption-managed".to_string()
}

/// Status of a StorageEncryption.
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct StorageEncryptionStatus {
    /// The generation most recently observed by the controller.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// Conditions describing the current state.
    #[serde(default)]
    pub conditions: Vec<Condition>,
}

/// Condition describes the controller's state at a certain point.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    /// Type of condition.
    pub r#type: String,
    /// Status of the condition ("True", "False", "Unknown").
    pub status: String,
    /// Machine-readable reason for the condition's last transition.
    pub reason: String,
    /// Human-readable message indicating details about last transition.
    pub message: String,
    /// Last time the condition transitioned from one status to another.
    pub last_transition_time: String,
    /// The generation of the resource this condition was observed for.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
}

impl Condition {
    /// Create a new condition.
    pub fn new(
        condition_type: &str,
        status: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self {
            r#type: condition_type.to_string(),
            status: if status {
                "True".to_string()
            } else {
                "False".to_string()
            },
            reason: reason.to_string(),
            message: message.to_string(),
            last_transition_time: jiff::Timestamp::now().to_string(),
            observed_generation: generation,
        }
    }

    /// Create the Degraded condition.
    pub fn degraded(degraded: bool, reason: &str, message: &str, generation: Option<i64>) -> Self {
        Self::new(DEGRADED_CONDITION, degraded, reason, message, generation)
    }

    /// Create the Progressing condition.
    pub fn progressing(
        progressing: bool,
        reason: &str,
        message: &str,
        generation: Option<i64>,
    ) -> Self {
        Self::new(PROGRESSING_CONDITION, progressing, reason, message, generation)
    }
}
