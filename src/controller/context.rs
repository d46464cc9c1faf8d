//! Shared context for the controller.
//!
//! The Context struct holds the Kubernetes client, the migration driver
//! with its injected collaborators, and the event recorder identity.

use std::sync::Arc;

use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::{Client, Resource};

use crate::controller::migration::MigrationDriver;
use crate::crd::StorageEncryption;
use crate::health::HealthState;

/// Field manager name for the operator
pub const FIELD_MANAGER: &str = "encryption-operator";

/// Shared context for the controller
#[derive(Clone)]
pub struct Context {
    /// Kubernetes client
    pub client: Client,
    /// The migration driver and its collaborator seams
    pub driver: Arc<MigrationDriver>,
    /// Event reporter identity
    reporter: Reporter,
    /// Optional health state for metrics and readiness
    pub health_state: Option<Arc<HealthState>>,
}

impl Context {
    /// Create a new context
    pub fn new(
        client: Client,
        driver: Arc<MigrationDriver>,
        health_state: Option<Arc<HealthState>>,
    ) -> Self {
        Self {
            client,
            driver,
            reporter: Reporter {
                controller: FIELD_MANAGER.into(),
                instance: std::env::var("POD_NAME").ok(),
            },
            health_state,
        }
    }

    /// Create an event recorder for publishing Kubernetes events
    fn recorder(&self) -> Recorder {
        Recorder::new(self.client.clone(), self.reporter.clone())
    }

    /// Publish a normal event for a StorageEncryption resource
    pub async fn publish_normal_event(
        &self,
        resource: &StorageEncryption,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish_event(resource, EventType::Normal, reason, action, note)
            .await;
    }

    /// Publish a warning event for a StorageEncryption resource
    pub async fn publish_warning_event(
        &self,
        resource: &StorageEncryption,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        self.publish_event(resource, EventType::Warning, reason, action, note)
            .await;
    }

    async fn publish_event(
        &self,
        resource: &StorageEncryption,
        type_: EventType,
        reason: &str,
        action: &str,
        note: Option<String>,
    ) {
        let recorder = self.recorder();
        let object_ref = resource.object_ref(&());
        if let Err(e) = recorder
            .publish(
                &Event {
                    type_,
                    reason: reason.into(),
                    note,
                    action: action.into(),
                    secondary: None,
                },
                &object_ref,
            )
            .await
        {
            tracing::warn!(reason = %reason, error = %e, "Failed to publish event");
        }
    }
}
