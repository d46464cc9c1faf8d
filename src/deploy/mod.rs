//! Deployment observation: which encryption config has every API-server
//! replica converged on.
//!
//! The migration controller never talks to API-server processes; it only
//! consumes this seam. The shipped implementation reads the `revision` label
//! the installer stamps on operand pods and resolves the per-revision config
//! secret once the whole fleet agrees on a single revision.

use async_trait::async_trait;
use futures::StreamExt;
use futures::stream::BoxStream;
use k8s_openapi::api::core::v1::{Pod, Secret};
use kube::api::{Api, ListParams};
use kube::runtime::{WatchStreamExt, watcher};
use kube::Client;
use tracing::debug;

use crate::controller::error::{Error, Result};

/// Label carrying the rollout revision on operand pods.
const REVISION_LABEL: &str = "revision";

/// Name prefix of the per-revision encryption-config secret.
const ENCRYPTION_CONFIG_SECRET_PREFIX: &str = "encryption-config-";

/// Reports the encryption config currently observed by all replicas and
/// whether the fleet has converged on a single revision.
#[async_trait]
pub trait Deployer: Send + Sync {
    /// `(secret, converged)`: the config secret is only meaningful when
    /// `converged` is true. A converged fleet with no deployed config yet
    /// returns `(None, true)`.
    async fn deployed_encryption_config_secret(&self) -> Result<(Option<Secret>, bool)>;

    /// Wakes the sync loop whenever the deployment state may have changed.
    fn changed(&self) -> BoxStream<'static, ()>;
}

/// Deployer that derives convergence from the revision labels of the operand
/// pods and fetches `encryption-config-<revision>` from the operand
/// namespace.
pub struct RevisionLabelDeployer {
    client: Client,
    operand_namespace: String,
    pod_selector: String,
}

impl RevisionLabelDeployer {
    pub fn new(client: Client, operand_namespace: &str, pod_selector: &str) -> Self {
        Self {
            client,
            operand_namespace: operand_namespace.to_string(),
            pod_selector: pod_selector.to_string(),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.operand_namespace)
    }

    /// The single revision all operand pods agree on, if any.
    async fn converged_revision(&self) -> Result<Option<String>> {
        let pods = self
            .pods()
            .list(&ListParams::default().labels(&self.pod_selector))
            .await?;

        let mut revision: Option<String> = None;
        if pods.items.is_empty() {
            return Ok(None);
        }
        for pod in &pods.items {
            let Some(pod_revision) = pod
                .metadata
                .labels
                .as_ref()
                .and_then(|l| l.get(REVISION_LABEL))
            else {
                return Ok(None);
            };
            match &revision {
                None => revision = Some(pod_revision.clone()),
                Some(seen) if seen != pod_revision => return Ok(None),
                Some(_) => {}
            }
        }
        Ok(revision)
    }
}

#[async_trait]
impl Deployer for RevisionLabelDeployer {
    async fn deployed_encryption_config_secret(&self) -> Result<(Option<Secret>, bool)> {
        let Some(revision) = self.converged_revision().await? else {
            debug!(namespace = %self.operand_namespace, "operand replicas have not converged on one revision");
            return Ok((None, false));
        };

        let name = format!("{}{}", ENCRYPTION_CONFIG_SECRET_PREFIX, revision);
        let secrets: Api<Secret> = Api::namespaced(self.client.clone(), &self.operand_namespace);
        match secrets.get(&name).await {
            Ok(secret) => Ok((Some(secret), true)),
            Err(e) => {
                let err = Error::from(e);
                if err.is_not_found() {
                    // converged fleet that has never deployed an encryption config
                    Ok((None, true))
                } else {
                    Err(err)
                }
            }
        }
    }

    fn changed(&self) -> BoxStream<'static, ()> {
        let config = watcher::Config::default().labels(&self.pod_selector);
        watcher(self.pods(), config)
            .touched_objects()
            .map(|_| ())
            .boxed()
    }
}
