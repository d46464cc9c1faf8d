//! Durable projection of per-key metadata onto annotated secrets in the
//! managed namespace.
//!
//! Key-secrets are created by the external key controller; this store only
//! reads them and annotates them. It never creates or deletes key material.
//! Mutations go through compare-and-swap on the resource version, and
//! annotations only ever move forward: the migrated-resources set is
//! append-only and the migrated-timestamp only advances.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jiff::Timestamp;
use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use kube::api::{Api, ListParams, PostParams};
use kube::Client;
use tracing::{debug, error, warn};

use crate::controller::error::{Error, Result};
use crate::state::{GroupResource, Key, KeyMode, KeyRole, KeyState, MigratedGroupResources};

/// RFC3339 instant of the most recent successful migration step for this key.
pub const MIGRATED_TIMESTAMP_ANNOTATION: &str = "encryption-operator.io/migrated-timestamp";

/// JSON set of GroupResources this key has finished migrating.
pub const MIGRATED_RESOURCES_ANNOTATION: &str = "encryption-operator.io/migrated-resources";

/// Cipher mode of the key carried by the secret.
pub const MODE_ANNOTATION: &str = "encryption-operator.io/mode";

/// Label selecting the key-secrets of one component.
pub const COMPONENT_LABEL: &str = "encryption-operator.io/component";

/// Data key holding the raw key material.
pub const KEY_DATA_KEY: &str = "encryption-key";

const KEY_SECRET_PREFIX: &str = "encryption-key-";

/// Conflict retry schedule for the read-modify-write annotation step.
const CONFLICT_RETRIES: u32 = 5;
const CONFLICT_RETRY_BASE: Duration = Duration::from_millis(10);

/// Narrow seam over the secret API so the store logic runs against an
/// in-memory client in tests.
#[async_trait]
pub trait SecretClient: Send + Sync {
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>>;

    async fn get(&self, namespace: &str, name: &str) -> Result<Secret>;

    /// Replace the secret, preserving the resource version carried on it.
    /// A stale resource version yields a conflict error.
    async fn apply(&self, secret: &Secret) -> Result<Secret>;
}

/// Production client backed by the cluster secret API.
pub struct KubeSecretClient {
    client: Client,
}

impl KubeSecretClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn api(&self, namespace: &str) -> Api<Secret> {
        Api::namespaced(self.client.clone(), namespace)
    }
}

#[async_trait]
impl SecretClient for KubeSecretClient {
    async fn list(&self, namespace: &str, label_selector: &str) -> Result<Vec<Secret>> {
        let params = ListParams::default().labels(label_selector);
        let list = self.api(namespace).list(&params).await?;
        Ok(list.items)
    }

    async fn get(&self, namespace: &str, name: &str) -> Result<Secret> {
        Ok(self.api(namespace).get(name).await?)
    }

    async fn apply(&self, secret: &Secret) -> Result<Secret> {
        let name = secret.metadata.name.as_deref().ok_or_else(|| {
            Error::InvalidKeySecret("cannot apply a secret without a name".to_string())
        })?;
        let namespace = secret.metadata.namespace.as_deref().ok_or_else(|| {
            Error::InvalidKeySecret(format!("cannot apply secret {} without a namespace", name))
        })?;
        Ok(self
            .api(namespace)
            .replace(name, &PostParams::default(), secret)
            .await?)
    }
}

/// Thin mediator over the key-secrets of one component.
#[derive(Clone)]
pub struct KeySecretStore {
    client: Arc<dyn SecretClient>,
    namespace: String,
    component: String,
}

impl KeySecretStore {
    pub fn new(client: Arc<dyn SecretClient>, namespace: &str, component: &str) -> Self {
        Self {
            client,
            namespace: namespace.to_string(),
            component: component.to_string(),
        }
    }

    pub fn namespace(&self) -> &str {
        &self.namespace
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    /// Label selector matching this component's key-secrets.
    pub fn selector(&self) -> String {
        format!("{}={}", COMPONENT_LABEL, self.component)
    }

    /// List and parse all key-secrets, newest key first.
    pub async fn list_key_states(&self) -> Result<Vec<KeyState>> {
        let secrets = self
            .client
            .list(&self.namespace, &self.selector())
            .await?;
        let mut states = secrets
            .iter()
            .map(|s| self.to_key_state(s))
            .collect::<Result<Vec<_>>>()?;
        states.sort_by(|a, b| b.key.id.cmp(&a.key.id));
        Ok(states)
    }

    pub async fn get_secret(&self, name: &str) -> Result<Secret> {
        self.client.get(&self.namespace, name).await
    }

    /// Parse a key-secret into a key state. The role starts out unused; the
    /// state deriver assigns roles per GR.
    pub fn to_key_state(&self, secret: &Secret) -> Result<KeyState> {
        let name = secret
            .metadata
            .name
            .as_deref()
            .ok_or_else(|| Error::InvalidKeySecret("key secret without a name".to_string()))?;

        let prefix = format!("{}{}-", KEY_SECRET_PREFIX, self.component);
        let id: u64 = name
            .strip_prefix(&prefix)
            .and_then(|suffix| suffix.parse().ok())
            .ok_or_else(|| {
                Error::InvalidKeySecret(format!(
                    "secret {} does not match {}<id>",
                    name, prefix
                ))
            })?;

        let annotations = secret.metadata.annotations.as_ref();
        let mode: KeyMode = annotations
            .and_then(|a| a.get(MODE_ANNOTATION))
            .ok_or_else(|| {
                Error::InvalidKeySecret(format!("secret {} has no {} annotation", name, MODE_ANNOTATION))
            })?
            .parse()
            .map_err(Error::InvalidKeySecret)?;

        // identity keys carry no material
        let material = secret
            .data
            .as_ref()
            .and_then(|d| d.get(KEY_DATA_KEY))
            .map(|b| b.0.clone())
            .unwrap_or_default();

        let migrated = annotations
            .and_then(|a| a.get(MIGRATED_RESOURCES_ANNOTATION))
            .map(|raw| parse_migrated_resources(name, raw))
            .unwrap_or_default();

        let migrated_at = annotations
            .and_then(|a| a.get(MIGRATED_TIMESTAMP_ANNOTATION))
            .and_then(|raw| match raw.parse::<Timestamp>() {
                Ok(ts) => Some(ts),
                Err(e) => {
                    warn!(secret = name, error = %e, "ignoring unparseable migrated-timestamp annotation");
                    None
                }
            });

        Ok(KeyState {
            key: Key {
                name: name.to_string(),
                id,
                mode,
                material,
            },
            role: KeyRole::Unused,
            migrated,
            migrated_at,
        })
    }

    /// Render a key state back into a fully-formed key-secret, carrying the
    /// component label, mode annotation, and migration annotations.
    pub fn from_key_state(&self, state: &KeyState) -> Secret {
        let mut annotations = BTreeMap::new();
        annotations.insert(MODE_ANNOTATION.to_string(), state.key.mode.to_string());
        if let Some(ts) = state.migrated_at {
            annotations.insert(MIGRATED_TIMESTAMP_ANNOTATION.to_string(), ts.to_string());
        }
        if !state.migrated.resources.is_empty()
            && let Ok(encoded) = serde_json::to_string(&state.migrated)
        {
            annotations.insert(MIGRATED_RESOURCES_ANNOTATION.to_string(), encoded);
        }

        let mut labels = BTreeMap::new();
        labels.insert(COMPONENT_LABEL.to_string(), self.component.clone());

        let mut data = BTreeMap::new();
        if !state.key.material.is_empty() {
            data.insert(KEY_DATA_KEY.to_string(), ByteString(state.key.material.clone()));
        }

        Secret {
            metadata: ObjectMeta {
                name: Some(state.key.name.clone()),
                namespace: Some(self.namespace.clone()),
                labels: Some(labels),
                annotations: Some(annotations),
                ..Default::default()
            },
            data: (!data.is_empty()).then_some(data),
            type_: Some("Opaque".to_string()),
            ..Default::default()
        }
    }

    /// Stamp `gr` as migrated on the named write-key secret.
    ///
    /// Read-modify-write under compare-and-swap; a conflict restarts this
    /// step only, not the whole sync. Returns true when a write happened,
    /// false when the annotations were already in place.
    pub async fn record_migrated(&self, gr: &GroupResource, write_key_name: &str) -> Result<bool> {
        let mut attempt = 0u32;
        loop {
            let mut secret = self.get_secret(write_key_name).await?;
            if !set_resource_migrated(gr, &mut secret)? {
                return Ok(false);
            }
            match self.client.apply(&secret).await {
                Ok(_) => {
                    debug!(gr = %gr, secret = write_key_name, "recorded migration on write key");
                    return Ok(true);
                }
                Err(e) if e.is_conflict() && attempt < CONFLICT_RETRIES => {
                    attempt += 1;
                    tokio::time::sleep(CONFLICT_RETRY_BASE * 2u32.pow(attempt - 1)).await;
                }
                Err(e) => return Err(e),
            }
        }
    }
}

fn parse_migrated_resources(secret_name: &str, raw: &str) -> MigratedGroupResources {
    match serde_json::from_str(raw) {
        Ok(set) => set,
        Err(e) => {
            // Start over with an empty set; the write key has not changed, so
            // the worst case is a redundant migration next cycle.
            error!(
                secret = secret_name,
                error = %e,
                "corrupt migrated-resources annotation, resetting to empty"
            );
            MigratedGroupResources::default()
        }
    }
}

/// Annotation update for one migrated GR.
///
/// Returns false when the secret already records the migration (both the GR
/// in the resource set and a timestamp present), true when the annotations
/// were updated in place.
pub fn set_resource_migrated(gr: &GroupResource, secret: &mut Secret) -> Result<bool> {
    let annotations = secret.metadata.annotations.get_or_insert_with(BTreeMap::new);

    let mut migrated = annotations
        .get(MIGRATED_RESOURCES_ANNOTATION)
        .map(|raw| {
            parse_migrated_resources(
                secret.metadata.name.as_deref().unwrap_or("<unnamed>"),
                raw,
            )
        })
        .unwrap_or_default();

    let already_migrated = migrated.contains(gr);

    // nothing to do when both annotations are in place
    if already_migrated && annotations.contains_key(MIGRATED_TIMESTAMP_ANNOTATION) {
        return Ok(false);
    }

    annotations.insert(
        MIGRATED_TIMESTAMP_ANNOTATION.to_string(),
        Timestamp::now().to_string(),
    );

    if !already_migrated {
        migrated.insert(gr);
        annotations.insert(
            MIGRATED_RESOURCES_ANNOTATION.to_string(),
            serde_json::to_string(&migrated)?,
        );
    }

    Ok(true)
}
