//! Serde model of the encryption configuration consumed by API servers,
//! and the conversions between it and the per-GR key state.
//!
//! The configuration lists, per resource, the providers in the order the
//! server must try them: the write key first, read keys after it, identity
//! last so pre-encryption objects stay readable. The config-writer renders
//! this structure into a per-revision secret under the `encryption-config`
//! data key; the deployer reports that secret back once every replica
//! observes it.

use k8s_openapi::ByteString;
use k8s_openapi::api::core::v1::Secret;
use serde::{Deserialize, Serialize};
use tracing::warn;

use crate::controller::error::Error;
use crate::state::{EncryptionState, GrKeys, GroupResource, KeyMode, KeyRole, KeyState};

/// Data key holding the serialized configuration inside the config secret.
pub const ENCRYPTION_CONFIG_DATA_KEY: &str = "encryption-config";

const API_VERSION: &str = "apiserver.config.k8s.io/v1";
const KIND: &str = "EncryptionConfiguration";

#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EncryptionConfiguration {
    #[serde(default = "default_api_version")]
    pub api_version: String,
    #[serde(default = "default_kind")]
    pub kind: String,
    #[serde(default)]
    pub resources: Vec<ResourceConfiguration>,
}

fn default_api_version() -> String {
    API_VERSION.to_string()
}

fn default_kind() -> String {
    KIND.to_string()
}

/// Provider list for a set of resource ids.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceConfiguration {
    pub resources: Vec<String>,
    pub providers: Vec<ProviderConfiguration>,
}

/// Exactly one field is set per entry.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProviderConfiguration {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aescbc: Option<KeysConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aesgcm: Option<KeysConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secretbox: Option<KeysConfiguration>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub identity: Option<IdentityConfiguration>,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct KeysConfiguration {
    pub keys: Vec<KeyConfiguration>,
}

/// A key reference inside the configuration. The name is the numeric key id
/// rendered as a string; the secret field carries the base64 key material.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct KeyConfiguration {
    pub name: String,
    pub secret: ByteString,
}

#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize)]
pub struct IdentityConfiguration {}

impl ProviderConfiguration {
    fn identity() -> Self {
        Self {
            identity: Some(IdentityConfiguration {}),
            ..Default::default()
        }
    }

    fn for_key(state: &KeyState) -> Self {
        let keys = KeysConfiguration {
            keys: vec![KeyConfiguration {
                name: state.key.id.to_string(),
                secret: ByteString(state.key.material.clone()),
            }],
        };
        match state.key.mode {
            KeyMode::AesCbc => Self {
                aescbc: Some(keys),
                ..Default::default()
            },
            KeyMode::AesGcm => Self {
                aesgcm: Some(keys),
                ..Default::default()
            },
            KeyMode::SecretBox => Self {
                secretbox: Some(keys),
                ..Default::default()
            },
            KeyMode::Identity => Self::identity(),
        }
    }

    fn key_ids(&self) -> Vec<&str> {
        let keys = [&self.aescbc, &self.aesgcm, &self.secretbox]
            .into_iter()
            .flatten()
            .flat_map(|k| k.keys.iter());
        keys.map(|k| k.name.as_str()).collect()
    }

    fn is_identity(&self) -> bool {
        self.identity.is_some()
    }
}

/// Parse the configuration out of the deployed config secret.
pub fn from_secret(secret: &Secret) -> Result<EncryptionConfiguration, Error> {
    let data = secret
        .data
        .as_ref()
        .and_then(|d| d.get(ENCRYPTION_CONFIG_DATA_KEY))
        .ok_or_else(|| {
            Error::InvalidEncryptionConfig(format!(
                "config secret {} has no {} data key",
                secret.metadata.name.as_deref().unwrap_or("<unnamed>"),
                ENCRYPTION_CONFIG_DATA_KEY
            ))
        })?;
    Ok(serde_json::from_slice(&data.0)?)
}

/// Render the desired configuration from a derived encryption state.
///
/// Resource entries come out in GroupResource order (the state map is a
/// BTreeMap), so two derivations of the same state are byte-identical. Keys
/// with the unused role are not rendered.
pub fn from_encryption_state(state: &EncryptionState) -> EncryptionConfiguration {
    let resources = state
        .iter()
        .map(|(gr, keys)| {
            let mut providers = Vec::new();
            if let Some(write) = keys.write_key() {
                providers.push(ProviderConfiguration::for_key(write));
            }
            for read in keys.read_keys() {
                providers.push(ProviderConfiguration::for_key(read));
            }
            // identity last: objects written before encryption was enabled
            // must stay readable
            if !providers.iter().any(ProviderConfiguration::is_identity) {
                providers.push(ProviderConfiguration::identity());
            }
            ResourceConfiguration {
                resources: vec![gr.config_id()],
                providers,
            }
        })
        .collect();

    EncryptionConfiguration {
        api_version: default_api_version(),
        kind: default_kind(),
        resources,
    }
}

/// Join the deployed configuration against live key-secrets to recover the
/// actual per-GR key state.
///
/// The first provider of each resource entry is the write provider; an
/// identity-first entry means the GR has no write key yet. Config keys that
/// match no live secret are dropped from the join with a warning, they
/// cannot be migrated to or from without their material.
pub fn to_encryption_state(
    config: &EncryptionConfiguration,
    key_states: &[KeyState],
) -> EncryptionState {
    let mut state = EncryptionState::new();

    for resource_config in &config.resources {
        for id in &resource_config.resources {
            let gr = GroupResource::from_config_id(id);
            let mut states: Vec<KeyState> = Vec::new();

            for (position, provider) in resource_config.providers.iter().enumerate() {
                if provider.is_identity() {
                    continue;
                }
                for key_id in provider.key_ids() {
                    let Some(found) = key_states
                        .iter()
                        .find(|s| s.key.id.to_string() == key_id)
                    else {
                        warn!(gr = %gr, key_id, "deployed config references a key with no backing secret");
                        continue;
                    };
                    let role = if position == 0 {
                        KeyRole::Write
                    } else if found.is_migrated_for(&gr) {
                        KeyRole::Migrated
                    } else {
                        KeyRole::Read
                    };
                    states.push(found.clone().with_role(role));
                }
            }

            state.insert(gr, GrKeys { states });
        }
    }

    state
}
