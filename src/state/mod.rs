//! Key and per-resource state model for storage encryption.
//!
//! - `GroupResource`: one kind of stored object.
//! - `Key` / `KeyState`: a symmetric encryption key and its role relative to
//!   one GroupResource.
//! - `GrKeys`: the ordered key set for one GroupResource, used both for the
//!   state derived from the deployed config and for the desired state derived
//!   from live key-secrets.

mod deriver;

pub use deriver::{EncryptionConfigAndState, desired_encryption_state, get_encryption_config_and_state};

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

/// Identifier of one stored object kind: `(group, resource)`.
///
/// An empty group is the core API group and renders as `core` in human
/// output. In encryption-config resource ids the core group is omitted
/// (`secrets`) and other groups are suffixed (`deployments.apps`).
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupResource {
    pub group: String,
    pub resource: String,
}

impl GroupResource {
    pub fn new(group: impl Into<String>, resource: impl Into<String>) -> Self {
        Self {
            group: group.into(),
            resource: resource.into(),
        }
    }

    /// The resource id used inside an encryption configuration, e.g.
    /// `secrets` or `deployments.apps`.
    pub fn config_id(&self) -> String {
        if self.group.is_empty() {
            self.resource.clone()
        } else {
            format!("{}.{}", self.resource, self.group)
        }
    }

    /// Parse a config resource id back into a GroupResource. The resource
    /// segment never contains a dot, so everything after the first dot is
    /// the group.
    pub fn from_config_id(id: &str) -> Self {
        match id.split_once('.') {
            Some((resource, group)) => Self::new(group, resource),
            None => Self::new("", id),
        }
    }
}

/// Renders as `group/resource` with the core group spelled `core`. Used for
/// log output and condition messages, never for API calls.
impl std::fmt::Display for GroupResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let group = if self.group.is_empty() {
            "core"
        } else {
            &self.group
        };
        write!(f, "{}/{}", group, self.resource)
    }
}

/// Cipher mode a key is used with.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum KeyMode {
    AesCbc,
    AesGcm,
    SecretBox,
    Identity,
}

impl std::fmt::Display for KeyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMode::AesCbc => write!(f, "aescbc"),
            KeyMode::AesGcm => write!(f, "aesgcm"),
            KeyMode::SecretBox => write!(f, "secretbox"),
            KeyMode::Identity => write!(f, "identity"),
        }
    }
}

impl std::str::FromStr for KeyMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "aescbc" => Ok(KeyMode::AesCbc),
            "aesgcm" => Ok(KeyMode::AesGcm),
            "secretbox" => Ok(KeyMode::SecretBox),
            "identity" => Ok(KeyMode::Identity),
            _ => Err(format!("unknown key mode: {}", s)),
        }
    }
}

/// One symmetric encryption key.
///
/// The id is the monotonically increasing integer parsed from the carrying
/// secret's name and is unique within a component. The key is addressed
/// everywhere by that secret name.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Key {
    /// Name of the secret that carries this key.
    pub name: String,
    /// Monotonically increasing key id within the component.
    pub id: u64,
    /// Cipher mode.
    pub mode: KeyMode,
    /// Raw key material.
    pub material: Vec<u8>,
}

/// Role of a key relative to one GroupResource.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KeyRole {
    /// The single key new objects are encrypted with.
    Write,
    /// Listed so existing ciphertext can still be decrypted.
    Read,
    /// A read key whose migration for this GR has already completed.
    Migrated,
    /// Exists as a secret but is not referenced for this GR.
    Unused,
}

impl std::fmt::Display for KeyRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyRole::Write => write!(f, "write"),
            KeyRole::Read => write!(f, "read"),
            KeyRole::Migrated => write!(f, "migrated"),
            KeyRole::Unused => write!(f, "unused"),
        }
    }
}

/// A key annotated with its role relative to one GroupResource, plus the
/// migration metadata carried on the key-secret.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct KeyState {
    pub key: Key,
    pub role: KeyRole,
    /// GRs this key has finished migrating, from the migrated-resources
    /// annotation.
    pub migrated: MigratedGroupResources,
    /// Most recent successful migration step, from the migrated-timestamp
    /// annotation.
    pub migrated_at: Option<jiff::Timestamp>,
}

impl KeyState {
    /// Whether migration for `gr` has completed and been stamped on this key.
    pub fn is_migrated_for(&self, gr: &GroupResource) -> bool {
        self.migrated.contains(gr) && self.migrated_at.is_some()
    }

    pub fn with_role(mut self, role: KeyRole) -> Self {
        self.role = role;
        self
    }
}

/// Ordered key states for one GroupResource: the write key first (if any),
/// then read keys in descending key-id order.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct GrKeys {
    pub states: Vec<KeyState>,
}

impl GrKeys {
    pub fn has_write_key(&self) -> bool {
        self.write_key().is_some()
    }

    /// At most one key per GR holds the write role at any instant.
    pub fn write_key(&self) -> Option<&KeyState> {
        self.states.iter().find(|s| s.role == KeyRole::Write)
    }

    /// Read keys, including those already migrated.
    pub fn read_keys(&self) -> impl Iterator<Item = &KeyState> {
        self.states
            .iter()
            .filter(|s| matches!(s.role, KeyRole::Read | KeyRole::Migrated))
    }
}

/// Per-GR key state keyed by GroupResource; BTreeMap for deterministic
/// iteration.
pub type EncryptionState = BTreeMap<GroupResource, GrKeys>;

/// JSON payload of the migrated-resources annotation:
/// `{"resources":[{"group":g,"resource":r}, ...]}`.
///
/// The resource list is append-only for the lifetime of a key; a GR once
/// present is never removed. Encoding is plain serde_json in struct order,
/// so an unchanged set always re-encodes to the same bytes.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigratedGroupResources {
    #[serde(default)]
    pub resources: Vec<GroupResource>,
}

impl MigratedGroupResources {
    pub fn contains(&self, gr: &GroupResource) -> bool {
        self.resources.iter().any(|existing| existing == gr)
    }

    /// Append `gr` if absent. Returns true when the set changed.
    pub fn insert(&mut self, gr: &GroupResource) -> bool {
        if self.contains(gr) {
            return false;
        }
        self.resources.push(gr.clone());
        true
    }
}

/// Render GRs for log and condition messages, e.g.
/// `[core/secrets, apps/deployments]`.
pub fn grs_to_human_readable(grs: &[GroupResource]) -> String {
    let rendered: Vec<String> = grs.iter().map(|gr| gr.to_string()).collect();
    format!("[{}]", rendered.join(", "))
}
