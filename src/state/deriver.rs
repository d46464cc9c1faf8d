//! Derivation of the current and desired per-resource key sets.
//!
//! The current state comes from the config the deployer vouches for; the
//! desired state comes from the live key-secrets. The migration driver only
//! acts when the two agree.

use crate::controller::error::Result;
use crate::deploy::Deployer;
use crate::encryptionconfig::{self, EncryptionConfiguration};
use crate::secrets::KeySecretStore;

use super::{EncryptionState, GrKeys, GroupResource, KeyRole, KeyState};

/// Transitional reason while replicas disagree on a revision.
pub const REASON_REVISION_NOT_CONVERGED: &str = "APIServerRevisionNotConverged";

/// Everything one sync needs to know about config and key state.
#[derive(Clone, Debug)]
pub struct EncryptionConfigAndState {
    /// The deployed config, when one exists. None either before the first
    /// deployment or while the fleet is mid-rollout.
    pub current_config: Option<EncryptionConfiguration>,
    /// Parsed live key-secrets, newest key first.
    pub key_states: Vec<KeyState>,
    /// Desired per-GR key state derived from the live key-secrets.
    pub desired_state: EncryptionState,
    /// Non-empty iff the cluster is mid-rollout and the deployer cannot
    /// vouch that every replica observes the same config.
    pub transitional_reason: Option<String>,
}

/// Compute the deployed config and the desired state in one shot.
pub async fn get_encryption_config_and_state(
    deployer: &dyn Deployer,
    store: &KeySecretStore,
    encrypted_grs: &[GroupResource],
) -> Result<EncryptionConfigAndState> {
    let (config_secret, converged) = deployer.deployed_encryption_config_secret().await?;
    if !converged {
        return Ok(EncryptionConfigAndState {
            current_config: None,
            key_states: Vec::new(),
            desired_state: EncryptionState::new(),
            transitional_reason: Some(REASON_REVISION_NOT_CONVERGED.to_string()),
        });
    }

    let current_config = config_secret
        .as_ref()
        .map(encryptionconfig::from_secret)
        .transpose()?;

    let key_states = store.list_key_states().await?;
    let desired_state = desired_encryption_state(&key_states, encrypted_grs);

    Ok(EncryptionConfigAndState {
        current_config,
        key_states,
        desired_state,
        transitional_reason: None,
    })
}

/// Desired state for each GR: the newest existing key becomes the write key;
/// all older keys become read keys in descending id order; a key already
/// annotated as migrated for the GR is marked migrated.
pub fn desired_encryption_state(
    key_states: &[KeyState],
    encrypted_grs: &[GroupResource],
) -> EncryptionState {
    let mut newest_first = key_states.to_vec();
    newest_first.sort_by(|a, b| b.key.id.cmp(&a.key.id));

    let mut state = EncryptionState::new();
    for gr in encrypted_grs {
        let states = newest_first
            .iter()
            .enumerate()
            .map(|(position, key_state)| {
                let role = if position == 0 {
                    KeyRole::Write
                } else if key_state.is_migrated_for(gr) {
                    KeyRole::Migrated
                } else {
                    KeyRole::Read
                };
                key_state.clone().with_role(role)
            })
            .collect();
        state.insert(gr.clone(), GrKeys { states });
    }
    state
}
