//! The provider seam: which resources the component wants encrypted and
//! whether the encryption controllers should run at all.
//!
//! Both signals are evaluated inside every sync so that toggling them
//! propagates without a restart.

use std::sync::Arc;

use crate::controller::error::Result;
use crate::state::GroupResource;

pub trait Provider: Send + Sync {
    /// The set of GroupResources this component wants encrypted.
    fn encrypted_grs(&self) -> Vec<GroupResource>;

    /// Global enable switch for the encryption controllers.
    fn should_run_encryption_controllers(&self) -> Result<bool>;
}

/// Operator-level precondition check, injected rather than read from
/// process-wide state.
pub type PreconditionsFulfilled = Arc<dyn Fn() -> Result<bool> + Send + Sync>;

/// Provider with a fixed resource set and an always-on switch, used by the
/// operator binary.
pub struct StaticProvider {
    grs: Vec<GroupResource>,
}

impl StaticProvider {
    pub fn new(grs: Vec<GroupResource>) -> Self {
        Self { grs }
    }
}

impl Provider for StaticProvider {
    fn encrypted_grs(&self) -> Vec<GroupResource> {
        self.grs.clone()
    }

    fn should_run_encryption_controllers(&self) -> Result<bool> {
        Ok(true)
    }
}
