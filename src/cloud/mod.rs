//! Cloud action dispatcher: maps a logical repair/update action to a concrete Azure
//! Resource Manager long-running operation and blocks until it reaches a terminal state.
//!
//! The dispatcher never touches Kubernetes; it receives a [`NodeIdentity`], not a `Node`.

pub mod azure;

use async_trait::async_trait;

use crate::error::Result;
use crate::identity::NodeIdentity;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RepairAction {
    Restart,
    Redeploy,
    Reimage,
    Delete,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateAction {
    Update,
    UpdateReimage,
    Delete,
}

impl RepairAction {
    pub fn name(&self) -> &'static str {
        match self {
            RepairAction::Restart => "restart",
            RepairAction::Redeploy => "redeploy",
            RepairAction::Reimage => "reimage",
            RepairAction::Delete => "delete",
        }
    }
}

impl UpdateAction {
    pub fn name(&self) -> &'static str {
        match self {
            UpdateAction::Update => "update",
            UpdateAction::UpdateReimage => "update+reimage",
            UpdateAction::Delete => "delete",
        }
    }
}

/// The seam between the reconcilers and the concrete cloud provider. Production code is
/// backed by [`azure::AzureComputeClient`]; tests substitute a scripted in-memory impl.
#[async_trait]
pub trait CloudComputeClient: Send + Sync {
    /// Provisioning state of the VM or VMSS instance targeted by `identity`, or `None` if
    /// the cloud has not yet reported one.
    async fn provisioning_state(&self, identity: &NodeIdentity) -> Result<Option<String>>;

    /// Dispatch a repair action and await its completion.
    async fn repair(&self, identity: &NodeIdentity, action: RepairAction) -> Result<()>;

    /// Dispatch an update action (VMSS `UpdateInstances`, optionally followed by reimage)
    /// and await its completion.
    async fn update(&self, identity: &NodeIdentity, action: UpdateAction) -> Result<()>;

    /// The tri-state "does this VMSS instance already carry the scale set's latest model"
    /// signal used to build update candidates.
    async fn latest_model_applied(&self, identity: &NodeIdentity) -> Result<Option<bool>>;
}

/// Check the target's provisioning state against the configured whitelist before allowing
/// a repair/update action. A `None` provisioning state (cloud hasn't reported one yet) is
/// treated as allowed.
pub fn provisioning_state_allowed(state: Option<&str>, whitelist: &[String], allow_all: bool) -> bool {
    if allow_all {
        return true;
    }
    match state {
        None => true,
        Some(state) => whitelist.iter().any(|allowed| allowed.eq_ignore_ascii_case(state)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_provisioning_state_is_allowed() {
        assert!(provisioning_state_allowed(None, &["succeeded".to_string()], false));
    }

    #[test]
    fn wildcard_accepts_any_state() {
        assert!(provisioning_state_allowed(Some("updating"), &[], true));
    }

    #[test]
    fn whitelist_match_is_case_insensitive() {
        assert!(provisioning_state_allowed(Some("Succeeded"), &["succeeded".to_string()], false));
    }

    #[test]
    fn state_outside_whitelist_is_rejected() {
        assert!(!provisioning_state_allowed(
            Some("updating"),
            &["succeeded".to_string(), "failed".to_string()],
            false
        ));
    }
}
