//! Node repair: detects nodes that have been unhealthy for longer than the configured
//! threshold and dispatches a cloud-level repair action, guarded by a per-node expiring
//! lock so a slow-to-recover node is not repaired on every tick.

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cloud::{self, CloudComputeClient, RepairAction};
use crate::config::{Config, RepairConfig, VmRepairAction, VmssRepairAction};
use crate::controller::scheduler::trigger_self_eviction;
use crate::error::Result;
use crate::identity::NodeIdentityKind;
use crate::inventory::{self, NodeInventory};
use crate::lock::{self, ExpiringLockTable};
use crate::notify::{self, Notification};
use crate::patch::{self, AnnotationOp};

#[cfg(feature = "metrics")]
use crate::controller::metrics;

/// Map the configured per-kind action into the cloud dispatcher's action enum.
pub fn repair_action_for(kind: &NodeIdentityKind, cfg: &RepairConfig) -> RepairAction {
    match kind {
        NodeIdentityKind::Vmss { .. } => match cfg.vmss_action {
            VmssRepairAction::Restart => RepairAction::Restart,
            VmssRepairAction::Redeploy => RepairAction::Redeploy,
            VmssRepairAction::Reimage => RepairAction::Reimage,
            VmssRepairAction::Delete => RepairAction::Delete,
        },
        NodeIdentityKind::Vm { .. } => match cfg.vm_action {
            VmRepairAction::Restart => RepairAction::Restart,
            VmRepairAction::Redeploy => RepairAction::Redeploy,
        },
    }
}

/// Whether `node` qualifies for repair right now: cloud-managed, unhealthy for at least
/// the configured threshold, and not cordoned by something other than us. Pure so the
/// selection rule is testable without a live cluster or clock.
pub fn is_repair_candidate(node: &crate::inventory::NodeView, cfg: &RepairConfig, now: DateTime<Utc>) -> bool {
    if !node.is_cloud_managed() {
        return false;
    }
    if node.ready {
        return false;
    }
    if node.unschedulable {
        return false;
    }
    let age = match node.last_heartbeat {
        Some(heartbeat) => now.signed_duration_since(heartbeat),
        None => return false,
    };
    let threshold = chrono::Duration::from_std(cfg.not_ready_threshold).unwrap_or_default();
    age >= threshold
}

/// Run one repair cycle: refresh cloud enrichment, reclaim expired autoscaler-disable
/// annotations, resync the lock cache from annotations, select candidates among the
/// currently unlocked ones up to the configured concurrency, dispatch repair, and record
/// the outcome back onto the node's lock annotation.
#[allow(clippy::too_many_arguments)]
pub async fn run_cycle(
    api: &Api<Node>,
    inventory: &NodeInventory,
    cloud: &dyn CloudComputeClient,
    table: &ExpiringLockTable,
    cfg: &Config,
    dry_run: bool,
    http: &reqwest::Client,
    client: &Client,
    shutdown_tx: &watch::Sender<bool>,
) -> Result<()> {
    let now = Utc::now();

    inventory.refresh_enrichment(cloud).await;
    let nodes_with_cloud = inventory.node_list_with_cloud();
    let nodes: Vec<_> = nodes_with_cloud.iter().map(|(n, _)| n.clone()).collect();

    inventory::cleanup_expired_companion_annotations(inventory, api, &cfg.autoscaler.disable_annotation, now).await?;
    lock::sync_node_lock_cache(table, api, &nodes, &cfg.repair.lock_annotation, now).await?;

    for node in &nodes {
        if node.is_cloud_managed() && !node.ready && node.unschedulable {
            info!(node = %node.name, "ignoring because node is cordoned");
        }
    }

    let candidates: Vec<_> = nodes_with_cloud
        .into_iter()
        .filter(|(n, _)| is_repair_candidate(n, &cfg.repair, now))
        .filter(|(n, _)| table.get_with_expiration(&n.name).is_none())
        .collect();

    #[cfg(feature = "metrics")]
    metrics::CANDIDATE_NODES
        .get_or_create(&metrics::TypeLabels { type_: "repair".to_string() })
        .set(candidates.len() as i64);

    if candidates.is_empty() {
        return Ok(());
    }

    let mut failed = 0i64;
    for (node, snapshot) in candidates.into_iter().take(cfg.repair.concurrency) {
        let identity = match node.identity() {
            Ok(identity) => identity,
            Err(e) => {
                warn!(node = %node.name, error = %e, "skipping repair, identity parse failed");
                continue;
            }
        };

        if dry_run {
            info!(node = %node.name, "dry run: would repair node");
            continue;
        }

        if cfg.instance.nodename.as_deref() == Some(node.name.as_str()) {
            warn!(node = %node.name, "repair candidate is our own node, evicting self instead of dispatching");
            trigger_self_eviction(client, &cfg.instance, shutdown_tx).await;
            return Ok(());
        }

        let provisioning_state = snapshot.as_ref().and_then(|s| s.provisioning_state.as_deref());
        if !cloud::provisioning_state_allowed(provisioning_state, &cfg.repair.provisioning_state, cfg.repair.provisioning_state_all())
        {
            info!(node = %node.name, state = provisioning_state.unwrap_or("unknown"), "provisioning state not in whitelist, skipping");
            continue;
        }

        let action = repair_action_for(&identity.kind, &cfg.repair);
        info!(node = %node.name, action = action.name(), "dispatching repair action");

        let outcome = cloud.repair(&identity, action).await;
        #[cfg(feature = "metrics")]
        metrics::REPAIR_COUNT.inc();

        let (lock_duration, status_value, message) = match &outcome {
            Ok(()) => (cfg.repair.lock_duration, 1, "repair succeeded".to_string()),
            Err(e) => {
                warn!(node = %node.name, error = %e, "repair action failed");
                failed += 1;
                #[cfg(feature = "metrics")]
                metrics::ERRORS.get_or_create(&metrics::ScopeLabels { scope: "azure".to_string() }).inc();
                (cfg.repair.lock_duration_error, 0, e.to_string())
            }
        };

        notify::send(
            http,
            &cfg.notification,
            &Notification { kind: "repair", node: &node.name, action: action.name(), success: outcome.is_ok(), message: &message },
        )
        .await;

        #[cfg(feature = "metrics")]
        metrics::REPAIR_NODE_STATUS
            .get_or_create(&metrics::NodeLabels { node_name: node.name.clone() })
            .set(status_value);

        table.add(&node.name, lock_duration);
        let expiry = lock::format_expiry(now, lock_duration);
        let disable_expiry = lock::format_expiry(now, cfg.autoscaler.scaledown_lock_time);
        let ops = vec![
            AnnotationOp::Set(cfg.repair.lock_annotation.clone(), expiry),
            AnnotationOp::Set(cfg.autoscaler.disable_annotation.clone(), disable_expiry),
        ];
        if let Err(e) = patch::apply(api, &node.name, &ops).await {
            warn!(node = %node.name, error = %e, "failed to write repair lock annotation");
        }
    }

    #[cfg(feature = "metrics")]
    metrics::FAILED_NODES.get_or_create(&metrics::TypeLabels { type_: "repair".to_string() }).set(failed);

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg() -> RepairConfig {
        RepairConfig {
            crontab: String::new(),
            not_ready_threshold: std::time::Duration::from_secs(600),
            concurrency: 1,
            lock_duration: std::time::Duration::from_secs(1800),
            lock_duration_error: std::time::Duration::from_secs(300),
            vmss_action: VmssRepairAction::Redeploy,
            vm_action: VmRepairAction::Redeploy,
            provisioning_state: vec!["succeeded".to_string(), "failed".to_string()],
            lock_annotation: "autopilot.example.io/repair-lock".to_string(),
        }
    }

    fn node(ready: bool, unschedulable: bool, heartbeat: Option<DateTime<Utc>>) -> crate::inventory::NodeView {
        crate::inventory::NodeView {
            name: "node-1".to_string(),
            provider_id: "azure:///subscriptions/s/resourceGroups/r/providers/Microsoft.Compute/virtualMachines/node-1"
                .to_string(),
            unschedulable,
            annotations: HashMap::new(),
            ready,
            last_heartbeat: heartbeat,
        }
    }

    #[test]
    fn healthy_node_is_not_a_candidate() {
        let now = Utc::now();
        assert!(!is_repair_candidate(&node(true, false, Some(now)), &cfg(), now));
    }

    #[test]
    fn recently_unhealthy_node_is_not_yet_a_candidate() {
        let now = Utc::now();
        let heartbeat = now - chrono::Duration::minutes(2);
        assert!(!is_repair_candidate(&node(false, false, Some(heartbeat)), &cfg(), now));
    }

    #[test]
    fn unhealthy_past_threshold_is_a_candidate() {
        let now = Utc::now();
        let heartbeat = now - chrono::Duration::minutes(15);
        assert!(is_repair_candidate(&node(false, false, Some(heartbeat)), &cfg(), now));
    }

    #[test]
    fn node_without_heartbeat_is_not_a_candidate() {
        let now = Utc::now();
        assert!(!is_repair_candidate(&node(false, false, None), &cfg(), now));
    }

    #[test]
    fn non_cloud_managed_node_is_never_a_candidate() {
        let now = Utc::now();
        let mut n = node(false, false, Some(now - chrono::Duration::minutes(15)));
        n.provider_id = "aws:///instance/i-1".to_string();
        assert!(!is_repair_candidate(&n, &cfg(), now));
    }

    #[test]
    fn cordoned_node_is_not_a_candidate_even_if_unhealthy_past_threshold() {
        let now = Utc::now();
        let heartbeat = now - chrono::Duration::minutes(15);
        assert!(!is_repair_candidate(&node(false, true, Some(heartbeat)), &cfg(), now));
    }

    #[test]
    fn repair_action_follows_vmss_config() {
        let kind = NodeIdentityKind::Vmss { scale_set_name: "set".to_string(), instance_id: "0".to_string() };
        let mut c = cfg();
        c.vmss_action = VmssRepairAction::Reimage;
        assert_eq!(repair_action_for(&kind, &c), RepairAction::Reimage);
    }

    #[test]
    fn repair_action_follows_vm_config() {
        let kind = NodeIdentityKind::Vm { vm_name: "node-1".to_string() };
        let mut c = cfg();
        c.vm_action = VmRepairAction::Restart;
        assert_eq!(repair_action_for(&kind, &c), RepairAction::Restart);
    }
}
