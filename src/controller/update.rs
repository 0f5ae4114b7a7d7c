//! Model-version update: drains and updates VMSS instances that have not yet picked up
//! their scale set's latest model, pinning an in-progress node via a sticky annotation so
//! a restart mid-drain resumes the same node instead of abandoning it.

use chrono::Utc;
use k8s_openapi::api::core::v1::Node;
use kube::{Api, Client};
use tokio::sync::watch;
use tracing::{info, warn};

use crate::cloud::{CloudComputeClient, UpdateAction};
use crate::config::{Config, UpdateConfig, VmssUpdateAction};
use crate::controller::scheduler::trigger_self_eviction;
use crate::drain;
use crate::error::Result;
use crate::inventory::{self, NodeInventory, NodeView, ScaleSetVmSnapshot};
use crate::lock::{self, ExpiringLockTable};
use crate::notify::{self, Notification};
use crate::patch::{self, AnnotationOp};

#[cfg(feature = "metrics")]
use crate::controller::metrics;

/// Whether `node` qualifies as an update candidate: cloud-managed, not excluded, and
/// either already marked ongoing (sticky pin from a prior, possibly-interrupted cycle) or
/// reporting a stale model per its cloud enrichment snapshot.
pub fn is_update_candidate(
    node: &crate::inventory::NodeView,
    cfg: &UpdateConfig,
    snapshot: Option<&ScaleSetVmSnapshot>,
) -> bool {
    if !node.is_cloud_managed() {
        return false;
    }
    if node.annotation(&cfg.exclude_annotation).is_some() {
        return false;
    }
    if node.annotation(&cfg.ongoing_annotation).is_some() {
        return true;
    }
    matches!(snapshot.and_then(|s| s.latest_model_applied), Some(false))
}

/// Select this tick's update candidates. If any node carries the ongoing annotation and
/// is not excluded, it is the sole candidate this tick -- an in-progress update must finish
/// (or fail) before any other node is touched. Otherwise, every non-excluded node reporting
/// a stale model is a candidate.
pub fn select_update_candidates<'a>(
    nodes_with_cloud: &'a [(NodeView, Option<ScaleSetVmSnapshot>)],
    cfg: &UpdateConfig,
) -> Vec<&'a (NodeView, Option<ScaleSetVmSnapshot>)> {
    let pinned = nodes_with_cloud.iter().find(|(n, _)| {
        n.is_cloud_managed() && n.annotation(&cfg.ongoing_annotation).is_some() && n.annotation(&cfg.exclude_annotation).is_none()
    });

    if let Some(pinned) = pinned {
        return vec![pinned];
    }

    nodes_with_cloud.iter().filter(|(n, snapshot)| is_update_candidate(n, cfg, snapshot.as_ref())).collect()
}

/// Count nodes whose cloud enrichment reports a `Failed` provisioning state. Used as the
/// pre-mutation safety gate: if this count meets the configured threshold, the entire cycle
/// aborts before any candidate is processed.
pub fn count_failed_provisioning(nodes_with_cloud: &[(NodeView, Option<ScaleSetVmSnapshot>)]) -> usize {
    nodes_with_cloud
        .iter()
        .filter(|(_, snapshot)| {
            snapshot.as_ref().and_then(|s| s.provisioning_state.as_deref()).map(|s| s.eq_ignore_ascii_case("failed")).unwrap_or(false)
        })
        .count()
}

fn update_action_for(cfg: &UpdateConfig) -> UpdateAction {
    match cfg.vmss_action {
        VmssUpdateAction::Update => UpdateAction::Update,
        VmssUpdateAction::UpdateReimage => UpdateAction::UpdateReimage,
        VmssUpdateAction::Delete => UpdateAction::Delete,
    }
}

/// Uncordon any node whose update lock has already expired (no live entry in `table`) but
/// is still marked unschedulable -- a restart between the lock expiring and the next sync
/// would otherwise leave it cordoned forever.
async fn auto_uncordon(nodes: &[NodeView], table: &ExpiringLockTable, cfg: &Config) {
    for node in nodes {
        if node.unschedulable && table.get_with_expiration(&node.name).is_none() {
            if let Err(e) = drain::uncordon_node(&node.name, &cfg.drain).await {
                warn!(node = %node.name, error = %e, "failed to auto-uncordon node with expired update lock");
            }
        }
    }
}

/// Run one update cycle: refresh cloud enrichment, auto-uncordon nodes with an expired
/// lock, resync locks, reclaim expired autoscaler-disable annotations, abort outright if
/// too many nodes report a failed provisioning state, otherwise select this tick's
/// candidates (honoring the sticky ongoing pin), mark each as ongoing before touching the
/// cluster, drain, dispatch the cloud update, and uncordon. Any dispatch failure acquires
/// the error-TTL lock and stops the rest of this cycle's candidates.
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
    if cfg.update.concurrency > 0 && table.item_count() >= cfg.update.concurrency {
        info!("update lock table already at concurrency limit, skipping this cycle");
        return Ok(());
    }

    let now = Utc::now();

    inventory.refresh_enrichment(cloud).await;
    let nodes_with_cloud = inventory.node_list_with_cloud();
    let nodes: Vec<_> = nodes_with_cloud.iter().map(|(n, _)| n.clone()).collect();

    auto_uncordon(&nodes, table, cfg).await;

    inventory::cleanup_expired_companion_annotations(inventory, api, &cfg.autoscaler.disable_annotation, now).await?;
    lock::sync_node_lock_cache(table, api, &nodes, &cfg.update.lock_annotation, now).await?;

    let failed_provisioning = count_failed_provisioning(&nodes_with_cloud);
    #[cfg(feature = "metrics")]
    metrics::FAILED_NODES.get_or_create(&metrics::TypeLabels { type_: "provisionState".to_string() }).set(failed_provisioning as i64);

    if cfg.update.failed_threshold > 0 && failed_provisioning >= cfg.update.failed_threshold {
        warn!(
            failed = failed_provisioning,
            threshold = cfg.update.failed_threshold,
            "too many nodes report a failed provisioning state, aborting this cycle"
        );
        return Ok(());
    }

    let candidates: Vec<_> = select_update_candidates(&nodes_with_cloud, &cfg.update)
        .into_iter()
        .filter(|(n, _)| table.get_with_expiration(&n.name).is_none())
        .cloned()
        .collect();

    #[cfg(feature = "metrics")]
    metrics::CANDIDATE_NODES
        .get_or_create(&metrics::TypeLabels { type_: "update".to_string() })
        .set(candidates.len() as i64);

    if candidates.is_empty() {
        return Ok(());
    }

    let mut failed_total = 0i64;

    for (node, _snapshot) in candidates.into_iter().take(cfg.update.concurrency) {
        let identity = match node.identity() {
            Ok(identity) => identity,
            Err(e) => {
                warn!(node = %node.name, error = %e, "skipping update, identity parse failed");
                continue;
            }
        };

        if dry_run {
            info!(node = %node.name, "dry run: would update node");
            continue;
        }

        if cfg.instance.nodename.as_deref() == Some(node.name.as_str()) {
            warn!(node = %node.name, "update candidate is our own node, evicting self instead of dispatching");
            trigger_self_eviction(client, &cfg.instance, shutdown_tx).await;
            return Ok(());
        }

        let disable_expiry = lock::format_expiry(now, cfg.autoscaler.scaledown_lock_time);
        if node.annotation(&cfg.update.ongoing_annotation).is_none() {
            let ops = vec![
                AnnotationOp::Set(cfg.update.ongoing_annotation.clone(), Utc::now().to_rfc3339()),
                AnnotationOp::Set(cfg.autoscaler.disable_annotation.clone(), disable_expiry),
            ];
            if let Err(e) = patch::apply(api, &node.name, &ops).await {
                warn!(node = %node.name, error = %e, "failed to mark node as update-ongoing");
                continue;
            }
        }

        let outcome = run_one(&node.name, &identity, cloud, cfg).await;

        #[cfg(feature = "metrics")]
        metrics::UPDATE_COUNT.inc();

        let (lock_duration, message) = match &outcome {
            Ok(()) => {
                info!(node = %node.name, "update completed");
                (cfg.update.lock_duration, "update succeeded".to_string())
            }
            Err(e) => {
                failed_total += 1;
                warn!(node = %node.name, error = %e, "update action failed");
                #[cfg(feature = "metrics")]
                metrics::ERRORS.get_or_create(&metrics::ScopeLabels { scope: "azure".to_string() }).inc();
                (cfg.update.lock_duration_error, e.to_string())
            }
        };

        notify::send(
            http,
            &cfg.notification,
            &Notification {
                kind: "update",
                node: &node.name,
                action: update_action_for(&cfg.update).name(),
                success: outcome.is_ok(),
                message: &message,
            },
        )
        .await;

        table.add(&node.name, lock_duration);
        let expiry = lock::format_expiry(now, lock_duration);
        let ops = vec![
            AnnotationOp::Set(cfg.update.lock_annotation.clone(), expiry),
            AnnotationOp::Remove(cfg.update.ongoing_annotation.clone()),
            AnnotationOp::Set(cfg.autoscaler.disable_annotation.clone(), disable_expiry),
        ];
        if let Err(e) = patch::apply(api, &node.name, &ops).await {
            warn!(node = %node.name, error = %e, "failed to finalize update lock annotations");
        }

        if outcome.is_err() {
            warn!(node = %node.name, "update failed, stopping the rest of this cycle's candidates");
            break;
        }
    }

    #[cfg(feature = "metrics")]
    metrics::FAILED_NODES.get_or_create(&metrics::TypeLabels { type_: "update".to_string() }).set(failed_total);

    Ok(())
}

/// Drain, update, optionally reimage, and uncordon a single node. A failure at any step
/// short-circuits without attempting the later ones; the node is always left with a lock
/// annotation by the caller regardless of outcome.
async fn run_one(
    node_name: &str,
    identity: &crate::identity::NodeIdentity,
    cloud: &dyn CloudComputeClient,
    cfg: &Config,
) -> Result<()> {
    drain::drain_node(node_name, &cfg.drain).await?;

    let action = update_action_for(&cfg.update);
    cloud.update(identity, action).await?;

    let uncordon_result = drain::uncordon_node(node_name, &cfg.drain).await;
    if let Err(e) = &uncordon_result {
        warn!(node = node_name, error = %e, "failed to uncordon node after update");
    }
    uncordon_result
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn cfg() -> UpdateConfig {
        UpdateConfig {
            crontab: String::new(),
            concurrency: 1,
            lock_duration: std::time::Duration::from_secs(900),
            lock_duration_error: std::time::Duration::from_secs(300),
            lock_annotation: "autopilot.example.io/update-lock".to_string(),
            ongoing_annotation: "autopilot.example.io/update-ongoing".to_string(),
            exclude_annotation: "autopilot.example.io/exclude".to_string(),
            vmss_action: VmssUpdateAction::UpdateReimage,
            provisioning_state: vec!["succeeded".to_string()],
            failed_threshold: 2,
        }
    }

    fn node(name: &str, annotations: HashMap<String, String>) -> crate::inventory::NodeView {
        crate::inventory::NodeView {
            name: name.to_string(),
            provider_id: format!(
                "azure:///subscriptions/s/resourceGroups/r/providers/Microsoft.Compute/virtualMachineScaleSets/set/virtualMachines/{name}"
            ),
            unschedulable: false,
            annotations,
            ready: true,
            last_heartbeat: Some(Utc::now()),
        }
    }

    #[test]
    fn stale_model_makes_a_fresh_candidate() {
        let snapshot = ScaleSetVmSnapshot { provisioning_state: Some("succeeded".to_string()), latest_model_applied: Some(false) };
        assert!(is_update_candidate(&node("node-1", HashMap::new()), &cfg(), Some(&snapshot)));
    }

    #[test]
    fn up_to_date_node_is_not_a_candidate() {
        let snapshot = ScaleSetVmSnapshot { provisioning_state: Some("succeeded".to_string()), latest_model_applied: Some(true) };
        assert!(!is_update_candidate(&node("node-1", HashMap::new()), &cfg(), Some(&snapshot)));
    }

    #[test]
    fn excluded_node_is_never_a_candidate_even_if_stale() {
        let mut annotations = HashMap::new();
        annotations.insert("autopilot.example.io/exclude".to_string(), "true".to_string());
        let snapshot = ScaleSetVmSnapshot { provisioning_state: None, latest_model_applied: Some(false) };
        assert!(!is_update_candidate(&node("node-1", annotations), &cfg(), Some(&snapshot)));
    }

    #[test]
    fn ongoing_annotation_pins_candidate_regardless_of_snapshot() {
        let mut annotations = HashMap::new();
        annotations.insert("autopilot.example.io/update-ongoing".to_string(), "2026-01-01T00:00:00Z".to_string());
        let snapshot = ScaleSetVmSnapshot { provisioning_state: Some("succeeded".to_string()), latest_model_applied: Some(true) };
        assert!(is_update_candidate(&node("node-1", annotations), &cfg(), Some(&snapshot)));
    }

    #[test]
    fn missing_snapshot_is_not_a_candidate_without_ongoing_pin() {
        assert!(!is_update_candidate(&node("node-1", HashMap::new()), &cfg(), None));
    }

    #[test]
    fn ongoing_node_is_the_sole_candidate_even_with_other_stale_nodes() {
        let mut ongoing_annotations = HashMap::new();
        ongoing_annotations.insert("autopilot.example.io/update-ongoing".to_string(), "2026-01-01T00:00:00Z".to_string());
        let stale_snapshot = ScaleSetVmSnapshot { provisioning_state: Some("succeeded".to_string()), latest_model_applied: Some(false) };

        let nodes = vec![
            (node("ongoing-node", ongoing_annotations), None),
            (node("stale-node", HashMap::new()), Some(stale_snapshot)),
        ];

        let candidates = select_update_candidates(&nodes, &cfg());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.name, "ongoing-node");
    }

    #[test]
    fn no_ongoing_pin_returns_all_stale_candidates() {
        let stale_snapshot = ScaleSetVmSnapshot { provisioning_state: Some("succeeded".to_string()), latest_model_applied: Some(false) };
        let up_to_date_snapshot = ScaleSetVmSnapshot { provisioning_state: Some("succeeded".to_string()), latest_model_applied: Some(true) };

        let nodes = vec![
            (node("stale-node", HashMap::new()), Some(stale_snapshot)),
            (node("fresh-node", HashMap::new()), Some(up_to_date_snapshot)),
        ];

        let candidates = select_update_candidates(&nodes, &cfg());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.name, "stale-node");
    }

    #[test]
    fn excluded_ongoing_node_does_not_pin() {
        let mut annotations = HashMap::new();
        annotations.insert("autopilot.example.io/update-ongoing".to_string(), "2026-01-01T00:00:00Z".to_string());
        annotations.insert("autopilot.example.io/exclude".to_string(), "true".to_string());
        let stale_snapshot = ScaleSetVmSnapshot { provisioning_state: Some("succeeded".to_string()), latest_model_applied: Some(false) };

        let nodes = vec![(node("excluded-ongoing", annotations), None), (node("stale-node", HashMap::new()), Some(stale_snapshot))];

        let candidates = select_update_candidates(&nodes, &cfg());
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].0.name, "stale-node");
    }

    #[test]
    fn counts_nodes_with_failed_provisioning_state_case_insensitively() {
        let nodes = vec![
            (node("a", HashMap::new()), Some(ScaleSetVmSnapshot { provisioning_state: Some("Failed".to_string()), latest_model_applied: None })),
            (node("b", HashMap::new()), Some(ScaleSetVmSnapshot { provisioning_state: Some("succeeded".to_string()), latest_model_applied: None })),
            (node("c", HashMap::new()), Some(ScaleSetVmSnapshot { provisioning_state: Some("failed".to_string()), latest_model_applied: None })),
            (node("d", HashMap::new()), None),
        ];
        assert_eq!(count_failed_provisioning(&nodes), 2);
    }
}
