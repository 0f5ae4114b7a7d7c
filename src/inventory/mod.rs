//! Long-lived watch over the cluster's node collection, indexed for point-in-time reads
//! by the reconcilers and enriched with cloud-side VMSS instance state.

use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use futures::StreamExt;
use k8s_openapi::api::core::v1::Node as K8sNode;
use kube::runtime::watcher::{self, Event};
use kube::{Api, Client};
use tracing::{error, info, warn};

use crate::cloud::CloudComputeClient;
use crate::identity::{self, NodeIdentity};

const ENRICHMENT_TTL: Duration = Duration::from_secs(600);

/// The subset of a Kubernetes `Node` the reconcilers need, decoupled from the raw
/// `k8s_openapi` type so decision logic stays pure and testable.
#[derive(Debug, Clone)]
pub struct NodeView {
    pub name: String,
    pub provider_id: String,
    pub unschedulable: bool,
    pub annotations: HashMap<String, String>,
    pub ready: bool,
    pub last_heartbeat: Option<DateTime<Utc>>,
}

impl NodeView {
    pub fn is_cloud_managed(&self) -> bool {
        identity::is_cloud_managed(&self.provider_id)
    }

    pub fn identity(&self) -> crate::error::Result<NodeIdentity> {
        identity::parse(&self.provider_id)
    }

    pub fn annotation(&self, key: &str) -> Option<&str> {
        self.annotations.get(key).map(|s| s.as_str())
    }
}

/// Build a [`NodeView`] from a raw `k8s_openapi::Node`.
///
/// Health is computed by *finding* the condition whose `type == Ready`, not by folding
/// over every condition and letting the last one win -- a node with conditions in
/// `[Ready=True, DiskPressure=False]` order must still read as healthy.
pub fn node_view(node: &K8sNode) -> NodeView {
    let name = node.metadata.name.clone().unwrap_or_default();
    let provider_id = node.spec.as_ref().and_then(|s| s.provider_id.clone()).unwrap_or_default();
    let unschedulable = node.spec.as_ref().and_then(|s| s.unschedulable).unwrap_or(false);
    let annotations = node.metadata.annotations.clone().unwrap_or_default().into_iter().collect();

    let ready_condition = node
        .status
        .as_ref()
        .and_then(|s| s.conditions.as_ref())
        .and_then(|conditions| conditions.iter().find(|c| c.type_ == "Ready"));

    let ready = ready_condition.map(|c| c.status == "True").unwrap_or(true);
    let last_heartbeat = ready_condition.and_then(|c| c.last_heartbeat_time.as_ref()).map(|t| t.0);

    NodeView { name, provider_id, unschedulable, annotations, ready, last_heartbeat }
}

#[derive(Debug, Clone, Default)]
pub struct ScaleSetVmSnapshot {
    pub provisioning_state: Option<String>,
    pub latest_model_applied: Option<bool>,
}

struct EnrichmentEntry {
    snapshot: ScaleSetVmSnapshot,
    fetched_at: Instant,
}

pub struct NodeInventory {
    index: RwLock<HashMap<String, NodeView>>,
    enrichment: RwLock<HashMap<String, EnrichmentEntry>>,
    ready: std::sync::atomic::AtomicBool,
}

impl Default for NodeInventory {
    fn default() -> Self {
        Self::new()
    }
}

impl NodeInventory {
    pub fn new() -> Self {
        Self {
            index: RwLock::new(HashMap::new()),
            enrichment: RwLock::new(HashMap::new()),
            ready: std::sync::atomic::AtomicBool::new(false),
        }
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(std::sync::atomic::Ordering::Relaxed)
    }

    /// Point-in-time snapshot of all cloud-managed nodes in the index.
    pub fn node_list(&self) -> Vec<NodeView> {
        self.index.read().unwrap().values().cloned().collect()
    }

    /// Same as [`NodeInventory::node_list`], but returns each node paired with its cached
    /// cloud enrichment, if any has been populated (by a separate call to `refresh_enrichment`).
    pub fn node_list_with_cloud(&self) -> Vec<(NodeView, Option<ScaleSetVmSnapshot>)> {
        let index = self.index.read().unwrap();
        let enrichment = self.enrichment.read().unwrap();
        index
            .values()
            .map(|node| {
                let snapshot = enrichment.get(&node.provider_id.to_ascii_lowercase()).map(|e| e.snapshot.clone());
                (node.clone(), snapshot)
            })
            .collect()
    }

    fn upsert(&self, node: &K8sNode) {
        let view = node_view(node);
        if !view.is_cloud_managed() {
            return;
        }
        self.index.write().unwrap().insert(view.name.clone(), view);
    }

    fn remove(&self, node: &K8sNode) {
        if let Some(name) = node.metadata.name.as_ref() {
            self.index.write().unwrap().remove(name);
        }
    }

    /// Refresh the cloud enrichment cache for every distinct (subscription, resource
    /// group, scale set) referenced by the current index, skipping entries still inside
    /// their TTL.
    pub async fn refresh_enrichment(&self, cloud: &dyn CloudComputeClient) {
        let nodes = self.node_list();
        let now = Instant::now();

        let stale: Vec<NodeView> = {
            let enrichment = self.enrichment.read().unwrap();
            nodes
                .into_iter()
                .filter(|n| n.is_cloud_managed())
                .filter(|n| {
                    let key = n.provider_id.to_ascii_lowercase();
                    match enrichment.get(&key) {
                        Some(entry) => now.duration_since(entry.fetched_at) >= ENRICHMENT_TTL,
                        None => true,
                    }
                })
                .collect()
        };

        for node in stale {
            let identity = match node.identity() {
                Ok(identity) => identity,
                Err(e) => {
                    warn!(node = %node.name, error = %e, "skipping cloud enrichment, identity parse failed");
                    continue;
                }
            };

            let provisioning_state = match cloud.provisioning_state(&identity).await {
                Ok(state) => state,
                Err(e) => {
                    warn!(node = %node.name, error = %e, "failed to fetch provisioning state");
                    continue;
                }
            };
            let latest_model_applied = if identity.is_vmss() {
                cloud.latest_model_applied(&identity).await.unwrap_or(None)
            } else {
                None
            };

            let snapshot = ScaleSetVmSnapshot { provisioning_state, latest_model_applied };
            self.enrichment
                .write()
                .unwrap()
                .insert(node.provider_id.to_ascii_lowercase(), EnrichmentEntry { snapshot, fetched_at: now });
        }
    }

    /// Remove the autoscaler scale-down-disable companion annotation from nodes whose
    /// expiry instant has passed. Driven by the caller with the annotation name it uses.
    pub fn expired_companion_annotations(&self, annotation: &str, now: DateTime<Utc>) -> Vec<String> {
        self.index
            .read()
            .unwrap()
            .values()
            .filter_map(|node| {
                let value = node.annotation(annotation)?;
                match crate::lock::remaining_from_annotation(value, now) {
                    None => Some(node.name.clone()),
                    Some(_) => None,
                }
            })
            .collect()
    }
}

/// Remove the autoscaler scale-down-disable annotation from every node whose expiry has
/// passed. Run at the top of every reconcile tick alongside the lock-annotation resync.
pub async fn cleanup_expired_companion_annotations(
    inventory: &NodeInventory,
    api: &Api<K8sNode>,
    annotation: &str,
    now: DateTime<Utc>,
) -> crate::error::Result<()> {
    for name in inventory.expired_companion_annotations(annotation, now) {
        if let Err(e) = crate::patch::apply(api, &name, &[crate::patch::AnnotationOp::Remove(annotation.to_string())]).await
        {
            warn!(node = %name, error = %e, "failed to reclaim expired autoscaler scale-down-disable annotation");
        }
    }
    Ok(())
}

/// Drive the watch loop until the process shuts down, upserting/removing from `inventory`
/// as events arrive and reconnecting whenever the stream ends.
pub async fn run_watch(client: Client, inventory: Arc<NodeInventory>, label_selector: String) {
    let api: Api<K8sNode> = Api::all(client);
    let config = watcher::Config::default().labels(&label_selector);

    loop {
        let mut stream = Box::pin(watcher::watcher(api.clone(), config.clone()));
        info!("starting node watch");

        while let Some(event) = stream.next().await {
            match event {
                Ok(Event::Apply(node)) | Ok(Event::InitApply(node)) => inventory.upsert(&node),
                Ok(Event::Delete(node)) => inventory.remove(&node),
                Ok(Event::Init) => {}
                Ok(Event::InitDone) => {
                    inventory.ready.store(true, std::sync::atomic::Ordering::Relaxed);
                    info!("initial node list synchronized");
                }
                Err(e) => {
                    error!(error = %e, "node watch stream error, will resync on reconnect");
                }
            }
        }

        warn!("node watch stream ended, reconnecting");
    }
}
