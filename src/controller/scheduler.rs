//! Cron-driven entry points for the repair and update cycles, plus the self-eviction
//! safeguard that stops both drivers if this controller's own node ever becomes a repair
//! candidate (repairing the node we run on would kill us mid-action).

use std::str::FromStr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use chrono::Utc;
use cron::Schedule;
use k8s_openapi::api::core::v1::{Node, Pod};
use kube::api::{Api, EvictParams};
use kube::Client;
use tokio::sync::watch;
use tracing::{error, info, warn};

use crate::cloud::CloudComputeClient;
use crate::config::{Config, InstanceConfig};
use crate::controller::repair;
use crate::error::Result;
use crate::inventory::NodeInventory;
use crate::lock::ExpiringLockTable;

/// Drive `cycle` on every firing of `crontab`, skipping a firing outright if the previous
/// invocation has not yet returned (mirrors a `cron.SkipIfStillRunning` wrapper).
async fn run_cron_driver<F, Fut>(name: &'static str, crontab: &str, mut shutdown: watch::Receiver<bool>, mut cycle: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<()>>,
{
    let schedule = match Schedule::from_str(crontab) {
        Ok(s) => s,
        Err(e) => {
            error!(driver = name, error = %e, "invalid crontab expression, driver will not run");
            return;
        }
    };

    let running = Arc::new(AtomicBool::new(false));

    loop {
        let next = match schedule.upcoming(Utc).next() {
            Some(t) => t,
            None => {
                error!(driver = name, "crontab schedule produced no further firings");
                return;
            }
        };
        let wait = (next - Utc::now()).to_std().unwrap_or(std::time::Duration::from_secs(1));

        tokio::select! {
            _ = tokio::time::sleep(wait) => {}
            _ = shutdown.changed() => {
                info!(driver = name, "stopping on shutdown signal");
                return;
            }
        }

        if *shutdown.borrow() {
            info!(driver = name, "stopping on shutdown signal");
            return;
        }

        if running.swap(true, Ordering::SeqCst) {
            warn!(driver = name, "previous cycle still running, skipping this firing");
            continue;
        }

        info!(driver = name, "starting cycle");
        let started = std::time::Instant::now();
        if let Err(e) = cycle().await {
            error!(driver = name, error = %e, "cycle failed");
        }
        let elapsed = started.elapsed();
        info!(driver = name, elapsed_ms = elapsed.as_millis() as u64, "cycle finished");
        #[cfg(feature = "metrics")]
        match name {
            "repair" => crate::controller::metrics::REPAIR_DURATION.observe(elapsed.as_secs_f64()),
            "update" => crate::controller::metrics::UPDATE_DURATION.observe(elapsed.as_secs_f64()),
            _ => {}
        }
        running.store(false, Ordering::SeqCst);
    }
}

/// Start both cron drivers and the self-eviction watcher. Returns a handle whose `stop()`
/// cancels all three tasks.
pub struct Scheduler {
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<tokio::task::JoinHandle<()>>,
}

impl Scheduler {
    pub fn start(
        client: Client,
        inventory: Arc<NodeInventory>,
        cloud: Arc<dyn CloudComputeClient>,
        cfg: Arc<Config>,
        http: reqwest::Client,
    ) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let mut tasks = Vec::new();

        {
            let client = client.clone();
            let inventory = inventory.clone();
            let cloud = cloud.clone();
            let cfg = cfg.clone();
            let http = http.clone();
            let shutdown_tx_for_cycle = shutdown_tx.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let api: Api<Node> = Api::all(client.clone());
                let table = ExpiringLockTable::new();
                run_cron_driver("repair", &cfg.repair.crontab, shutdown_rx, || {
                    repair::run_cycle(
                        &api,
                        &inventory,
                        cloud.as_ref(),
                        &table,
                        &cfg,
                        cfg.dry_run,
                        &http,
                        &client,
                        &shutdown_tx_for_cycle,
                    )
                })
                .await;
            }));
        }

        {
            let client = client.clone();
            let inventory = inventory.clone();
            let cloud = cloud.clone();
            let cfg = cfg.clone();
            let http = http.clone();
            let shutdown_tx_for_cycle = shutdown_tx.clone();
            let shutdown_rx = shutdown_rx.clone();
            tasks.push(tokio::spawn(async move {
                let api: Api<Node> = Api::all(client.clone());
                let table = ExpiringLockTable::new();
                run_cron_driver("update", &cfg.update.crontab, shutdown_rx, || {
                    crate::controller::update::run_cycle(
                        &api,
                        &inventory,
                        cloud.as_ref(),
                        &table,
                        &cfg,
                        cfg.dry_run,
                        &http,
                        &client,
                        &shutdown_tx_for_cycle,
                    )
                })
                .await;
            }));
        }

        {
            let shutdown_tx = shutdown_tx.clone();
            let client = client.clone();
            let inventory = inventory.clone();
            let cfg = cfg.clone();
            tasks.push(tokio::spawn(async move {
                self_eviction_watch(client, inventory, cfg, shutdown_tx).await;
            }));
        }

        Self { shutdown_tx, tasks }
    }

    pub async fn stop(self) {
        let _ = self.shutdown_tx.send(true);
        for task in self.tasks {
            let _ = task.await;
        }
    }
}

/// Poll, at a fixed slow interval, whether the node this pod is running on has become a
/// repair candidate. If so, evict our own pod and signal both cron drivers to stop. This
/// is a backstop: the reconcilers themselves check self-eviction in-cycle before any
/// destructive dispatch, so by the time this poller would fire the node has usually
/// already been handled; it exists to catch the case where no cycle ran in between.
async fn self_eviction_watch(
    client: Client,
    inventory: Arc<NodeInventory>,
    cfg: Arc<Config>,
    shutdown_tx: watch::Sender<bool>,
) {
    let Some(own_node) = cfg.instance.nodename.clone() else {
        info!("instance.nodename not set, self-eviction safeguard disabled");
        return;
    };
    if cfg.instance.namespace.is_none() || cfg.instance.pod.is_none() {
        info!("instance.namespace/instance.pod not set, self-eviction safeguard disabled");
        return;
    }

    let mut ticker = tokio::time::interval(std::time::Duration::from_secs(15));
    loop {
        ticker.tick().await;
        if *shutdown_tx.subscribe().borrow() {
            return;
        }

        let now = Utc::now();
        let candidate = inventory
            .node_list()
            .into_iter()
            .find(|n| n.name == own_node)
            .map(|n| repair::is_repair_candidate(&n, &cfg.repair, now))
            .unwrap_or(false);

        if !candidate {
            continue;
        }

        warn!(node = %own_node, "own node became a repair candidate, evicting self");
        trigger_self_eviction(&client, &cfg.instance, &shutdown_tx).await;
        return;
    }
}

/// Evict the controller's own pod and signal both cron drivers to stop. Called both from
/// the reconcilers (in-cycle, before a destructive dispatch against the node they run on)
/// and from the slower [`self_eviction_watch`] backstop.
pub async fn trigger_self_eviction(client: &Client, instance: &InstanceConfig, shutdown_tx: &watch::Sender<bool>) {
    let (Some(namespace), Some(pod)) = (instance.namespace.as_deref(), instance.pod.as_deref()) else {
        warn!("self-eviction triggered but instance.namespace/instance.pod not set, cannot evict");
        let _ = shutdown_tx.send(true);
        return;
    };

    let pods: Api<Pod> = Api::namespaced(client.clone(), namespace);
    match pods.evict(pod, &EvictParams::default()).await {
        Ok(_) => info!(pod, "self-eviction requested"),
        Err(e) => warn!(pod, error = %e, "self-eviction failed, continuing to run"),
    }

    let _ = shutdown_tx.send(true);
}
