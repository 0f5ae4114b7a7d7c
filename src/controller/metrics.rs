//! Prometheus metrics exported on `/metrics` when built with the `metrics` feature.
//!
//! - `autopilot_errors` (counter): errors observed, labeled by `scope`.
//! - `autopilot_candidate_nodes` (gauge): candidates found for an action, labeled by `type`.
//! - `autopilot_failed_nodes` (gauge): candidates that failed their action, labeled by `type`.
//! - `autopilot_repair_node_status` (gauge): last repair outcome per node (1=success, 0=failure).
//! - `autopilot_repair_count` / `autopilot_update_count` (counter): actions dispatched.
//! - `autopilot_repair_duration` / `autopilot_update_duration` (histogram): cycle durations.

use std::sync::atomic::{AtomicI64, AtomicU64};

use once_cell::sync::Lazy;
use prometheus_client::encoding::EncodeLabelSet;
use prometheus_client::metrics::counter::Counter;
use prometheus_client::metrics::family::Family;
use prometheus_client::metrics::gauge::Gauge;
use prometheus_client::metrics::histogram::{exponential_buckets, Histogram};
use prometheus_client::registry::Registry;

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct ScopeLabels {
    pub scope: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct TypeLabels {
    #[prometheus(rename = "type")]
    pub type_: String,
}

#[derive(Clone, Debug, Hash, PartialEq, Eq, EncodeLabelSet)]
pub struct NodeLabels {
    pub node_name: String,
}

pub static ERRORS: Lazy<Family<ScopeLabels, Counter<u64, AtomicU64>>> = Lazy::new(Family::default);
pub static CANDIDATE_NODES: Lazy<Family<TypeLabels, Gauge<i64, AtomicI64>>> = Lazy::new(Family::default);
pub static FAILED_NODES: Lazy<Family<TypeLabels, Gauge<i64, AtomicI64>>> = Lazy::new(Family::default);
pub static REPAIR_NODE_STATUS: Lazy<Family<NodeLabels, Gauge<i64, AtomicI64>>> = Lazy::new(Family::default);
pub static REPAIR_COUNT: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);
pub static UPDATE_COUNT: Lazy<Counter<u64, AtomicU64>> = Lazy::new(Counter::default);

pub static REPAIR_DURATION: Lazy<Histogram> = Lazy::new(|| Histogram::new(exponential_buckets(1.0, 2.0, 12)));
pub static UPDATE_DURATION: Lazy<Histogram> = Lazy::new(|| Histogram::new(exponential_buckets(1.0, 2.0, 12)));

pub fn registry() -> Registry {
    let mut registry = Registry::default();

    registry.register("autopilot_errors", "Errors observed by scope", ERRORS.clone());
    registry.register(
        "autopilot_candidate_nodes",
        "Nodes found as candidates for an action",
        CANDIDATE_NODES.clone(),
    );
    registry.register("autopilot_failed_nodes", "Candidate nodes whose action failed", FAILED_NODES.clone());
    registry.register(
        "autopilot_repair_node_status",
        "Outcome of the most recent repair attempt per node (1=success, 0=failure)",
        REPAIR_NODE_STATUS.clone(),
    );
    registry.register("autopilot_repair_count", "Repair actions dispatched", REPAIR_COUNT.clone());
    registry.register("autopilot_update_count", "Update actions dispatched", UPDATE_COUNT.clone());
    registry.register("autopilot_repair_duration", "Repair cycle duration in seconds", REPAIR_DURATION.clone());
    registry.register("autopilot_update_duration", "Update cycle duration in seconds", UPDATE_DURATION.clone());

    registry
}
