//! In-memory expiring lock tables, mirrored to node annotations so a restarted controller
//! can rebuild its lock posture from the cluster within one tick.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use k8s_openapi::api::core::v1::Node;
use kube::Api;
use tracing::warn;

use crate::error::Result;
use crate::inventory::NodeView;
use crate::patch::{self, AnnotationOp};

/// A single expiring key-value table. Two independent instances back the repair and
/// update reconcilers; they are never merged because their TTL semantics differ per
/// reconciler and a shared table would need per-entry purpose tagging for no benefit.
pub struct ExpiringLockTable {
    entries: Mutex<HashMap<String, Instant>>,
}

impl Default for ExpiringLockTable {
    fn default() -> Self {
        Self::new()
    }
}

impl ExpiringLockTable {
    pub fn new() -> Self {
        Self { entries: Mutex::new(HashMap::new()) }
    }

    /// Insert or replace the lock for `key`, expiring after `ttl`.
    pub fn add(&self, key: &str, ttl: Duration) {
        let expiry = Instant::now() + ttl;
        self.entries.lock().unwrap().insert(key.to_string(), expiry);
    }

    /// Present/expiry-remaining, if the entry exists and has not yet expired.
    pub fn get_with_expiration(&self, key: &str) -> Option<Duration> {
        let now = Instant::now();
        let entries = self.entries.lock().unwrap();
        entries.get(key).and_then(|expiry| {
            if *expiry > now {
                Some(*expiry - now)
            } else {
                None
            }
        })
    }

    pub fn item_count(&self) -> usize {
        let now = Instant::now();
        self.entries.lock().unwrap().values().filter(|expiry| **expiry > now).count()
    }

    pub fn delete(&self, key: &str) {
        self.entries.lock().unwrap().remove(key);
    }

    pub fn flush(&self) {
        self.entries.lock().unwrap().clear();
    }

    pub fn delete_expired(&self) {
        let now = Instant::now();
        self.entries.lock().unwrap().retain(|_, expiry| *expiry > now);
    }
}

/// Parse an RFC-3339 expiry annotation value into a remaining duration from `now`, or
/// `None` if the value is malformed or already in the past.
pub fn remaining_from_annotation(value: &str, now: DateTime<Utc>) -> Option<Duration> {
    let expiry = DateTime::parse_from_rfc3339(value).ok()?.with_timezone(&Utc);
    let remaining = expiry.signed_duration_since(now);
    if remaining.num_milliseconds() <= 0 {
        None
    } else {
        remaining.to_std().ok()
    }
}

/// Format an expiry instant (now + ttl) as the RFC-3339 string stored in the annotation.
pub fn format_expiry(now: DateTime<Utc>, ttl: Duration) -> String {
    let expiry = now + chrono::Duration::from_std(ttl).unwrap_or_default();
    expiry.to_rfc3339()
}

/// Decide, for one node carrying (or not carrying) a lock annotation, what in-memory
/// action should be taken. Pure function so the annotation-sync pass is testable without
/// a live cluster.
#[derive(Debug, PartialEq, Eq)]
pub enum SyncAction {
    /// No annotation present: ensure no stale in-memory entry remains.
    ClearStale,
    /// Annotation present but expired/malformed: reclaim by removing the annotation.
    ReclaimExpired,
    /// Annotation present and still valid: install/refresh the in-memory entry.
    InstallRemaining(Duration),
}

pub fn sync_action(annotation_value: Option<&str>, now: DateTime<Utc>) -> SyncAction {
    match annotation_value {
        None => SyncAction::ClearStale,
        Some(value) => match remaining_from_annotation(value, now) {
            Some(remaining) => SyncAction::InstallRemaining(remaining),
            None => SyncAction::ReclaimExpired,
        },
    }
}

/// Rebuild `table` from the current state of `nodes`' lock annotation, reclaiming any
/// expired annotation by removing it from the node. Run once at the start of every repair
/// and update cycle so a freshly-restarted controller inherits the correct lock posture
/// instead of starting with an empty table and double-acting on already-locked nodes.
pub async fn sync_node_lock_cache(
    table: &ExpiringLockTable,
    api: &Api<Node>,
    nodes: &[NodeView],
    annotation: &str,
    now: DateTime<Utc>,
) -> Result<()> {
    table.flush();
    for node in nodes {
        match sync_action(node.annotation(annotation), now) {
            SyncAction::ClearStale => table.delete(&node.name),
            SyncAction::InstallRemaining(remaining) => table.add(&node.name, remaining),
            SyncAction::ReclaimExpired => {
                if let Err(e) = patch::apply(api, &node.name, &[AnnotationOp::Remove(annotation.to_string())]).await {
                    warn!(node = %node.name, error = %e, "failed to reclaim expired lock annotation");
                }
            }
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread::sleep;

    #[test]
    fn add_and_get_with_expiration_round_trips() {
        let table = ExpiringLockTable::new();
        table.add("node-1", Duration::from_secs(60));
        let remaining = table.get_with_expiration("node-1").unwrap();
        assert!(remaining <= Duration::from_secs(60) && remaining > Duration::from_secs(55));
    }

    #[test]
    fn expired_entries_are_absent() {
        let table = ExpiringLockTable::new();
        table.add("node-1", Duration::from_millis(10));
        sleep(Duration::from_millis(30));
        assert!(table.get_with_expiration("node-1").is_none());
    }

    #[test]
    fn item_count_excludes_expired() {
        let table = ExpiringLockTable::new();
        table.add("node-1", Duration::from_secs(60));
        table.add("node-2", Duration::from_millis(5));
        sleep(Duration::from_millis(20));
        assert_eq!(table.item_count(), 1);
    }

    #[test]
    fn delete_expired_prunes_table() {
        let table = ExpiringLockTable::new();
        table.add("node-1", Duration::from_millis(5));
        sleep(Duration::from_millis(20));
        table.delete_expired();
        assert_eq!(table.item_count(), 0);
    }

    #[test]
    fn sync_action_clears_stale_when_annotation_absent() {
        assert_eq!(sync_action(None, Utc::now()), SyncAction::ClearStale);
    }

    #[test]
    fn sync_action_reclaims_past_expiry() {
        let now = Utc::now();
        let past = (now - chrono::Duration::minutes(5)).to_rfc3339();
        assert_eq!(sync_action(Some(&past), now), SyncAction::ReclaimExpired);
    }

    #[test]
    fn sync_action_reclaims_malformed_value() {
        assert_eq!(sync_action(Some("not-a-timestamp"), Utc::now()), SyncAction::ReclaimExpired);
    }

    #[test]
    fn sync_action_installs_remaining_duration_for_future_expiry() {
        let now = Utc::now();
        let future = (now + chrono::Duration::minutes(10)).to_rfc3339();
        match sync_action(Some(&future), now) {
            SyncAction::InstallRemaining(remaining) => {
                assert!(remaining.as_secs() > 590 && remaining.as_secs() <= 600);
            }
            other => panic!("expected InstallRemaining, got {other:?}"),
        }
    }

    #[test]
    fn format_expiry_round_trips_through_remaining_from_annotation() {
        let now = Utc::now();
        let encoded = format_expiry(now, Duration::from_secs(300));
        let remaining = remaining_from_annotation(&encoded, now).unwrap();
        assert!(remaining.as_secs() > 295 && remaining.as_secs() <= 300);
    }
}
