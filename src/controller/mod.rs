//! Reconciliation loops proper: candidate selection, cloud dispatch, and lock bookkeeping
//! for node repair and model-version update, plus the cron drivers and metrics that wire
//! them into a running process.

#[cfg(feature = "metrics")]
pub mod metrics;
pub mod repair;
pub mod scheduler;
pub mod update;
