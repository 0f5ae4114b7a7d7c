//! Cluster-side node-health and model-version reconciliation for Azure-backed Kubernetes
//! nodes: repairs nodes stuck unhealthy past a threshold, and rolls VMSS instances onto
//! their scale set's latest model, both through expiring-lock-guarded cron cycles.

pub mod cloud;
pub mod config;
pub mod controller;
pub mod drain;
pub mod error;
pub mod identity;
pub mod inventory;
pub mod lock;
pub mod notify;
pub mod patch;

#[cfg(feature = "rest-api")]
pub mod rest_api;

pub use crate::error::{Error, Result};
