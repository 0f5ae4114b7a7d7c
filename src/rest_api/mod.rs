//! Minimal HTTP surface: liveness/readiness probes and the Prometheus scrape endpoint.

mod server;

pub use server::run_server;
