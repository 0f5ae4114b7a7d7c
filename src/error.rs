//! Crate-wide error type and retriability classification.

use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API call failed (list/watch/patch/evict).
    #[error("Kubernetes API error: {0}")]
    KubeError(#[from] kube::Error),

    /// A node's provider ID did not match the expected Azure resource-id shape.
    #[error("failed to parse node identity: {0}")]
    ParseError(String),

    /// A JSON-patch request was rejected by the API server.
    #[error("failed to patch node: {0}")]
    PatchError(String),

    /// The external drain executable failed and the configured policy did not absorb it.
    #[error("failed to drain node {node}: {source}")]
    DrainError { node: String, source: String },

    /// An Azure Resource Manager call failed, or its long-running operation did not reach
    /// a successful terminal state.
    #[error("cloud action {action} failed: {source}")]
    CloudError { action: String, source: String },

    /// The target VM/VMSS instance's provisioning state is not in the configured whitelist.
    #[error("node is in provisioning state \"{0}\", repair/update not allowed")]
    ProvisioningStateNotAllowed(String),

    /// An outbound HTTP call (Azure REST, notification webhook) failed at the transport level.
    #[error("HTTP request failed: {0}")]
    HttpError(#[from] reqwest::Error),

    /// Configuration failed validation at startup; this is not recoverable.
    #[error("invalid configuration: {0}")]
    ConfigFatal(String),

    /// Self-eviction of the controller's own pod failed.
    #[error("failed to evict own pod: {0}")]
    EvictionError(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Whether the condition that produced this error is expected to clear on its own by
    /// the next reconcile tick, and is therefore safe to let a cron-driven retry absorb
    /// rather than treat as a hard failure of the process.
    pub fn is_retriable(&self) -> bool {
        matches!(
            self,
            Error::KubeError(_) | Error::CloudError { .. } | Error::DrainError { .. } | Error::HttpError(_)
        )
    }
}
