//! RFC-6902 JSON-Patch helper for node annotation mutations.
//!
//! Annotations are the only durable state this controller owns, so writes here must be
//! idempotent replace/remove operations rather than read-modify-write: a lost update must
//! never leave a node permanently locked.

use kube::api::{Patch, PatchParams};
use kube::Api;
use serde_json::{json, Value};

use crate::error::{Error, Result};

pub const FIELD_MANAGER: &str = "node-autopilot";

/// Escape an annotation key for embedding in a JSON-Patch path, per RFC 6901: `~` first,
/// then `/`.
pub fn escape_path_segment(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[derive(Debug, Clone)]
pub enum AnnotationOp {
    Set(String, String),
    Remove(String),
}

/// Build the ordered list of JSON-Patch operations for a batch of annotation mutations.
pub fn build_ops(ops: &[AnnotationOp]) -> Vec<Value> {
    ops.iter()
        .map(|op| match op {
            AnnotationOp::Set(key, value) => json!({
                "op": "replace",
                "path": format!("/metadata/annotations/{}", escape_path_segment(key)),
                "value": value,
            }),
            AnnotationOp::Remove(key) => json!({
                "op": "remove",
                "path": format!("/metadata/annotations/{}", escape_path_segment(key)),
            }),
        })
        .collect()
}

/// Apply a batch of annotation operations to a node as a single JSON-Patch request.
///
/// Callers that only add/replace annotations (never remove a key that might not exist)
/// can use `replace`-only batches freely; removing a possibly-absent key is handled by
/// the caller pre-checking presence, since a `remove` against a missing path is rejected
/// by the API server as a whole-patch failure.
pub async fn apply(api: &Api<k8s_openapi::api::core::v1::Node>, node_name: &str, ops: &[AnnotationOp]) -> Result<()> {
    if ops.is_empty() {
        return Ok(());
    }
    let patch = Patch::Json::<()>(json_patch::Patch(
        build_ops(ops)
            .into_iter()
            .map(|v| serde_json::from_value(v).expect("well-formed patch op"))
            .collect(),
    ));
    api.patch(node_name, &PatchParams::apply(FIELD_MANAGER), &patch)
        .await
        .map_err(|e| Error::PatchError(e.to_string()))?;
    Ok(())
}
