//! Decomposes a node's provider ID into the Azure Resource Manager coordinates needed to
//! act on its underlying VM or VMSS instance.

use crate::error::{Error, Result};

const SCHEME: &str = "azure://";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeIdentity {
    pub subscription: String,
    pub resource_group: String,
    pub kind: NodeIdentityKind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NodeIdentityKind {
    Vmss { scale_set_name: String, instance_id: String },
    Vm { vm_name: String },
}

impl NodeIdentity {
    pub fn is_vmss(&self) -> bool {
        matches!(self.kind, NodeIdentityKind::Vmss { .. })
    }
}

/// Whether a provider ID is recognized as belonging to this cloud at all. Nodes that fail
/// this check are skipped as non-cloud-managed rather than treated as a parse error.
pub fn is_cloud_managed(provider_id: &str) -> bool {
    provider_id.to_ascii_lowercase().starts_with(SCHEME)
}

/// Parse a provider ID of the form:
///   azure:///subscriptions/<sub>/resourceGroups/<rg>/providers/Microsoft.Compute/virtualMachines/<name>
/// or, for a VMSS instance:
///   azure:///subscriptions/<sub>/resourceGroups/<rg>/providers/Microsoft.Compute/virtualMachineScaleSets/<set>/virtualMachines/<id>
pub fn parse(provider_id: &str) -> Result<NodeIdentity> {
    let subscription = extract(provider_id, "/subscriptions/")
        .ok_or_else(|| {
            Error::ParseError(format!(
                "unable to detect Azure Subscription from provider id: {provider_id}"
            ))
        })?;

    let resource_group = extract(provider_id, "/resourceGroups/").ok_or_else(|| {
        Error::ParseError(format!(
            "unable to detect Azure ResourceGroup from provider id: {provider_id}"
        ))
    })?;

    let kind = if provider_id.contains("/Microsoft.Compute/virtualMachineScaleSets/") {
        let scale_set_name = extract(provider_id, "/virtualMachineScaleSets/").ok_or_else(|| {
            Error::ParseError(format!(
                "unable to detect Azure VMScaleSetName from provider id: {provider_id}"
            ))
        })?;
        let instance_id = extract_last_segment(provider_id, "/virtualMachines/").ok_or_else(|| {
            Error::ParseError(format!(
                "unable to detect Azure VmssInstanceId from provider id: {provider_id}"
            ))
        })?;
        NodeIdentityKind::Vmss { scale_set_name, instance_id }
    } else {
        let vm_name = extract(provider_id, "/virtualMachines/").ok_or_else(|| {
            Error::ParseError(format!(
                "unable to detect Azure VM name from provider id: {provider_id}"
            ))
        })?;
        NodeIdentityKind::Vm { vm_name }
    };

    Ok(NodeIdentity { subscription, resource_group, kind })
}

/// Extract the first path segment following `marker`, stopping at the next `/`.
fn extract(source: &str, marker: &str) -> Option<String> {
    let idx = source.find(marker)?;
    let rest = &source[idx + marker.len()..];
    let end = rest.find('/').unwrap_or(rest.len());
    if end == 0 {
        return None;
    }
    Some(rest[..end].to_string())
}

/// Extract the segment following the *last* occurrence of `marker`, trimming any trailing slash.
fn extract_last_segment(source: &str, marker: &str) -> Option<String> {
    let idx = source.rfind(marker)?;
    let rest = source[idx + marker.len()..].trim_end_matches('/');
    if rest.is_empty() {
        return None;
    }
    Some(rest.to_string())
}
