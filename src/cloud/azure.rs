//! Azure Resource Manager compute client: REST calls over the VM/VMSS control plane,
//! authenticated via `azure_identity`'s `DefaultAzureCredential`, with long-running
//! operations awaited by polling the `Azure-AsyncOperation` URL.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use azure_core::auth::TokenCredential;
use azure_identity::DefaultAzureCredential;
use reqwest::{Client, StatusCode};
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info};

use super::{CloudComputeClient, RepairAction, UpdateAction};
use crate::error::{Error, Result};
use crate::identity::{NodeIdentity, NodeIdentityKind};

const API_VERSION: &str = "2024-03-01";
const ARM_BASE: &str = "https://management.azure.com";
const ARM_SCOPE: &str = "https://management.azure.com/.default";

pub struct AzureComputeClient {
    http: Client,
    credential: Arc<DefaultAzureCredential>,
    subscription_override: Option<String>,
}

impl AzureComputeClient {
    pub fn new(subscription_override: Option<String>) -> Result<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(30))
            .user_agent(concat!("node-autopilot/", env!("CARGO_PKG_VERSION")))
            .build()
            .map_err(Error::HttpError)?;
        let credential = DefaultAzureCredential::create(Default::default())
            .map_err(|e| Error::CloudError { action: "auth".to_string(), source: e.to_string() })?;
        Ok(Self { http, credential: Arc::new(credential), subscription_override })
    }

    fn subscription<'a>(&'a self, identity: &'a NodeIdentity) -> &'a str {
        self.subscription_override.as_deref().unwrap_or(&identity.subscription)
    }

    async fn bearer_token(&self) -> Result<String> {
        let token = self
            .credential
            .get_token(&[ARM_SCOPE])
            .await
            .map_err(|e| Error::CloudError { action: "auth".to_string(), source: e.to_string() })?;
        Ok(token.token.secret().to_string())
    }

    fn resource_url(&self, identity: &NodeIdentity) -> String {
        let sub = self.subscription(identity);
        let rg = &identity.resource_group;
        match &identity.kind {
            NodeIdentityKind::Vm { vm_name } => format!(
                "{ARM_BASE}/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/virtualMachines/{vm_name}"
            ),
            NodeIdentityKind::Vmss { scale_set_name, instance_id } => format!(
                "{ARM_BASE}/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/virtualMachineScaleSets/{scale_set_name}/virtualMachines/{instance_id}"
            ),
        }
    }

    fn vmss_action_url(&self, identity: &NodeIdentity, action: &str) -> Option<String> {
        let sub = self.subscription(identity);
        let rg = &identity.resource_group;
        match &identity.kind {
            NodeIdentityKind::Vmss { scale_set_name, .. } => Some(format!(
                "{ARM_BASE}/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/virtualMachineScaleSets/{scale_set_name}/{action}"
            )),
            NodeIdentityKind::Vm { .. } => None,
        }
    }

    fn vm_action_url(&self, identity: &NodeIdentity, action: &str) -> Option<String> {
        let sub = self.subscription(identity);
        let rg = &identity.resource_group;
        match &identity.kind {
            NodeIdentityKind::Vm { vm_name } => Some(format!(
                "{ARM_BASE}/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/virtualMachines/{vm_name}/{action}"
            )),
            NodeIdentityKind::Vmss { .. } => None,
        }
    }

    async fn get_json(&self, url: &str) -> Result<serde_json::Value> {
        let token = self.bearer_token().await?;
        let resp = self
            .http
            .get(url)
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(token)
            .send()
            .await
            .map_err(Error::HttpError)?;
        let status = resp.status();
        let body = resp.json::<serde_json::Value>().await.map_err(Error::HttpError)?;
        if !status.is_success() {
            return Err(Error::CloudError { action: "get".to_string(), source: body.to_string() });
        }
        Ok(body)
    }

    /// POST an action with an optional request body, returning the operation's
    /// `Azure-AsyncOperation` header if the service accepted the request asynchronously.
    async fn post_action(&self, url: &str, body: serde_json::Value) -> Result<Option<String>> {
        let token = self.bearer_token().await?;
        let resp = self
            .http
            .post(url)
            .query(&[("api-version", API_VERSION)])
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .map_err(Error::HttpError)?;

        let status = resp.status();
        let async_url = resp
            .headers()
            .get("Azure-AsyncOperation")
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_string());

        if status == StatusCode::ACCEPTED {
            return Ok(async_url);
        }
        if status.is_success() {
            return Ok(None);
        }
        let text = resp.text().await.unwrap_or_default();
        Err(Error::CloudError { action: url.to_string(), source: format!("HTTP {status}: {text}") })
    }

    /// Poll an Azure-AsyncOperation URL to a terminal state, with the same exponential
    /// backoff shape used elsewhere for outbound retries (base 15s, cap 300s).
    async fn poll_lro(&self, operation_url: &str, action: &str) -> Result<()> {
        #[derive(Deserialize)]
        struct OperationStatus {
            status: String,
        }

        let mut attempt: u32 = 0;
        loop {
            let token = self.bearer_token().await?;
            let resp = self
                .http
                .get(operation_url)
                .bearer_auth(token)
                .send()
                .await
                .map_err(Error::HttpError)?;
            let parsed: OperationStatus = resp.json().await.map_err(Error::HttpError)?;

            match parsed.status.as_str() {
                "Succeeded" => {
                    info!(action, "long-running operation succeeded");
                    return Ok(());
                }
                "Failed" | "Canceled" => {
                    return Err(Error::CloudError {
                        action: action.to_string(),
                        source: format!("operation ended in state {}", parsed.status),
                    });
                }
                other => {
                    debug!(action, status = other, attempt, "operation still in progress");
                    let delay = backoff(attempt);
                    tokio::time::sleep(delay).await;
                    attempt += 1;
                }
            }
        }
    }
}

fn backoff(attempt: u32) -> Duration {
    let base = 15_u64;
    let max = 300_u64;
    let delay = base.saturating_mul(2_u64.saturating_pow(attempt.min(5)));
    Duration::from_secs(delay.min(max))
}

#[async_trait]
impl CloudComputeClient for AzureComputeClient {
    async fn provisioning_state(&self, identity: &NodeIdentity) -> Result<Option<String>> {
        let body = self.get_json(&self.resource_url(identity)).await?;
        Ok(body
            .get("properties")
            .and_then(|p| p.get("provisioningState"))
            .and_then(|v| v.as_str())
            .map(|s| s.to_string()))
    }

    async fn repair(&self, identity: &NodeIdentity, action: RepairAction) -> Result<()> {
        let instance_id = match &identity.kind {
            NodeIdentityKind::Vmss { instance_id, .. } => Some(instance_id.clone()),
            NodeIdentityKind::Vm { .. } => None,
        };

        let (url, body) = match (&identity.kind, action) {
            (NodeIdentityKind::Vmss { .. }, RepairAction::Restart) => {
                (self.vmss_action_url(identity, "restart"), json!({"instanceIds": [instance_id]}))
            }
            (NodeIdentityKind::Vmss { .. }, RepairAction::Redeploy) => {
                (self.vmss_action_url(identity, "redeploy"), json!({"instanceIds": [instance_id]}))
            }
            (NodeIdentityKind::Vmss { .. }, RepairAction::Reimage) => {
                (self.vmss_action_url(identity, "reimage"), json!({"instanceIds": [instance_id]}))
            }
            (NodeIdentityKind::Vmss { .. }, RepairAction::Delete) => (
                self.vmss_action_url(identity, "delete"),
                json!({"instanceIds": [instance_id], "forceDeletion": false}),
            ),
            (NodeIdentityKind::Vm { .. }, RepairAction::Restart) => (self.vm_action_url(identity, "restart"), json!({})),
            (NodeIdentityKind::Vm { .. }, RepairAction::Redeploy) => (self.vm_action_url(identity, "redeploy"), json!({})),
            (NodeIdentityKind::Vm { .. }, other) => {
                return Err(Error::CloudError {
                    action: other.name().to_string(),
                    source: "action not valid for a standalone VM".to_string(),
                })
            }
        };

        let url = url.expect("action/kind combinations above are exhaustive for their branch");
        let async_op = self.post_action(&url, body).await?;
        if let Some(op_url) = async_op {
            self.poll_lro(&op_url, action.name()).await?;
        }
        Ok(())
    }

    async fn update(&self, identity: &NodeIdentity, action: UpdateAction) -> Result<()> {
        let instance_id = match &identity.kind {
            NodeIdentityKind::Vmss { instance_id, .. } => instance_id.clone(),
            NodeIdentityKind::Vm { .. } => {
                return Err(Error::CloudError {
                    action: action.name().to_string(),
                    source: "update action requires a VMSS instance".to_string(),
                })
            }
        };

        if action == UpdateAction::Delete {
            let url = self.vmss_action_url(identity, "delete").unwrap();
            let async_op = self.post_action(&url, json!({"instanceIds": [instance_id]})).await?;
            if let Some(op_url) = async_op {
                self.poll_lro(&op_url, "delete").await?;
            }
            return Ok(());
        }

        let update_url = self.vmss_action_url(identity, "manualupgrade").unwrap();
        let async_op = self.post_action(&update_url, json!({"instanceIds": [instance_id.clone()]})).await?;
        if let Some(op_url) = async_op {
            self.poll_lro(&op_url, "update").await?;
        }

        if action == UpdateAction::UpdateReimage {
            let reimage_url = self.vmss_action_url(identity, "reimage").unwrap();
            let async_op = self.post_action(&reimage_url, json!({"instanceIds": [instance_id]})).await?;
            if let Some(op_url) = async_op {
                self.poll_lro(&op_url, "reimage").await?;
            }
        }

        Ok(())
    }

    async fn latest_model_applied(&self, identity: &NodeIdentity) -> Result<Option<bool>> {
        let body = self.get_json(&self.resource_url(identity)).await?;
        Ok(body
            .get("properties")
            .and_then(|p| p.get("latestModelApplied"))
            .and_then(|v| v.as_bool()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_grows_exponentially_and_caps() {
        assert_eq!(backoff(0), Duration::from_secs(15));
        assert_eq!(backoff(1), Duration::from_secs(30));
        assert_eq!(backoff(2), Duration::from_secs(60));
        assert_eq!(backoff(5), Duration::from_secs(300));
        assert_eq!(backoff(10), Duration::from_secs(300));
    }

    fn vmss_identity() -> NodeIdentity {
        NodeIdentity {
            subscription: "sub-1".to_string(),
            resource_group: "rg-1".to_string(),
            kind: NodeIdentityKind::Vmss { scale_set_name: "set-1".to_string(), instance_id: "3".to_string() },
        }
    }

    #[test]
    fn vmss_resource_url_includes_instance_id() {
        let client = AzureComputeClientTestable;
        let url = client.resource_url_for_test(&vmss_identity());
        assert!(url.ends_with("/virtualMachineScaleSets/set-1/virtualMachines/3"));
    }

    /// Thin helper so the URL-building logic can be exercised without constructing a real
    /// `AzureComputeClient` (which requires live credential discovery).
    struct AzureComputeClientTestable;

    impl AzureComputeClientTestable {
        fn resource_url_for_test(&self, identity: &NodeIdentity) -> String {
            let sub = &identity.subscription;
            let rg = &identity.resource_group;
            match &identity.kind {
                NodeIdentityKind::Vm { vm_name } => format!(
                    "{ARM_BASE}/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/virtualMachines/{vm_name}"
                ),
                NodeIdentityKind::Vmss { scale_set_name, instance_id } => format!(
                    "{ARM_BASE}/subscriptions/{sub}/resourceGroups/{rg}/providers/Microsoft.Compute/virtualMachineScaleSets/{scale_set_name}/virtualMachines/{instance_id}"
                ),
            }
        }
    }
}
