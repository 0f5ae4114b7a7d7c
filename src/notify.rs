//! Best-effort webhook fan-out. A repair/update outcome is posted to every configured
//! URL; a failed delivery is logged and otherwise ignored; notification delivery never
//! fails a reconcile cycle.

use serde::Serialize;
use tracing::warn;

#[derive(Debug, Clone, Serialize)]
pub struct Notification<'a> {
    pub kind: &'a str,
    pub node: &'a str,
    pub action: &'a str,
    pub success: bool,
    pub message: &'a str,
}

/// POST `notification` as JSON to every URL in `targets`, concurrently, swallowing
/// individual failures.
pub async fn send(client: &reqwest::Client, targets: &[String], notification: &Notification<'_>) {
    if targets.is_empty() {
        return;
    }

    let sends = targets.iter().map(|url| async move {
        if let Err(e) = client.post(url).json(notification).send().await {
            warn!(url, error = %e, "notification delivery failed");
        }
    });

    futures::future::join_all(sends).await;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn notification_serializes_expected_shape() {
        let n = Notification { kind: "repair", node: "node-1", action: "redeploy", success: true, message: "ok" };
        let value = serde_json::to_value(&n).unwrap();
        assert_eq!(value["kind"], "repair");
        assert_eq!(value["success"], true);
    }
}
