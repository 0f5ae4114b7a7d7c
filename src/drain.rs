//! Invokes the external drain/uncordon tool (default `kubectl`) with the retry and
//! failure-absorption policy the update reconciler relies on before taking a node's
//! VMSS instance out for a model update.

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};

use crate::config::DrainConfig;
use crate::error::{Error, Result};

/// Build the `drain` argument vector for a node, mirroring the flags the external tool
/// accepts. `force_no_eviction` is set on the retry-without-eviction pass.
pub fn drain_args(node: &str, cfg: &DrainConfig, force_no_eviction: bool) -> Vec<String> {
    let mut args = vec!["drain".to_string(), node.to_string(), format!("--timeout={}s", cfg.timeout.as_secs())];
    if cfg.delete_emptydir_data {
        args.push("--delete-emptydir-data=true".to_string());
    }
    if cfg.force {
        args.push("--force=true".to_string());
    }
    if cfg.grace_period >= 0 {
        args.push(format!("--grace-period={}", cfg.grace_period));
    }
    if cfg.ignore_daemonsets {
        args.push("--ignore-daemonsets=true".to_string());
    }
    if let Some(selector) = &cfg.pod_selector {
        args.push(format!("--pod-selector={selector}"));
    }
    if cfg.disable_eviction || force_no_eviction {
        args.push("--disable-eviction=true".to_string());
    }
    args
}

pub fn uncordon_args(node: &str) -> Vec<String> {
    vec!["uncordon".to_string(), node.to_string()]
}

/// Drain a node per the configured policy:
/// 1. disabled drain is a no-op success;
/// 2. a failed first attempt is retried once without eviction, if configured;
/// 3. a still-failing attempt is swallowed as success if `ignore_failure` is set;
/// 4. a success sleeps `wait_after` to let the platform detach volumes.
pub async fn drain_node(node: &str, cfg: &DrainConfig) -> Result<()> {
    if !cfg.enable {
        info!(node, "drain disabled, skipping");
        return Ok(());
    }

    let mut result = run(&cfg.binary, &drain_args(node, cfg, false)).await;

    if result.is_err() && cfg.retry_without_eviction {
        warn!(node, "drain failed, retrying without eviction");
        result = run(&cfg.binary, &drain_args(node, cfg, true)).await;
    }

    if let Err(source) = result {
        if cfg.ignore_failure {
            warn!(node, %source, "drain failed, ignoring per configured policy");
        } else {
            return Err(Error::DrainError { node: node.to_string(), source });
        }
    }

    tokio::time::sleep(cfg.wait_after).await;
    Ok(())
}

pub async fn uncordon_node(node: &str, cfg: &DrainConfig) -> Result<()> {
    run(&cfg.binary, &uncordon_args(node))
        .await
        .map_err(|source| Error::DrainError { node: node.to_string(), source })
}

async fn run(binary: &str, args: &[String]) -> std::result::Result<(), String> {
    info!(binary, args = ?args, "executing drain command");

    let mut child = Command::new(binary)
        .args(args)
        .stdout(std::process::Stdio::piped())
        .stderr(std::process::Stdio::piped())
        .spawn()
        .map_err(|e| e.to_string())?;

    if let Some(stdout) = child.stdout.take() {
        let mut lines = BufReader::new(stdout).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                info!(target: "drain.stdout", "{line}");
            }
        });
    }
    if let Some(stderr) = child.stderr.take() {
        let mut lines = BufReader::new(stderr).lines();
        tokio::spawn(async move {
            while let Ok(Some(line)) = lines.next_line().await {
                warn!(target: "drain.stderr", "{line}");
            }
        });
    }

    let status = child.wait().await.map_err(|e| e.to_string())?;
    if status.success() {
        Ok(())
    } else {
        Err(format!("command exited with {status}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn base_cfg() -> DrainConfig {
        DrainConfig {
            binary: "kubectl".to_string(),
            enable: true,
            delete_emptydir_data: false,
            force: false,
            grace_period: -1,
            ignore_daemonsets: false,
            pod_selector: None,
            timeout: Duration::from_secs(0),
            wait_after: Duration::from_secs(0),
            disable_eviction: false,
            retry_without_eviction: false,
            ignore_failure: false,
        }
    }

    #[test]
    fn builds_minimal_drain_args() {
        let args = drain_args("node-1", &base_cfg(), false);
        assert_eq!(args, vec!["drain", "node-1", "--timeout=0s"]);
    }

    #[test]
    fn appends_optional_switches() {
        let mut cfg = base_cfg();
        cfg.delete_emptydir_data = true;
        cfg.force = true;
        cfg.grace_period = 30;
        cfg.ignore_daemonsets = true;
        cfg.pod_selector = Some("app=foo".to_string());
        let args = drain_args("node-1", &cfg, false);
        assert!(args.contains(&"--delete-emptydir-data=true".to_string()));
        assert!(args.contains(&"--force=true".to_string()));
        assert!(args.contains(&"--grace-period=30".to_string()));
        assert!(args.contains(&"--ignore-daemonsets=true".to_string()));
        assert!(args.contains(&"--pod-selector=app=foo".to_string()));
    }

    #[test]
    fn retry_without_eviction_forces_disable_eviction_flag() {
        let args = drain_args("node-1", &base_cfg(), true);
        assert!(args.contains(&"--disable-eviction=true".to_string()));
    }

    #[test]
    fn uncordon_args_are_minimal() {
        assert_eq!(uncordon_args("node-1"), vec!["uncordon", "node-1"]);
    }
}
