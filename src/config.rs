//! Process configuration, bound once at startup from CLI flags with env-var fallbacks.

use std::time::Duration;

use clap::{Parser, ValueEnum};

use crate::error::{Error, Result};

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum VmssRepairAction {
    Restart,
    Redeploy,
    Reimage,
    Delete,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum VmRepairAction {
    Restart,
    Redeploy,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum VmssUpdateAction {
    Update,
    #[value(name = "update+reimage")]
    UpdateReimage,
    Delete,
}

#[derive(Debug, Clone, Copy, ValueEnum, PartialEq, Eq)]
pub enum LogFormat {
    Text,
    Json,
}

fn parse_duration(src: &str) -> std::result::Result<Duration, String> {
    humantime_parse(src).map_err(|e| e.to_string())
}

/// Minimal "2m", "30s", "1h" duration parser, matching the shape autopilot configs use.
fn humantime_parse(src: &str) -> std::result::Result<Duration, String> {
    let src = src.trim();
    let split_at = src
        .find(|c: char| !c.is_ascii_digit())
        .ok_or_else(|| format!("missing unit in duration \"{src}\""))?;
    let (value, unit) = src.split_at(split_at);
    let value: u64 = value
        .parse()
        .map_err(|_| format!("invalid duration \"{src}\""))?;
    let secs = match unit {
        "s" => value,
        "m" => value * 60,
        "h" => value * 3600,
        other => return Err(format!("unrecognized duration unit \"{other}\"")),
    };
    Ok(Duration::from_secs(secs))
}

#[derive(Parser, Debug, Clone)]
#[command(name = "node-autopilot", version, about)]
pub struct Config {
    /// Dry run: no cloud mutation or drain is actually performed, but locks still apply.
    #[arg(long, env = "DRY_RUN")]
    pub dry_run: bool,

    /// Optional path to a kubeconfig. Absence means in-cluster config.
    #[arg(long, env = "KUBECONFIG")]
    pub kubeconfig: Option<String>,

    /// Label selector restricting which nodes are watched.
    #[arg(long = "kube.node.labelselector", env = "KUBE_NODE_LABELSELECTOR", default_value = "")]
    pub node_label_selector: String,

    #[command(flatten)]
    pub repair: RepairConfig,

    #[command(flatten)]
    pub update: UpdateConfig,

    #[command(flatten)]
    pub drain: DrainConfig,

    #[command(flatten)]
    pub autoscaler: AutoscalerConfig,

    #[command(flatten)]
    pub instance: InstanceConfig,

    #[command(flatten)]
    pub http: HttpConfig,

    /// Webhook URLs notifications are fanned out to.
    #[arg(long = "notification", env = "NOTIFICATION", value_delimiter = ' ')]
    pub notification: Vec<String>,

    /// Force a single Azure subscription instead of deriving one per node.
    #[arg(long = "azure.subscription-override", env = "AZURE_SUBSCRIPTION_OVERRIDE")]
    pub azure_subscription_override: Option<String>,

    #[arg(long = "log.format", env = "LOG_FORMAT", value_enum, default_value = "text")]
    pub log_format: LogFormat,
}

#[derive(Parser, Debug, Clone)]
pub struct RepairConfig {
    #[arg(long = "repair.crontab", env = "REPAIR_CRONTAB", default_value = "0 */2 * * * *")]
    pub crontab: String,

    #[arg(long = "repair.notready-threshold", env = "REPAIR_NOTREADY_THRESHOLD", value_parser = parse_duration, default_value = "10m")]
    pub not_ready_threshold: Duration,

    #[arg(long = "repair.concurrency", env = "REPAIR_CONCURRENCY", default_value_t = 1)]
    pub concurrency: usize,

    #[arg(long = "repair.lock-duration", env = "REPAIR_LOCK_DURATION", value_parser = parse_duration, default_value = "30m")]
    pub lock_duration: Duration,

    #[arg(long = "repair.lock-duration-error", env = "REPAIR_LOCK_DURATION_ERROR", value_parser = parse_duration, default_value = "5m")]
    pub lock_duration_error: Duration,

    #[arg(long = "repair.azure.vmss.action", env = "REPAIR_AZURE_VMSS_ACTION", value_enum, default_value = "redeploy")]
    pub vmss_action: VmssRepairAction,

    #[arg(long = "repair.azure.vm.action", env = "REPAIR_AZURE_VM_ACTION", value_enum, default_value = "redeploy")]
    pub vm_action: VmRepairAction,

    /// Provisioning states (lower-cased) in which repair is allowed to run; "*" accepts any.
    #[arg(long = "repair.azure.provisioningstate", env = "REPAIR_AZURE_PROVISIONINGSTATE", value_delimiter = ' ', default_values_t = ["succeeded".to_string(), "failed".to_string()])]
    pub provisioning_state: Vec<String>,

    #[arg(long = "repair.lock-annotation", env = "REPAIR_LOCK_ANNOTATION", default_value = "autopilot.example.io/repair-lock")]
    pub lock_annotation: String,
}

impl RepairConfig {
    pub fn provisioning_state_all(&self) -> bool {
        self.provisioning_state.iter().any(|s| s == "*")
    }
}

#[derive(Parser, Debug, Clone)]
pub struct UpdateConfig {
    #[arg(long = "update.crontab", env = "UPDATE_CRONTAB", default_value = "0 */15 * * * *")]
    pub crontab: String,

    #[arg(long = "update.concurrency", env = "UPDATE_CONCURRENCY", default_value_t = 1)]
    pub concurrency: usize,

    #[arg(long = "update.lock-duration", env = "UPDATE_LOCK_DURATION", value_parser = parse_duration, default_value = "15m")]
    pub lock_duration: Duration,

    #[arg(long = "update.lock-duration-error", env = "UPDATE_LOCK_DURATION_ERROR", value_parser = parse_duration, default_value = "5m")]
    pub lock_duration_error: Duration,

    #[arg(long = "update.lock-annotation", env = "UPDATE_LOCK_ANNOTATION", default_value = "autopilot.example.io/update-lock")]
    pub lock_annotation: String,

    #[arg(long = "update.ongoing-annotation", env = "UPDATE_ONGOING_ANNOTATION", default_value = "autopilot.example.io/update-ongoing")]
    pub ongoing_annotation: String,

    #[arg(long = "update.exclude-annotation", env = "UPDATE_EXCLUDE_ANNOTATION", default_value = "autopilot.example.io/exclude")]
    pub exclude_annotation: String,

    #[arg(long = "update.azure.vmss.action", env = "UPDATE_AZURE_VMSS_ACTION", value_enum, default_value = "update+reimage")]
    pub vmss_action: VmssUpdateAction,

    #[arg(long = "update.azure.provisioningstate", env = "UPDATE_AZURE_PROVISIONINGSTATE", value_delimiter = ' ', default_values_t = ["succeeded".to_string(), "failed".to_string()])]
    pub provisioning_state: Vec<String>,

    #[arg(long = "update.failed-threshold", env = "UPDATE_FAILED_THRESHOLD", default_value_t = 2)]
    pub failed_threshold: usize,
}

impl UpdateConfig {
    pub fn provisioning_state_all(&self) -> bool {
        self.provisioning_state.iter().any(|s| s == "*")
    }
}

#[derive(Parser, Debug, Clone)]
pub struct DrainConfig {
    #[arg(long = "drain.binary", env = "DRAIN_BINARY", default_value = "kubectl")]
    pub binary: String,

    #[arg(long = "drain.enable", env = "DRAIN_ENABLE")]
    pub enable: bool,

    #[arg(long = "drain.delete-emptydir-data", env = "DRAIN_DELETE_EMPTYDIR_DATA")]
    pub delete_emptydir_data: bool,

    #[arg(long = "drain.force", env = "DRAIN_FORCE")]
    pub force: bool,

    #[arg(long = "drain.grace-period", env = "DRAIN_GRACE_PERIOD", default_value_t = -1)]
    pub grace_period: i64,

    #[arg(long = "drain.ignore-daemonsets", env = "DRAIN_IGNORE_DAEMONSETS")]
    pub ignore_daemonsets: bool,

    #[arg(long = "drain.pod-selector", env = "DRAIN_POD_SELECTOR")]
    pub pod_selector: Option<String>,

    #[arg(long = "drain.timeout", env = "DRAIN_TIMEOUT", value_parser = parse_duration, default_value = "0s")]
    pub timeout: Duration,

    #[arg(long = "drain.wait-after", env = "DRAIN_WAIT_AFTER", value_parser = parse_duration, default_value = "30s")]
    pub wait_after: Duration,

    #[arg(long = "drain.disable-eviction", env = "DRAIN_DISABLE_EVICTION")]
    pub disable_eviction: bool,

    #[arg(long = "drain.retry-without-eviction", env = "DRAIN_RETRY_WITHOUT_EVICTION")]
    pub retry_without_eviction: bool,

    #[arg(long = "drain.ignore-failure", env = "DRAIN_IGNORE_FAILURE")]
    pub ignore_failure: bool,
}

#[derive(Parser, Debug, Clone)]
pub struct AutoscalerConfig {
    #[arg(long = "autoscaler.scaledown-locktime", env = "AUTOSCALER_SCALEDOWN_LOCKTIME", value_parser = parse_duration, default_value = "60m")]
    pub scaledown_lock_time: Duration,

    /// Annotation co-written alongside a repair/update lock to keep the cluster autoscaler
    /// from scaling down the node while it is being remediated. Value is an RFC-3339 expiry
    /// timestamp, same encoding as the lock annotations.
    #[arg(
        long = "autoscaler.disable-annotation",
        env = "AUTOSCALER_DISABLE_ANNOTATION",
        default_value = "autopilot.example.io/autoscaler-disable"
    )]
    pub disable_annotation: String,
}

#[derive(Parser, Debug, Clone)]
pub struct InstanceConfig {
    #[arg(long = "instance.nodename", env = "INSTANCE_NODENAME")]
    pub nodename: Option<String>,

    #[arg(long = "instance.namespace", env = "INSTANCE_NAMESPACE")]
    pub namespace: Option<String>,

    #[arg(long = "instance.pod", env = "INSTANCE_POD")]
    pub pod: Option<String>,
}

#[derive(Parser, Debug, Clone)]
pub struct HttpConfig {
    #[arg(long = "http.listen-addr", env = "HTTP_LISTEN_ADDR", default_value = "0.0.0.0:8080")]
    pub listen_addr: String,
}

impl Config {
    /// Validate cross-field invariants that `clap`'s own parsing cannot express. Called once
    /// from `main` before anything else starts; failure here is fatal.
    pub fn validate(&self) -> Result<()> {
        use std::str::FromStr;

        if !self.repair.crontab.is_empty() && cron::Schedule::from_str(&self.repair.crontab).is_err() {
            return Err(Error::ConfigFatal(format!(
                "invalid repair.crontab expression: {}",
                self.repair.crontab
            )));
        }
        if !self.update.crontab.is_empty() && cron::Schedule::from_str(&self.update.crontab).is_err() {
            return Err(Error::ConfigFatal(format!(
                "invalid update.crontab expression: {}",
                self.update.crontab
            )));
        }
        if self.update.vmss_action == VmssUpdateAction::Delete && self.update.failed_threshold == 0 {
            return Err(Error::ConfigFatal(
                "update.failed-threshold must be > 0 when update action is delete".to_string(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_plain_duration_units() {
        assert_eq!(parse_duration("30s").unwrap(), Duration::from_secs(30));
        assert_eq!(parse_duration("10m").unwrap(), Duration::from_secs(600));
        assert_eq!(parse_duration("1h").unwrap(), Duration::from_secs(3600));
    }

    #[test]
    fn rejects_unrecognized_unit() {
        assert!(parse_duration("10x").is_err());
    }

    #[test]
    fn provisioning_state_all_detects_wildcard() {
        let cfg = RepairConfig {
            crontab: String::new(),
            not_ready_threshold: Duration::from_secs(0),
            concurrency: 0,
            lock_duration: Duration::from_secs(0),
            lock_duration_error: Duration::from_secs(0),
            vmss_action: VmssRepairAction::Redeploy,
            vm_action: VmRepairAction::Redeploy,
            provisioning_state: vec!["*".to_string()],
            lock_annotation: String::new(),
        };
        assert!(cfg.provisioning_state_all());
    }
}
