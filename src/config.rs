use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use figment::providers::{Env, Serialized};
use figment::Figment;
use serde::{Deserialize, Serialize};

/// Operator configuration. Every tunable comes from the environment with the
/// `NIO_` prefix (nested fields via `__`, e.g. `NIO_RETRY__MAX_ATTEMPTS`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// Base directory for per-reconcile working trees and scratch key files.
    #[serde(default = "default_workspace_base")]
    pub workspace_base: PathBuf,
    /// Path of the pinned known-hosts file.
    #[serde(default = "default_known_hosts_path")]
    pub known_hosts_path: PathBuf,
    /// Seconds between reachability probes per Machine.
    #[serde(default = "default_discovery_interval")]
    pub machine_discovery_interval_secs: u64,
    /// Seconds between hardware fact refreshes per Machine.
    #[serde(default = "default_hardware_scan_interval")]
    pub hardware_scan_interval_secs: u64,
    /// Seconds between periodic reconciles per NixosConfiguration.
    #[serde(default = "default_reconcile_interval")]
    pub config_reconcile_interval_secs: u64,
    /// Upper bound for one apply invocation.
    #[serde(default = "default_apply_timeout")]
    pub apply_timeout_secs: u64,
    /// SSH connection establishment timeout.
    #[serde(default = "default_ssh_connect_timeout")]
    pub ssh_connect_timeout_secs: u64,
    #[serde(default)]
    pub retry: RetryConfig,
    /// How many KiB of applier output to keep for status and events.
    #[serde(default = "default_output_tail_kib")]
    pub output_tail_kib: usize,
    /// Skip the tear-down apply when the Machine has been unreachable.
    #[serde(default = "default_true")]
    pub skip_teardown_on_unreachable: bool,
    /// Maximum reconciles running in parallel.
    #[serde(default = "default_concurrency")]
    pub concurrency: u16,
    #[serde(default)]
    pub leader: LeaderConfig,
    #[serde(default = "default_metrics_port")]
    pub metrics_port: u16,
    #[serde(default = "default_health_port")]
    pub health_port: u16,
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RetryConfig {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_initial_delay")]
    pub initial_delay_secs: f64,
    #[serde(default = "default_max_delay")]
    pub max_delay_secs: f64,
    /// Separate, longer cap for unreachable hosts.
    #[serde(default = "default_unreachable_max_delay")]
    pub unreachable_max_delay_secs: f64,
    #[serde(default = "default_exponential_base")]
    pub exponential_base: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            initial_delay_secs: default_initial_delay(),
            max_delay_secs: default_max_delay(),
            unreachable_max_delay_secs: default_unreachable_max_delay(),
            exponential_base: default_exponential_base(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LeaderConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_lease_name")]
    pub lease_name: String,
    #[serde(default = "default_lease_namespace")]
    pub lease_namespace: String,
    #[serde(default = "default_lease_duration")]
    pub lease_duration_secs: u64,
    #[serde(default = "default_renew_interval")]
    pub renew_interval_secs: u64,
}

impl Default for LeaderConfig {
    fn default() -> Self {
        Self {
            enabled: default_true(),
            lease_name: default_lease_name(),
            lease_namespace: default_lease_namespace(),
            lease_duration_secs: default_lease_duration(),
            renew_interval_secs: default_renew_interval(),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            workspace_base: default_workspace_base(),
            known_hosts_path: default_known_hosts_path(),
            machine_discovery_interval_secs: default_discovery_interval(),
            hardware_scan_interval_secs: default_hardware_scan_interval(),
            config_reconcile_interval_secs: default_reconcile_interval(),
            apply_timeout_secs: default_apply_timeout(),
            ssh_connect_timeout_secs: default_ssh_connect_timeout(),
            retry: RetryConfig::default(),
            output_tail_kib: default_output_tail_kib(),
            skip_teardown_on_unreachable: default_true(),
            concurrency: default_concurrency(),
            leader: LeaderConfig::default(),
            metrics_port: default_metrics_port(),
            health_port: default_health_port(),
            log_level: default_log_level(),
        }
    }
}

impl Config {
    pub fn apply_timeout(&self) -> Duration {
        Duration::from_secs(self.apply_timeout_secs)
    }

    pub fn ssh_connect_timeout(&self) -> Duration {
        Duration::from_secs(self.ssh_connect_timeout_secs)
    }

    pub fn discovery_interval(&self) -> Duration {
        Duration::from_secs(self.machine_discovery_interval_secs)
    }

    pub fn hardware_scan_interval(&self) -> Duration {
        Duration::from_secs(self.hardware_scan_interval_secs)
    }

    pub fn reconcile_interval(&self) -> Duration {
        Duration::from_secs(self.config_reconcile_interval_secs)
    }

    pub fn output_tail_bytes(&self) -> usize {
        self.output_tail_kib * 1024
    }
}

fn default_workspace_base() -> PathBuf {
    // Memory-backed so secret material never touches persistent disk.
    PathBuf::from("/dev/shm/nixos-operator")
}
fn default_known_hosts_path() -> PathBuf {
    PathBuf::from("/var/lib/nixos-operator/known_hosts")
}
fn default_discovery_interval() -> u64 {
    60
}
fn default_hardware_scan_interval() -> u64 {
    300
}
fn default_reconcile_interval() -> u64 {
    120
}
fn default_apply_timeout() -> u64 {
    3600
}
fn default_ssh_connect_timeout() -> u64 {
    10
}
fn default_max_attempts() -> u32 {
    3
}
fn default_initial_delay() -> f64 {
    2.0
}
fn default_max_delay() -> f64 {
    30.0
}
fn default_unreachable_max_delay() -> f64 {
    300.0
}
fn default_exponential_base() -> f64 {
    2.0
}
fn default_output_tail_kib() -> usize {
    64
}
fn default_true() -> bool {
    true
}
fn default_concurrency() -> u16 {
    4
}
fn default_lease_name() -> String {
    "nixos-operator-leader".to_string()
}
fn default_lease_namespace() -> String {
    "default".to_string()
}
fn default_lease_duration() -> u64 {
    15
}
fn default_renew_interval() -> u64 {
    5
}
fn default_metrics_port() -> u16 {
    8000
}
fn default_health_port() -> u16 {
    8080
}
fn default_log_level() -> String {
    "info".to_string()
}

/// Build the figment provider chain: defaults, then `NIO_*` env vars.
fn figment() -> Figment {
    Figment::from(Serialized::defaults(Config::default()))
        .merge(Env::prefixed("NIO_").split("__"))
}

/// Load config from the environment.
pub fn load() -> Result<Config> {
    figment()
        .extract()
        .map_err(|e| anyhow::anyhow!("config error: {}", e))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.machine_discovery_interval_secs, 60);
        assert_eq!(config.config_reconcile_interval_secs, 120);
        assert_eq!(config.apply_timeout_secs, 3600);
        assert_eq!(config.retry.max_attempts, 3);
        assert_eq!(config.retry.initial_delay_secs, 2.0);
        assert_eq!(config.retry.max_delay_secs, 30.0);
        assert_eq!(config.retry.unreachable_max_delay_secs, 300.0);
        assert_eq!(config.metrics_port, 8000);
        assert_eq!(config.health_port, 8080);
        assert!(config.skip_teardown_on_unreachable);
    }

    #[test]
    fn tail_budget_is_in_bytes() {
        let config = Config::default();
        assert_eq!(config.output_tail_bytes(), 64 * 1024);
    }
}
