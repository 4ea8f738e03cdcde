//! `nixos-operator run`: start the reconciliation engine.

use std::sync::Arc;

use anyhow::{Context as _, Result};
use tracing::info;

use crate::client::Resources;
use crate::config::{self, Config};
use crate::controller::{self, Context};
use crate::known_hosts::KnownHosts;
use crate::leader::{Elector, Leadership};
use crate::metrics::Metrics;
use crate::secrets::Vault;
use crate::server::{self, Health};
use crate::ssh::Ssh;

pub fn run() -> Result<()> {
    let config = config::load()?;

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(&config.log_level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .json()
        .init();

    info!(version = env!("CARGO_PKG_VERSION"), "nixos-operator starting");

    // Build tokio runtime explicitly (no #[tokio::main] on fn main)
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(run_operator(config))
}

async fn run_operator(config: Config) -> Result<()> {
    let client = kube::Client::try_default()
        .await
        .context("connecting to the cluster")?;
    let resources = Resources::new(client.clone());

    std::fs::create_dir_all(&config.workspace_base)
        .with_context(|| format!("creating {}", config.workspace_base.display()))?;
    let known_hosts = Arc::new(KnownHosts::open(config.known_hosts_path.clone())?);
    let ssh = Ssh::new(known_hosts, config.ssh_connect_timeout());
    let vault = Vault::new(resources.clone(), config.workspace_base.clone());
    let metrics = Metrics::new().context("registering metrics")?;
    let health = Health::new();

    let leadership = if config.leader.enabled {
        let elector = Elector::new(client, config.leader.clone());
        let handle = elector.handle();
        tokio::spawn(elector.run());
        handle
    } else {
        info!("leader election disabled, assuming leadership");
        Leadership::always()
    };

    let health_port = config.health_port;
    let metrics_port = config.metrics_port;
    let ctx = Arc::new(Context::new(
        config,
        resources,
        vault,
        ssh,
        metrics.clone(),
        leadership,
    ));

    // A listener that cannot bind is a fatal initialization failure; the
    // controllers run until the shutdown signal.
    tokio::select! {
        result = server::run_health(health_port, health.clone()) => result?,
        result = server::run_metrics(metrics_port, metrics) => result?,
        result = controller::run(ctx, health.clone()) => result?,
    }

    info!("nixos-operator stopped");
    Ok(())
}
