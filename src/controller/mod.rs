//! Reconciliation controllers.
//!
//! One controller per resource kind, both driven by the kube runtime: it
//! provides per-key mutual exclusion (no two ticks for the same object run
//! concurrently), watch-event triggers, periodic requeue ticks, and the
//! backoff queue fed by the error policy.

pub mod configuration;
pub mod machine;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use futures::StreamExt;
use kube::runtime::controller::{self, Controller};
use kube::runtime::watcher;
use kube::Api;
use tracing::{info, warn};

use crate::api::{Machine, NixosConfiguration};
use crate::client::Resources;
use crate::config::Config;
use crate::error::Result;
use crate::leader::Leadership;
use crate::metrics::Metrics;
use crate::retry::{Backoff, Records};
use crate::secrets::Vault;
use crate::server::Health;
use crate::ssh::Ssh;

/// Shared state handed to every reconcile invocation.
pub struct Context {
    pub config: Config,
    pub resources: Resources,
    pub vault: Vault,
    pub ssh: Ssh,
    pub metrics: Metrics,
    pub records: Records,
    pub backoff: Backoff,
    pub leadership: Leadership,
    /// Last completed hardware scan per machine key.
    pub facts_scanned: Mutex<HashMap<String, Instant>>,
}

impl Context {
    pub fn new(
        config: Config,
        resources: Resources,
        vault: Vault,
        ssh: Ssh,
        metrics: Metrics,
        leadership: Leadership,
    ) -> Self {
        let backoff = Backoff::new(&config.retry);
        Self {
            config,
            resources,
            vault,
            ssh,
            metrics,
            records: Records::new(),
            backoff,
            leadership,
            facts_scanned: Mutex::new(HashMap::new()),
        }
    }
}

/// Run both controllers until shutdown.
pub async fn run(ctx: Arc<Context>, health: Health) -> Result<(), anyhow::Error> {
    let client = ctx.resources.client();
    let machines: Api<Machine> = Api::all(client.clone());
    let configurations: Api<NixosConfiguration> = Api::all(client);

    let controller_config =
        controller::Config::default().concurrency(ctx.config.concurrency);

    let machine_controller = Controller::new(machines, watcher::Config::default())
        .with_config(controller_config.clone())
        .shutdown_on_signal()
        .run(machine::reconcile, machine::error_policy, ctx.clone())
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => tracing::debug!(machine = %object.name, "reconciled"),
                Err(e) => warn!(error = %e, "machine reconcile failed"),
            }
        });

    let configuration_controller = Controller::new(configurations, watcher::Config::default())
        .with_config(controller_config)
        .shutdown_on_signal()
        .run(
            configuration::reconcile,
            configuration::error_policy,
            ctx.clone(),
        )
        .for_each(|result| async move {
            match result {
                Ok((object, _)) => {
                    tracing::debug!(configuration = %object.name, "reconciled")
                }
                Err(e) => warn!(error = %e, "configuration reconcile failed"),
            }
        });

    health.mark_ready();
    info!("controllers running");
    tokio::join!(machine_controller, configuration_controller);
    health.mark_not_ready();
    info!("controllers stopped");
    Ok(())
}
