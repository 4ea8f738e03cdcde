//! Machine reconciliation: reachability discovery and hardware facts.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::api::{configuration, Condition, Machine};
use crate::error::{Error, Result};
use crate::facts;
use crate::ssh::Target;

use super::Context;

/// How long a follower waits before checking leadership again.
const FOLLOWER_REQUEUE: Duration = Duration::from_secs(15);

pub async fn reconcile(machine: Arc<Machine>, ctx: Arc<Context>) -> Result<Action> {
    if !ctx.leadership.is_leader() {
        return Ok(Action::requeue(FOLLOWER_REQUEUE));
    }

    let namespace = machine.namespace().unwrap_or_default();
    let name = machine.name_any();
    let key = format!("{namespace}/{name}");

    configuration::validate_hostname(&machine.spec.hostname)?;
    configuration::validate_ssh_user(&machine.spec.ssh_user)?;

    let credential = match ctx
        .vault
        .ssh_key(&namespace, &machine.spec.ssh_key_secret_ref)
        .await
    {
        Ok(credential) => credential,
        Err(e) => {
            ctx.resources
                .emit_warning(machine.as_ref(), e.reason(), &e.to_string())
                .await;
            mark_unreachable(&ctx, &machine, &namespace, &name, &e).await?;
            return Err(e);
        }
    };
    let key_file = ctx.vault.materialize_key(&credential)?;
    let target = Target {
        host: &machine.spec.hostname,
        port: machine.spec.ssh_port,
        user: &machine.spec.ssh_user,
        key_path: key_file.path(),
    };

    let pinned_before = ctx
        .ssh
        .known_hosts()
        .has(&machine.spec.hostname, machine.spec.ssh_port);

    match ctx.ssh.probe(&target).await {
        Ok(latency) => {
            debug!(machine = %name, latency_ms = latency.as_millis() as u64, "probe ok");
            if !pinned_before
                && ctx
                    .ssh
                    .known_hosts()
                    .has(&machine.spec.hostname, machine.spec.ssh_port)
            {
                info!(machine = %name, host = %machine.spec.hostname, "host key learned");
                ctx.resources
                    .emit_event(
                        machine.as_ref(),
                        "HostKeyLearned",
                        &format!("pinned host key for {} on first use", machine.spec.hostname),
                    )
                    .await;
            }

            let mut conditions = current_conditions(&machine);
            crate::api::upsert_condition(
                &mut conditions,
                Condition::new("Reachable", true, "ProbeSucceeded", "ssh probe succeeded"),
            );
            if conditions.iter().any(|c| c.r#type == "HostKeyMismatch") {
                crate::api::upsert_condition(
                    &mut conditions,
                    Condition::new(
                        "HostKeyMismatch",
                        false,
                        "HostKeyVerified",
                        "pinned host key matches again",
                    ),
                );
            }
            ctx.resources
                .patch_status(
                    &ctx.resources.machines(&namespace),
                    &name,
                    json!({
                        "reachable": true,
                        "lastReachableAt": Utc::now(),
                        "conditions": conditions,
                    }),
                )
                .await?;

            maybe_scan_facts(&ctx, &namespace, &name, &key, &target).await;
            ctx.records.update(&key, |r| r.retries = 0);
        }
        Err(e @ Error::HostKeyMismatch { .. }) => {
            ctx.metrics.ssh_failure(e.reason());
            warn!(machine = %name, "host key mismatch, refusing connection");
            ctx.resources
                .emit_warning(
                    machine.as_ref(),
                    "HostKeyMismatch",
                    &format!(
                        "host key for {} differs from the pinned fingerprint; \
                         run `nixos-operator known-hosts clear --host {}` after verifying",
                        machine.spec.hostname, machine.spec.hostname
                    ),
                )
                .await;
            let mut conditions = current_conditions(&machine);
            crate::api::upsert_condition(
                &mut conditions,
                Condition::new("HostKeyMismatch", true, "HostKeyMismatch", &e.to_string()),
            );
            crate::api::upsert_condition(
                &mut conditions,
                Condition::new("Reachable", false, "HostKeyMismatch", &e.to_string()),
            );
            ctx.resources
                .patch_status(
                    &ctx.resources.machines(&namespace),
                    &name,
                    json!({ "reachable": false, "conditions": conditions }),
                )
                .await?;
            // Terminal until the operator adjudicates; keep the normal
            // discovery cadence rather than a retry storm.
        }
        Err(e) => {
            ctx.metrics.ssh_failure(e.reason());
            mark_unreachable(&ctx, &machine, &namespace, &name, &e).await?;
            return Err(e);
        }
    }

    update_gauges(&ctx).await;
    Ok(Action::requeue(ctx.config.discovery_interval()))
}

pub fn error_policy(machine: Arc<Machine>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = format!(
        "{}/{}",
        machine.namespace().unwrap_or_default(),
        machine.name_any()
    );
    let attempt = ctx.records.record_failure(&key);
    let delay = ctx.backoff.delay(attempt, error.disposition());
    debug!(machine = %key, attempt, delay_secs = delay.as_secs(), reason = error.reason(), "requeueing after failure");
    Action::requeue(delay)
}

async fn mark_unreachable(
    ctx: &Context,
    machine: &Machine,
    namespace: &str,
    name: &str,
    error: &Error,
) -> Result<()> {
    let mut conditions = current_conditions(machine);
    crate::api::upsert_condition(
        &mut conditions,
        Condition::new("Reachable", false, error.reason(), &error.to_string()),
    );
    ctx.resources
        .patch_status(
            &ctx.resources.machines(namespace),
            name,
            json!({ "reachable": false, "conditions": conditions }),
        )
        .await
}

/// Refresh hardware facts when the last scan is older than the configured
/// interval. Failures are logged and retried at the next due scan; they do
/// not fail discovery.
async fn maybe_scan_facts(
    ctx: &Context,
    namespace: &str,
    name: &str,
    key: &str,
    target: &Target<'_>,
) {
    let due = {
        let scanned = ctx.facts_scanned.lock().unwrap();
        scanned
            .get(key)
            .map(|at| at.elapsed() >= ctx.config.hardware_scan_interval())
            .unwrap_or(true)
    };
    if !due {
        return;
    }

    match scan_facts(ctx, target).await {
        Ok(facts) if !facts.is_empty() => {
            info!(machine = %name, facts = facts.len(), "hardware facts refreshed");
            let patch_result = ctx
                .resources
                .patch_status(
                    &ctx.resources.machines(namespace),
                    name,
                    json!({ "facts": facts }),
                )
                .await;
            match patch_result {
                Ok(()) => {
                    ctx.facts_scanned
                        .lock()
                        .unwrap()
                        .insert(key.to_string(), Instant::now());
                }
                Err(e) => warn!(machine = %name, error = %e, "failed to patch facts"),
            }
        }
        Ok(_) => warn!(machine = %name, "fact probe returned no output"),
        Err(e) => {
            ctx.metrics.ssh_failure(e.reason());
            warn!(machine = %name, error = %e, "hardware scan failed");
        }
    }
}

async fn scan_facts(
    ctx: &Context,
    target: &Target<'_>,
) -> Result<std::collections::BTreeMap<String, String>> {
    let remote_path = format!("/tmp/nio-facts-{}.sh", uuid::Uuid::new_v4());
    let deadline = Duration::from_secs(60);
    ctx.ssh
        .upload(target, facts::PROBE_SCRIPT.as_bytes(), &remote_path, 0o755, deadline)
        .await?;
    let result = ctx
        .ssh
        .run_checked(target, &remote_path, None, deadline)
        .await;
    // Best-effort cleanup regardless of probe outcome.
    let _ = ctx
        .ssh
        .run(target, &format!("rm -f {remote_path}"), None, Duration::from_secs(10), &mut |_, _| {})
        .await;
    Ok(facts::parse(&result?.stdout))
}

async fn update_gauges(ctx: &Context) {
    let api: kube::Api<Machine> = kube::Api::all(ctx.resources.client());
    match api.list(&Default::default()).await {
        Ok(list) => {
            let total = list.items.len() as i64;
            let reachable = list
                .items
                .iter()
                .filter(|m| m.status.as_ref().map(|s| s.reachable).unwrap_or(false))
                .count() as i64;
            ctx.metrics.managed_machines.set(total);
            ctx.metrics.machines_reachable.set(reachable);
        }
        Err(e) => debug!(error = %e, "failed to refresh machine gauges"),
    }
}

fn current_conditions(machine: &Machine) -> Vec<Condition> {
    machine
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default()
}
