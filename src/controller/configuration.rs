//! NixosConfiguration reconciliation.
//!
//! The per-resource state machine: resolve the target Machine, check
//! ownership, prepare the working tree, fingerprint the desired state,
//! decide whether remote work is needed, and drive the applier. Deletion
//! runs the optional tear-down before the finalizer is released.
//!
//! Status write order on success is load-bearing: the Machine's ownership
//! fields are patched before the configuration records the same
//! fingerprint, so a crash between the two writes is recovered by the
//! idempotence check on the next tick.

use std::sync::Arc;
use std::time::{Duration, Instant};

use chrono::Utc;
use kube::runtime::controller::Action;
use kube::ResourceExt;
use serde_json::json;
use tracing::{debug, info, warn};

use crate::api::configuration::{
    validate_hostname, validate_spec, validate_ssh_user, FileSource, Phase,
};
use crate::api::{Condition, Machine, NixosConfiguration, FINALIZER};
use crate::apply;
use crate::error::{Disposition, Error, Result};
use crate::facts;
use crate::fingerprint;
use crate::git;
use crate::inject::{self, ResolvedFile};
use crate::secrets::ScratchKey;
use crate::ssh::Target;

use super::Context;

const FOLLOWER_REQUEUE: Duration = Duration::from_secs(15);

struct Outcome {
    label: &'static str,
    action: Action,
}

pub async fn reconcile(config: Arc<NixosConfiguration>, ctx: Arc<Context>) -> Result<Action> {
    if !ctx.leadership.is_leader() {
        return Ok(Action::requeue(FOLLOWER_REQUEUE));
    }

    let started = Instant::now();
    let deleting = config.metadata.deletion_timestamp.is_some();
    let result = if deleting {
        reconcile_delete(&config, &ctx).await
    } else {
        reconcile_desired(&config, &ctx).await
    };

    match result {
        Ok(outcome) => {
            ctx.metrics
                .observe_reconcile(outcome.label, started.elapsed().as_secs_f64());
            Ok(outcome.action)
        }
        Err(error) => fail(&config, &ctx, error, deleting, started).await,
    }
}

pub fn error_policy(config: Arc<NixosConfiguration>, error: &Error, ctx: Arc<Context>) -> Action {
    let key = object_key(&config);
    let attempt = ctx.records.record_failure(&key);
    let delay = ctx.backoff.delay(attempt, error.disposition());
    debug!(configuration = %key, attempt, delay_secs = delay.as_secs(), reason = error.reason(), "requeueing after failure");
    Action::requeue(delay)
}

/// The normal (non-deleting) reconcile path.
async fn reconcile_desired(
    config: &NixosConfiguration,
    ctx: &Context,
) -> Result<Outcome> {
    let namespace = config.namespace().unwrap_or_default();
    let name = config.name_any();
    let key = object_key(config);

    validate_spec(&config.spec)?;
    ctx.resources.ensure_finalizer(config).await?;

    // Resolve the target machine and refuse to preempt another owner.
    let machine = ctx
        .resources
        .get_machine(&namespace, &config.spec.machine_ref.name)
        .await?;
    if let Some(owner) = machine.owner() {
        if owner != name {
            return Err(Error::Conflict {
                owner: owner.to_string(),
            });
        }
    }

    let key_file = machine_target_key(ctx, &machine).await?;
    let target = Target {
        host: &machine.spec.hostname,
        port: machine.spec.ssh_port,
        user: &machine.spec.ssh_user,
        key_path: key_file.path(),
    };
    ctx.ssh.probe(&target).await.map_err(|e| {
        ctx.metrics.ssh_failure(e.reason());
        e
    })?;

    // Transitional phases are only written when the object is not already
    // converged, so a no-op re-tick leaves status untouched.
    let converged = config
        .status
        .as_ref()
        .map(|s| {
            s.phase == Phase::Applied && s.observed_generation == config.metadata.generation
        })
        .unwrap_or(false);

    // Prepare the working tree and compute the desired-state fingerprint.
    if !converged {
        patch_phase(ctx, &namespace, &name, Phase::Resolving).await?;
    }
    let git_credential = match &config.spec.credentials_ref {
        Some(secret_ref) => Some(ctx.vault.git_credentials(&namespace, secret_ref).await?),
        None => None,
    };
    let (workspace, commit) = git::prepare(
        &ctx.config.workspace_base,
        &config.spec.git_repo,
        &config.spec.git_ref,
        git_credential,
    )
    .await?;

    if !converged {
        patch_phase(ctx, &namespace, &name, Phase::Building).await?;
    }
    let resolved = resolve_files(ctx, &namespace, config, &machine).await?;
    let injected = inject::inject(workspace.path(), &resolved)?;
    let desired_fingerprint = fingerprint::compute(&fingerprint::Inputs {
        commit: &commit,
        flake: &config.spec.flake,
        subdir: config.spec.configuration_subdir.as_deref(),
        full_install: config.spec.full_install,
        files: &injected,
    });
    ctx.records.update(&key, |r| {
        r.fingerprint = Some(desired_fingerprint.clone());
    });

    // Idempotence: converged machine means no remote work at all.
    let machine_fingerprint = machine
        .status
        .as_ref()
        .and_then(|s| s.applied_fingerprint.as_deref());
    if machine.owned_by(&name) && machine_fingerprint == Some(desired_fingerprint.as_str()) {
        debug!(configuration = %key, "fingerprint unchanged, skipping apply");
        let status_current = config
            .status
            .as_ref()
            .map(|s| {
                s.phase == Phase::Applied
                    && s.observed_generation == config.metadata.generation
                    && s.applied_fingerprint.as_deref() == Some(desired_fingerprint.as_str())
            })
            .unwrap_or(false);
        if !status_current {
            // Recovery for a crash between the two status writes of a
            // previous apply: the machine already records the fingerprint.
            patch_applied_status(ctx, config, &namespace, &name, &commit, &desired_fingerprint)
                .await?;
        }
        return Ok(Outcome {
            label: "noop",
            action: Action::requeue(ctx.config.reconcile_interval()),
        });
    }

    // Apply.
    patch_phase(ctx, &namespace, &name, Phase::Applying).await?;
    let mode = if config.spec.full_install {
        apply::Mode::Bootstrap
    } else {
        apply::Mode::Switch
    };
    ctx.resources
        .emit_event(
            config,
            "ApplyStarted",
            &format!(
                "applying commit {} to machine {} ({} mode)",
                &commit[..8],
                machine.name_any(),
                mode.label()
            ),
        )
        .await;

    run_applier(
        ctx,
        mode,
        &workspace,
        config.spec.configuration_subdir.as_deref(),
        &config.spec.flake,
        &machine,
        &target,
    )
    .await?;

    // Machine first, then configuration (crash-consistent recovery order).
    let now = Utc::now();
    ctx.resources
        .patch_status(
            &ctx.resources.machines(&namespace),
            &machine.name_any(),
            json!({
                "hasConfiguration": true,
                "appliedConfiguration": name,
                "appliedCommit": commit,
                "appliedFingerprint": desired_fingerprint,
                "lastAppliedAt": now,
            }),
        )
        .await?;
    patch_applied_status(ctx, config, &namespace, &name, &commit, &desired_fingerprint).await?;

    ctx.records.record_success(&key, &desired_fingerprint);
    ctx.resources
        .emit_event(
            config,
            "ApplySucceeded",
            &format!(
                "machine {} now at commit {}",
                machine.name_any(),
                &commit[..8]
            ),
        )
        .await;
    info!(configuration = %key, commit = %commit, "configuration applied");

    Ok(Outcome {
        label: "success",
        action: Action::requeue(ctx.config.reconcile_interval()),
    })
}

/// The deletion branch: optional tear-down, ownership release, finalizer.
async fn reconcile_delete(config: &NixosConfiguration, ctx: &Context) -> Result<Outcome> {
    let namespace = config.namespace().unwrap_or_default();
    let name = config.name_any();
    let key = object_key(config);

    if !config.finalizers().iter().any(|f| f == FINALIZER) {
        return Ok(Outcome {
            label: "noop",
            action: Action::await_change(),
        });
    }

    patch_phase(ctx, &namespace, &name, Phase::Deleting).await?;

    let machine = match ctx
        .resources
        .get_machine(&namespace, &config.spec.machine_ref.name)
        .await
    {
        Ok(machine) => Some(machine),
        Err(Error::MissingMachine { .. }) => None,
        Err(e) => return Err(e),
    };

    let owned = machine
        .as_ref()
        .map(|m| m.owned_by(&name))
        .unwrap_or(false);

    if owned {
        let machine = machine.as_ref().expect("owned implies machine present");
        if let Some(teardown_flake) = &config.spec.on_remove_flake {
            run_teardown(ctx, config, machine, teardown_flake, &key).await?;
        }
        // Release ownership so another configuration may claim the host.
        ctx.resources
            .patch_status(
                &ctx.resources.machines(&namespace),
                &machine.name_any(),
                json!({
                    "hasConfiguration": false,
                    "appliedConfiguration": null,
                    "appliedCommit": null,
                    "appliedFingerprint": null,
                }),
            )
            .await?;
    }

    ctx.resources.remove_finalizer(config).await?;
    ctx.records.remove(&key);
    info!(configuration = %key, "finalizer released");

    Ok(Outcome {
        label: "success",
        action: Action::await_change(),
    })
}

/// Apply the tear-down selector in switch mode, or skip it when the host
/// is unreachable and policy allows.
async fn run_teardown(
    ctx: &Context,
    config: &NixosConfiguration,
    machine: &Machine,
    teardown_flake: &str,
    key: &str,
) -> Result<()> {
    let namespace = config.namespace().unwrap_or_default();
    let key_file = machine_target_key(ctx, machine).await?;
    let target = Target {
        host: &machine.spec.hostname,
        port: machine.spec.ssh_port,
        user: &machine.spec.ssh_user,
        key_path: key_file.path(),
    };

    match ctx.ssh.probe(&target).await {
        Ok(_) => {}
        Err(e @ Error::Unreachable { .. }) if ctx.config.skip_teardown_on_unreachable => {
            warn!(configuration = %key, "machine unreachable, skipping tear-down by policy");
            ctx.resources
                .emit_warning(
                    config,
                    "TeardownSkipped",
                    &format!("tear-down skipped: {e}"),
                )
                .await;
            return Ok(());
        }
        Err(e) => {
            ctx.metrics.ssh_failure(e.reason());
            return Err(e);
        }
    }

    ctx.records.update(key, |r| r.teardown_attempted = true);

    let git_credential = match &config.spec.credentials_ref {
        Some(secret_ref) => Some(ctx.vault.git_credentials(&namespace, secret_ref).await?),
        None => None,
    };
    let (workspace, commit) = git::prepare(
        &ctx.config.workspace_base,
        &config.spec.git_repo,
        &config.spec.git_ref,
        git_credential,
    )
    .await?;
    let resolved = resolve_files(ctx, &namespace, config, machine).await?;
    inject::inject(workspace.path(), &resolved)?;

    ctx.resources
        .emit_event(
            config,
            "TeardownStarted",
            &format!(
                "applying tear-down selector {} at commit {}",
                teardown_flake,
                &commit[..8]
            ),
        )
        .await;

    run_applier(
        ctx,
        apply::Mode::Switch,
        &workspace,
        config.spec.configuration_subdir.as_deref(),
        teardown_flake,
        machine,
        &target,
    )
    .await?;

    ctx.resources
        .emit_event(config, "TeardownSucceeded", "tear-down configuration applied")
        .await;
    Ok(())
}

async fn run_applier(
    ctx: &Context,
    mode: apply::Mode,
    workspace: &git::Workspace,
    subdir: Option<&str>,
    flake: &str,
    machine: &Machine,
    target: &Target<'_>,
) -> Result<apply::Outcome> {
    let destination = target.destination();
    let request = apply::Request {
        mode,
        flake_dir: &workspace.flake_dir(subdir),
        flake,
        destination: &destination,
        ssh_port: machine.spec.ssh_port,
        key_path: target.key_path,
        ssh_options: &ctx.ssh.options_string(target),
        timeout: ctx.config.apply_timeout(),
        tail_limit: ctx.config.output_tail_bytes(),
    };
    match apply::run(&request).await {
        Ok(outcome) => {
            ctx.metrics
                .observe_apply(mode.label(), "success", outcome.duration.as_secs_f64());
            Ok(outcome)
        }
        Err(e) => {
            ctx.metrics.observe_apply(mode.label(), "failure", 0.0);
            Err(e)
        }
    }
}

/// Resolve additional-file contents from their declared sources.
async fn resolve_files(
    ctx: &Context,
    namespace: &str,
    config: &NixosConfiguration,
    machine: &Machine,
) -> Result<Vec<ResolvedFile>> {
    let mut resolved = Vec::with_capacity(config.spec.additional_files.len());
    for file in &config.spec.additional_files {
        let (contents, secret) = match file.source()? {
            FileSource::Inline(text) => (text.as_bytes().to_vec(), false),
            FileSource::Secret(selector) => {
                (ctx.vault.secret_value(namespace, selector).await?, true)
            }
            FileSource::HardwareFacts => {
                let empty = Default::default();
                let current = machine
                    .status
                    .as_ref()
                    .map(|s| &s.facts)
                    .unwrap_or(&empty);
                (facts::render_canonical(current).into_bytes(), false)
            }
        };
        resolved.push(ResolvedFile {
            path: file.path.clone(),
            contents,
            secret,
        });
    }
    Ok(resolved)
}

/// Resolve and materialize the machine's SSH key, validating the fields
/// that end up on a command line.
async fn machine_target_key(ctx: &Context, machine: &Machine) -> Result<ScratchKey> {
    validate_hostname(&machine.spec.hostname)?;
    validate_ssh_user(&machine.spec.ssh_user)?;
    let machine_namespace = machine.namespace().unwrap_or_default();
    let credential = ctx
        .vault
        .ssh_key(&machine_namespace, &machine.spec.ssh_key_secret_ref)
        .await?;
    ctx.vault.materialize_key(&credential)
}

async fn patch_phase(ctx: &Context, namespace: &str, name: &str, phase: Phase) -> Result<()> {
    ctx.resources
        .patch_status(
            &ctx.resources.configurations(namespace),
            name,
            json!({
                "phase": phase,
                "lastTransitionAt": Utc::now(),
            }),
        )
        .await
}

async fn patch_applied_status(
    ctx: &Context,
    config: &NixosConfiguration,
    namespace: &str,
    name: &str,
    commit: &str,
    desired_fingerprint: &str,
) -> Result<()> {
    let mut conditions = config
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    crate::api::upsert_condition(
        &mut conditions,
        Condition::new("Applied", true, "Success", "configuration successfully applied"),
    );
    ctx.resources
        .patch_status(
            &ctx.resources.configurations(namespace),
            name,
            json!({
                "phase": Phase::Applied,
                "observedGeneration": config.metadata.generation,
                "appliedCommit": commit,
                "appliedFingerprint": desired_fingerprint,
                "lastError": null,
                "lastTransitionAt": Utc::now(),
                "conditions": conditions,
            }),
        )
        .await
}

/// Classify a failure, surface it, and decide the requeue.
async fn fail(
    config: &NixosConfiguration,
    ctx: &Context,
    error: Error,
    deleting: bool,
    started: Instant,
) -> Result<Action> {
    let namespace = config.namespace().unwrap_or_default();
    let name = config.name_any();
    let key = object_key(config);
    let disposition = error.disposition();

    ctx.metrics
        .observe_reconcile("error", started.elapsed().as_secs_f64());

    let mut message = error.to_string();
    if let Error::ApplyFailed { tail, .. } = &error {
        if !tail.is_empty() {
            message = format!("{message}\n--- output tail ---\n{tail}");
        }
    }
    ctx.resources
        .emit_warning(config, error.reason(), &message)
        .await;

    // A deleting resource stays in Deleting; tear-down retries continue.
    let phase = if deleting { Phase::Deleting } else { Phase::Failed };
    let condition_type = if deleting { "TeardownFailed" } else { "Applied" };
    let mut conditions = config
        .status
        .as_ref()
        .map(|s| s.conditions.clone())
        .unwrap_or_default();
    crate::api::upsert_condition(
        &mut conditions,
        Condition::new(condition_type, deleting, error.reason(), &error.to_string()),
    );
    ctx.resources
        .patch_status(
            &ctx.resources.configurations(&namespace),
            &name,
            json!({
                "phase": phase,
                "lastError": error.to_string(),
                "lastTransitionAt": Utc::now(),
                "conditions": conditions,
            }),
        )
        .await?;

    match disposition {
        Disposition::Terminal => {
            warn!(configuration = %key, reason = error.reason(), "terminal failure, waiting for edit");
            Ok(Action::requeue(ctx.config.reconcile_interval()))
        }
        _ => {
            let attempt = ctx.records.record_failure(&key);
            if matches!(error, Error::ApplyFailed { .. })
                && attempt >= ctx.backoff.max_attempts()
            {
                warn!(
                    configuration = %key,
                    attempt,
                    "apply retries exhausted, parking until next edit or interval"
                );
                return Ok(Action::requeue(ctx.config.reconcile_interval()));
            }
            let delay = ctx.backoff.delay(attempt, disposition);
            debug!(configuration = %key, attempt, delay_secs = delay.as_secs(), "retrying with backoff");
            Ok(Action::requeue(delay))
        }
    }
}

fn object_key(config: &NixosConfiguration) -> String {
    format!(
        "{}/{}",
        config.namespace().unwrap_or_default(),
        config.name_any()
    )
}
