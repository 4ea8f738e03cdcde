//! Lease-based leader election.
//!
//! Multiple replicas may run; exactly one holds the coordination Lease and
//! performs reconciliation. Non-leaders keep their watch caches warm and
//! take over when the lease expires. Write conflicts mean another replica
//! won the round, which is the intended outcome.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use k8s_openapi::api::coordination::v1::{Lease, LeaseSpec};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::MicroTime;
use kube::api::{Patch, PatchParams, PostParams};
use kube::{Api, Client};
use serde_json::json;
use tracing::{debug, info, warn};

use crate::config::LeaderConfig;

/// Cheap handle controllers consult before doing any work.
#[derive(Clone, Default)]
pub struct Leadership {
    is_leader: Arc<AtomicBool>,
}

impl Leadership {
    /// A handle that always reports leadership, for single-replica runs
    /// with election disabled.
    pub fn always() -> Self {
        let handle = Self::default();
        handle.is_leader.store(true, Ordering::Relaxed);
        handle
    }

    pub fn is_leader(&self) -> bool {
        self.is_leader.load(Ordering::Relaxed)
    }

    fn set(&self, value: bool) {
        let previous = self.is_leader.swap(value, Ordering::Relaxed);
        if previous != value {
            if value {
                info!("acquired leadership");
            } else {
                warn!("lost leadership");
            }
        }
    }
}

pub struct Elector {
    api: Api<Lease>,
    config: LeaderConfig,
    identity: String,
    handle: Leadership,
}

impl Elector {
    pub fn new(client: Client, config: LeaderConfig) -> Self {
        let api = Api::namespaced(client, &config.lease_namespace);
        let identity = hostname::get()
            .ok()
            .and_then(|h| h.into_string().ok())
            .unwrap_or_else(|| format!("nixos-operator-{}", std::process::id()));
        Self {
            api,
            config,
            identity,
            handle: Leadership::default(),
        }
    }

    pub fn handle(&self) -> Leadership {
        self.handle.clone()
    }

    /// Acquire-and-renew loop; runs for the lifetime of the process.
    pub async fn run(self) {
        let interval = Duration::from_secs(self.config.renew_interval_secs);
        loop {
            match self.try_acquire().await {
                Ok(leading) => self.handle.set(leading),
                Err(e) => {
                    warn!(error = %e, "lease update failed");
                    self.handle.set(false);
                }
            }
            tokio::time::sleep(interval).await;
        }
    }

    async fn try_acquire(&self) -> Result<bool, kube::Error> {
        let name = &self.config.lease_name;
        match self.api.get_opt(name).await? {
            None => match self.api.create(&PostParams::default(), &self.fresh_lease()).await {
                Ok(_) => Ok(true),
                Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(false),
                Err(e) => Err(e),
            },
            Some(lease) => {
                let spec = lease.spec.unwrap_or_default();
                let holder = spec.holder_identity.as_deref().unwrap_or("");
                if holder == self.identity {
                    self.renew(&lease.metadata, &spec, false).await
                } else if self.expired(&spec) {
                    debug!(previous = holder, "lease expired, attempting takeover");
                    self.renew(&lease.metadata, &spec, true).await
                } else {
                    Ok(false)
                }
            }
        }
    }

    fn expired(&self, spec: &LeaseSpec) -> bool {
        let duration = spec
            .lease_duration_seconds
            .unwrap_or(self.config.lease_duration_secs as i32);
        match &spec.renew_time {
            Some(MicroTime(renewed)) => {
                Utc::now().signed_duration_since(*renewed).num_seconds() > duration as i64
            }
            None => true,
        }
    }

    async fn renew(
        &self,
        metadata: &kube::core::ObjectMeta,
        spec: &LeaseSpec,
        takeover: bool,
    ) -> Result<bool, kube::Error> {
        let now = MicroTime(Utc::now());
        let transitions = spec.lease_transitions.unwrap_or(0) + i32::from(takeover);
        let acquire_time = if takeover {
            Some(now.clone())
        } else {
            spec.acquire_time.clone()
        };
        let patch = json!({
            "metadata": { "resourceVersion": metadata.resource_version },
            "spec": {
                "holderIdentity": self.identity,
                "leaseDurationSeconds": self.config.lease_duration_secs,
                "renewTime": now,
                "acquireTime": acquire_time,
                "leaseTransitions": transitions,
            }
        });
        // resourceVersion makes the patch optimistic: a concurrent renewal
        // from another replica wins and this one stands down.
        match self
            .api
            .patch(
                &self.config.lease_name,
                &PatchParams::default(),
                &Patch::Merge(&patch),
            )
            .await
        {
            Ok(_) => Ok(true),
            Err(kube::Error::Api(resp)) if resp.code == 409 => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn fresh_lease(&self) -> Lease {
        let now = MicroTime(Utc::now());
        Lease {
            metadata: kube::core::ObjectMeta {
                name: Some(self.config.lease_name.clone()),
                ..Default::default()
            },
            spec: Some(LeaseSpec {
                holder_identity: Some(self.identity.clone()),
                lease_duration_seconds: Some(self.config.lease_duration_secs as i32),
                acquire_time: Some(now.clone()),
                renew_time: Some(now),
                lease_transitions: Some(0),
                ..Default::default()
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn handle_defaults_to_follower() {
        let handle = Leadership::default();
        assert!(!handle.is_leader());
        handle.set(true);
        assert!(handle.is_leader());
    }

    #[test]
    fn always_handle_reports_leader() {
        assert!(Leadership::always().is_leader());
    }
}
