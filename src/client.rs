//! Typed access to the cluster store.
//!
//! Wraps the raw Kubernetes client with the contracts the engine relies on:
//! status merge-patches retry internally on write conflicts (up to a small
//! bound), mutating calls surface 404s instead of swallowing them, and event
//! emission is fire-and-forget.

use std::collections::BTreeMap;

use k8s_openapi::api::core::v1::Secret;
use kube::api::{Patch, PatchParams};
use kube::runtime::events::{Event, EventType, Recorder, Reporter};
use kube::runtime::reflector::ObjectRef;
use kube::{Api, Client, Resource, ResourceExt};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, warn};

use crate::api::{Machine, NixosConfiguration, SecretRef, FINALIZER};
use crate::error::{Error, Result};

const CONFLICT_RETRIES: u32 = 5;
const FIELD_MANAGER: &str = "nixos-operator";

#[derive(Clone)]
pub struct Resources {
    client: Client,
    recorder: Recorder,
}

impl Resources {
    pub fn new(client: Client) -> Self {
        let reporter = Reporter {
            controller: FIELD_MANAGER.into(),
            instance: hostname::get().ok().and_then(|h| h.into_string().ok()),
        };
        let recorder = Recorder::new(client.clone(), reporter);
        Self { client, recorder }
    }

    pub fn client(&self) -> Client {
        self.client.clone()
    }

    pub fn machines(&self, namespace: &str) -> Api<Machine> {
        Api::namespaced(self.client.clone(), namespace)
    }

    pub fn configurations(&self, namespace: &str) -> Api<NixosConfiguration> {
        Api::namespaced(self.client.clone(), namespace)
    }

    /// Fetch the Machine a configuration references. A 404 becomes the
    /// terminal `MissingMachine` classification.
    pub async fn get_machine(&self, namespace: &str, name: &str) -> Result<Machine> {
        match self.machines(namespace).get(name).await {
            Ok(machine) => Ok(machine),
            Err(kube::Error::Api(resp)) if resp.code == 404 => Err(Error::MissingMachine {
                name: name.to_string(),
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Merge-patch the status subresource, retrying on write conflicts.
    pub async fn patch_status<K>(
        &self,
        api: &Api<K>,
        name: &str,
        status: serde_json::Value,
    ) -> Result<()>
    where
        K: Resource + Clone + DeserializeOwned + Serialize + std::fmt::Debug,
    {
        let patch = Patch::Merge(json!({ "status": status }));
        let params = PatchParams::apply(FIELD_MANAGER);
        for attempt in 1..=CONFLICT_RETRIES {
            match api.patch_status(name, &params, &patch).await {
                Ok(_) => return Ok(()),
                Err(kube::Error::Api(resp)) if resp.code == 409 => {
                    debug!(name, attempt, "status patch conflicted, retrying");
                    continue;
                }
                Err(e) => return Err(e.into()),
            }
        }
        Err(Error::StatusConflict {
            attempts: CONFLICT_RETRIES,
        })
    }

    /// Ensure the engine finalizer is present on a configuration.
    pub async fn ensure_finalizer(&self, config: &NixosConfiguration) -> Result<()> {
        if config.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        let namespace = config.namespace().unwrap_or_default();
        let mut finalizers = config.finalizers().to_vec();
        finalizers.push(FINALIZER.to_string());
        self.patch_finalizers(&namespace, &config.name_any(), finalizers)
            .await
    }

    /// Remove the engine finalizer, releasing the object for deletion.
    pub async fn remove_finalizer(&self, config: &NixosConfiguration) -> Result<()> {
        if !config.finalizers().iter().any(|f| f == FINALIZER) {
            return Ok(());
        }
        let namespace = config.namespace().unwrap_or_default();
        let finalizers: Vec<String> = config
            .finalizers()
            .iter()
            .filter(|f| *f != FINALIZER)
            .cloned()
            .collect();
        self.patch_finalizers(&namespace, &config.name_any(), finalizers)
            .await
    }

    async fn patch_finalizers(
        &self,
        namespace: &str,
        name: &str,
        finalizers: Vec<String>,
    ) -> Result<()> {
        let patch = Patch::Merge(json!({ "metadata": { "finalizers": finalizers } }));
        self.configurations(namespace)
            .patch(name, &PatchParams::apply(FIELD_MANAGER), &patch)
            .await?;
        Ok(())
    }

    /// Emit a normal-type event. Failures are logged, never propagated.
    pub async fn emit_event<K>(&self, object: &K, reason: &str, message: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(object, EventType::Normal, reason, message).await;
    }

    /// Emit a warning-type event. Failures are logged, never propagated.
    pub async fn emit_warning<K>(&self, object: &K, reason: &str, message: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        self.publish(object, EventType::Warning, reason, message).await;
    }

    async fn publish<K>(&self, object: &K, type_: EventType, reason: &str, message: &str)
    where
        K: Resource<DynamicType = ()>,
    {
        let event = Event {
            type_,
            reason: reason.to_string(),
            note: Some(message.to_string()),
            action: "Reconcile".to_string(),
            secondary: None,
        };
        let reference: k8s_openapi::api::core::v1::ObjectReference =
            ObjectRef::from_obj(object).into();
        if let Err(e) = self.recorder.publish(&event, &reference).await {
            warn!(reason, error = %e, "failed to emit event");
        }
    }

    /// Read a secret's data map. 404 surfaces as `SecretMissing`.
    pub async fn read_secret(
        &self,
        default_namespace: &str,
        secret_ref: &SecretRef,
    ) -> Result<BTreeMap<String, Vec<u8>>> {
        let namespace = secret_ref
            .namespace
            .as_deref()
            .unwrap_or(default_namespace);
        let api: Api<Secret> = Api::namespaced(self.client.clone(), namespace);
        let secret = match api.get(&secret_ref.name).await {
            Ok(secret) => secret,
            Err(kube::Error::Api(resp)) if resp.code == 404 => {
                return Err(Error::SecretMissing {
                    namespace: namespace.to_string(),
                    name: secret_ref.name.clone(),
                })
            }
            Err(e) => return Err(e.into()),
        };
        Ok(secret
            .data
            .unwrap_or_default()
            .into_iter()
            .map(|(k, v)| (k, v.0))
            .collect())
    }
}
