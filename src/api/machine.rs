//! The Machine resource: one remotely reachable NixOS host.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::Condition;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "nixos.infra",
    version = "v1alpha1",
    kind = "Machine",
    namespaced,
    plural = "machines",
    status = "MachineStatus",
    printcolumn = r#"{"name":"Hostname","type":"string","jsonPath":".spec.hostname"}"#,
    printcolumn = r#"{"name":"Reachable","type":"boolean","jsonPath":".status.reachable"}"#,
    printcolumn = r#"{"name":"Configuration","type":"string","jsonPath":".status.appliedConfiguration"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct MachineSpec {
    /// DNS name or IP literal of the host.
    pub hostname: String,
    #[serde(default = "default_ssh_user")]
    pub ssh_user: String,
    /// Secret holding the SSH private key under `ssh-privatekey`.
    pub ssh_key_secret_ref: SecretRef,
    #[serde(default = "default_ssh_port")]
    pub ssh_port: u16,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretRef {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineStatus {
    #[serde(default)]
    pub reachable: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_reachable_at: Option<DateTime<Utc>>,
    /// Flat `key=value` hardware facts gathered over SSH.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub facts: BTreeMap<String, String>,
    #[serde(default)]
    pub has_configuration: bool,
    /// Name of the NixosConfiguration currently owning this host.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_configuration: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_applied_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

fn default_ssh_user() -> String {
    "root".to_string()
}

fn default_ssh_port() -> u16 {
    22
}

impl Machine {
    /// Whether this machine is owned by the named configuration.
    pub fn owned_by(&self, configuration: &str) -> bool {
        self.status
            .as_ref()
            .and_then(|s| s.applied_configuration.as_deref())
            .map(|owner| owner == configuration)
            .unwrap_or(false)
    }

    /// The current owner, if any.
    pub fn owner(&self) -> Option<&str> {
        self.status
            .as_ref()
            .and_then(|s| s.applied_configuration.as_deref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn spec_defaults_user_and_port() {
        let spec: MachineSpec = serde_json::from_value(serde_json::json!({
            "hostname": "host1.example.com",
            "sshKeySecretRef": {"name": "host1-ssh"}
        }))
        .unwrap();
        assert_eq!(spec.ssh_user, "root");
        assert_eq!(spec.ssh_port, 22);
        assert!(spec.ssh_key_secret_ref.namespace.is_none());
    }

    #[test]
    fn ownership_checks_applied_configuration() {
        let machine = Machine::new(
            "m1",
            MachineSpec {
                hostname: "10.0.0.5".into(),
                ssh_user: "root".into(),
                ssh_key_secret_ref: SecretRef {
                    name: "key".into(),
                    namespace: None,
                },
                ssh_port: 22,
            },
        );
        assert!(!machine.owned_by("c1"));

        let mut machine = machine;
        machine.status = Some(MachineStatus {
            applied_configuration: Some("c1".into()),
            ..Default::default()
        });
        assert!(machine.owned_by("c1"));
        assert!(!machine.owned_by("c2"));
        assert_eq!(machine.owner(), Some("c1"));
    }
}
