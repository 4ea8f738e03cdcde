//! Custom resource types for the `nixos.infra` API group.

pub mod configuration;
pub mod machine;

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

pub use configuration::{
    AdditionalFile, FileSource, MachineRef, NixosConfiguration, NixosConfigurationSpec,
    NixosConfigurationStatus, Phase, SecretKeySelector,
};
pub use machine::{Machine, MachineSpec, MachineStatus, SecretRef};

pub const GROUP: &str = "nixos.infra";
pub const VERSION: &str = "v1alpha1";

/// Finalizer owned by the engine on NixosConfiguration resources.
pub const FINALIZER: &str = "nixos.infra/finalizer";

/// Observed condition on a resource status.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct Condition {
    pub r#type: String,
    /// "True", "False", or "Unknown".
    pub status: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl Condition {
    pub fn new(r#type: &str, status: bool, reason: &str, message: &str) -> Self {
        Self {
            r#type: r#type.to_string(),
            status: if status { "True" } else { "False" }.to_string(),
            last_transition_time: Some(Utc::now()),
            reason: Some(reason.to_string()),
            message: Some(message.to_string()),
        }
    }
}

/// Replace or insert a condition by type, keeping the rest untouched.
pub fn upsert_condition(conditions: &mut Vec<Condition>, condition: Condition) {
    match conditions.iter_mut().find(|c| c.r#type == condition.r#type) {
        Some(existing) => *existing = condition,
        None => conditions.push(condition),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn upsert_replaces_by_type() {
        let mut conditions = vec![Condition::new("Reachable", true, "Probe", "ok")];
        upsert_condition(
            &mut conditions,
            Condition::new("Reachable", false, "Probe", "connect timed out"),
        );
        upsert_condition(
            &mut conditions,
            Condition::new("HostKeyMismatch", true, "HostKeyMismatch", "pinned key differs"),
        );
        assert_eq!(conditions.len(), 2);
        assert_eq!(conditions[0].status, "False");
    }
}
