//! The NixosConfiguration resource: desired state for exactly one Machine.

use chrono::{DateTime, Utc};
use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::machine::SecretRef;
use super::Condition;
use crate::error::Error;

#[derive(CustomResource, Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "nixos.infra",
    version = "v1alpha1",
    kind = "NixosConfiguration",
    namespaced,
    plural = "nixosconfigurations",
    shortname = "nixcfg",
    status = "NixosConfigurationStatus",
    printcolumn = r#"{"name":"Machine","type":"string","jsonPath":".spec.machineRef.name"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Commit","type":"string","jsonPath":".status.appliedCommit"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct NixosConfigurationSpec {
    /// Repository holding the flake (https or ssh URL).
    pub git_repo: String,
    /// Branch, tag, or commit. `HEAD` resolves to the default branch tip.
    #[serde(default = "default_git_ref")]
    pub git_ref: String,
    /// Fragment selecting one system within the repository, e.g. `#web01`.
    pub flake: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub configuration_subdir: Option<String>,
    /// Bootstrap a fresh host (destructive) instead of switching generations.
    #[serde(default)]
    pub full_install: bool,
    pub machine_ref: MachineRef,
    /// Git credentials secret: `token` for HTTPS or `ssh-privatekey` for SSH.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub credentials_ref: Option<SecretRef>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub additional_files: Vec<AdditionalFile>,
    /// Tear-down selector applied in switch mode when the resource is deleted.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub on_remove_flake: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct MachineRef {
    pub name: String,
}

/// A file materialized into the working tree before the apply.
///
/// Exactly one of `inline`, `secretRef`, `hardwareFacts` must be set.
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct AdditionalFile {
    /// POSIX path relative to the working tree root.
    pub path: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inline: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub secret_ref: Option<SecretKeySelector>,
    #[serde(default)]
    pub hardware_facts: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct SecretKeySelector {
    pub name: String,
    pub key: String,
}

/// Resolved value source of an [`AdditionalFile`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileSource<'a> {
    Inline(&'a str),
    Secret(&'a SecretKeySelector),
    HardwareFacts,
}

impl AdditionalFile {
    /// Validate the exactly-one-source rule and return the source.
    pub fn source(&self) -> Result<FileSource<'_>, Error> {
        let mut sources = Vec::new();
        if let Some(inline) = &self.inline {
            sources.push(FileSource::Inline(inline));
        }
        if let Some(secret) = &self.secret_ref {
            sources.push(FileSource::Secret(secret));
        }
        if self.hardware_facts {
            sources.push(FileSource::HardwareFacts);
        }
        match sources.len() {
            1 => Ok(sources.remove(0)),
            0 => Err(Error::Validation {
                field: format!("additionalFiles[{}]", self.path),
                reason: "one of inline, secretRef, hardwareFacts is required".into(),
            }),
            _ => Err(Error::Validation {
                field: format!("additionalFiles[{}]", self.path),
                reason: "inline, secretRef and hardwareFacts are mutually exclusive".into(),
            }),
        }
    }
}

/// Reconciliation phase of a NixosConfiguration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema, Default)]
pub enum Phase {
    #[default]
    Pending,
    Resolving,
    Building,
    Applying,
    Applied,
    Failed,
    Deleting,
}

impl std::fmt::Display for Phase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Phase::Pending => "Pending",
            Phase::Resolving => "Resolving",
            Phase::Building => "Building",
            Phase::Applying => "Applying",
            Phase::Applied => "Applied",
            Phase::Failed => "Failed",
            Phase::Deleting => "Deleting",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct NixosConfigurationStatus {
    #[serde(default)]
    pub phase: Phase,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_commit: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_fingerprint: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conditions: Vec<Condition>,
}

fn default_git_ref() -> String {
    "HEAD".to_string()
}

/// Pre-flight validation of spec fields that end up on a command line.
///
/// Rejects shell metacharacters in the hostname-adjacent fields so a crafted
/// resource cannot smuggle arguments into the ssh or applier invocations.
pub fn validate_spec(spec: &NixosConfigurationSpec) -> Result<(), Error> {
    validate_git_url(&spec.git_repo)?;
    for file in &spec.additional_files {
        file.source()?;
    }
    if let Some(subdir) = &spec.configuration_subdir {
        if subdir.starts_with('/') || subdir.split('/').any(|seg| seg == "..") {
            return Err(Error::Validation {
                field: "configurationSubdir".into(),
                reason: "must be a relative path without .. segments".into(),
            });
        }
    }
    Ok(())
}

pub fn validate_hostname(hostname: &str) -> Result<(), Error> {
    if hostname.is_empty() || hostname.len() > 253 {
        return Err(Error::Validation {
            field: "hostname".into(),
            reason: "must be 1-253 characters".into(),
        });
    }
    let ok = hostname
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '.' | ':' | '[' | ']'));
    if !ok {
        return Err(Error::Validation {
            field: "hostname".into(),
            reason: "only alphanumerics, hyphens, dots, colons and brackets allowed".into(),
        });
    }
    Ok(())
}

pub fn validate_ssh_user(user: &str) -> Result<(), Error> {
    if user.is_empty() || user.len() > 32 {
        return Err(Error::Validation {
            field: "sshUser".into(),
            reason: "must be 1-32 characters".into(),
        });
    }
    if !user
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-'))
    {
        return Err(Error::Validation {
            field: "sshUser".into(),
            reason: "only alphanumerics, underscore and hyphen allowed".into(),
        });
    }
    Ok(())
}

fn validate_git_url(url: &str) -> Result<(), Error> {
    if url.is_empty() || url.len() > 2048 {
        return Err(Error::Validation {
            field: "gitRepo".into(),
            reason: "must be 1-2048 characters".into(),
        });
    }
    const DANGEROUS: &[char] = &[';', '$', '`', '|', '&', '\n', '\r', '<', '>'];
    if url.contains(DANGEROUS) {
        return Err(Error::Validation {
            field: "gitRepo".into(),
            reason: "contains shell metacharacters".into(),
        });
    }
    let allowed = ["https://", "http://", "ssh://", "git://", "git@"];
    if !allowed.iter().any(|scheme| url.starts_with(scheme)) {
        return Err(Error::Validation {
            field: "gitRepo".into(),
            reason: "scheme must be https, http, ssh, or git".into(),
        });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn base_spec() -> NixosConfigurationSpec {
        serde_json::from_value(serde_json::json!({
            "gitRepo": "https://git.example.com/infra.git",
            "flake": "#web01",
            "machineRef": {"name": "m1"}
        }))
        .unwrap()
    }

    #[test]
    fn git_ref_defaults_to_head() {
        let spec = base_spec();
        assert_eq!(spec.git_ref, "HEAD");
        assert!(!spec.full_install);
        assert!(spec.additional_files.is_empty());
    }

    #[test]
    fn additional_file_requires_exactly_one_source() {
        let none = AdditionalFile {
            path: "etc/x.conf".into(),
            inline: None,
            secret_ref: None,
            hardware_facts: false,
        };
        assert!(none.source().is_err());

        let both = AdditionalFile {
            path: "etc/x.conf".into(),
            inline: Some("hello\n".into()),
            secret_ref: None,
            hardware_facts: true,
        };
        assert!(both.source().is_err());

        let inline = AdditionalFile {
            path: "etc/x.conf".into(),
            inline: Some("hello\n".into()),
            secret_ref: None,
            hardware_facts: false,
        };
        assert_eq!(inline.source().unwrap(), FileSource::Inline("hello\n"));
    }

    #[test]
    fn rejects_metacharacters_in_git_url() {
        let mut spec = base_spec();
        spec.git_repo = "https://git.example.com/infra.git;rm -rf /".into();
        assert!(validate_spec(&spec).is_err());
    }

    #[test]
    fn rejects_escaping_subdir() {
        let mut spec = base_spec();
        spec.configuration_subdir = Some("../other".into());
        assert!(validate_spec(&spec).is_err());
        spec.configuration_subdir = Some("hosts/web".into());
        assert!(validate_spec(&spec).is_ok());
    }

    #[test]
    fn hostname_validation_accepts_ip_literals() {
        assert!(validate_hostname("10.0.0.5").is_ok());
        assert!(validate_hostname("[2001:db8::1]").is_ok());
        assert!(validate_hostname("host1.example.com").is_ok());
        assert!(validate_hostname("host1;reboot").is_err());
        assert!(validate_hostname("").is_err());
    }

    #[test]
    fn ssh_user_validation() {
        assert!(validate_ssh_user("root").is_ok());
        assert!(validate_ssh_user("deploy-bot_2").is_ok());
        assert!(validate_ssh_user("bad user").is_err());
    }
}
