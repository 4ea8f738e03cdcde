//! Engine error taxonomy.
//!
//! Every failure that can surface from a reconcile tick is classified here so
//! the controllers can decide, in one place, whether to retry (and how
//! aggressively) or to park the resource until the operator edits it.

use thiserror::Error;

/// How an error should be handled by the reconcile loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disposition {
    /// Retry with the standard transient backoff (capped at seconds).
    Retry,
    /// Retry with the long backoff reserved for unreachable hosts.
    RetrySlow,
    /// Do not retry until the resource (or its secrets) are edited.
    Terminal,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("secret {name} not found in namespace {namespace}")]
    SecretMissing { namespace: String, name: String },

    #[error("secret {name} is missing required field {field}")]
    SecretMalformed { name: String, field: String },

    #[error("referenced machine {name} does not exist")]
    MissingMachine { name: String },

    #[error("machine is already owned by configuration {owner}")]
    Conflict { owner: String },

    #[error("host {host} is unreachable: {detail}")]
    Unreachable { host: String, detail: String },

    #[error("authentication failed for {target}")]
    AuthFailed { target: String },

    #[error("host key for {host} does not match the pinned fingerprint")]
    HostKeyMismatch { host: String },

    #[error("git ref {reference} not found in {repo}")]
    RefNotFound { repo: String, reference: String },

    #[error("network error: {0}")]
    Network(String),

    #[error("operation timed out after {seconds}s")]
    Timeout { seconds: u64 },

    #[error("remote command exited with status {exit}")]
    RemoteExecFailed { exit: i32 },

    #[error("apply exited with status {exit}")]
    ApplyFailed { exit: i32, tail: String },

    #[error("additional file path {path} collides with an existing file")]
    PathCollision { path: String },

    #[error("invalid value for {field}: {reason}")]
    Validation { field: String, reason: String },

    #[error("status patch conflicted {attempts} times")]
    StatusConflict { attempts: u32 },

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Classify per the error-handling table: transient network and IO
    /// problems retry, configuration-shaped problems wait for an edit.
    pub fn disposition(&self) -> Disposition {
        match self {
            Error::Unreachable { .. } => Disposition::RetrySlow,
            Error::Network(_) | Error::Timeout { .. } | Error::Io(_) => Disposition::Retry,
            Error::ApplyFailed { .. } | Error::RemoteExecFailed { .. } => Disposition::Retry,
            Error::StatusConflict { .. } | Error::Kube(_) => Disposition::Retry,
            Error::SecretMissing { .. }
            | Error::SecretMalformed { .. }
            | Error::MissingMachine { .. }
            | Error::Conflict { .. }
            | Error::AuthFailed { .. }
            | Error::HostKeyMismatch { .. }
            | Error::RefNotFound { .. }
            | Error::PathCollision { .. }
            | Error::Validation { .. } => Disposition::Terminal,
        }
    }

    /// Stable reason string used for conditions, events, and metric labels.
    pub fn reason(&self) -> &'static str {
        match self {
            Error::SecretMissing { .. } => "SecretMissing",
            Error::SecretMalformed { .. } => "SecretMalformed",
            Error::MissingMachine { .. } => "MissingMachine",
            Error::Conflict { .. } => "Conflict",
            Error::Unreachable { .. } => "Unreachable",
            Error::AuthFailed { .. } => "AuthFailed",
            Error::HostKeyMismatch { .. } => "HostKeyMismatch",
            Error::RefNotFound { .. } => "RefNotFound",
            Error::Network(_) => "NetworkError",
            Error::Timeout { .. } => "Timeout",
            Error::RemoteExecFailed { .. } => "RemoteExecFailed",
            Error::ApplyFailed { .. } => "ApplyFailed",
            Error::PathCollision { .. } => "PathCollision",
            Error::Validation { .. } => "InvalidSpec",
            Error::StatusConflict { .. } => "ConflictError",
            Error::Kube(_) => "ApiError",
            Error::Io(_) => "IO",
        }
    }
}

pub type Result<T, E = Error> = std::result::Result<T, E>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unreachable_uses_the_slow_queue() {
        let err = Error::Unreachable {
            host: "host1".into(),
            detail: "connect timed out".into(),
        };
        assert_eq!(err.disposition(), Disposition::RetrySlow);
        assert_eq!(err.reason(), "Unreachable");
    }

    #[test]
    fn credential_errors_are_terminal() {
        let missing = Error::SecretMissing {
            namespace: "default".into(),
            name: "ssh-key".into(),
        };
        let auth = Error::AuthFailed {
            target: "root@host1".into(),
        };
        assert_eq!(missing.disposition(), Disposition::Terminal);
        assert_eq!(auth.disposition(), Disposition::Terminal);
    }

    #[test]
    fn apply_failures_retry_until_the_loop_caps_them() {
        let err = Error::ApplyFailed {
            exit: 1,
            tail: "error: build failed".into(),
        };
        assert_eq!(err.disposition(), Disposition::Retry);
        assert_eq!(err.reason(), "ApplyFailed");
    }
}
