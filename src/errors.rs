//! Error taxonomy (§7). Leaf functions propagate with `anyhow::Result` and
//! `?` in the teacher's style; these variants are the surface-level kinds
//! the restore driver pattern-matches on to classify a phase outcome as
//! fatal, warning, or abort-by-operator, and to build the exit code (§6).

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyDomain {
    Network,
    Firewall,
    Ha,
    AccessControl,
}

impl std::fmt::Display for ApplyDomain {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            ApplyDomain::Network => "network",
            ApplyDomain::Firewall => "firewall",
            ApplyDomain::Ha => "ha",
            ApplyDomain::AccessControl => "access-control",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Error)]
pub enum RestoreError {
    #[error("restore aborted by operator: {reason}")]
    RestoreAborted { reason: String },

    #[error("archive type '{archive_type}' does not match detected host type '{host_type}'")]
    CompatibilityMismatch {
        archive_type: String,
        host_type: String,
    },

    #[error("archive error: {0}")]
    Archive(String),

    #[error("preflight check rejected staged config: {0}")]
    Preflight(String),

    #[error("{domain} apply was not committed before the deadline")]
    ApplyNotCommitted {
        domain: ApplyDomain,
        rollback_log: PathBuf,
        rollback_marker: PathBuf,
        restored_ip: Option<String>,
        rollback_armed: bool,
        rollback_deadline_unix: u64,
    },

    #[error("service error: {0}")]
    Service(String),

    #[error("staged apply for category '{category}' failed: {source}")]
    StagedApply {
        category: String,
        #[source]
        source: anyhow::Error,
    },

    #[error("mount guard error: {0}")]
    MountGuard(String),
}

/// Severity the driver assigns to a phase outcome (§7 propagation policy).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Severity {
    Fatal,
    Warning,
    AbortByOperator,
}

impl RestoreError {
    pub fn severity(&self) -> Severity {
        match self {
            RestoreError::RestoreAborted { .. } => Severity::AbortByOperator,
            RestoreError::CompatibilityMismatch { .. } => Severity::AbortByOperator,
            RestoreError::Archive(_) => Severity::Fatal,
            RestoreError::Preflight(_) => Severity::Fatal,
            RestoreError::ApplyNotCommitted { .. } => Severity::Warning,
            RestoreError::Service(_) => Severity::Warning,
            RestoreError::StagedApply { .. } => Severity::Warning,
            RestoreError::MountGuard(_) => Severity::Warning,
        }
    }

    /// Process exit code per §6.
    pub fn exit_code(&self) -> i32 {
        match self {
            RestoreError::RestoreAborted { .. } => 9,
            RestoreError::CompatibilityMismatch { .. } => 9,
            RestoreError::Archive(_) => 5,
            RestoreError::Preflight(_) => 1,
            RestoreError::ApplyNotCommitted { .. } => 1,
            RestoreError::Service(_) => 1,
            RestoreError::StagedApply { .. } => 1,
            RestoreError::MountGuard(_) => 1,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn abort_maps_to_exit_9() {
        let e = RestoreError::RestoreAborted {
            reason: "operator declined".into(),
        };
        assert_eq!(e.exit_code(), 9);
        assert_eq!(e.severity(), Severity::AbortByOperator);
    }

    #[test]
    fn apply_not_committed_is_a_warning_not_fatal() {
        let e = RestoreError::ApplyNotCommitted {
            domain: ApplyDomain::Network,
            rollback_log: "/tmp/x.log".into(),
            rollback_marker: "/tmp/x.marker".into(),
            restored_ip: None,
            rollback_armed: false,
            rollback_deadline_unix: 0,
        };
        assert_eq!(e.severity(), Severity::Warning);
    }
}
