//! Typed failure classes carried inside `anyhow` chains.
//!
//! Orchestration code downcasts to [`FleetError`] to decide whether a failure
//! is local to one repository or fatal to the run.

use std::fmt;

use thiserror::Error;

use crate::core::pipeline::IllegalTransition;
use crate::core::types::ReasonCode;

#[derive(Debug, Error)]
pub enum FleetError {
    #[error("preflight skipped {repo}: {reason}")]
    PreflightSkipped { repo: String, reason: ReasonCode },
    #[error("session error: {0}")]
    Session(#[from] DriverError),
    #[error("phase {phase} timed out after {secs}s")]
    PhaseTimeout { phase: &'static str, secs: u64 },
    #[error("plan rejected ({reason}): {detail}")]
    ValidationFailed { reason: ReasonCode, detail: String },
    /// Any other per-repository failure with a stable reason code.
    #[error("{detail}")]
    RepoFailed { reason: ReasonCode, detail: String },
    #[error("timed out acquiring lock '{name}' (held by pid {owner_pid:?})")]
    LockTimeout { name: String, owner_pid: Option<u32> },
    #[error("missing dependency: {0}")]
    DependencyMissing(String),
    #[error("interrupted")]
    Interrupted,
    #[error("illegal pipeline transition {} -> {}", .0.from.as_str(), .0.to.as_str())]
    IllegalTransition(IllegalTransition),
}

impl FleetError {
    /// Find a typed failure anywhere in an `anyhow` chain.
    pub fn find(err: &anyhow::Error) -> Option<&FleetError> {
        err.chain().find_map(|cause| cause.downcast_ref::<FleetError>())
    }

    pub fn reason(&self) -> ReasonCode {
        match self {
            FleetError::PreflightSkipped { reason, .. }
            | FleetError::ValidationFailed { reason, .. }
            | FleetError::RepoFailed { reason, .. } => *reason,
            FleetError::Session(err) => err.reason(),
            FleetError::PhaseTimeout { .. } => ReasonCode::PhaseTimeout,
            FleetError::LockTimeout { .. } => ReasonCode::LockTimeout,
            FleetError::DependencyMissing(_) => ReasonCode::SessionError,
            FleetError::Interrupted => ReasonCode::Interrupted,
            FleetError::IllegalTransition(_) => ReasonCode::IllegalTransition,
        }
    }
}

/// Closed set of error codes a session backend may report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DriverErrorCode {
    NotFound,
    Timeout,
    Busy,
    DependencyMissing,
    Internal,
}

impl DriverErrorCode {
    pub fn as_str(self) -> &'static str {
        match self {
            DriverErrorCode::NotFound => "not_found",
            DriverErrorCode::Timeout => "timeout",
            DriverErrorCode::Busy => "busy",
            DriverErrorCode::DependencyMissing => "dependency_missing",
            DriverErrorCode::Internal => "internal",
        }
    }
}

impl fmt::Display for DriverErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Error)]
#[error("{code}: {message}")]
pub struct DriverError {
    pub code: DriverErrorCode,
    pub message: String,
}

impl DriverError {
    pub fn new(code: DriverErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
        }
    }

    /// Pipeline reason for a backend failure; backend text is never inspected.
    pub fn reason(&self) -> ReasonCode {
        match self.code {
            DriverErrorCode::Timeout => ReasonCode::PhaseTimeout,
            DriverErrorCode::NotFound
            | DriverErrorCode::Busy
            | DriverErrorCode::DependencyMissing
            | DriverErrorCode::Internal => ReasonCode::SessionError,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn typed_error_survives_context_layers() {
        let err: anyhow::Result<()> = Err(FleetError::LockTimeout {
            name: "queue".into(),
            owner_pid: Some(42),
        }
        .into());
        let err = err.context("dequeue").unwrap_err();
        let found = FleetError::find(&err).expect("typed error");
        assert_eq!(found.reason(), ReasonCode::LockTimeout);
    }

    #[test]
    fn driver_codes_map_to_pipeline_reasons() {
        let timeout = DriverError::new(DriverErrorCode::Timeout, "spawn");
        assert_eq!(timeout.reason(), ReasonCode::PhaseTimeout);
        let busy = DriverError::new(DriverErrorCode::Busy, "pane in use");
        assert_eq!(busy.reason(), ReasonCode::SessionError);
        assert_eq!(busy.to_string(), "busy: pane in use");
    }
}
