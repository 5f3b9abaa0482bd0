//! Typed fatal errors.
//!
//! Engine functions return `anyhow::Result`; the variants here are attached to
//! those errors so callers (the CLI, tests) can `downcast_ref` and react to the
//! specific failure, e.g. report an interrupt differently from a rejected gate.

use std::path::{Path, PathBuf};

use thiserror::Error;

/// Fatal pipeline conditions. None of these are retried by the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum PipelineError {
    /// Cancellation was requested (interrupt, SIGTERM, or programmatic).
    #[error("pipeline cancelled")]
    Cancelled,

    #[error("user aborted at gate '{step}'")]
    GateAborted { step: String },

    #[error("blocked in '{step}': {reason}")]
    Blocked { step: String, reason: String },

    #[error("step '{step}' not found in pipeline")]
    StepNotFound { step: String },

    #[error("convergence loop '{step}' reached max rounds ({max_rounds}) without approval")]
    MaxRounds { step: String, max_rounds: u32 },

    #[error("shell step '{step}' failed: {message}")]
    ShellFailed { step: String, message: String },
}

/// An agent asked to write outside the sandbox root.
///
/// Kept separate from [`PipelineError`]: this is a tool-trust violation rather
/// than an ordinary pipeline failure.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
#[error("{what} escapes {}: {requested}", root.display())]
pub struct SecurityError {
    pub what: String,
    pub requested: String,
    pub root: PathBuf,
}

impl SecurityError {
    pub fn new(what: &str, requested: &str, root: &Path) -> Self {
        Self {
            what: what.to_string(),
            requested: requested.to_string(),
            root: root.to_path_buf(),
        }
    }
}

/// True if `err` (or anything in its chain) is a cancellation.
pub fn is_cancelled(err: &anyhow::Error) -> bool {
    err.chain().any(|cause| {
        matches!(
            cause.downcast_ref::<PipelineError>(),
            Some(PipelineError::Cancelled)
        )
    })
}

/// True if `err` (or anything in its chain) is a sandbox violation.
pub fn is_security_violation(err: &anyhow::Error) -> bool {
    err.chain()
        .any(|cause| cause.downcast_ref::<SecurityError>().is_some())
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Context;

    #[test]
    fn cancellation_is_found_through_context() {
        let err = Err::<(), _>(anyhow::Error::new(PipelineError::Cancelled))
            .context("run step 'build'")
            .unwrap_err();
        assert!(is_cancelled(&err));
        assert!(!is_security_violation(&err));
    }

    #[test]
    fn security_error_message_names_request() {
        let err = SecurityError::new("update path", "../x", Path::new("/p/.pilot"));
        assert_eq!(err.to_string(), "update path escapes /p/.pilot: ../x");
    }

    #[test]
    fn max_rounds_message() {
        let err = PipelineError::MaxRounds {
            step: "review".to_string(),
            max_rounds: 2,
        };
        assert!(err.to_string().contains("max rounds (2)"));
    }
}
