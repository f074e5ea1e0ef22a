//! Typed error hierarchy for the Reelforge coordinator.
//!
//! Three enums cover the three failure surfaces:
//! - `RegistryError`: invalid step graph definitions
//! - `RemoteError`: failures of a single remote call
//! - `CoordinatorError`: rejected or failed coordinator commands

use reelforge_common::{RunId, StepKey};
use std::time::Duration;
use thiserror::Error;

/// Errors raised while building a step registry.
#[derive(Debug, Error)]
pub enum RegistryError {
    #[error("Duplicate step definition: {0}")]
    DuplicateStep(StepKey),

    #[error("Step {step} depends on {dependency}, which is not registered")]
    UnknownDependency { step: StepKey, dependency: StepKey },

    #[error("Dependency cycle detected among steps: {0:?}")]
    Cycle(Vec<StepKey>),
}

/// Errors from one remote operation.
#[derive(Debug, Error)]
pub enum RemoteError {
    #[error("{operation} timed out after {after:?}")]
    Timeout {
        operation: &'static str,
        after: Duration,
    },

    #[error("Remote returned HTTP {status}: {body}")]
    Http { status: u16, body: String },

    #[error("Transport error: {0}")]
    Transport(#[source] anyhow::Error),

    #[error("Failed to decode remote response: {0}")]
    Decode(String),
}

impl RemoteError {
    /// Whether a poll tick that hit this error may simply try again on the next tick.
    pub fn is_transient(&self) -> bool {
        match self {
            RemoteError::Timeout { .. } | RemoteError::Transport(_) => true,
            RemoteError::Http { status, .. } => *status >= 500 || *status == 429,
            RemoteError::Decode(_) => false,
        }
    }
}

/// Why a retry request was refused.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RetryRejection {
    /// The step is not in a state that calls for a retry.
    NothingToRetry,
    /// The registry does not allow retrying this step at all.
    NotRetriable,
    /// Automatic retry is disallowed until an operator supplies a fix.
    ManualFixRequired,
    /// The configured ceiling on operator-triggered retries was reached.
    ManualLimitReached { limit: u32 },
}

impl std::fmt::Display for RetryRejection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RetryRejection::NothingToRetry => write!(f, "step has not failed"),
            RetryRejection::NotRetriable => write!(f, "step is not retriable"),
            RetryRejection::ManualFixRequired => write!(f, "manual fix required"),
            RetryRejection::ManualLimitReached { limit } => {
                write!(f, "operator retry limit of {} reached", limit)
            }
        }
    }
}

/// Errors from coordinator commands.
#[derive(Debug, Error)]
pub enum CoordinatorError {
    #[error("No run is currently mirrored; start a run or refresh first")]
    NoActiveRun,

    #[error("Run handle {requested} does not match the mirrored run {mirrored}")]
    RunMismatch { requested: RunId, mirrored: RunId },

    #[error("Failed to start run: {0}")]
    StartFailed(#[source] RemoteError),

    #[error(
        "Retry of {step} rejected: {reason} ({attempts_remaining} automatic attempts remaining, manual fix required: {manual_fix_required})"
    )]
    RetryRejected {
        step: StepKey,
        reason: RetryRejection,
        attempts_remaining: u32,
        manual_fix_required: bool,
    },

    #[error("Automatic retry budget for {step} exhausted after {attempts} attempts")]
    BudgetExhausted { step: StepKey, attempts: u32 },

    #[error("Compilation is not ready: missing {}", missing.join(", "))]
    CompilationNotReady { missing: Vec<String> },

    #[error("Invalid configuration: {0}")]
    Config(String),

    #[error(
        "Remote retry of {step} failed ({attempts_remaining} automatic attempts remaining, manual fix required: {manual_fix_required}): {source}"
    )]
    RetryFailed {
        step: StepKey,
        attempts_remaining: u32,
        manual_fix_required: bool,
        #[source]
        source: RemoteError,
    },

    #[error("Remote {operation} failed for step {step:?}: {source}")]
    Remote {
        operation: &'static str,
        step: Option<StepKey>,
        #[source]
        source: RemoteError,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
