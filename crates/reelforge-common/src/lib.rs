//! Shared domain types for the Reelforge pipeline.
//!
//! These types describe the remote system's wire format: the run snapshot returned by
//! `get_state`, the request body for `start_run`, and the step/status vocabulary every
//! other crate speaks. They carry no behavior beyond parsing and small accessors.

pub mod request;
pub mod run;
pub mod step;

pub use request::{CompileMode, RunId, StartRunRequest, StartRunResponse, StepSettings};
pub use run::{
    NarratedAudio, PipelineRun, RunOutputs, RunStatus, ShotPlan, ShotScene, StepState,
    ValidationIssue, ValidationResult, ValidationStatus,
};
pub use step::{ParseStepKeyError, StepKey, StepStatus};
