//! Pure pipeline logic: the step registry, readiness evaluation, retry budgets, and
//! settings diffing.
//!
//! Nothing in this module performs I/O. Every function takes a [`PipelineRun`]
//! snapshot (and the registry) and returns a derived value, which keeps the decision
//! logic testable without a network.
//!
//! [`PipelineRun`]: reelforge_common::PipelineRun

pub mod readiness;
pub mod registry;
pub mod retry;
pub mod settings;

pub use readiness::{
    BlockedReason, CompilationPrerequisite, CompilationReadiness, GateClosure, GateState,
    ReadinessEvaluator, compilation_readiness, evaluate_gate, is_compilation_ready,
};
pub use registry::{Gate, RetryOverride, RetryPrecondition, StepDef, StepDuration, StepRegistry};
pub use retry::{AttemptCounter, Remediation, RetryAssessment, RetryManager, RetryTrigger};
pub use settings::{ChangeKind, SettingChange, SettingsSnapshot};
