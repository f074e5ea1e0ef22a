//! Read-only view of a mirrored run, derived fresh on every call.

use chrono::{DateTime, Utc};
use reelforge_common::{PipelineRun, RunId, RunStatus, StepKey, StepStatus, ValidationStatus};
use serde::Serialize;

use super::synchronizer::SyncStatus;
use crate::pipeline::{
    CompilationReadiness, ReadinessEvaluator, Remediation, RetryManager, StepRegistry,
    compilation_readiness,
};

/// One row per registered step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepView {
    pub step: StepKey,
    pub name: &'static str,
    pub status: StepStatus,
    pub attempts_used: u32,
    pub max_attempts: u32,
    pub operator_retries: u32,
    pub eligible: bool,
    pub blocked_reason: Option<String>,
    pub remediation: Option<Remediation>,
    pub manual_fix_required: bool,
    pub auto_retry_available: bool,
    pub error: Option<String>,
    pub warnings: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    pub status: ValidationStatus,
    pub issue_ids: Vec<String>,
    pub has_patch_instructions: bool,
}

impl ValidationSummary {
    pub fn status_label(&self) -> &'static str {
        match self.status {
            ValidationStatus::Pass => "PASS",
            ValidationStatus::Fail => "FAIL",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunView {
    pub run_id: RunId,
    pub status: RunStatus,
    pub steps: Vec<StepView>,
    pub compilation: CompilationReadiness,
    pub validation: Option<ValidationSummary>,
    pub video_path: Option<String>,
    pub sync: SyncStatus,
    pub fetched_at: Option<DateTime<Utc>>,
}

impl RunView {
    pub fn build(
        run: &PipelineRun,
        registry: &StepRegistry,
        retries: &RetryManager,
        sync: SyncStatus,
        fetched_at: Option<DateTime<Utc>>,
    ) -> Self {
        let evaluator = ReadinessEvaluator::new(registry);
        let steps = registry
            .steps()
            .iter()
            .map(|def| {
                let state = run.step(def.key);
                let assessment = retries.assess(def.key, run);
                StepView {
                    step: def.key,
                    name: def.name,
                    status: run.step_status(def.key),
                    attempts_used: assessment.attempts_used,
                    max_attempts: assessment.max_attempts,
                    operator_retries: retries.counter(def.key).operator,
                    eligible: evaluator.is_eligible(def.key, run),
                    blocked_reason: evaluator
                        .blocked_reason(def.key, run)
                        .map(|reason| reason.to_string()),
                    remediation: assessment.remediation,
                    manual_fix_required: assessment.manual_fix_required,
                    auto_retry_available: assessment.can_auto_retry,
                    error: state.and_then(|s| s.error.clone()),
                    warnings: state.map(|s| s.warnings.clone()).unwrap_or_default(),
                }
            })
            .collect();

        let validation = run.validation.as_ref().map(|v| ValidationSummary {
            status: v.status,
            issue_ids: v.issues.iter().map(|i| i.issue_id.clone()).collect(),
            has_patch_instructions: v.has_patch_instructions(),
        });

        Self {
            run_id: run.run_id.clone(),
            status: run.status,
            steps,
            compilation: compilation_readiness(run),
            validation,
            video_path: run.outputs.video_path.clone(),
            sync,
            fetched_at,
        }
    }

    pub fn step(&self, step: StepKey) -> Option<&StepView> {
        self.steps.iter().find(|row| row.step == step)
    }

    /// Steps that need an operator before anything else can happen.
    pub fn needs_attention(&self) -> impl Iterator<Item = &StepView> {
        self.steps.iter().filter(|row| row.manual_fix_required)
    }
}
