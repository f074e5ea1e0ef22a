//! Retry budgets and the manual-fix decision.
//!
//! The manager keeps per-step attempt counters for the lifetime of one run. The
//! automatic budget governs what the coordinator may retry on its own; operator
//! retries are tracked separately and only bounded when a manual ceiling is configured.

use crate::errors::{CoordinatorError, RetryRejection};
use crate::pipeline::registry::{RetryPrecondition, StepRegistry};
use reelforge_common::{PipelineRun, StepKey, StepStatus};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::Arc;

/// Who asked for a retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryTrigger {
    /// The coordinator (or automation) acting within the automatic budget.
    Automatic,
    /// An operator explicitly asked for it.
    Operator,
}

/// What retrying a step means for the current snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Remediation {
    /// Run the step again as-is.
    Rerun,
    /// Rewrite the narrative from the validator's patch instructions.
    Rewrite,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AttemptCounter {
    pub automatic: u32,
    pub operator: u32,
}

/// Snapshot of the retry situation for one step.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RetryAssessment {
    pub remediation: Option<Remediation>,
    pub attempts_used: u32,
    pub max_attempts: u32,
    pub can_auto_retry: bool,
    pub manual_fix_required: bool,
}

impl RetryAssessment {
    pub fn attempts_remaining(&self) -> u32 {
        self.max_attempts.saturating_sub(self.attempts_used)
    }
}

#[derive(Debug)]
pub struct RetryManager {
    registry: Arc<StepRegistry>,
    counters: HashMap<StepKey, AttemptCounter>,
    max_manual_retries: Option<u32>,
}

impl RetryManager {
    pub fn new(registry: Arc<StepRegistry>, max_manual_retries: Option<u32>) -> Self {
        Self {
            registry,
            counters: HashMap::new(),
            max_manual_retries,
        }
    }

    /// Why the step needs a retry in this snapshot, if it does.
    ///
    /// A step in ERROR needs a rerun. A validation FAIL is a soft failure with two
    /// remediation paths: rewrite the narrative, or rerun validation alone.
    pub fn remediation(&self, step: StepKey, run: &PipelineRun) -> Option<Remediation> {
        if run.step_status(step) == StepStatus::Error {
            return Some(Remediation::Rerun);
        }
        let validation_failed = run.step_status(StepKey::Validation) == StepStatus::Done
            && run.validation.as_ref().is_some_and(|v| v.is_fail());
        match step {
            StepKey::Narrative if validation_failed => Some(Remediation::Rewrite),
            StepKey::Validation if validation_failed => Some(Remediation::Rerun),
            _ => None,
        }
    }

    /// Automatic attempts used so far: the larger of the local and remote counts.
    pub fn attempts_used(&self, step: StepKey, run: &PipelineRun) -> u32 {
        let local = self.counters.get(&step).map_or(0, |c| c.automatic);
        local.max(run.attempts(step))
    }

    pub fn counter(&self, step: StepKey) -> AttemptCounter {
        self.counters.get(&step).copied().unwrap_or_default()
    }

    fn precondition_met(&self, step: StepKey, remediation: Remediation, run: &PipelineRun) -> bool {
        match (self.registry.retry_precondition(step), remediation) {
            (Some(RetryPrecondition::PatchInstructions), Remediation::Rewrite) => run
                .validation
                .as_ref()
                .is_some_and(|v| v.has_patch_instructions()),
            _ => true,
        }
    }

    /// True iff the step needs remediation, is auto-retriable, has budget left, and any
    /// precondition for an automatic retry is present.
    pub fn can_auto_retry(&self, step: StepKey, run: &PipelineRun) -> bool {
        let Some(remediation) = self.remediation(step, run) else {
            return false;
        };
        self.registry.is_auto_retriable(step)
            && self.attempts_used(step, run) < self.registry.max_auto_attempts(step)
            && self.precondition_met(step, remediation, run)
    }

    /// The step needs remediation but automatic retry is off the table.
    pub fn requires_manual_fix(&self, step: StepKey, run: &PipelineRun) -> bool {
        self.remediation(step, run).is_some() && !self.can_auto_retry(step, run)
    }

    pub fn assess(&self, step: StepKey, run: &PipelineRun) -> RetryAssessment {
        RetryAssessment {
            remediation: self.remediation(step, run),
            attempts_used: self.attempts_used(step, run),
            max_attempts: self.registry.max_auto_attempts(step),
            can_auto_retry: self.can_auto_retry(step, run),
            manual_fix_required: self.requires_manual_fix(step, run),
        }
    }

    /// Check whether a retry may be issued, without recording it.
    pub fn authorize(
        &self,
        step: StepKey,
        run: &PipelineRun,
        trigger: RetryTrigger,
    ) -> Result<Remediation, CoordinatorError> {
        let assessment = self.assess(step, run);
        let reject = |reason: RetryRejection| CoordinatorError::RetryRejected {
            step,
            reason,
            attempts_remaining: assessment.attempts_remaining(),
            manual_fix_required: assessment.manual_fix_required,
        };

        let Some(remediation) = assessment.remediation else {
            return Err(reject(RetryRejection::NothingToRetry));
        };
        if !self.registry.is_retriable(step) {
            return Err(reject(RetryRejection::NotRetriable));
        }
        match trigger {
            RetryTrigger::Automatic if !assessment.can_auto_retry => {
                Err(reject(RetryRejection::ManualFixRequired))
            }
            RetryTrigger::Operator => match self.max_manual_retries {
                Some(limit) if self.counter(step).operator >= limit => {
                    Err(reject(RetryRejection::ManualLimitReached { limit }))
                }
                _ => Ok(remediation),
            },
            RetryTrigger::Automatic => Ok(remediation),
        }
    }

    /// Count an issued retry. Automatic attempts never exceed the step's maximum.
    pub fn record_attempt(
        &mut self,
        step: StepKey,
        trigger: RetryTrigger,
    ) -> Result<AttemptCounter, CoordinatorError> {
        let max = self.registry.max_auto_attempts(step);
        let counter = self.counters.entry(step).or_default();
        match trigger {
            RetryTrigger::Automatic => {
                if counter.automatic >= max {
                    return Err(CoordinatorError::BudgetExhausted {
                        step,
                        attempts: counter.automatic,
                    });
                }
                counter.automatic += 1;
            }
            RetryTrigger::Operator => counter.operator += 1,
        }
        Ok(*counter)
    }

    /// Authorize and count a retry in one step, before it is sent.
    ///
    /// Callers that issue the retry afterwards must [`release`](Self::release) the
    /// attempt if the remote call fails.
    pub fn reserve(
        &mut self,
        step: StepKey,
        run: &PipelineRun,
        trigger: RetryTrigger,
    ) -> Result<(Remediation, AttemptCounter), CoordinatorError> {
        let remediation = self.authorize(step, run, trigger)?;
        let counter = self.record_attempt(step, trigger)?;
        Ok((remediation, counter))
    }

    /// Hand back an attempt reserved for a retry that never reached the remote system.
    pub fn release(&mut self, step: StepKey, trigger: RetryTrigger) {
        if let Some(counter) = self.counters.get_mut(&step) {
            match trigger {
                RetryTrigger::Automatic => counter.automatic = counter.automatic.saturating_sub(1),
                RetryTrigger::Operator => counter.operator = counter.operator.saturating_sub(1),
            }
        }
    }

    /// Lift local automatic counters to what the remote system has recorded.
    /// Counters are never lowered.
    pub fn observe(&mut self, run: &PipelineRun) {
        for (step, remote) in &run.attempts {
            let max = self.registry.max_auto_attempts(*step);
            let counter = self.counters.entry(*step).or_default();
            counter.automatic = counter.automatic.max((*remote).min(max));
        }
    }

    /// Forget every counter. Only used when a new run starts or the local view is reset.
    pub fn reset(&mut self) {
        self.counters.clear();
    }
}
