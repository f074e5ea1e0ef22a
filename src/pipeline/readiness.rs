//! Readiness evaluation: which steps may start, and why the others may not.
//!
//! Everything here is a pure function of a [`PipelineRun`] snapshot and the
//! [`StepRegistry`]. Gates are evaluated on every call; nothing is cached.

use crate::pipeline::registry::{Gate, StepRegistry};
use reelforge_common::{PipelineRun, StepKey, StepStatus};
use serde::Serialize;
use std::collections::BTreeSet;
use std::fmt;

/// A prerequisite of the terminal compilation step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompilationPrerequisite {
    ShotPlan,
    NarratedAudio,
}

impl fmt::Display for CompilationPrerequisite {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompilationPrerequisite::ShotPlan => f.write_str("shot plan"),
            CompilationPrerequisite::NarratedAudio => f.write_str("narrated audio"),
        }
    }
}

/// Derived compilation readiness. Never stored.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CompilationReadiness {
    pub ready: bool,
    pub missing: Vec<CompilationPrerequisite>,
}

/// Why a gate is closed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateClosure {
    /// Validation reported FAIL with these issues.
    ValidationFailed { issue_ids: Vec<String> },
    /// No validation result has been produced yet.
    ValidationPending,
    MissingPrerequisites { missing: Vec<CompilationPrerequisite> },
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GateState {
    Open,
    Closed(GateClosure),
}

impl GateState {
    pub fn is_open(&self) -> bool {
        matches!(self, GateState::Open)
    }
}

/// Actionable explanation of why an IDLE step cannot start.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BlockedReason {
    ValidationFailed { issue_ids: Vec<String> },
    DependencyNotDone { dependency: StepKey, status: StepStatus },
    GateClosed { gate: Gate, closure: GateClosure },
}

impl fmt::Display for BlockedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            BlockedReason::ValidationFailed { issue_ids } if issue_ids.is_empty() => {
                write!(f, "blocked by validation FAIL")
            }
            BlockedReason::ValidationFailed { issue_ids } => {
                write!(f, "blocked by validation FAIL (issues: {})", issue_ids.join(", "))
            }
            BlockedReason::DependencyNotDone { dependency, status } => {
                write!(f, "waiting on {} ({})", dependency, status)
            }
            BlockedReason::GateClosed { gate, closure } => match closure {
                GateClosure::ValidationPending => {
                    write!(f, "gate {} closed: validation result not available", gate.name())
                }
                GateClosure::MissingPrerequisites { missing } => {
                    let names: Vec<String> = missing.iter().map(|m| m.to_string()).collect();
                    write!(f, "gate {} closed: missing {}", gate.name(), names.join(", "))
                }
                GateClosure::ValidationFailed { .. } => {
                    write!(f, "gate {} closed: validation FAIL", gate.name())
                }
            },
        }
    }
}

/// Compute compilation readiness from a snapshot, independent of run status.
pub fn compilation_readiness(run: &PipelineRun) -> CompilationReadiness {
    let mut missing = Vec::new();
    let has_scenes = run
        .outputs
        .shot_plan
        .as_ref()
        .is_some_and(|plan| !plan.scenes.is_empty());
    if !has_scenes {
        missing.push(CompilationPrerequisite::ShotPlan);
    }
    let has_audio = run
        .outputs
        .narrated_audio
        .as_ref()
        .is_some_and(|audio| !audio.files.is_empty());
    if !has_audio {
        missing.push(CompilationPrerequisite::NarratedAudio);
    }
    CompilationReadiness {
        ready: missing.is_empty(),
        missing,
    }
}

pub fn is_compilation_ready(run: &PipelineRun) -> bool {
    compilation_readiness(run).ready
}

/// Evaluate a gate against the current snapshot.
pub fn evaluate_gate(gate: Gate, run: &PipelineRun) -> GateState {
    match gate {
        Gate::ValidationPassed => match &run.validation {
            Some(v) if v.is_fail() => GateState::Closed(GateClosure::ValidationFailed {
                issue_ids: v.issues.iter().map(|i| i.issue_id.clone()).collect(),
            }),
            Some(_) => GateState::Open,
            None => GateState::Closed(GateClosure::ValidationPending),
        },
        Gate::CompilationReady => {
            let readiness = compilation_readiness(run);
            if readiness.ready {
                GateState::Open
            } else {
                GateState::Closed(GateClosure::MissingPrerequisites {
                    missing: readiness.missing,
                })
            }
        }
    }
}

/// Readiness queries bound to a registry.
#[derive(Debug, Clone, Copy)]
pub struct ReadinessEvaluator<'a> {
    registry: &'a StepRegistry,
}

impl<'a> ReadinessEvaluator<'a> {
    pub fn new(registry: &'a StepRegistry) -> Self {
        Self { registry }
    }

    /// Dependencies DONE and gate open, ignoring the step's own status.
    fn prerequisites_met(&self, step: StepKey, run: &PipelineRun) -> bool {
        let deps_done = self
            .registry
            .dependencies(step)
            .iter()
            .all(|dep| run.step_status(*dep) == StepStatus::Done);
        let gate_open = self
            .registry
            .gate(step)
            .is_none_or(|gate| evaluate_gate(gate, run).is_open());
        deps_done && gate_open
    }

    /// IDLE, every dependency DONE, and gate open.
    pub fn is_eligible(&self, step: StepKey, run: &PipelineRun) -> bool {
        self.registry.get(step).is_some()
            && run.step_status(step) == StepStatus::Idle
            && self.prerequisites_met(step, run)
    }

    pub fn eligible_steps(&self, run: &PipelineRun) -> BTreeSet<StepKey> {
        self.registry
            .steps()
            .iter()
            .map(|s| s.key)
            .filter(|key| self.is_eligible(*key, run))
            .collect()
    }

    /// Explain why an IDLE step cannot start. Returns `None` for steps that are
    /// eligible or already past IDLE.
    ///
    /// A validation FAIL is reported ahead of any unmet dependency so operators see the
    /// actionable cause first.
    pub fn blocked_reason(&self, step: StepKey, run: &PipelineRun) -> Option<BlockedReason> {
        if run.step_status(step) != StepStatus::Idle {
            return None;
        }
        self.unmet_prerequisite(step, run)
    }

    fn unmet_prerequisite(&self, step: StepKey, run: &PipelineRun) -> Option<BlockedReason> {
        let gate_state = self
            .registry
            .gate(step)
            .map(|gate| (gate, evaluate_gate(gate, run)));

        if let Some((_, GateState::Closed(GateClosure::ValidationFailed { issue_ids }))) =
            &gate_state
        {
            return Some(BlockedReason::ValidationFailed {
                issue_ids: issue_ids.clone(),
            });
        }

        if let Some(dep) = self
            .registry
            .dependencies(step)
            .iter()
            .find(|dep| run.step_status(**dep) != StepStatus::Done)
        {
            return Some(BlockedReason::DependencyNotDone {
                dependency: *dep,
                status: run.step_status(*dep),
            });
        }

        match gate_state {
            Some((gate, GateState::Closed(closure))) => {
                Some(BlockedReason::GateClosed { gate, closure })
            }
            _ => None,
        }
    }

    /// Steps the snapshot reports RUNNING although their prerequisites are unmet.
    ///
    /// The remote system owns scheduling; a non-empty result means the snapshot
    /// disagrees with the registry and is worth logging.
    pub fn running_violations(&self, run: &PipelineRun) -> Vec<(StepKey, BlockedReason)> {
        self.registry
            .steps()
            .iter()
            .filter(|s| run.step_status(s.key) == StepStatus::Running)
            .filter_map(|s| self.unmet_prerequisite(s.key, run).map(|r| (s.key, r)))
            .collect()
    }
}
