//! Static description of the pipeline's steps.
//!
//! The registry records, for each step, its upstream dependencies, its gate (if any),
//! and its retry policy. Every other component reads it; nothing mutates it after
//! construction.

use crate::errors::RegistryError;
use reelforge_common::StepKey;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// A predicate over another step's structured output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gate {
    /// Open only when the validation result reports PASS.
    ValidationPassed,
    /// Open only when a non-empty shot plan and narrated audio both exist.
    CompilationReady,
}

impl Gate {
    pub fn name(&self) -> &'static str {
        match self {
            Gate::ValidationPassed => "validation_passed",
            Gate::CompilationReady => "compilation_ready",
        }
    }
}

/// Something that must be present before an automatic retry is offered.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryPrecondition {
    /// A rewrite driven by a failed validation needs patch instructions.
    PatchInstructions,
}

/// How long a step usually runs. Long steps are polled at a coarser cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepDuration {
    #[default]
    Short,
    Long,
}

/// Definition of one pipeline step.
#[derive(Debug, Clone, PartialEq)]
pub struct StepDef {
    pub key: StepKey,
    /// Human-readable name
    pub name: &'static str,
    /// Steps that must be DONE before this one may start
    pub depends_on: Vec<StepKey>,
    pub gate: Option<Gate>,
    /// Operators may retry the step after a failure
    pub retriable: bool,
    /// The coordinator may offer automatic retries
    pub auto_retry: bool,
    pub max_auto_attempts: u32,
    pub retry_precondition: Option<RetryPrecondition>,
    pub duration: StepDuration,
}

impl StepDef {
    pub fn new(key: StepKey, name: &'static str, depends_on: Vec<StepKey>) -> Self {
        Self {
            key,
            name,
            depends_on,
            gate: None,
            retriable: true,
            auto_retry: true,
            max_auto_attempts: 1,
            retry_precondition: None,
            duration: StepDuration::Short,
        }
    }

    pub fn with_gate(mut self, gate: Gate) -> Self {
        self.gate = Some(gate);
        self
    }

    pub fn with_auto_retry(mut self, enabled: bool, max_attempts: u32) -> Self {
        self.auto_retry = enabled;
        self.max_auto_attempts = max_attempts;
        self
    }

    pub fn with_precondition(mut self, precondition: RetryPrecondition) -> Self {
        self.retry_precondition = Some(precondition);
        self
    }

    pub fn long_running(mut self) -> Self {
        self.duration = StepDuration::Long;
        self
    }

    pub fn operator_only(mut self) -> Self {
        self.auto_retry = false;
        self
    }
}

/// Per-step retry policy overrides applied on top of the standard registry.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RetryOverride {
    pub auto_retry: Option<bool>,
    pub max_auto_attempts: Option<u32>,
}

/// Read-only metadata for every step of the pipeline.
#[derive(Debug, Clone)]
pub struct StepRegistry {
    steps: Vec<StepDef>,
    index: HashMap<StepKey, usize>,
    dependents: HashMap<StepKey, Vec<StepKey>>,
}

impl StepRegistry {
    /// Build a registry from step definitions, rejecting duplicates, unknown
    /// dependencies, and cycles.
    pub fn new(steps: Vec<StepDef>) -> Result<Self, RegistryError> {
        let mut index = HashMap::new();
        for (i, step) in steps.iter().enumerate() {
            if index.insert(step.key, i).is_some() {
                return Err(RegistryError::DuplicateStep(step.key));
            }
        }

        let mut dependents: HashMap<StepKey, Vec<StepKey>> = HashMap::new();
        for step in &steps {
            for dep in &step.depends_on {
                if !index.contains_key(dep) {
                    return Err(RegistryError::UnknownDependency {
                        step: step.key,
                        dependency: *dep,
                    });
                }
                dependents.entry(*dep).or_default().push(step.key);
            }
        }

        let registry = Self {
            steps,
            index,
            dependents,
        };
        registry.validate_no_cycles()?;
        Ok(registry)
    }

    /// The observed production pipeline.
    ///
    /// research → narrative → validation → packaging (gated on PASS) → speech_formatting
    /// → footage_direction → asset_resolution. Compilation has no chain dependency and is
    /// gated on compilation readiness alone.
    pub fn standard() -> Self {
        let steps = vec![
            StepDef::new(StepKey::Research, "Research", vec![]).long_running(),
            StepDef::new(StepKey::Narrative, "Narrative", vec![StepKey::Research])
                .with_auto_retry(true, 2)
                .with_precondition(RetryPrecondition::PatchInstructions)
                .long_running(),
            StepDef::new(StepKey::Validation, "Fact validation", vec![StepKey::Narrative])
                .operator_only(),
            StepDef::new(StepKey::Packaging, "Packaging", vec![StepKey::Validation])
                .with_gate(Gate::ValidationPassed),
            StepDef::new(
                StepKey::SpeechFormatting,
                "Speech formatting",
                vec![StepKey::Packaging],
            ),
            StepDef::new(
                StepKey::FootageDirection,
                "Footage direction",
                vec![StepKey::SpeechFormatting],
            )
            .long_running(),
            StepDef::new(
                StepKey::AssetResolution,
                "Asset resolution",
                vec![StepKey::FootageDirection],
            )
            .long_running(),
            StepDef::new(StepKey::CompilationBuilder, "Video compilation", vec![])
                .with_gate(Gate::CompilationReady)
                .long_running(),
        ];
        Self::new(steps).expect("standard registry is a valid static graph")
    }

    /// Apply retry overrides (from configuration) to a registry.
    pub fn with_retry_overrides(
        mut self,
        default_max_auto_attempts: Option<u32>,
        overrides: &HashMap<StepKey, RetryOverride>,
    ) -> Self {
        for step in &mut self.steps {
            // The narrative rewrite budget only changes through an explicit override.
            if let Some(default_max) = default_max_auto_attempts
                && step.key != StepKey::Narrative
            {
                step.max_auto_attempts = default_max;
            }
            if let Some(o) = overrides.get(&step.key) {
                if let Some(auto) = o.auto_retry {
                    step.auto_retry = auto;
                }
                if let Some(max) = o.max_auto_attempts {
                    step.max_auto_attempts = max;
                }
            }
        }
        self
    }

    pub fn get(&self, step: StepKey) -> Option<&StepDef> {
        self.index.get(&step).and_then(|&i| self.steps.get(i))
    }

    /// All steps in registration order.
    pub fn steps(&self) -> &[StepDef] {
        &self.steps
    }

    pub fn dependencies(&self, step: StepKey) -> &[StepKey] {
        self.get(step)
            .map(|s| s.depends_on.as_slice())
            .unwrap_or(&[])
    }

    /// Steps that directly depend on `step`.
    pub fn dependents(&self, step: StepKey) -> &[StepKey] {
        self.dependents
            .get(&step)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    pub fn gate(&self, step: StepKey) -> Option<Gate> {
        self.get(step).and_then(|s| s.gate)
    }

    pub fn is_retriable(&self, step: StepKey) -> bool {
        self.get(step).is_some_and(|s| s.retriable)
    }

    pub fn is_auto_retriable(&self, step: StepKey) -> bool {
        self.get(step)
            .is_some_and(|s| s.retriable && s.auto_retry && s.max_auto_attempts > 0)
    }

    pub fn max_auto_attempts(&self, step: StepKey) -> u32 {
        self.get(step).map_or(0, |s| s.max_auto_attempts)
    }

    pub fn retry_precondition(&self, step: StepKey) -> Option<RetryPrecondition> {
        self.get(step).and_then(|s| s.retry_precondition)
    }

    pub fn duration(&self, step: StepKey) -> StepDuration {
        self.get(step).map(|s| s.duration).unwrap_or_default()
    }

    /// Kahn's algorithm over the dependency edges.
    fn validate_no_cycles(&self) -> Result<(), RegistryError> {
        let mut in_degree: HashMap<StepKey, usize> = self
            .steps
            .iter()
            .map(|s| (s.key, s.depends_on.len()))
            .collect();
        let mut queue: Vec<StepKey> = in_degree
            .iter()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(k, _)| *k)
            .collect();
        let mut processed = 0;

        while let Some(step) = queue.pop() {
            processed += 1;
            for dependent in self.dependents(step) {
                if let Some(deg) = in_degree.get_mut(dependent) {
                    *deg -= 1;
                    if *deg == 0 {
                        queue.push(*dependent);
                    }
                }
            }
        }

        if processed != self.steps.len() {
            let mut cyclic: Vec<StepKey> = in_degree
                .into_iter()
                .filter(|&(_, deg)| deg > 0)
                .map(|(k, _)| k)
                .collect();
            cyclic.sort();
            return Err(RegistryError::Cycle(cyclic));
        }
        Ok(())
    }
}

impl Default for StepRegistry {
    fn default() -> Self {
        Self::standard()
    }
}
