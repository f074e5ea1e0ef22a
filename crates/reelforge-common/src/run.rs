//! Run snapshot returned by the remote `get_state` call.

use crate::request::RunId;
use crate::step::{StepKey, StepStatus};
use chrono::{DateTime, Utc};
use serde::de::{DeserializeOwned, Error as _};
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::BTreeMap;

/// Top-level run status uses the same vocabulary as step status.
pub type RunStatus = StepStatus;

/// Status, diagnostics, and warnings for one step.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StepState {
    #[serde(default)]
    pub status: StepStatus,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub warnings: Vec<String>,
}

impl StepState {
    pub fn new(status: StepStatus) -> Self {
        Self {
            status,
            ..Default::default()
        }
    }

    pub fn failed(error: &str) -> Self {
        Self {
            status: StepStatus::Error,
            error: Some(error.to_string()),
            warnings: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ValidationStatus {
    Pass,
    Fail,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationIssue {
    pub issue_id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub severity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl ValidationIssue {
    pub fn new(issue_id: &str) -> Self {
        Self {
            issue_id: issue_id.to_string(),
            severity: None,
            message: None,
        }
    }
}

/// Output of the validation step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ValidationResult {
    pub status: ValidationStatus,
    #[serde(default)]
    pub issues: Vec<ValidationIssue>,
    /// Rewrite instructions for the narrative step, when the validator produced them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub patch_instructions: Option<serde_json::Value>,
}

impl ValidationResult {
    pub fn pass() -> Self {
        Self {
            status: ValidationStatus::Pass,
            issues: Vec::new(),
            patch_instructions: None,
        }
    }

    pub fn fail(issues: Vec<ValidationIssue>) -> Self {
        Self {
            status: ValidationStatus::Fail,
            issues,
            patch_instructions: None,
        }
    }

    pub fn with_patch(mut self, patch: serde_json::Value) -> Self {
        self.patch_instructions = Some(patch);
        self
    }

    pub fn is_fail(&self) -> bool {
        self.status == ValidationStatus::Fail
    }

    /// True when patch instructions exist and are not an empty value.
    pub fn has_patch_instructions(&self) -> bool {
        match &self.patch_instructions {
            None | Some(serde_json::Value::Null) => false,
            Some(serde_json::Value::String(s)) => !s.trim().is_empty(),
            Some(serde_json::Value::Array(a)) => !a.is_empty(),
            Some(serde_json::Value::Object(o)) => !o.is_empty(),
            Some(_) => true,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShotScene {
    #[serde(default)]
    pub scene_id: String,
    #[serde(flatten)]
    pub details: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ShotPlan {
    #[serde(default)]
    pub scenes: Vec<ShotScene>,
}

/// Narrated-audio package produced by speech synthesis.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NarratedAudio {
    #[serde(default)]
    pub files: Vec<String>,
}

/// Opaque per-step outputs. Only the shot plan, audio, and video path are inspected.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RunOutputs {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub research_report: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub draft_script: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub shot_plan: Option<ShotPlan>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub narrated_audio: Option<NarratedAudio>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub video_path: Option<String>,
}

/// Full remote-authoritative state of one run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineRun {
    pub run_id: RunId,
    #[serde(default)]
    pub status: RunStatus,
    #[serde(default, deserialize_with = "known_steps")]
    pub steps: BTreeMap<StepKey, StepState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub validation: Option<ValidationResult>,
    #[serde(default, deserialize_with = "known_steps")]
    pub attempts: BTreeMap<StepKey, u32>,
    #[serde(default)]
    pub outputs: RunOutputs,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<DateTime<Utc>>,
}

/// Decode a step-keyed map, skipping steps this build does not know about.
fn known_steps<'de, D, V>(deserializer: D) -> Result<BTreeMap<StepKey, V>, D::Error>
where
    D: Deserializer<'de>,
    V: DeserializeOwned,
{
    let raw = BTreeMap::<String, serde_json::Value>::deserialize(deserializer)?;
    raw.into_iter()
        .filter_map(|(key, value)| key.parse::<StepKey>().ok().map(|step| (step, value)))
        .map(|(step, value)| {
            serde_json::from_value(value)
                .map(|v| (step, v))
                .map_err(D::Error::custom)
        })
        .collect()
}

impl PipelineRun {
    /// A fresh run with every step IDLE.
    pub fn new(run_id: RunId) -> Self {
        Self {
            run_id,
            status: RunStatus::Idle,
            steps: StepKey::ALL
                .into_iter()
                .map(|k| (k, StepState::default()))
                .collect(),
            validation: None,
            attempts: BTreeMap::new(),
            outputs: RunOutputs::default(),
            updated_at: None,
        }
    }

    /// Status of a step; steps absent from the snapshot are IDLE.
    pub fn step_status(&self, step: StepKey) -> StepStatus {
        self.steps
            .get(&step)
            .map(|s| s.status)
            .unwrap_or_default()
    }

    pub fn step(&self, step: StepKey) -> Option<&StepState> {
        self.steps.get(&step)
    }

    /// Attempts the remote system has recorded for a step.
    pub fn attempts(&self, step: StepKey) -> u32 {
        self.attempts.get(&step).copied().unwrap_or(0)
    }

    pub fn with_step(mut self, step: StepKey, state: StepState) -> Self {
        self.steps.insert(step, state);
        self
    }

    pub fn with_status(mut self, status: RunStatus) -> Self {
        self.status = status;
        self
    }

    pub fn with_validation(mut self, validation: ValidationResult) -> Self {
        self.validation = Some(validation);
        self
    }

    pub fn with_outputs(mut self, outputs: RunOutputs) -> Self {
        self.outputs = outputs;
        self
    }
}
