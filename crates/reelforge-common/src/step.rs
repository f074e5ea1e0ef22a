use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Identity of a pipeline step as used on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepKey {
    Research,
    Narrative,
    Validation,
    Packaging,
    SpeechFormatting,
    FootageDirection,
    AssetResolution,
    CompilationBuilder,
}

impl StepKey {
    /// All steps in pipeline order.
    pub const ALL: [StepKey; 8] = [
        StepKey::Research,
        StepKey::Narrative,
        StepKey::Validation,
        StepKey::Packaging,
        StepKey::SpeechFormatting,
        StepKey::FootageDirection,
        StepKey::AssetResolution,
        StepKey::CompilationBuilder,
    ];

    /// Wire name of the step (`snake_case`).
    pub fn as_str(&self) -> &'static str {
        match self {
            StepKey::Research => "research",
            StepKey::Narrative => "narrative",
            StepKey::Validation => "validation",
            StepKey::Packaging => "packaging",
            StepKey::SpeechFormatting => "speech_formatting",
            StepKey::FootageDirection => "footage_direction",
            StepKey::AssetResolution => "asset_resolution",
            StepKey::CompilationBuilder => "compilation_builder",
        }
    }
}

impl fmt::Display for StepKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("Unknown step '{0}'. Valid steps: research, narrative, validation, packaging, speech_formatting, footage_direction, asset_resolution, compilation_builder")]
pub struct ParseStepKeyError(pub String);

impl FromStr for StepKey {
    type Err = ParseStepKeyError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_lowercase().replace('-', "_");
        StepKey::ALL
            .into_iter()
            .find(|k| k.as_str() == normalized)
            .ok_or_else(|| ParseStepKeyError(s.to_string()))
    }
}

/// Lifecycle status shared by steps and runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum StepStatus {
    #[default]
    Idle,
    Running,
    Done,
    Error,
}

impl StepStatus {
    /// DONE or ERROR.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Error)
    }
}

impl fmt::Display for StepStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            StepStatus::Idle => "IDLE",
            StepStatus::Running => "RUNNING",
            StepStatus::Done => "DONE",
            StepStatus::Error => "ERROR",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_key_round_trips_through_wire_name() {
        for key in StepKey::ALL {
            assert_eq!(key.as_str().parse::<StepKey>().unwrap(), key);
        }
    }

    #[test]
    fn test_step_key_parse_accepts_dashes_and_case() {
        assert_eq!(
            "Speech-Formatting".parse::<StepKey>().unwrap(),
            StepKey::SpeechFormatting
        );
    }

    #[test]
    fn test_step_key_parse_unknown() {
        let err = "thumbnail".parse::<StepKey>().unwrap_err();
        assert!(err.to_string().contains("thumbnail"));
    }

    #[test]
    fn test_step_status_serializes_uppercase() {
        let json = serde_json::to_string(&StepStatus::Running).unwrap();
        assert_eq!(json, "\"RUNNING\"");
        let status: StepStatus = serde_json::from_str("\"ERROR\"").unwrap();
        assert_eq!(status, StepStatus::Error);
    }

    #[test]
    fn test_step_status_terminal() {
        assert!(!StepStatus::Idle.is_terminal());
        assert!(!StepStatus::Running.is_terminal());
        assert!(StepStatus::Done.is_terminal());
        assert!(StepStatus::Error.is_terminal());
    }
}
