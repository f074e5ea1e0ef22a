use crate::step::StepKey;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Opaque run identifier assigned by the remote system.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunId(String);

impl RunId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for RunId {
    fn from(value: &str) -> Self {
        Self(value.to_string())
    }
}

/// Free-form settings for one step. The coordinator never interprets them.
pub type StepSettings = BTreeMap<String, serde_json::Value>;

/// Body of the remote `start_run` call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartRunRequest {
    pub topic: String,
    pub language: String,
    pub target_minutes: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channel_profile: Option<String>,
    #[serde(default)]
    pub per_step_configs: BTreeMap<StepKey, StepSettings>,
}

impl StartRunRequest {
    pub fn new(topic: &str, language: &str, target_minutes: u32) -> Self {
        Self {
            topic: topic.to_string(),
            language: language.to_string(),
            target_minutes,
            channel_profile: None,
            per_step_configs: BTreeMap::new(),
        }
    }

    pub fn with_channel_profile(mut self, profile: &str) -> Self {
        self.channel_profile = Some(profile.to_string());
        self
    }

    pub fn with_step_settings(mut self, step: StepKey, settings: StepSettings) -> Self {
        self.per_step_configs.insert(step, settings);
        self
    }
}

/// Response of the remote `start_run` call.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StartRunResponse {
    pub run_id: RunId,
}

/// Compilation mode passed to the remote `compile` call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CompileMode {
    #[default]
    Full,
    Preview,
}

impl fmt::Display for CompileMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompileMode::Full => f.write_str("full"),
            CompileMode::Preview => f.write_str("preview"),
        }
    }
}

impl FromStr for CompileMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "full" => Ok(CompileMode::Full),
            "preview" => Ok(CompileMode::Preview),
            other => Err(format!(
                "Invalid compile mode '{}'. Valid values: full, preview",
                other
            )),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_start_request_serializes_step_keys_snake_case() {
        let mut settings = StepSettings::new();
        settings.insert("voice".to_string(), json!("narrator-2"));
        let request = StartRunRequest::new("Deep sea vents", "en", 12)
            .with_step_settings(StepKey::SpeechFormatting, settings);

        let value = serde_json::to_value(&request).unwrap();
        assert_eq!(value["per_step_configs"]["speech_formatting"]["voice"], "narrator-2");
        assert!(value.get("channel_profile").is_none());
    }

    #[test]
    fn test_compile_mode_parse() {
        assert_eq!("FULL".parse::<CompileMode>().unwrap(), CompileMode::Full);
        assert_eq!("preview".parse::<CompileMode>().unwrap(), CompileMode::Preview);
        assert!("draft".parse::<CompileMode>().is_err());
    }

    #[test]
    fn test_run_id_is_transparent() {
        let id: RunId = serde_json::from_str("\"run-42\"").unwrap();
        assert_eq!(id.as_str(), "run-42");
        assert_eq!(id.to_string(), "run-42");
    }
}
