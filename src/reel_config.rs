//! Configuration for Reelforge, read from `.reelforge/reelforge.toml`.
//!
//! Settings are layered file → environment → CLI. Every section is optional and falls
//! back to defaults that work against a local pipeline service.
//!
//! # Configuration File Format
//!
//! ```toml
//! [remote]
//! base_url = "http://localhost:8000"
//! start_timeout_secs = 60
//! request_timeout_secs = 15
//!
//! [poll]
//! interval_ms = 2000
//! long_step_interval_ms = 5000
//! max_window_secs = 1800
//!
//! [poll.step_interval_ms]
//! compilation_builder = 10000
//!
//! [retry]
//! default_max_auto_attempts = 1
//! max_manual_retries = 5
//!
//! [retry.steps.footage_direction]
//! max_auto_attempts = 3
//!
//! [run]
//! language = "en"
//! target_minutes = 10
//! channel_profile = "science-explainers"
//!
//! [steps.speech_formatting]
//! voice = "narrator-2"
//! speed = 1.05
//! ```

use anyhow::{Context, Result};
use reelforge_common::{StartRunRequest, StepKey, StepSettings};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use crate::coordinator::{CoordinatorConfig, PollConfig};
use crate::pipeline::{RetryOverride, StepRegistry};

/// The name of the project configuration directory.
pub const REELFORGE_DIR: &str = ".reelforge";

/// Config file name inside [`REELFORGE_DIR`].
pub const CONFIG_FILE: &str = "reelforge.toml";

pub const ENV_BASE_URL: &str = "REELFORGE_BASE_URL";
pub const ENV_POLL_INTERVAL_MS: &str = "REELFORGE_POLL_INTERVAL_MS";

/// Connection settings for the remote pipeline service.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteSection {
    #[serde(default = "default_base_url")]
    pub base_url: String,
    /// Timeout for `start_run`, which can be slow while workers spin up
    #[serde(default = "default_start_timeout_secs")]
    pub start_timeout_secs: u64,
    /// Timeout for state fetches, retries and compile requests
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

fn default_base_url() -> String {
    "http://localhost:8000".to_string()
}

fn default_start_timeout_secs() -> u64 {
    60
}

fn default_request_timeout_secs() -> u64 {
    15
}

impl Default for RemoteSection {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            start_timeout_secs: default_start_timeout_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PollSection {
    #[serde(default = "default_interval_ms")]
    pub interval_ms: u64,
    /// Cadence while a long-running step is RUNNING
    #[serde(default = "default_long_step_interval_ms")]
    pub long_step_interval_ms: u64,
    /// Wall-clock ceiling on one polling window
    #[serde(default = "default_max_window_secs")]
    pub max_window_secs: u64,
    /// Per-step cadence, keyed by step name
    #[serde(default)]
    pub step_interval_ms: BTreeMap<String, u64>,
}

fn default_interval_ms() -> u64 {
    2000
}

fn default_long_step_interval_ms() -> u64 {
    5000
}

fn default_max_window_secs() -> u64 {
    1800
}

impl Default for PollSection {
    fn default() -> Self {
        Self {
            interval_ms: default_interval_ms(),
            long_step_interval_ms: default_long_step_interval_ms(),
            max_window_secs: default_max_window_secs(),
            step_interval_ms: BTreeMap::new(),
        }
    }
}

/// Per-step retry override.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetryStepSection {
    #[serde(default)]
    pub max_auto_attempts: Option<u32>,
    #[serde(default)]
    pub auto: Option<bool>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RetrySection {
    /// Automatic budget for steps without a more specific setting
    #[serde(default)]
    pub default_max_auto_attempts: Option<u32>,
    /// Ceiling on operator-triggered retries per step; unbounded when unset
    #[serde(default)]
    pub max_manual_retries: Option<u32>,
    #[serde(default)]
    pub steps: BTreeMap<String, RetryStepSection>,
}

/// Defaults for new runs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSection {
    #[serde(default = "default_language")]
    pub language: String,
    #[serde(default = "default_target_minutes")]
    pub target_minutes: u32,
    #[serde(default)]
    pub channel_profile: Option<String>,
}

fn default_language() -> String {
    "en".to_string()
}

fn default_target_minutes() -> u32 {
    10
}

impl Default for RunSection {
    fn default() -> Self {
        Self {
            language: default_language(),
            target_minutes: default_target_minutes(),
            channel_profile: None,
        }
    }
}

/// The complete reelforge.toml structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReelToml {
    #[serde(default)]
    pub remote: RemoteSection,
    #[serde(default)]
    pub poll: PollSection,
    #[serde(default)]
    pub retry: RetrySection,
    #[serde(default)]
    pub run: RunSection,
    /// Free-form per-step settings sent with `start_run`
    #[serde(default)]
    pub steps: BTreeMap<String, StepSettings>,
}

impl ReelToml {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file: {}", path.display()))?;

        Self::parse(&content)
    }

    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse reelforge.toml")
    }

    /// Load `.reelforge/reelforge.toml`, or defaults if it doesn't exist.
    pub fn load_or_default(reel_dir: &Path) -> Result<Self> {
        let config_path = reel_dir.join(CONFIG_FILE);
        if config_path.exists() {
            Self::load(&config_path)
        } else {
            Ok(Self::default())
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let content =
            toml::to_string_pretty(self).context("Failed to serialize reelforge.toml")?;
        std::fs::write(path, content)
            .with_context(|| format!("Failed to write config file: {}", path.display()))?;
        Ok(())
    }

    /// Apply environment overrides, looked up through `lookup`.
    pub fn apply_env<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = lookup(ENV_BASE_URL).filter(|v| !v.trim().is_empty()) {
            self.remote.base_url = url;
        }
        if let Some(interval) = lookup(ENV_POLL_INTERVAL_MS).and_then(|v| v.trim().parse().ok()) {
            self.poll.interval_ms = interval;
        }
    }

    /// Per-step settings keyed by step. Unknown step names are skipped (and reported
    /// by [`ReelToml::validate`]).
    pub fn step_settings(&self) -> BTreeMap<StepKey, StepSettings> {
        self.steps
            .iter()
            .filter_map(|(name, settings)| {
                StepKey::from_str(name)
                    .ok()
                    .map(|key| (key, settings.clone()))
            })
            .collect()
    }

    pub fn poll_config(&self) -> PollConfig {
        let mut config = PollConfig::default()
            .with_interval(Duration::from_millis(self.poll.interval_ms))
            .with_long_step_interval(Duration::from_millis(self.poll.long_step_interval_ms))
            .with_max_window(Duration::from_secs(self.poll.max_window_secs))
            .with_tick_timeout(Duration::from_secs(self.remote.request_timeout_secs));
        for (name, ms) in &self.poll.step_interval_ms {
            if let Ok(step) = StepKey::from_str(name) {
                config = config.with_step_interval(step, Duration::from_millis(*ms));
            }
        }
        config
    }

    pub fn coordinator_config(&self) -> CoordinatorConfig {
        CoordinatorConfig {
            start_timeout: Duration::from_secs(self.remote.start_timeout_secs),
            command_timeout: Duration::from_secs(self.remote.request_timeout_secs),
            poll: self.poll_config(),
            max_manual_retries: self.retry.max_manual_retries,
        }
    }

    /// The standard registry with this file's retry overrides applied.
    pub fn registry(&self) -> StepRegistry {
        let overrides: HashMap<StepKey, RetryOverride> = self
            .retry
            .steps
            .iter()
            .filter_map(|(name, section)| {
                StepKey::from_str(name).ok().map(|key| {
                    (
                        key,
                        RetryOverride {
                            auto_retry: section.auto,
                            max_auto_attempts: section.max_auto_attempts,
                        },
                    )
                })
            })
            .collect();
        StepRegistry::standard()
            .with_retry_overrides(self.retry.default_max_auto_attempts, &overrides)
    }

    /// Build a start request for `topic` from the `[run]` and `[steps]` sections.
    pub fn start_request(&self, topic: &str) -> StartRunRequest {
        let mut request =
            StartRunRequest::new(topic, &self.run.language, self.run.target_minutes);
        if let Some(profile) = &self.run.channel_profile {
            request = request.with_channel_profile(profile);
        }
        for (step, settings) in self.step_settings() {
            request = request.with_step_settings(step, settings);
        }
        request
    }

    /// Validate the configuration and return any warnings.
    pub fn validate(&self) -> Vec<String> {
        let mut warnings = Vec::new();

        if !self.remote.base_url.starts_with("http://")
            && !self.remote.base_url.starts_with("https://")
        {
            warnings.push(format!(
                "remote.base_url '{}' should start with http:// or https://",
                self.remote.base_url
            ));
        }
        if self.remote.start_timeout_secs == 0 || self.remote.request_timeout_secs == 0 {
            warnings.push("remote timeouts must be greater than zero".to_string());
        }
        if self.poll.interval_ms == 0 {
            warnings.push("poll.interval_ms must be greater than zero".to_string());
        }
        if self.poll.long_step_interval_ms == 0 {
            warnings.push("poll.long_step_interval_ms must be greater than zero".to_string());
        }
        if self.poll.max_window_secs.saturating_mul(1000) < self.poll.interval_ms {
            warnings.push(format!(
                "poll.max_window_secs ({}s) is shorter than poll.interval_ms ({}ms)",
                self.poll.max_window_secs, self.poll.interval_ms
            ));
        }
        if self.run.target_minutes == 0 {
            warnings.push("run.target_minutes must be greater than zero".to_string());
        }

        for (name, ms) in &self.poll.step_interval_ms {
            check_step_name(&mut warnings, "poll.step_interval_ms", name);
            if *ms == 0 {
                warnings.push(format!("poll.step_interval_ms.{} must be greater than zero", name));
            }
        }
        for name in self.retry.steps.keys() {
            check_step_name(&mut warnings, "retry.steps", name);
        }
        for name in self.steps.keys() {
            check_step_name(&mut warnings, "steps", name);
        }

        warnings
    }
}

fn check_step_name(warnings: &mut Vec<String>, section: &str, name: &str) {
    if let Err(err) = StepKey::from_str(name) {
        warnings.push(format!("Unknown step in [{}]: {}", section, err));
    }
}

/// Fully resolved configuration for one project directory.
#[derive(Debug, Clone)]
pub struct ReelConfig {
    pub project_dir: PathBuf,
    pub reel_dir: PathBuf,
    pub toml: ReelToml,
    /// CLI override for the remote base URL
    pub cli_base_url: Option<String>,
}

impl ReelConfig {
    /// Load configuration for `project_dir`, applying process environment overrides.
    pub fn new(project_dir: PathBuf) -> Result<Self> {
        let project_dir = project_dir
            .canonicalize()
            .context("Failed to resolve project directory")?;
        let reel_dir = project_dir.join(REELFORGE_DIR);
        let mut toml = ReelToml::load_or_default(&reel_dir)?;
        toml.apply_env(|key| std::env::var(key).ok());

        Ok(Self {
            project_dir,
            reel_dir,
            toml,
            cli_base_url: None,
        })
    }

    pub fn with_cli_args(project_dir: PathBuf, base_url: Option<String>) -> Result<Self> {
        let mut config = Self::new(project_dir)?;
        config.cli_base_url = base_url;
        Ok(config)
    }

    /// Remote base URL (CLI → env → file → default).
    pub fn base_url(&self) -> &str {
        self.cli_base_url
            .as_deref()
            .unwrap_or(&self.toml.remote.base_url)
    }

    pub fn config_file(&self) -> PathBuf {
        self.reel_dir.join(CONFIG_FILE)
    }

    /// Where the active run handle is persisted between invocations.
    pub fn run_file(&self) -> PathBuf {
        self.reel_dir.join("run.json")
    }

    pub fn log_dir(&self) -> PathBuf {
        self.reel_dir.join("logs")
    }

    pub fn validate(&self) -> Vec<String> {
        self.toml.validate()
    }
}

/// Create `.reelforge/` with a default config file. Returns `false` if the directory
/// already existed; an existing config file is never overwritten.
pub fn init_project(project_dir: &Path) -> Result<bool> {
    let reel_dir = project_dir.join(REELFORGE_DIR);
    let created = !reel_dir.exists();
    std::fs::create_dir_all(reel_dir.join("logs"))
        .with_context(|| format!("Failed to create directory: {}", reel_dir.display()))?;

    let config_path = reel_dir.join(CONFIG_FILE);
    if !config_path.exists() {
        ReelToml::default().save(&config_path)?;
    }
    Ok(created)
}
