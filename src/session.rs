//! The active run, persisted between CLI invocations in `.reelforge/run.json`.

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;

use crate::coordinator::RunHandle;
use crate::pipeline::SettingsSnapshot;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RunRecord {
    pub handle: RunHandle,
    pub topic: String,
    /// Per-step settings the run was started with
    #[serde(default)]
    pub settings: SettingsSnapshot,
}

impl RunRecord {
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read run file: {}", path.display()))?;
        serde_json::from_str(&content)
            .with_context(|| format!("Failed to parse run file: {}", path.display()))
    }

    /// Load the record if one exists.
    pub fn load_optional(path: &Path) -> Result<Option<Self>> {
        if path.exists() {
            Self::load(path).map(Some)
        } else {
            Ok(None)
        }
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create directory: {}", parent.display()))?;
        }
        let json = serde_json::to_string_pretty(self).context("Failed to serialize run record")?;
        std::fs::write(path, json)
            .with_context(|| format!("Failed to write run file: {}", path.display()))
    }

    /// Forget the active run. Returns whether a record existed.
    pub fn remove(path: &Path) -> Result<bool> {
        if !path.exists() {
            return Ok(false);
        }
        std::fs::remove_file(path)
            .with_context(|| format!("Failed to remove run file: {}", path.display()))?;
        Ok(true)
    }
}
