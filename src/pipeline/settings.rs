//! Per-step settings snapshots and "unsaved changes" detection.
//!
//! A [`SettingsSnapshot`] captures the per-step settings a run was started with.
//! Diffing it against the settings a caller is currently editing yields field-level
//! changes. Nested objects are flattened into dotted paths; arrays and scalars compare
//! as whole values.

use reelforge_common::{StepKey, StepSettings};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Added,
    Removed,
    Modified,
}

/// One field that differs between the saved and current settings.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SettingChange {
    pub step: StepKey,
    /// Dotted path of the field within the step's settings
    pub path: String,
    pub kind: ChangeKind,
    pub before: Option<Value>,
    pub after: Option<Value>,
}

impl fmt::Display for SettingChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let show = |v: &Option<Value>| v.as_ref().map_or("-".to_string(), |v| v.to_string());
        match self.kind {
            ChangeKind::Added => write!(f, "+ {}.{} = {}", self.step, self.path, show(&self.after)),
            ChangeKind::Removed => {
                write!(f, "- {}.{} (was {})", self.step, self.path, show(&self.before))
            }
            ChangeKind::Modified => write!(
                f,
                "~ {}.{}: {} -> {}",
                self.step,
                self.path,
                show(&self.before),
                show(&self.after)
            ),
        }
    }
}

/// Saved per-step settings.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SettingsSnapshot {
    configs: BTreeMap<StepKey, StepSettings>,
}

impl SettingsSnapshot {
    pub fn capture(configs: &BTreeMap<StepKey, StepSettings>) -> Self {
        Self {
            configs: configs.clone(),
        }
    }

    pub fn configs(&self) -> &BTreeMap<StepKey, StepSettings> {
        &self.configs
    }

    /// Field-level changes from this snapshot to `current`, ordered by step then path.
    pub fn diff(&self, current: &BTreeMap<StepKey, StepSettings>) -> Vec<SettingChange> {
        let steps: BTreeSet<StepKey> = self.configs.keys().chain(current.keys()).copied().collect();
        let empty = StepSettings::new();
        let mut changes = Vec::new();
        for step in steps {
            let before = flatten(self.configs.get(&step).unwrap_or(&empty));
            let after = flatten(current.get(&step).unwrap_or(&empty));
            let paths: BTreeSet<&String> = before.keys().chain(after.keys()).collect();
            for path in paths {
                let (b, a) = (before.get(path), after.get(path));
                let kind = match (b, a) {
                    (None, Some(_)) => ChangeKind::Added,
                    (Some(_), None) => ChangeKind::Removed,
                    (Some(b), Some(a)) if b != a => ChangeKind::Modified,
                    _ => continue,
                };
                changes.push(SettingChange {
                    step,
                    path: path.clone(),
                    kind,
                    before: b.cloned(),
                    after: a.cloned(),
                });
            }
        }
        changes
    }

    pub fn has_unsaved_changes(&self, current: &BTreeMap<StepKey, StepSettings>) -> bool {
        !self.diff(current).is_empty()
    }

    /// Steps whose settings differ from the snapshot.
    pub fn dirty_steps(&self, current: &BTreeMap<StepKey, StepSettings>) -> BTreeSet<StepKey> {
        self.diff(current).into_iter().map(|c| c.step).collect()
    }
}

fn flatten(settings: &StepSettings) -> BTreeMap<String, Value> {
    let mut out = BTreeMap::new();
    for (key, value) in settings {
        flatten_into(key.clone(), value, &mut out);
    }
    out
}

fn flatten_into(prefix: String, value: &Value, out: &mut BTreeMap<String, Value>) {
    match value {
        Value::Object(map) if !map.is_empty() => {
            for (key, nested) in map {
                flatten_into(format!("{}.{}", prefix, key), nested, out);
            }
        }
        other => {
            out.insert(prefix, other.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn settings(value: Value) -> StepSettings {
        serde_json::from_value(value).unwrap()
    }

    fn configs(entries: Vec<(StepKey, Value)>) -> BTreeMap<StepKey, StepSettings> {
        entries.into_iter().map(|(k, v)| (k, settings(v))).collect()
    }

    #[test]
    fn test_identical_settings_have_no_changes() {
        let saved = configs(vec![(StepKey::Narrative, json!({"tone": "calm", "words": 1800}))]);
        let snapshot = SettingsSnapshot::capture(&saved);
        assert!(!snapshot.has_unsaved_changes(&saved));
    }

    #[test]
    fn test_nested_change_reports_dotted_path() {
        let saved = configs(vec![(
            StepKey::SpeechFormatting,
            json!({"voice": {"id": "v1", "speed": 1.0}}),
        )]);
        let current = configs(vec![(
            StepKey::SpeechFormatting,
            json!({"voice": {"id": "v1", "speed": 1.1}}),
        )]);
        let changes = SettingsSnapshot::capture(&saved).diff(&current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "voice.speed");
        assert_eq!(changes[0].kind, ChangeKind::Modified);
        assert_eq!(
            changes[0].to_string(),
            "~ speech_formatting.voice.speed: 1.0 -> 1.1"
        );
    }

    #[test]
    fn test_added_and_removed_fields_and_steps() {
        let saved = configs(vec![(StepKey::Research, json!({"depth": 3, "sources": ["wiki"]}))]);
        let current = configs(vec![
            (StepKey::Research, json!({"depth": 3})),
            (StepKey::FootageDirection, json!({"style": "archival"})),
        ]);
        let snapshot = SettingsSnapshot::capture(&saved);
        let changes = snapshot.diff(&current);
        assert_eq!(changes.len(), 2);
        assert_eq!(changes[0].step, StepKey::Research);
        assert_eq!(changes[0].kind, ChangeKind::Removed);
        assert_eq!(changes[1].step, StepKey::FootageDirection);
        assert_eq!(changes[1].kind, ChangeKind::Added);
        assert_eq!(
            snapshot.dirty_steps(&current).into_iter().collect::<Vec<_>>(),
            vec![StepKey::Research, StepKey::FootageDirection]
        );
    }

    #[test]
    fn test_arrays_compare_as_whole_values() {
        let saved = configs(vec![(StepKey::Packaging, json!({"tags": ["a", "b"]}))]);
        let current = configs(vec![(StepKey::Packaging, json!({"tags": ["b", "a"]}))]);
        let changes = SettingsSnapshot::capture(&saved).diff(&current);
        assert_eq!(changes.len(), 1);
        assert_eq!(changes[0].path, "tags");
    }
}
