//! Plain-terminal rendering of a [`RunView`].

use console::style;
use reelforge_common::{RunStatus, StepStatus};
use std::time::Duration;

use crate::coordinator::{RunView, StepView, SyncOutcome, SyncStatus};
use crate::ui::icons::{BLOCKER, FILM, WRENCH, status_icon};

fn styled_status(status: StepStatus) -> String {
    let text = format!("{:<7}", status.to_string());
    match status {
        StepStatus::Done => style(text).green().to_string(),
        StepStatus::Error => style(text).red().bold().to_string(),
        StepStatus::Running => style(text).cyan().to_string(),
        StepStatus::Idle => style(text).dim().to_string(),
    }
}

/// One line for a step, plus indented detail lines.
pub fn step_lines(row: &StepView) -> Vec<String> {
    let mut lines = vec![format!(
        "{}{:<20} {} attempts {}/{}{}",
        status_icon(row.status),
        row.name,
        styled_status(row.status),
        row.attempts_used,
        row.max_attempts,
        if row.eligible {
            format!(" {}", style("(ready)").green())
        } else {
            String::new()
        }
    )];

    if let Some(error) = &row.error {
        lines.push(format!("      error: {}", style(error).red()));
    }
    for warning in &row.warnings {
        lines.push(format!("      warning: {}", style(warning).yellow()));
    }
    if let Some(reason) = &row.blocked_reason {
        lines.push(format!("      {}{}", BLOCKER, style(reason).yellow()));
    }
    if row.manual_fix_required {
        lines.push(format!(
            "      {}{}",
            WRENCH,
            style("manual fix required (retry with --operator)").red()
        ));
    } else if row.auto_retry_available {
        lines.push(format!(
            "      {}",
            style(format!("automatic retry available: reelforge retry {}", row.step)).dim()
        ));
    }
    lines
}

pub fn sync_line(status: &SyncStatus) -> String {
    match status {
        SyncStatus::Idle => "sync: idle".to_string(),
        SyncStatus::Polling { scope, .. } => format!("sync: polling ({:?})", scope),
        SyncStatus::Stopped { outcome, .. } => match outcome {
            SyncOutcome::Finished(status) => format!("sync: finished ({})", status),
            SyncOutcome::TimedOut { elapsed } => format!(
                "sync: timed out after {} (run `reelforge watch` to resume)",
                format_duration(*elapsed)
            ),
            SyncOutcome::Failed { error } => format!("sync: failed ({})", error),
            SyncOutcome::Cancelled => "sync: cancelled".to_string(),
        },
    }
}

/// Full status report for `reelforge status`.
pub fn render_view(view: &RunView) -> String {
    let mut lines = Vec::new();
    let status = match view.status {
        RunStatus::Done => style(view.status.to_string()).green().bold(),
        RunStatus::Error => style(view.status.to_string()).red().bold(),
        _ => style(view.status.to_string()).cyan(),
    };
    lines.push(format!("Run {}  {}", style(&view.run_id).bold(), status));
    if let Some(fetched) = view.fetched_at {
        lines.push(format!(
            "{}",
            style(format!("fetched {}", fetched.format("%Y-%m-%d %H:%M:%S UTC"))).dim()
        ));
    }
    lines.push(String::new());

    for row in &view.steps {
        lines.extend(step_lines(row));
    }
    lines.push(String::new());

    if let Some(validation) = &view.validation {
        let issues = if validation.issue_ids.is_empty() {
            "no issues".to_string()
        } else {
            format!("issues: {}", validation.issue_ids.join(", "))
        };
        lines.push(format!(
            "Validation: {} ({}{})",
            validation.status_label(),
            issues,
            if validation.has_patch_instructions {
                ", patch instructions available"
            } else {
                ""
            }
        ));
    }

    if view.compilation.ready {
        lines.push(format!("Compilation: {}", style("ready").green()));
    } else {
        let missing: Vec<String> = view.compilation.missing.iter().map(|m| m.to_string()).collect();
        lines.push(format!(
            "Compilation: not ready (missing {})",
            missing.join(", ")
        ));
    }
    if let Some(path) = &view.video_path {
        lines.push(format!("{}Video: {}", FILM, style(path).green().bold()));
    }
    lines.push(style(sync_line(&view.sync)).dim().to_string());

    lines.join("\n")
}

/// Format a duration for display.
pub fn format_duration(d: Duration) -> String {
    let secs = d.as_secs();
    if secs >= 3600 {
        format!("{}h {}m {}s", secs / 3600, (secs % 3600) / 60, secs % 60)
    } else if secs >= 60 {
        format!("{}m {}s", secs / 60, secs % 60)
    } else if secs > 0 {
        format!("{}s", secs)
    } else {
        format!("{}ms", d.as_millis())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::pipeline::{RetryManager, StepRegistry};
    use reelforge_common::{
        NarratedAudio, PipelineRun, RunId, RunOutputs, ShotPlan, ShotScene, StepKey, StepState,
        ValidationIssue, ValidationResult,
    };
    use std::sync::Arc;

    fn view_of(run: &PipelineRun) -> RunView {
        let registry = Arc::new(StepRegistry::standard());
        let retries = RetryManager::new(Arc::clone(&registry), None);
        RunView::build(run, &registry, &retries, SyncStatus::Idle, None)
    }

    #[test]
    fn test_render_blocked_run() {
        let run = PipelineRun::new(RunId::new("run-7"))
            .with_status(RunStatus::Running)
            .with_step(StepKey::Research, StepState::new(StepStatus::Done))
            .with_step(StepKey::Narrative, StepState::new(StepStatus::Done))
            .with_step(StepKey::Validation, StepState::new(StepStatus::Done))
            .with_validation(ValidationResult::fail(vec![ValidationIssue::new("X1")]));
        let text = render_view(&view_of(&run));
        assert!(text.contains("run-7"));
        assert!(text.contains("validation FAIL"));
        assert!(text.contains("manual fix required"));
        assert!(text.contains("issues: X1"));
        assert!(text.contains("missing shot plan, narrated audio"));
    }

    #[test]
    fn test_render_finished_run_shows_video() {
        let outputs = RunOutputs {
            shot_plan: Some(ShotPlan {
                scenes: vec![ShotScene {
                    scene_id: "s1".to_string(),
                    details: Default::default(),
                }],
            }),
            narrated_audio: Some(NarratedAudio {
                files: vec!["a.wav".to_string()],
            }),
            video_path: Some("/out/final.mp4".to_string()),
            ..Default::default()
        };
        let run = PipelineRun::new(RunId::new("run-8"))
            .with_status(RunStatus::Done)
            .with_step(StepKey::CompilationBuilder, StepState::new(StepStatus::Done))
            .with_outputs(outputs);
        let text = render_view(&view_of(&run));
        assert!(text.contains("/out/final.mp4"));
        assert!(text.contains("Compilation:"));
        assert!(!text.contains("not ready"));
    }

    #[test]
    fn test_sync_line_timeout_mentions_resume() {
        let line = sync_line(&SyncStatus::Stopped {
            run_id: RunId::new("r"),
            outcome: SyncOutcome::TimedOut {
                elapsed: Duration::from_secs(1800),
            },
        });
        assert!(line.contains("30m 0s"));
        assert!(line.contains("reelforge watch"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(Duration::from_millis(250)), "250ms");
        assert_eq!(format_duration(Duration::from_secs(42)), "42s");
        assert_eq!(format_duration(Duration::from_secs(3725)), "1h 2m 5s");
    }
}
