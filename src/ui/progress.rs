use console::style;
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use reelforge_common::{StepKey, StepStatus};
use std::collections::HashMap;
use std::time::Duration;

use crate::coordinator::{RunView, StepView, SyncOutcome};
use crate::ui::icons::{BLOCKER, CLOCK, CROSS, FILM, SPARKLE, WRENCH, status_icon};
use crate::ui::status::format_duration;

/// Live terminal display for `reelforge watch`, rendered via `indicatif`.
///
/// The top bar counts finished steps; below it each step gets a line whose spinner
/// runs while the step is RUNNING.
pub struct RunProgressUI {
    multi: MultiProgress,
    overall: ProgressBar,
    rows: HashMap<StepKey, ProgressBar>,
    last_status: HashMap<StepKey, StepStatus>,
}

impl RunProgressUI {
    pub fn new(steps: &[(StepKey, &'static str)]) -> Self {
        let multi = MultiProgress::new();

        let overall_style = ProgressStyle::default_bar()
            .template("{prefix:.bold.dim} [{bar:30.cyan/blue}] {pos}/{len} {msg}")
            .expect("progress bar template is a valid static string")
            .progress_chars("█▓▒░");
        let overall = multi.add(ProgressBar::new(steps.len() as u64));
        overall.set_style(overall_style);
        overall.set_prefix("Steps");

        let row_style = ProgressStyle::default_spinner()
            .template("  {spinner} {prefix:<20} {msg}")
            .expect("progress bar template is a valid static string");

        let rows = steps
            .iter()
            .map(|(step, name)| {
                let bar = multi.add(ProgressBar::new_spinner());
                bar.set_style(row_style.clone());
                bar.set_prefix(*name);
                bar.set_message(style("waiting").dim().to_string());
                (*step, bar)
            })
            .collect();

        Self {
            multi,
            overall,
            rows,
            last_status: HashMap::new(),
        }
    }

    fn print_line(&self, msg: impl AsRef<str>) {
        if self.multi.println(msg.as_ref()).is_err() {
            eprintln!("{}", msg.as_ref());
        }
    }

    /// Redraw every row from a fresh view. Status transitions are also printed as
    /// permanent lines above the bars.
    pub fn update(&mut self, view: &RunView) {
        let done = view
            .steps
            .iter()
            .filter(|row| row.status == StepStatus::Done)
            .count();
        self.overall.set_position(done as u64);
        self.overall.set_message(format!("run {} {}", view.run_id, view.status));

        for row in &view.steps {
            let Some(bar) = self.rows.get(&row.step) else {
                continue;
            };
            bar.set_message(row_message(row));
            if row.status == StepStatus::Running {
                bar.enable_steady_tick(Duration::from_millis(120));
            } else {
                bar.disable_steady_tick();
                bar.tick();
            }

            let previous = self.last_status.insert(row.step, row.status);
            if previous.is_some_and(|p| p != row.status) {
                self.print_line(format!(
                    "{}{} → {}",
                    status_icon(row.status),
                    row.name,
                    row.status
                ));
                if let Some(error) = &row.error {
                    self.print_line(format!("    {} {}", CROSS, style(error).red()));
                }
            }
        }
    }

    /// Stop all spinners and print how the watch ended.
    pub fn finish(&self, outcome: Option<&SyncOutcome>, view: Option<&RunView>) {
        for bar in self.rows.values() {
            bar.disable_steady_tick();
        }
        let summary = match outcome {
            Some(SyncOutcome::Finished(StepStatus::Done)) => {
                format!("{}{}", SPARKLE, style("Run finished").green().bold())
            }
            Some(SyncOutcome::Finished(status)) => {
                format!("{}{}", CROSS, style(format!("Run ended in {}", status)).red().bold())
            }
            Some(SyncOutcome::TimedOut { elapsed }) => format!(
                "{}{}",
                CLOCK,
                style(format!(
                    "Polling window expired after {}; the run may still be going. Run `reelforge watch` to resume.",
                    format_duration(*elapsed)
                ))
                .yellow()
            ),
            Some(SyncOutcome::Failed { error }) => {
                format!("{}{}", CROSS, style(format!("Polling failed: {}", error)).red())
            }
            Some(SyncOutcome::Cancelled) | None => style("Stopped watching").dim().to_string(),
        };
        self.overall.finish_with_message(summary);

        if let Some(path) = view.and_then(|v| v.video_path.as_deref()) {
            self.print_line(format!("{}Video: {}", FILM, style(path).green().bold()));
        }
    }
}

fn row_message(row: &StepView) -> String {
    let mut message = match row.status {
        StepStatus::Done => style("done").green().to_string(),
        StepStatus::Error => style("error").red().bold().to_string(),
        StepStatus::Running => style("running").cyan().to_string(),
        StepStatus::Idle if row.eligible => style("ready").green().to_string(),
        StepStatus::Idle => style("waiting").dim().to_string(),
    };
    if row.attempts_used > 0 {
        message.push_str(&format!(" (attempt {}/{})", row.attempts_used, row.max_attempts));
    }
    if row.manual_fix_required {
        message.push_str(&format!(" {}{}", WRENCH, style("manual fix required").red()));
    } else if let Some(reason) = &row.blocked_reason {
        message.push_str(&format!(" {}{}", BLOCKER, style(reason).dim()));
    }
    message
}
