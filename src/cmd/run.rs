//! Run lifecycle commands: `start`, `status`, `watch`, `retry`, `compile`, `reset`.

use anyhow::{Context, Result, bail};
use console::style;
use reelforge::coordinator::{CompileOutcome, RunCoordinator, SyncOutcome, SyncStatus};
use reelforge::pipeline::{Remediation, RetryTrigger, SettingsSnapshot};
use reelforge::reel_config::ReelConfig;
use reelforge::remote::HttpRemote;
use reelforge::session::RunRecord;
use reelforge::ui::icons::{CHECK, RETRY};
use reelforge::ui::{RunProgressUI, render_view};
use reelforge_common::{CompileMode, StepKey};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::info;

use crate::Cli;

/// CLI overrides for the `[run]` section.
#[derive(Debug, Clone, Default)]
pub struct StartOverrides {
    pub language: Option<String>,
    pub target_minutes: Option<u32>,
    pub channel_profile: Option<String>,
}

fn load_config(cli: &Cli, project_dir: PathBuf) -> Result<ReelConfig> {
    ReelConfig::with_cli_args(project_dir, cli.base_url.clone())
}

fn build_coordinator(config: &ReelConfig) -> Result<RunCoordinator> {
    let remote = HttpRemote::new(
        config.base_url(),
        Duration::from_secs(config.toml.remote.start_timeout_secs),
        Duration::from_secs(config.toml.remote.request_timeout_secs),
    )
    .context("Failed to build HTTP client")?;
    Ok(RunCoordinator::new(
        Arc::new(remote),
        Arc::new(config.toml.registry()),
        config.toml.coordinator_config(),
    ))
}

fn require_record(config: &ReelConfig) -> Result<RunRecord> {
    match RunRecord::load_optional(&config.run_file())? {
        Some(record) => Ok(record),
        None => bail!("No active run. Start one with `reelforge start \"<topic>\"`."),
    }
}

pub async fn cmd_start(
    cli: &Cli,
    project_dir: PathBuf,
    topic: &str,
    overrides: StartOverrides,
    watch: bool,
) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    for warning in config.validate() {
        eprintln!("{} {}", style("warning:").yellow(), warning);
    }

    let mut request = config.toml.start_request(topic);
    if let Some(language) = overrides.language {
        request.language = language;
    }
    if let Some(minutes) = overrides.target_minutes {
        request.target_minutes = minutes;
    }
    if overrides.channel_profile.is_some() {
        request.channel_profile = overrides.channel_profile;
    }
    let settings = SettingsSnapshot::capture(&request.per_step_configs);

    let coordinator = build_coordinator(&config)?;
    let handle = coordinator.start_run(request).await?;
    let record = RunRecord {
        handle: handle.clone(),
        topic: topic.to_string(),
        settings,
    };
    record.save(&config.run_file())?;

    println!(
        "{}Started run {} for \"{}\"",
        CHECK,
        style(&handle.run_id).bold(),
        topic
    );

    if watch {
        watch_run(&coordinator).await?;
    } else {
        println!("Run `reelforge watch` to follow progress.");
    }
    Ok(())
}

pub async fn cmd_status(cli: &Cli, project_dir: PathBuf, local: bool) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let record = require_record(&config)?;

    if local {
        println!("Run:     {}", record.handle.run_id);
        println!("Topic:   {}", record.topic);
        println!(
            "Started: {}",
            record.handle.started_at.format("%Y-%m-%d %H:%M:%S UTC")
        );
        return Ok(());
    }

    let coordinator = build_coordinator(&config)?;
    coordinator.refresh(&record.handle).await?;
    match coordinator.view() {
        Some(view) => println!("{}", render_view(&view)),
        None => bail!("Remote returned no state for run {}", record.handle.run_id),
    }
    Ok(())
}

pub async fn cmd_watch(cli: &Cli, project_dir: PathBuf) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let record = require_record(&config)?;
    let coordinator = build_coordinator(&config)?;
    coordinator.attach(&record.handle).await?;
    watch_run(&coordinator).await
}

/// Render progress until the poll loop ends or the user presses Ctrl-C.
async fn watch_run(coordinator: &RunCoordinator) -> Result<()> {
    let steps: Vec<_> = coordinator
        .registry()
        .steps()
        .iter()
        .map(|def| (def.key, def.name))
        .collect();
    let mut ui = RunProgressUI::new(&steps);
    let mut mirror_rx = coordinator.subscribe();
    let mut sync_rx = coordinator.subscribe_sync();

    if let Some(view) = coordinator.view() {
        ui.update(&view);
    }

    while sync_rx.borrow_and_update().is_polling() {
        tokio::select! {
            changed = mirror_rx.changed() => {
                if changed.is_err() {
                    break;
                }
                if let Some(view) = coordinator.view() {
                    ui.update(&view);
                }
            }
            changed = sync_rx.changed() => {
                if changed.is_err() {
                    break;
                }
            }
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted, stopping poll loop");
                coordinator.stop_polling();
                break;
            }
        }
    }

    let view = coordinator.view();
    if let Some(view) = &view {
        ui.update(view);
    }
    let outcome = match coordinator.sync_status() {
        SyncStatus::Stopped { outcome, .. } => Some(outcome),
        _ => view
            .as_ref()
            .filter(|v| v.status.is_terminal())
            .map(|v| SyncOutcome::Finished(v.status)),
    };
    ui.finish(outcome.as_ref(), view.as_ref());
    Ok(())
}

pub async fn cmd_retry(cli: &Cli, project_dir: PathBuf, step: StepKey, operator: bool) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let record = require_record(&config)?;
    let coordinator = build_coordinator(&config)?;
    coordinator.refresh(&record.handle).await?;

    let trigger = if operator {
        RetryTrigger::Operator
    } else {
        RetryTrigger::Automatic
    };
    let remediation = coordinator.retry_step(&record.handle, step, trigger).await?;
    let action = match remediation {
        Remediation::Rerun => "rerunning",
        Remediation::Rewrite => "rewriting from patch instructions",
    };
    println!("{}Retry of {} accepted ({})", RETRY, style(step).cyan(), action);
    println!("Run `reelforge watch` to follow progress.");
    Ok(())
}

pub async fn cmd_compile(cli: &Cli, project_dir: PathBuf, mode: CompileMode) -> Result<()> {
    let config = load_config(cli, project_dir)?;
    let record = require_record(&config)?;
    let coordinator = build_coordinator(&config)?;
    coordinator.refresh(&record.handle).await?;

    match coordinator.request_compilation(&record.handle, mode).await? {
        CompileOutcome::Started => println!("{}Compilation started ({})", CHECK, mode),
        CompileOutcome::AlreadyRunning => {
            println!("A compilation is already running for this run; observing it.")
        }
    }
    println!("Run `reelforge watch` to follow progress.");
    Ok(())
}

pub fn cmd_reset(cli: &Cli, project_dir: PathBuf, force: bool) -> Result<()> {
    use dialoguer::Confirm;

    let config = load_config(cli, project_dir)?;
    let run_file = config.run_file();
    let Some(record) = RunRecord::load_optional(&run_file)? else {
        println!("No active run to reset.");
        return Ok(());
    };

    if !force {
        let confirm = Confirm::new()
            .with_prompt(format!(
                "Forget run {} locally? The remote run is not affected.",
                record.handle.run_id
            ))
            .default(false)
            .interact()
            .unwrap_or(false);

        if !confirm {
            println!("Reset cancelled");
            return Ok(());
        }
    }

    RunRecord::remove(&run_file)?;
    info!(run_id = %record.handle.run_id, "local run record removed");
    println!(
        "Forgot run {}. Remote state is untouched.",
        record.handle.run_id
    );
    Ok(())
}
