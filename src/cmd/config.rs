//! Configuration view and validation commands (`reelforge config`).

use anyhow::Result;

use super::super::ConfigCommands;

pub fn cmd_config(project_dir: &std::path::Path, command: Option<ConfigCommands>) -> Result<()> {
    use reelforge::reel_config::{CONFIG_FILE, REELFORGE_DIR, ReelConfig, ReelToml, init_project};
    use reelforge::session::RunRecord;

    let reel_dir = project_dir.join(REELFORGE_DIR);
    let config_path = reel_dir.join(CONFIG_FILE);

    match command {
        None | Some(ConfigCommands::Show) => {
            println!();
            println!("Reelforge Configuration");
            println!("=======================");
            println!();

            let toml = if config_path.exists() {
                println!("Config file: {}", config_path.display());
                ReelToml::load(&config_path)?
            } else {
                println!("No reelforge.toml found at {}", config_path.display());
                println!("Using default configuration.");
                ReelToml::default()
            };
            println!();

            println!("[remote]");
            println!("  base_url = \"{}\"", toml.remote.base_url);
            println!("  start_timeout_secs = {}", toml.remote.start_timeout_secs);
            println!("  request_timeout_secs = {}", toml.remote.request_timeout_secs);
            println!();

            println!("[poll]");
            println!("  interval_ms = {}", toml.poll.interval_ms);
            println!("  long_step_interval_ms = {}", toml.poll.long_step_interval_ms);
            println!("  max_window_secs = {}", toml.poll.max_window_secs);
            for (step, ms) in &toml.poll.step_interval_ms {
                println!("  step_interval_ms.{} = {}", step, ms);
            }
            println!();

            println!("[retry]");
            match toml.retry.default_max_auto_attempts {
                Some(max) => println!("  default_max_auto_attempts = {}", max),
                None => println!("  default_max_auto_attempts = (per step)"),
            }
            match toml.retry.max_manual_retries {
                Some(max) => println!("  max_manual_retries = {}", max),
                None => println!("  max_manual_retries = (unbounded)"),
            }
            for (step, section) in &toml.retry.steps {
                if let Some(max) = section.max_auto_attempts {
                    println!("  steps.{}.max_auto_attempts = {}", step, max);
                }
                if let Some(auto) = section.auto {
                    println!("  steps.{}.auto = {}", step, auto);
                }
            }
            println!();

            println!("[run]");
            println!("  language = \"{}\"", toml.run.language);
            println!("  target_minutes = {}", toml.run.target_minutes);
            if let Some(profile) = &toml.run.channel_profile {
                println!("  channel_profile = \"{}\"", profile);
            }
            println!();

            if !toml.steps.is_empty() {
                println!("[steps]");
                for (step, settings) in &toml.steps {
                    println!("  {}: {} setting(s)", step, settings.len());
                }
                println!();
            }

            if project_dir.exists() {
                let config = ReelConfig::new(project_dir.to_path_buf())?;
                println!("Effective values (with env overrides):");
                println!("  base_url = \"{}\"", config.base_url());
                println!("  poll.interval_ms = {}", config.toml.poll.interval_ms);
                println!();
            }
            if !config_path.exists() {
                println!("Run 'reelforge config init' to create a reelforge.toml file.");
                println!();
            }
        }
        Some(ConfigCommands::Validate) => {
            println!();
            println!("Validating configuration...");
            println!();

            if !config_path.exists() {
                println!("No reelforge.toml found. Using defaults (valid).");
                return Ok(());
            }

            let toml = ReelToml::load(&config_path)?;
            let warnings = toml.validate();

            if warnings.is_empty() {
                println!("Configuration is valid.");
            } else {
                println!("Configuration warnings:");
                for warning in warnings {
                    println!("  - {}", warning);
                }
            }
            println!();
        }
        Some(ConfigCommands::Init) => {
            if config_path.exists() {
                println!("reelforge.toml already exists at {}", config_path.display());
                println!("Delete it first if you want to recreate it.");
                return Ok(());
            }

            init_project(project_dir)?;

            println!("Created reelforge.toml at {}", config_path.display());
            println!();
            println!("You can now customize:");
            println!("  - [remote] base_url and timeouts");
            println!("  - [poll] cadence and the polling window");
            println!("  - [retry] automatic budgets and the operator retry ceiling");
            println!("  - [steps.<step>] settings sent with each new run");
            println!();
        }
        Some(ConfigCommands::Diff) => {
            let Some(record) = RunRecord::load_optional(&reel_dir.join("run.json"))? else {
                println!("No active run; nothing to compare against.");
                return Ok(());
            };
            let toml = ReelToml::load_or_default(&reel_dir)?;
            let current = toml.step_settings();

            if !record.settings.has_unsaved_changes(&current) {
                println!("No unsaved changes since run {} started.", record.handle.run_id);
            } else {
                println!(
                    "Step settings changed since run {} started:",
                    record.handle.run_id
                );
                for change in record.settings.diff(&current) {
                    println!("  {}", change);
                }
                let dirty: Vec<String> = record
                    .settings
                    .dirty_steps(&current)
                    .iter()
                    .map(|step| step.to_string())
                    .collect();
                println!();
                println!("Affected steps: {}", dirty.join(", "));
                println!("Changes apply to the next run started with `reelforge start`.");
            }
        }
    }

    Ok(())
}
