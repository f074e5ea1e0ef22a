//! Project initialization and step listing.

use anyhow::Result;
use console::style;
use std::path::{Path, PathBuf};

use crate::Cli;

pub fn cmd_init(project_dir: &Path) -> Result<()> {
    use reelforge::reel_config::{CONFIG_FILE, REELFORGE_DIR, init_project};

    let created = init_project(project_dir)?;
    let reel_dir = project_dir.join(REELFORGE_DIR);

    if created {
        println!("Initialized reelforge project at {}", reel_dir.display());
        println!();
        println!("Created:");
        println!("  .reelforge/");
        println!("  ├── {}   # Remote, polling and retry settings", CONFIG_FILE);
        println!("  └── logs/");
        println!();
        println!("Next steps:");
        println!("  1. Point [remote] base_url at your pipeline service");
        println!("  2. Run `reelforge start \"<topic>\"` to start a run");
        println!("  3. Run `reelforge watch` to follow it");
    } else {
        println!(
            "Reelforge project already initialized at {}",
            reel_dir.display()
        );
        println!("Directory structure verified.");
    }
    Ok(())
}

pub fn cmd_steps(cli: &Cli, project_dir: PathBuf) -> Result<()> {
    use reelforge::pipeline::StepDuration;
    use reelforge::reel_config::ReelConfig;

    let config = ReelConfig::with_cli_args(project_dir, cli.base_url.clone())?;
    let registry = config.toml.registry();

    println!();
    println!("{}", style("Pipeline steps").bold());
    println!();
    for def in registry.steps() {
        let deps = if def.depends_on.is_empty() {
            "-".to_string()
        } else {
            def.depends_on
                .iter()
                .map(|d| d.to_string())
                .collect::<Vec<_>>()
                .join(", ")
        };
        let retry = if !def.retriable {
            "not retriable".to_string()
        } else if registry.is_auto_retriable(def.key) {
            format!("auto x{}", def.max_auto_attempts)
        } else {
            "operator only".to_string()
        };
        println!(
            "  {:<20} {:<20} after: {:<18} retry: {}",
            style(def.key.as_str()).cyan(),
            def.name,
            deps,
            retry
        );
        if let Some(gate) = def.gate {
            println!("  {:<20} gate: {}", "", style(gate.name()).yellow());
        }
        if def.duration == StepDuration::Long {
            println!("  {:<20} {}", "", style("long-running").dim());
        }
    }
    println!();
    Ok(())
}
