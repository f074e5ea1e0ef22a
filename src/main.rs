use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use reelforge::logging::{self, LogOptions};
use reelforge_common::{CompileMode, StepKey};
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "reelforge")]
#[command(version, about = "Coordinator for the multi-stage video generation pipeline")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write logs to a daily-rolling file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[arg(long, global = true)]
    pub project_dir: Option<PathBuf>,

    /// Remote pipeline service URL. Overrides reelforge.toml and REELFORGE_BASE_URL.
    #[arg(long, global = true)]
    pub base_url: Option<String>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Create .reelforge/ with a default configuration
    Init,
    /// Start a new run for a topic
    Start {
        topic: String,

        /// Narration language (defaults to [run] language)
        #[arg(long)]
        language: Option<String>,

        /// Target video length in minutes
        #[arg(long)]
        minutes: Option<u32>,

        /// Channel profile to apply
        #[arg(long)]
        profile: Option<String>,

        /// Keep polling and show progress after starting
        #[arg(long)]
        watch: bool,
    },
    /// Show the active run's state
    Status {
        /// Only show the locally recorded run, without contacting the remote service
        #[arg(long)]
        local: bool,
    },
    /// Poll the active run and show live progress until it finishes
    Watch,
    /// Retry a failed step
    Retry {
        step: StepKey,

        /// Operator-triggered retry; allowed past the automatic budget
        #[arg(long)]
        operator: bool,
    },
    /// Request compilation of the final video
    Compile {
        #[arg(long, default_value = "full")]
        mode: CompileMode,
    },
    /// Forget the active run locally. Remote state is untouched.
    Reset {
        #[arg(long)]
        force: bool,
    },
    /// List pipeline steps, dependencies and retry policy
    Steps,
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default reelforge.toml file
    Init,
    /// Show step settings changed since the active run was started
    Diff,
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let _log_guard = logging::init(&LogOptions {
        verbose: cli.verbose,
        json: cli.log_json,
        log_dir: cli.log_dir.clone(),
    })?;

    let project_dir = match cli.project_dir.clone() {
        Some(dir) => dir,
        None => std::env::current_dir().context("Failed to get current directory")?,
    };

    match &cli.command {
        Commands::Init => cmd::cmd_init(&project_dir)?,
        Commands::Start {
            topic,
            language,
            minutes,
            profile,
            watch,
        } => {
            let overrides = cmd::StartOverrides {
                language: language.clone(),
                target_minutes: *minutes,
                channel_profile: profile.clone(),
            };
            cmd::cmd_start(&cli, project_dir, topic, overrides, *watch).await?
        }
        Commands::Status { local } => cmd::cmd_status(&cli, project_dir, *local).await?,
        Commands::Watch => cmd::cmd_watch(&cli, project_dir).await?,
        Commands::Retry { step, operator } => {
            cmd::cmd_retry(&cli, project_dir, *step, *operator).await?
        }
        Commands::Compile { mode } => cmd::cmd_compile(&cli, project_dir, *mode).await?,
        Commands::Reset { force } => cmd::cmd_reset(&cli, project_dir, *force)?,
        Commands::Steps => cmd::cmd_steps(&cli, project_dir)?,
        Commands::Config { command } => cmd::cmd_config(&project_dir, command.clone())?,
    }

    Ok(())
}
