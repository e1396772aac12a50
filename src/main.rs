use anyhow::Result;
use clap::{Args, Parser, Subcommand};
use debris::errors::RunError;
use std::path::PathBuf;
use std::process::ExitCode;

mod cmd;

#[derive(Parser)]
#[command(name = "debris")]
#[command(version, about = "Automatic sbuild runner for an aggregate Debian packaging repository")]
pub struct Cli {
    /// Path to debris.toml (defaults to $DEBRIS_CONFIG, then the user and system config dirs)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Emit log lines as JSON
    #[arg(long, global = true)]
    pub log_json: bool,

    /// Also write logs to a daily rolling file in this directory
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

/// Package selection shared by `run` and `plan`.
#[derive(Args, Clone, Debug, Default)]
pub struct SelectionArgs {
    /// Build only this package, even if it is up to date
    #[arg(short, long)]
    pub package: Option<String>,

    /// Never build these packages (comma-separated)
    #[arg(long, value_delimiter = ',')]
    pub exclude: Vec<String>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Refresh the checkout, then build every package that needs it
    Run {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Do not pull from the remote; only reset the local checkout
        #[arg(long)]
        no_pull: bool,

        /// Only update the build chroots, then exit
        #[arg(long)]
        update_only: bool,

        /// Do not update the build chroots before building
        #[arg(long, conflicts_with = "update_only")]
        skip_prepare: bool,
    },
    /// Show what a run would build, without touching anything
    Plan {
        #[command(flatten)]
        selection: SelectionArgs,

        /// Print the plan as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show recorded build attempts, newest first
    History {
        /// Only show attempts for this package
        package: Option<String>,

        /// Maximum number of attempts to show
        #[arg(short = 'n', long, default_value = "20")]
        limit: usize,

        /// Show the latest successfully built version of each package instead
        #[arg(long)]
        built: bool,

        /// Print as JSON
        #[arg(long)]
        json: bool,
    },
    /// Show the upstream tag derived from a Debian version
    Tag { version: String },
    /// View configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show every setting with its resolved value and source
    Show,
    /// Print one setting by name, e.g. DEBRIS_DB_FILE
    Get { key: String },
}

async fn dispatch(cli: &Cli) -> Result<ExitCode> {
    match &cli.command {
        Commands::Run {
            selection,
            no_pull,
            update_only,
            skip_prepare,
        } => cmd::cmd_run(cli, selection, *no_pull, *update_only, *skip_prepare).await,
        Commands::Plan { selection, json } => cmd::cmd_plan(cli, selection, *json).await,
        Commands::History {
            package,
            limit,
            built,
            json,
        } => cmd::cmd_history(cli, package.as_deref(), *limit, *built, *json),
        Commands::Tag { version } => cmd::cmd_tag(version),
        Commands::Config { command } => cmd::cmd_config(cli, command.clone()),
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let _log_guard =
        debris::logging::init_tracing(cli.verbose, cli.log_json, cli.log_dir.as_deref());

    match dispatch(&cli).await {
        Ok(code) => code,
        Err(e) => {
            eprintln!("{} {:#}", console::style("Error:").red().bold(), e);
            let code = e
                .downcast_ref::<RunError>()
                .map(RunError::exit_code)
                .unwrap_or(1);
            ExitCode::from(code)
        }
    }
}
