use anyhow::Result;
use clap::{Parser, Subcommand};
use slotwarden::config::{self, DEFAULT_ROOT, Settings};
use slotwarden::logging::{self, LogOptions};
use slotwarden_common::DesiredCommand;
use std::path::PathBuf;

mod cmd;

#[derive(Parser)]
#[command(name = "slotwarden")]
#[command(version, about = "Supervisor for slot-bound capture workers")]
pub struct Cli {
    /// State root holding the slot documents
    #[arg(long, global = true, env = "SLOTWARDEN_ROOT", default_value = DEFAULT_ROOT)]
    pub root: PathBuf,

    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub log_json: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the supervisor loop
    Supervise {
        /// Run a single reconciliation pass and exit
        #[arg(long)]
        once: bool,
    },
    /// Run a capture worker (launched by the supervisor)
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        slot: String,
        #[arg(long)]
        run_id: String,
    },
    /// Create a slot
    Provision {
        slot: String,
        /// Slot configuration file (.toml or .json)
        #[arg(long)]
        config: Option<PathBuf>,
    },
    /// Issue start, stop or restart to a slot
    Command {
        slot: String,
        command: DesiredCommand,
    },
    /// Replace a slot's configuration
    Configure {
        slot: String,
        #[arg(long)]
        config: PathBuf,
    },
    /// Show slot status
    Status {
        slot: Option<String>,
        #[arg(long)]
        json: bool,
    },
    /// Inspect or export a slot's ledger
    Ledger {
        #[command(subcommand)]
        command: LedgerCommands,
    },
    /// View or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
}

#[derive(Subcommand)]
pub enum LedgerCommands {
    /// Print ledger entries
    Show {
        slot: String,
        /// Only entries of this run
        #[arg(long)]
        run: Option<String>,
    },
    /// Copy ledger lines verbatim to a file
    Export {
        slot: String,
        output: PathBuf,
        /// Only entries of this run
        #[arg(long)]
        run: Option<String>,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show effective configuration
    Show,
    /// Validate configuration and show any warnings
    Validate,
    /// Initialize a default slotwarden.toml file
    Init,
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let log_dir = config::log_dir(&cli.root);
    let _guard = match &cli.command {
        Commands::Supervise { .. } => logging::init(LogOptions {
            verbose: cli.verbose,
            json: cli.log_json,
            ansi: true,
            file_dir: Some(&log_dir),
            file_prefix: "supervisor.log",
        }),
        Commands::Worker { .. } => logging::init(LogOptions {
            verbose: cli.verbose,
            json: cli.log_json,
            ..Default::default()
        }),
        _ => logging::init(LogOptions {
            verbose: cli.verbose,
            json: cli.log_json,
            ansi: true,
            ..Default::default()
        }),
    };

    let settings = Settings::with_cli_args(cli.root.clone(), cli.verbose, cli.log_json)?;

    match &cli.command {
        Commands::Supervise { once } => cmd::cmd_supervise(&settings, *once).await?,
        Commands::Worker { slot, run_id } => cmd::cmd_worker(&settings, slot, run_id).await?,
        Commands::Provision { slot, config } => {
            cmd::cmd_provision(&settings, slot, config.as_deref())?
        }
        Commands::Command { slot, command } => cmd::cmd_command(&settings, slot, *command)?,
        Commands::Configure { slot, config } => cmd::cmd_configure(&settings, slot, config)?,
        Commands::Status { slot, json } => cmd::cmd_status(&settings, slot.as_deref(), *json)?,
        Commands::Ledger { command } => cmd::cmd_ledger(&settings, command)?,
        Commands::Config { command } => cmd::cmd_config(&settings, command.clone())?,
    }

    Ok(())
}
