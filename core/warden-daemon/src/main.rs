//! Warden daemon entrypoint.
//!
//! The default command runs the supervisor, which launches one process per
//! worker by re-executing this binary with the hidden `worker` subcommand.
//! Termination signals flip a shared shutdown token; every loop exits at its
//! next checkpoint.

use clap::{Parser, Subcommand};
use std::env;
use tracing::{error, warn};
use tracing_subscriber::EnvFilter;

use warden_core::config::Paths;
use warden_core::error::Result;
use warden_core::shutdown::ShutdownToken;
use warden_core::store::Store;

mod supervisor;
mod transport;
mod worker;

use supervisor::{ExeSpawner, Supervisor};

#[derive(Parser)]
#[command(name = "wardend", about = "Self-healing watchdog for the home-automation gateway")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervisor and its workers (default).
    Run,
    /// Internal: run a single worker inside this process.
    #[command(hide = true)]
    Worker { name: String },
}

fn main() {
    init_logging();

    let cli = Cli::parse();
    let token = ShutdownToken::new();
    {
        let token = token.clone();
        if let Err(err) = ctrlc::set_handler(move || token.trigger()) {
            warn!(error = %err, "failed to install signal handler");
        }
    }

    let result = match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run_supervisor(&token),
        Commands::Worker { name } => worker::run(&name, &token),
    };

    if let Err(err) = result {
        error!(error = %err, "daemon exited with error");
        std::process::exit(1);
    }
}

fn run_supervisor(token: &ShutdownToken) -> Result<()> {
    let paths = Paths::resolve()?;
    let store = Store::open(&paths.storage_dir())?;
    let workers = worker::names();
    Supervisor::new(store, ExeSpawner, &workers).run(token)
}

fn init_logging() {
    let debug_enabled = env::var("WARDEN_DEBUG_LOG")
        .map(|value| matches!(value.as_str(), "1" | "true" | "TRUE" | "yes" | "YES"))
        .unwrap_or(false);
    let filter = if debug_enabled {
        EnvFilter::new("debug")
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
