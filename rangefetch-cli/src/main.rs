//! rangefetch CLI
//!
//! Fetches, stores and deletes byte ranges of remote resources through a
//! dedicated transfer reactor.

mod commands;
mod error;

use std::path::PathBuf;
use std::process;

use clap::{Parser, Subcommand};
use rangefetch::{init_logging, HttpEngine, Reactor, TransferConfig};
use tracing::{debug, Level};

use commands::{delete, get, put};
use error::CliError;

#[derive(Debug, Parser)]
#[command(name = "rangefetch", version, about = "Range-aware transfer client")]
struct Cli {
    /// Configuration file (defaults to the per-user transfer.ini)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Increase log verbosity (-v debug, -vv trace)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    /// Also write debug logs to rangefetch.log in this directory
    #[arg(long, global = true)]
    log_dir: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Download a resource or part of it
    Get(get::GetArgs),
    /// Upload a local file
    Put(put::PutArgs),
    /// Delete a remote resource
    Delete(delete::DeleteArgs),
}

impl Cli {
    fn log_level(&self) -> Level {
        match self.verbose {
            0 => Level::WARN,
            1 => Level::DEBUG,
            _ => Level::TRACE,
        }
    }

    fn transfer_config(&self) -> Result<TransferConfig, CliError> {
        Ok(match &self.config {
            Some(path) => TransferConfig::from_file(path)?,
            None => TransferConfig::load_default()?,
        })
    }
}

fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli) {
        eprintln!("Error: {}", e);
        process::exit(1);
    }
}

fn run(cli: Cli) -> Result<(), CliError> {
    let _logging = init_logging(cli.log_level(), cli.log_dir.as_deref())?;
    let config = cli.transfer_config()?;
    debug!(?config, "loaded transfer configuration");

    let reactor = Reactor::start(HttpEngine::new(config))?;
    let result = match cli.command {
        Command::Get(args) => get::run(&reactor, args),
        Command::Put(args) => put::run(&reactor, args),
        Command::Delete(args) => delete::run(&reactor, args),
    };
    debug!(stats = %reactor.stats(), "reactor statistics");
    reactor.shutdown();
    result
}
