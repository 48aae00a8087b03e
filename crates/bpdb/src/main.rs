//! BPDB - Blueprint Graph Debugger
//!
//! Headless driver for the debugger core: loads a scenario (graphs, objects,
//! invocations and scripted debugger commands), runs it on a simulated VM and
//! prints the session as JSON lines.

use std::{io, path::PathBuf, time::Duration};

use bpdb_common::DebuggerConfig;
use clap::{Parser, Subcommand};
use eyre::Result;

mod cmd;
mod scenario;

use cmd::ScenarioRunner;
use scenario::Scenario;

/// Command-line interface for BPDB
#[derive(Debug, Parser)]
#[command(name = "bpdb")]
#[command(about = "Blueprint Graph Debugger - A live debugger for node-graph scripts")]
#[command(version)]
pub struct Cli {
    /// Debugger settings file (default: ~/.bpdb.toml if present)
    #[arg(long, env = "BPDB_CONFIG")]
    pub config: Option<PathBuf>,

    /// Also write logs to a file under the system temp directory
    #[arg(long)]
    pub log_file: bool,

    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands
#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Run a scenario and print the session event stream
    Run {
        /// Scenario file
        scenario: PathBuf,

        /// Trace digest publish interval in milliseconds (overrides the settings file)
        #[arg(long, env = "BPDB_PUBLISH_INTERVAL_MS")]
        interval_ms: Option<u64>,

        /// How long a command waits for a context to pause, in milliseconds
        #[arg(long, default_value = "5000")]
        pause_timeout_ms: u64,
    },
    /// Print the effective debugger settings
    Config,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables
    dotenv::dotenv().ok();

    // Parse CLI arguments
    let cli = Cli::parse();

    bpdb_common::logging::init_logging("bpdb", cli.log_file)?;

    let mut config = match &cli.config {
        Some(path) => DebuggerConfig::load_from(path)?,
        None => DebuggerConfig::load()?,
    };

    match cli.command {
        Commands::Run { scenario, interval_ms, pause_timeout_ms } => {
            if let Some(ms) = interval_ms {
                config = config.with_publish_interval_ms(ms);
            }
            tracing::info!(scenario = %scenario.display(), "Running scenario");
            let scenario = Scenario::load(&scenario)?;
            let runner = ScenarioRunner::new(
                scenario,
                config,
                Duration::from_millis(pause_timeout_ms),
                io::stdout().lock(),
            )?;
            let (summary, _) = runner.run().await?;
            tracing::info!(
                commands = summary.commands,
                failed = summary.failed,
                runs = summary.runs,
                "Done"
            );
        }
        Commands::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
        }
    }

    Ok(())
}
