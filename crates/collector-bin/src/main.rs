//! li-exporter - delivers encoded intercept records to mediators.

mod commands;
mod shutdown;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use collector_config_and_utils::{init_logging, Config, LoggingOptions};
use collector_export::DestinationId;
use tracing::info;

/// Default location of the collector config file.
const DEFAULT_CONFIG_PATH: &str = "/etc/li-collector/li-exporter.json";

/// li-exporter command-line interface.
#[derive(Parser, Debug)]
#[command(name = "li-exporter")]
#[command(about = "Export intercept records to LI mediators over TCP")]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,

    /// Path to the JSON config file
    #[arg(short, long, env = "LI_EXPORT_CONFIG", default_value = DEFAULT_CONFIG_PATH, global = true)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error). Overrides the config file
    #[arg(short, long, global = true)]
    log_level: Option<String>,

    /// Stderr log format (compact, json). Overrides the config file
    #[arg(long, global = true)]
    log_format: Option<String>,

    /// Also write JSONL logs to this file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,
}

#[derive(Subcommand, Debug, PartialEq, Eq)]
enum Commands {
    /// Run the exporter until SIGINT/SIGTERM
    Run,
    /// Try to connect to every configured mediator once
    Probe,
    /// Export a file of BER-encoded records to one mediator
    Replay {
        /// Destination id the records are routed to
        #[arg(short, long)]
        dest: DestinationId,
        /// File of concatenated BER PDUs
        file: PathBuf,
    },
}

impl Cli {
    /// Merge command-line overrides into the loaded config.
    fn apply_overrides(&self, config: &mut Config) {
        if let Some(level) = &self.log_level {
            config.log_level = level.clone();
        }
        if let Some(format) = &self.log_format {
            config.log_format = format.clone();
        }
        if let Some(file) = &self.log_file {
            config.log_file = Some(file.clone());
        }
    }
}

fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = Config::load(&cli.config)?;
    cli.apply_overrides(&mut config);
    init_logging("li-exporter", &LoggingOptions::from_config(&config))?;
    config.validate()?;

    info!(
        config = %cli.config.display(),
        destinations = config.destinations.len(),
        "li-exporter starting"
    );

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => {
            let halt = shutdown::install_halt_flag()?;
            let stats = commands::run(&config, halt)?;
            info!(
                records_sent = stats.records_sent,
                records_buffered = stats.records_buffered,
                records_dropped = stats.records_dropped,
                "li-exporter stopped"
            );
        }
        Commands::Probe => {
            let (reachable, total) = commands::probe(&config)?;
            println!("{}/{} mediators reachable", reachable, total);
            if reachable < total {
                std::process::exit(1);
            }
        }
        Commands::Replay { dest, file } => {
            let halt = shutdown::install_halt_flag()?;
            let stats = commands::replay(&config, dest, &file, halt)?;
            println!(
                "replayed: {} sent, {} buffered, {} dropped",
                stats.records_sent, stats.records_buffered, stats.records_dropped
            );
        }
    }

    Ok(())
}
