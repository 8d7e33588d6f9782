use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

use station_relay::config::RelayConfig;
use station_relay::relay;

#[derive(Parser, Debug)]
#[command(author, version, about = "Schedule-driven metadata and audio relay for a radio stream")]
struct Args {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the relay: transcoder, listener stream, metadata push
    Relay {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,
    },
    /// Print the metadata for an instant and optionally push it once
    Now {
        /// Path to config file (TOML format)
        #[arg(short, long)]
        config: PathBuf,

        /// Instant to resolve, RFC3339 (default: now)
        #[arg(long)]
        at: Option<String>,

        /// Send the title to every configured mount
        #[arg(long)]
        push: bool,
    },
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let args = Args::parse();

    match args.command {
        Command::Relay { config } => relay::run(RelayConfig::load(&config)?),
        Command::Now { config, at, push } => {
            let at = match at {
                Some(value) => Some(
                    DateTime::parse_from_rfc3339(&value)
                        .map_err(|e| format!("Invalid --at '{}': {}", value, e))?
                        .with_timezone(&Utc),
                ),
                None => None,
            };
            relay::now(RelayConfig::load(&config)?, at, push)
        }
    }
}
