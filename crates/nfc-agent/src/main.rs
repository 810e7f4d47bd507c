use std::path::PathBuf;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tracing::info;

use nfc_agent::config::AgentConfig;
use nfc_agent::{commands, logging};
use nfc_core::types::GenericSeId;

#[derive(Parser)]
#[command(name = "nfc-agent")]
#[command(about = "NFC routing and secure element diagnostics")]
struct Args {
    /// Configuration file path
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Log level, overrides the configuration
    #[arg(short, long)]
    log_level: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Compute and commit the routing table, print the read-back as JSON
    Plan,
    /// Validate the configuration and print it with defaults filled in
    CheckConfig,
    /// Open a wired session, exchange APDUs and close it
    SeOpen {
        /// Secure element: ese, uicc, uicc2, uicc3, euicc, euicc2
        #[arg(long, default_value = "ese")]
        se: GenericSeId,

        /// Hex APDU to send, repeatable
        #[arg(long)]
        apdu: Vec<String>,

        /// Transceive timeout in milliseconds
        #[arg(long, default_value_t = 2000)]
        timeout_ms: u64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = match &args.config {
        Some(path) => AgentConfig::load_from_file(path)?,
        None => AgentConfig::load_from_env(),
    };
    if let Some(level) = args.log_level {
        config.log_level = level;
    }

    let _guard = logging::init(&config)?;
    info!("Starting nfc-agent");

    match args.command {
        Command::Plan => {
            let entries = commands::plan(&config).await?;
            println!("{}", serde_json::to_string_pretty(&entries)?);
        }
        Command::CheckConfig => {
            config.validate()?;
            println!("{}", toml::to_string_pretty(&config)?);
        }
        Command::SeOpen { se, apdu, timeout_ms } => {
            let apdus = commands::parse_apdus(&apdu)?;
            let report = commands::se_session(&config, se, &apdus, Duration::from_millis(timeout_ms)).await?;
            println!("{}", serde_json::to_string_pretty(&report)?);
        }
    }

    Ok(())
}
