mod analysis;
mod capabilities;
mod client;
mod cmd_analyze;
mod cmd_config;
mod config;
mod correlator;
mod error;
mod escalation;
mod protocol;
mod supervisor;
#[cfg(test)]
mod testing;
mod transport;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};
use tracing::info;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "glimpse", about = "Resilient client for a stdio image-analysis server", version)]
struct Cli {
    /// Path to config file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Analyze one image and print the result
    Analyze {
        /// Image file to analyze
        image: PathBuf,
        /// Prompt (default from config)
        #[arg(short, long)]
        prompt: Option<String>,
        /// Try once and give up instead of retrying until success
        #[arg(long)]
        soft: bool,
    },
    /// List the tools the server offers
    Tools,
    /// Read image paths from stdin and analyze each one
    Watch {
        /// Prompt (default from config)
        #[arg(short, long)]
        prompt: Option<String>,
    },
    /// Manage configuration
    Config {
        #[command(subcommand)]
        action: ConfigAction,
    },
}

#[derive(Subcommand)]
enum ConfigAction {
    /// Create default settings.json
    Init,
    /// Show current configuration (secrets masked)
    Show,
    /// Set a config value (dot notation: server.api_key)
    Set {
        /// Config key path
        key: String,
        /// Value to set
        value: String,
    },
    /// Print config file path
    Path,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config_path = cli.config.unwrap_or_else(config::default_config_path);

    if let Commands::Config { action } = &cli.command {
        return cmd_config::run(action, &config_path);
    }

    // watch → info, one-shot commands → warn; stdout carries results only
    let default_level = match cli.command {
        Commands::Watch { .. } => "info",
        _ => "warn",
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_writer(std::io::stderr)
        .init();

    let config = config::AppConfig::load_or_default(&config_path)?;
    if !config.has_api_key() {
        eprintln!(
            "Warning: no API key configured. Set {} or run `glimpse config set server.api_key <KEY>`.",
            config::API_KEY_VAR
        );
    }
    info!("Config loaded");

    match cli.command {
        Commands::Analyze { image, prompt, soft } => {
            cmd_analyze::analyze(&config, &image, prompt.as_deref(), soft).await
        }
        Commands::Tools => cmd_analyze::tools(&config).await,
        Commands::Watch { prompt } => cmd_analyze::watch(&config, prompt.as_deref()).await,
        Commands::Config { .. } => Ok(()),
    }
}
