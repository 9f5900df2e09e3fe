//! Interceptor daemon - rotating, capturing proxy for chat-completion APIs

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use interceptor_server::config::Config;
use interceptor_server::error::Result;
use interceptor_server::proxy::ProxyServer;
use interceptor_server::proxy::capture::mask_secret;

/// Interceptor - local proxy that rotates API keys and records every completion
#[derive(Parser)]
#[command(name = "interceptor")]
#[command(about = "A local proxy that rotates API keys/models and captures chat-completion traffic")]
#[command(version)]
pub struct Cli {
    /// Path to config file
    #[arg(long, short = 'c', global = true)]
    pub config: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Subcommand)]
pub enum Command {
    /// Start the proxy server (default command)
    #[command(name = "serve")]
    Serve,
    /// Validate the configuration and print a summary
    #[command(name = "check-config")]
    CheckConfig,
}

#[tokio::main]
async fn main() {
    if let Err(e) = run().await {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

async fn run() -> Result<()> {
    init_logging();

    let cli = Cli::parse();

    match cli.command {
        None | Some(Command::Serve) => serve(cli.config).await,
        Some(Command::CheckConfig) => check_config(cli.config),
    }
}

fn init_logging() {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("info,interceptor_server=debug"));

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}

/// Load, complete and validate the configuration
fn load_config(config_path: Option<PathBuf>) -> Result<Config> {
    let mut config = match config_path {
        Some(path) => {
            tracing::info!("Loading config from: {}", path.display());
            Config::from_file(&path)?
        }
        None => {
            let default_paths = [
                dirs::home_dir().map(|h| h.join(".interceptor").join("config.toml")),
                dirs::config_dir().map(|c| c.join("interceptor").join("config.toml")),
                Some(PathBuf::from("config.toml")),
            ];

            match default_paths.iter().flatten().find(|path| path.exists()) {
                Some(path) => {
                    tracing::info!("Loading config from: {}", path.display());
                    Config::from_file(path)?
                }
                None => {
                    tracing::info!("No config file found, using defaults");
                    Config::default()
                }
            }
        }
    };

    config.resolve_env_keys();
    config.validate()?;
    Ok(config)
}

fn check_config(config_path: Option<PathBuf>) -> Result<()> {
    let config = load_config(config_path)?;

    println!("Configuration OK");
    println!("  listen:   {}", config.proxy.listen_addr());
    println!(
        "  forward:  {}/* -> {}",
        config.proxy.normalized_prefix(),
        config.proxy.target_base_url
    );
    println!("  keys:     {}", config.proxy.api_keys.len());
    for key in &config.proxy.api_keys {
        println!("            {}", mask_secret(key));
    }
    println!("  models:   {}", config.proxy.api_models.join(", "));
    println!(
        "  retries:  {} attempts, rotation {:?}",
        config.retry.max_retries, config.retry.rotation
    );
    Ok(())
}

async fn serve(config_path: Option<PathBuf>) -> Result<()> {
    tracing::info!("Starting Interceptor daemon");

    let config = load_config(config_path)?;
    tracing::debug!(
        keys = config.proxy.api_keys.len(),
        models = ?config.proxy.api_models,
        timeout_secs = config.proxy.timeout_seconds,
        max_retries = config.retry.max_retries,
        "Config loaded"
    );

    let proxy = ProxyServer::new(config)?;
    proxy.serve().await?;

    tracing::info!("Interceptor daemon stopped");
    Ok(())
}
