//! Remora - intercepting HTTP/HTTPS proxy for web-security testing
//!
//! Accepts browser traffic on one port, decrypts HTTPS with minted per-host
//! certificates, captures every exchange, and exposes an inspection and
//! attack-replay API on a second port.

mod api;
mod app;
mod capture;
mod error;
mod proxy;
mod replay;
mod scanner;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::sync::broadcast;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::api::ApiState;
use crate::app::{Config, Services};
use crate::proxy::ProxyServer;

/// Intercepting HTTP/HTTPS proxy with an inspection and attack-replay API
#[derive(Parser, Debug)]
#[command(name = "remora")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, env = "REMORA_CONFIG")]
    config: Option<String>,

    /// Proxy listen port
    #[arg(short, long, env = "REMORA_PROXY_PORT")]
    proxy_port: Option<u16>,

    /// Inspection API port
    #[arg(long, env = "REMORA_API_PORT")]
    api_port: Option<u16>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "REMORA_LOG_LEVEL")]
    log_level: String,

    /// Log file path (enables file logging)
    #[arg(long, env = "REMORA_LOG_FILE")]
    log_file: Option<String>,

    /// Enable JSON structured logging
    #[arg(long, env = "REMORA_LOG_JSON")]
    log_json: bool,

    /// Generate default configuration and exit
    #[arg(long)]
    generate_config: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Install rustls ring crypto provider (required for rustls 0.23+)
    rustls::crypto::ring::default_provider()
        .install_default()
        .expect("Failed to install rustls crypto provider");

    let cli = Cli::parse();

    if cli.generate_config {
        return generate_default_config();
    }

    init_logging(&cli)?;

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "Starting Remora");

    let config = load_config(&cli)?;
    let services = Services::new(&config)?;

    let (shutdown_tx, _) = broadcast::channel::<()>(1);
    tokio::spawn({
        let shutdown_tx = shutdown_tx.clone();
        async move {
            handle_signals(shutdown_tx).await;
        }
    });

    let proxy = ProxyServer::new(
        config.proxy.clone(),
        services.ca.clone(),
        services.store.clone(),
    );
    let api_state = ApiState {
        store: services.store.clone(),
        replay: services.replay.clone(),
    };

    let proxy_task = {
        let shutdown = shutdown_tx.subscribe();
        tokio::spawn(async move { proxy.run(shutdown).await })
    };
    let api_task = {
        let shutdown = shutdown_tx.subscribe();
        let api_config = config.api.clone();
        tokio::spawn(async move { api::serve(&api_config, api_state, shutdown).await })
    };

    let (proxy_result, api_result) =
        tokio::try_join!(proxy_task, api_task).context("Server task panicked")?;
    proxy_result?;
    api_result?;

    tracing::info!("Remora shut down gracefully");
    Ok(())
}

/// Initialize the logging system
fn init_logging(cli: &Cli) -> Result<()> {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&cli.log_level));

    let subscriber = tracing_subscriber::registry().with(env_filter);

    if let Some(log_path) = &cli.log_file {
        let path = std::path::Path::new(log_path);
        let dir = path.parent().filter(|d| !d.as_os_str().is_empty());
        let filename = path
            .file_name()
            .and_then(|s| s.to_str())
            .unwrap_or("remora.log");
        let file_appender = RollingFileAppender::new(
            Rotation::DAILY,
            dir.unwrap_or_else(|| std::path::Path::new(".")),
            filename,
        );

        if cli.log_json {
            subscriber
                .with(fmt::layer().json().with_writer(file_appender).with_ansi(false))
                .init();
        } else {
            subscriber
                .with(fmt::layer().with_writer(file_appender).with_ansi(false))
                .init();
        }
    } else if cli.log_json {
        subscriber.with(fmt::layer().json()).init();
    } else {
        subscriber.with(fmt::layer()).init();
    }

    Ok(())
}

/// Load configuration with CLI overrides
fn load_config(cli: &Cli) -> Result<Config> {
    let mut config = Config::load(cli.config.as_deref())?;

    if let Some(port) = cli.proxy_port {
        config.proxy.port = port;
    }
    if let Some(port) = cli.api_port {
        config.api.port = port;
    }

    validate_config(&config)?;
    Ok(config)
}

/// Validate configuration
fn validate_config(config: &Config) -> Result<()> {
    if config.proxy.port == 0 {
        anyhow::bail!("Proxy port cannot be 0");
    }
    if config.api.port == 0 {
        anyhow::bail!("API port cannot be 0");
    }
    if config.proxy.port == config.api.port {
        anyhow::bail!("Proxy and API ports must differ");
    }
    if config.proxy.connect_timeout == 0 {
        anyhow::bail!("Proxy connect_timeout must be greater than 0");
    }
    if config.replay.timeout == 0 {
        anyhow::bail!("Replay timeout must be greater than 0");
    }
    Ok(())
}

/// Generate default configuration file
fn generate_default_config() -> Result<()> {
    let config = Config::default();
    let toml = toml::to_string_pretty(&config).context("Failed to serialize configuration")?;

    println!("{}", toml);
    Ok(())
}

/// Handle shutdown signals
async fn handle_signals(shutdown_tx: broadcast::Sender<()>) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};

        let mut sigint = signal(SignalKind::interrupt()).expect("Failed to register SIGINT handler");
        let mut sigterm =
            signal(SignalKind::terminate()).expect("Failed to register SIGTERM handler");

        tokio::select! {
            _ = sigint.recv() => {
                tracing::info!("Received SIGINT, initiating shutdown");
            }
            _ = sigterm.recv() => {
                tracing::info!("Received SIGTERM, initiating shutdown");
            }
        }
    }

    #[cfg(windows)]
    {
        tokio::signal::ctrl_c()
            .await
            .expect("Failed to register Ctrl+C handler");
        tracing::info!("Received Ctrl+C, initiating shutdown");
    }

    let _ = shutdown_tx.send(());
}
