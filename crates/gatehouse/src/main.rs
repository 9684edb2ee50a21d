//! # Gatehouse - contact form gate
//!
//! Sits behind the marketing site's contact page. Every submission is rate
//! limited per client IP, checked for bots (score service or math challenge),
//! validated, and delivered by email.
//!
//! ## Architecture
//! ```text
//! Browser → Reverse proxy → Gatehouse → Mail relay
//!                              ↓
//!                        Redis (rate limits, sessions)
//! ```

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use tracing::info;
use tracing_subscriber::{EnvFilter, fmt, prelude::*};

mod captcha;
mod clock;
mod config;
mod gate;
mod mail;
mod ratelimit;
mod routes;
mod session;
mod state;
mod sweeper;
mod validation;

use config::{AppConfig, StorageBackend};
use state::AppState;
use sweeper::sweeper_worker;

/// Gatehouse - contact form gate
#[derive(Parser, Debug)]
#[command(name = "gatehouse")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Configuration file path
    #[arg(short, long, default_value = "config/gatehouse.toml")]
    config: String,

    /// Redis URL (overrides config)
    #[arg(long, env = "REDIS_URL")]
    redis_url: Option<String>,

    /// Listen address (overrides config)
    #[arg(short, long, env = "LISTEN_ADDR")]
    listen: Option<String>,

    /// Storage backend (overrides config)
    #[arg(long, value_enum, env = "GATEHOUSE_STORAGE")]
    storage: Option<StorageBackend>,

    /// reCAPTCHA secret key (overrides config)
    #[arg(long, env = "RECAPTCHA_SECRET_KEY", hide_env_values = true)]
    captcha_secret: Option<String>,

    /// HTTP mail relay endpoint (overrides config)
    #[arg(long, env = "MAIL_RELAY_URL")]
    mail_relay_url: Option<String>,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, default_value = "info", env = "LOG_LEVEL")]
    log_level: String,

    /// Enable JSON logging output
    #[arg(long, default_value = "false")]
    json_logs: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Run the HTTP server (default)
    Serve,

    /// Delete expired rate limit entries once and exit
    CleanupRateLimits,

    /// Send a test email through the configured transport
    TestMail {
        /// Recipient address
        #[arg(long)]
        to: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    // Pick up a local .env before clap reads the environment
    dotenvy::dotenv().ok();

    // Parse CLI arguments
    let args = Args::parse();

    // Initialize logging
    init_logging(&args.log_level, args.json_logs)?;

    // Load configuration
    let config = AppConfig::load(&args.config, &args)?;
    info!("Configuration loaded from {}", args.config);

    match args.command {
        None | Some(Command::Serve) => serve(config).await,
        Some(Command::CleanupRateLimits) => cleanup_rate_limits(config).await,
        Some(Command::TestMail { ref to }) => test_mail(config, to).await,
    }
}

async fn serve(config: AppConfig) -> Result<()> {
    info!("Starting Gatehouse v{}", env!("CARGO_PKG_VERSION"));

    // Create shutdown broadcast channel
    let (shutdown_tx, _) = tokio::sync::broadcast::channel::<()>(1);

    // Initialize application state
    let state = AppState::new(config.clone()).await?;
    info!(storage = ?config.storage, "Storage ready");

    // Spawn the rate limit sweeper
    let sweeper = state.sweeper.clone();
    let sweeper_shutdown = shutdown_tx.subscribe();
    let sweep_interval = config.rate_limit.sweep_interval();
    tokio::spawn(async move {
        sweeper_worker(sweeper, sweep_interval, sweeper_shutdown).await;
    });

    // Build router
    let app = routes::create_router(state);

    // Start server
    let listener = tokio::net::TcpListener::bind(&config.listen_addr)
        .await
        .with_context(|| format!("Failed to bind {}", config.listen_addr))?;
    info!("Gatehouse listening on {}", config.listen_addr);

    // Handle graceful shutdown
    let shutdown_signal = async move {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
        }
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(());
    };

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal)
    .await
    .context("Server error")?;

    info!("Gatehouse shutdown complete");
    Ok(())
}

/// One-shot sweep, meant for cron
async fn cleanup_rate_limits(config: AppConfig) -> Result<()> {
    let state = AppState::new(config).await?;

    let deleted = state
        .sweeper
        .run_once()
        .await
        .context("Error cleaning up expired rate limit entries")?;

    if deleted > 0 {
        println!("Cleaned up {deleted} expired rate limit entries.");
    } else {
        println!("No expired rate limit entries found.");
    }
    Ok(())
}

async fn test_mail(config: AppConfig, to: &str) -> Result<()> {
    let state = AppState::new(config).await?;

    state
        .mailer
        .send_test(to)
        .await
        .with_context(|| format!("Failed to send test email to {to}"))?;

    println!("Test email sent to {to}.");
    Ok(())
}

/// Initialize structured logging with tracing
fn init_logging(level: &str, json: bool) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    if json {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(filter)
            .with(fmt::layer().with_target(true).with_thread_ids(true))
            .init();
    }

    Ok(())
}
