//! Stacker Server - Main entry point
//!
//! Loads configuration, starts telemetry and runs the listener group until
//! a termination signal arrives.

use clap::Parser;
use tokio_util::sync::CancellationToken;

use stacker_core::{
    app,
    config::Config,
    telemetry::{init_telemetry, LoggingConfig},
};

#[derive(Debug, Parser)]
#[command(name = "stacker-server", version, about = "Sub-exposure processing worker")]
struct Cli {
    /// Configuration file; environment variables prefixed `STACKER__` override it
    #[arg(long, short, env = "STACKER_CONFIG")]
    config: Option<String>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let config = Config::load(cli.config.as_deref())?;

    let metrics = init_telemetry(&LoggingConfig {
        level: config.log_level,
        format: config.log_format,
    })?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        config = ?config.redacted(),
        "Starting Stacker Server"
    );

    let shutdown = CancellationToken::new();
    watch_signals(shutdown.clone())?;

    app::run(config, metrics, shutdown).await?;
    Ok(())
}

/// Cancel `shutdown` on the first termination signal.
#[cfg(unix)]
fn watch_signals(shutdown: CancellationToken) -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut interrupt = signal(SignalKind::interrupt())?;
    let mut terminate = signal(SignalKind::terminate())?;
    let mut quit = signal(SignalKind::quit())?;
    let mut hangup = signal(SignalKind::hangup())?;

    tokio::spawn(async move {
        let name = tokio::select! {
            _ = interrupt.recv() => "SIGINT",
            _ = terminate.recv() => "SIGTERM",
            _ = quit.recv() => "SIGQUIT",
            _ = hangup.recv() => "SIGHUP",
        };
        tracing::info!(signal = name, "Shutdown signal received");
        shutdown.cancel();
    });
    Ok(())
}

#[cfg(not(unix))]
fn watch_signals(shutdown: CancellationToken) -> std::io::Result<()> {
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("Shutdown signal received");
            shutdown.cancel();
        }
    });
    Ok(())
}
