//! streamwarden daemon CLI.
//!
//! `swd run` hosts the supervised process: media engine, health sampler,
//! recovery supervisor, and the health surface. `swd watchdog` is the
//! independent escalation watchdog meant to run as its own service unit.
//! `swd status` queries a running instance.

use std::path::PathBuf;
use std::process::ExitCode;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use tokio::signal;
use tokio::sync::watch;
use tracing::info;

use streamwarden_core::config::Config;
use streamwarden_core::engine::{CommandEngine, EngineHandle};
use streamwarden_core::logging::{init_logging, LogConfig, LogFormat};
use streamwarden_core::runtime::{self, RunOutcome};

#[derive(Parser)]
#[command(name = "swd")]
#[command(about = "Self-healing supervision for unattended media pipelines")]
#[command(version)]
struct Cli {
    /// Configuration file path
    #[arg(long, global = true, default_value = "/etc/streamwarden/config.toml")]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, default_value = "info", env = "SWD_LOG")]
    log_level: String,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    log_json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the supervised process: engine, sampler, supervisor, health surface
    Run,
    /// Run the independent escalation watchdog
    Watchdog,
    /// Query a running instance's health endpoint
    Status {
        /// Health endpoint URL (defaults to the configured watchdog target)
        #[arg(long)]
        url: Option<String>,
        /// Fetch the detailed endpoint instead of the summary
        #[arg(long)]
        detailed: bool,
    },
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    match run(cli) {
        Ok(code) => code,
        Err(e) => {
            eprintln!("error: {e:#}");
            ExitCode::from(1)
        }
    }
}

fn run(cli: Cli) -> Result<ExitCode> {
    init_logging(&LogConfig {
        level: cli.log_level.clone(),
        format: if cli.log_json {
            LogFormat::Json
        } else {
            LogFormat::Pretty
        },
        file: None,
    })
    .context("initializing logging")?;

    let config = Config::load_from(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    let rt = tokio::runtime::Runtime::new().context("starting tokio runtime")?;
    match cli.command {
        Commands::Run => rt.block_on(run_monitor(config)),
        Commands::Watchdog => rt.block_on(run_watchdog(config)).map(|()| ExitCode::SUCCESS),
        Commands::Status { url, detailed } => rt
            .block_on(show_status(&config, url, detailed))
            .map(|()| ExitCode::SUCCESS),
    }
}

async fn run_monitor(config: Config) -> Result<ExitCode> {
    if config.engine.program.is_empty() {
        bail!("engine.program is not configured");
    }
    let engine = CommandEngine::new(
        config.engine.program.clone(),
        config.engine.args.clone(),
        config.monitor.artifact_dir.clone(),
        std::time::Duration::from_secs(config.monitor.artifact_fresh_within),
    );
    engine.spawn().context("spawning media engine")?;
    let engine = EngineHandle::command(engine);

    let shutdown = shutdown_channel();
    let outcome = runtime::run_monitor(config, engine, shutdown)
        .await
        .context("monitor loop failed")?;

    // The restart exit code is the hand-off to the service supervisor; it
    // must reach the OS unmodified.
    match outcome {
        RunOutcome::Shutdown => Ok(ExitCode::SUCCESS),
        RunOutcome::RestartRequested => {
            Ok(ExitCode::from(u8::try_from(outcome.exit_code()).unwrap_or(1)))
        }
    }
}

async fn run_watchdog(config: Config) -> Result<()> {
    let shutdown = shutdown_channel();
    runtime::run_watchdog(config, shutdown).await;
    Ok(())
}

async fn show_status(config: &Config, url: Option<String>, detailed: bool) -> Result<()> {
    let mut url = url.unwrap_or_else(|| config.watchdog.health_url.clone());
    if detailed && !url.ends_with("/detailed") {
        url = format!("{}/detailed", url.trim_end_matches('/'));
    }
    let client = reqwest::Client::builder()
        .timeout(std::time::Duration::from_secs(5))
        .build()?;
    let response = client
        .get(&url)
        .send()
        .await
        .with_context(|| format!("querying {url}"))?;
    let status = response.status();
    let body: serde_json::Value = response.json().await.context("parsing health response")?;
    if !status.is_success() {
        bail!("health endpoint returned {status}: {body}");
    }
    println!("{}", serde_json::to_string_pretty(&body)?);
    Ok(())
}

/// Watch channel flipped on SIGINT/SIGTERM.
fn shutdown_channel() -> watch::Receiver<bool> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        let ctrl_c = signal::ctrl_c();
        #[cfg(unix)]
        {
            let mut term = signal::unix::signal(signal::unix::SignalKind::terminate())
                .expect("installing SIGTERM handler");
            tokio::select! {
                _ = ctrl_c => {}
                _ = term.recv() => {}
            }
        }
        #[cfg(not(unix))]
        {
            let _ = ctrl_c.await;
        }
        info!("shutdown signal received");
        let _ = tx.send(true);
    });
    rx
}
