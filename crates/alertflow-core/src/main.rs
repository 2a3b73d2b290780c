//! AlertFlow CLI
//!
//! Runs the alerting engine, sends one-off alerts and checks configuration.

use std::process::ExitCode;

use alertflow::alerting::{AlertingEngine, EngineBuilder};
use alertflow::config::{Config, ResolvedConfig};
use alertflow::models::{AlertType, Severity};
use anyhow::Context;
use clap::{Parser, Subcommand};
use tracing::{info, warn};

/// AlertFlow - alert batching and webhook delivery
#[derive(Parser)]
#[command(name = "alertflow")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, global = true, env = "ALERTFLOW_CONFIG")]
    config: Option<String>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the alerting loops until interrupted
    Serve,

    /// Send a single alert and flush it
    Send {
        /// Markdown message body
        message: String,

        /// Alert type used for routing
        #[arg(long = "type", default_value = "llm_exceptions")]
        alert_type: AlertType,

        /// Severity (low, medium, high)
        #[arg(long, default_value = "low")]
        severity: Severity,

        /// JSON object appended to the alert
        #[arg(long)]
        metadata: Option<String>,
    },

    /// Print the resolved configuration with secrets redacted
    CheckConfig,
}

#[tokio::main]
async fn main() -> ExitCode {
    let _ = dotenvy::dotenv();
    let cli = Cli::parse();

    let config = match load_config(cli.config.as_deref()) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("Error loading configuration: {e:#}");
            return ExitCode::FAILURE;
        }
    };

    init_logging(&config, cli.verbose);

    let result = match cli.command {
        Commands::Serve => run_serve(&config).await,
        Commands::Send {
            message,
            alert_type,
            severity,
            metadata,
        } => run_send(&config, &message, alert_type, severity, metadata.as_deref()).await,
        Commands::CheckConfig => run_check_config(&config),
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("Error: {e:#}");
            ExitCode::FAILURE
        }
    }
}

fn load_config(path: Option<&str>) -> anyhow::Result<ResolvedConfig> {
    let config = Config::load(path).context("failed to load configuration")?;
    config.resolve().context("failed to resolve configuration")
}

fn init_logging(config: &ResolvedConfig, verbose: bool) {
    let level = if verbose { "debug" } else { config.logging.level.as_str() };
    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(level));

    if config.logging.format == "json" {
        tracing_subscriber::fmt().with_env_filter(filter).json().init();
    } else {
        tracing_subscriber::fmt().with_env_filter(filter).init();
    }
}

fn build_engine(config: &ResolvedConfig) -> anyhow::Result<AlertingEngine> {
    EngineBuilder::from_config(config)
        .and_then(EngineBuilder::build)
        .context("failed to build alerting engine")
}

async fn run_serve(config: &ResolvedConfig) -> anyhow::Result<()> {
    let engine = build_engine(config)?;
    let settings = engine.settings();
    info!(
        batch_size = settings.batch_size,
        flush_interval_secs = settings.flush_interval.as_secs(),
        threshold_secs = settings.alerting_threshold.as_secs_f64(),
        "Starting alerting engine"
    );

    engine.start();

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");
    engine.shutdown().await;

    let stats = engine.queue_stats();
    info!(
        flushes = stats.flushes,
        items = stats.items_flushed,
        failed = stats.failed_deliveries,
        "Alerting engine summary"
    );
    Ok(())
}

async fn run_send(
    config: &ResolvedConfig,
    message: &str,
    alert_type: AlertType,
    severity: Severity,
    metadata: Option<&str>,
) -> anyhow::Result<()> {
    let metadata = match metadata {
        Some(raw) => serde_json::from_str(raw).context("metadata must be valid JSON")?,
        None => serde_json::Value::Null,
    };

    let engine = build_engine(config)?;
    let queued = engine.send_alert(message, severity, alert_type, &metadata).await;
    if queued == 0 {
        warn!(%alert_type, "No webhook configured or alert type disabled");
        anyhow::bail!("alert was not queued");
    }

    engine.flush().await;
    let stats = engine.queue_stats();
    println!(
        "Sent {alert_type} alert to {queued} endpoint(s), {} failed",
        stats.failed_deliveries
    );
    if stats.failed_deliveries > 0 {
        anyhow::bail!("{} delivery(ies) failed", stats.failed_deliveries);
    }
    Ok(())
}

fn run_check_config(config: &ResolvedConfig) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(&config.summary())?);
    Ok(())
}
