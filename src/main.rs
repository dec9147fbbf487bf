//! AOS IAM node agent

use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use tokio::signal::unix::{signal, SignalKind};
use tracing::info;

use aos_iamanager::telemetry::{init_telemetry, TelemetryConfig};
use aos_iamanager::{App, Config, DEFAULT_CONFIG_PATH};

/// IAM node agent: node registration, request forwarding and identity services
#[derive(Parser, Debug)]
#[command(name = "aos-iamanager", version, about, long_about = None)]
struct Cli {
    /// Path to the JSON configuration file
    #[arg(short = 'c', long = "config", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,

    /// Run both listeners without TLS
    #[arg(short = 'p', long)]
    provisioning: bool,

    /// Log filter used when RUST_LOG is unset
    #[arg(short = 'v', long = "log-level", env = "AOS_IAM_LOG_LEVEL", default_value = "info")]
    log_level: String,

    /// Emit JSON log lines
    #[arg(short = 'j', long)]
    json_logs: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_telemetry(&TelemetryConfig {
        level: cli.log_level.clone(),
        json: cli.json_logs,
    })?;

    let config = Config::load(&cli.config)
        .with_context(|| format!("failed to load config {}", cli.config.display()))?;

    let mut app = App::new(&config, cli.provisioning)
        .await
        .context("failed to initialize node agent")?;
    app.start().await.context("failed to start node agent")?;

    let mut hangup = signal(SignalKind::hangup()).context("failed to install SIGHUP handler")?;
    let mut terminate =
        signal(SignalKind::terminate()).context("failed to install SIGTERM handler")?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            _ = terminate.recv() => break,
            _ = hangup.recv() => app.reload_subjects(),
        }
    }

    info!("Shutting down");
    app.stop().await;

    Ok(())
}
