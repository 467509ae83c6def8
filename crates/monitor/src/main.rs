//! Driver Monitor - Main Entry Point

use anyhow::Context;
use clap::Parser;
use monitor::cli::Cli;
use monitor::{init_logging, install_metrics, run, MonitorSettings};
use tokio::sync::mpsc;
use tracing::{info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let settings = MonitorSettings::load(cli.config.as_deref(), &cli.overrides())
        .context("failed to load settings")?;
    init_logging(cli.verbose, &settings.logging.level, settings.logging.json)?;

    info!("=== Driver Monitor v{} ===", env!("CARGO_PKG_VERSION"));
    info!(
        "Profile {}, model {}",
        settings.profile.as_str(),
        settings.model.path.display()
    );

    if let Some(listen) = settings.metrics.listen {
        install_metrics(listen)?;
    }

    let (commands_tx, commands) = mpsc::channel(8);
    #[cfg(unix)]
    monitor::reload_on_hangup(cli.config.clone(), cli.overrides(), commands_tx)?;
    #[cfg(not(unix))]
    drop(commands_tx);

    let shutdown = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Could not listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    run(&settings, commands, shutdown).await
}
