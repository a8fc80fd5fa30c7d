use anyhow::Result;
use console::style;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::info;

use crate::core::config::PipelineConfig;
use crate::core::lifecycle::LifecycleManager;
use crate::core::pipeline::{Pipeline, PipelineComponent, schedule_housekeeping};
use crate::core::terminal::GuideSection;
use crate::interfaces::web::ApiServer;
use crate::platform::{NativePlatform, Platform};

pub(crate) struct DaemonOptions {
    pub config_path: Option<PathBuf>,
    pub api_host: Option<String>,
    pub api_port: Option<u16>,
    /// Print the startup summary; off for `daemon-run`, whose stdout is a log.
    pub interactive: bool,
}

pub async fn run_daemon(options: DaemonOptions) -> Result<()> {
    let data_dir = NativePlatform::data_dir();
    std::fs::create_dir_all(&data_dir)?;
    NativePlatform::restrict_dir_permissions(&data_dir);

    let mut config = PipelineConfig::load(options.config_path.as_deref(), &data_dir).await?;
    if let Some(host) = options.api_host {
        config.server.host = host;
    }
    if let Some(port) = options.api_port {
        config.server.port = port;
    }

    let log_tx = crate::logging::init_daemon_logging(config.logging.tracing_level());
    info!(
        "Starting alert-relay (data dir {}, level {})",
        data_dir.display(),
        config.logging.level
    );

    let api_host = config.server.host.clone();
    let api_port = config.server.port;
    let pipeline = Pipeline::build(config, &data_dir).await?;

    let mut lifecycle = LifecycleManager::new().await?;
    lifecycle.attach(Arc::new(Mutex::new(PipelineComponent::new(
        pipeline.clone(),
    ))));
    lifecycle.attach(Arc::new(Mutex::new(ApiServer::new(
        pipeline.clone(),
        log_tx,
        api_host.clone(),
        api_port,
    ))));
    schedule_housekeeping(&lifecycle, pipeline.clone()).await?;
    lifecycle.start().await?;

    if options.interactive {
        GuideSection::new("alert-relay")
            .status(
                "Status",
                &format!("{}", style("RUNNING").green().bold()),
            )
            .status("API Endpoint", &format!("http://{}:{}", api_host, api_port))
            .status("Data Dir", &data_dir.display().to_string())
            .blank()
            .text(&format!(
                "Press {} to stop.",
                style("Ctrl+C").bold().yellow()
            ))
            .print();
        println!();
    }

    wait_for_shutdown().await?;
    info!("Shutdown signal received, draining pipeline...");
    lifecycle.shutdown().await?;
    if let Err(e) = lifecycle.scheduler.shutdown().await {
        tracing::warn!("Scheduler shutdown error: {}", e);
    }
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{SignalKind, signal};
    let mut term = signal(SignalKind::terminate())?;
    tokio::select! {
        res = tokio::signal::ctrl_c() => res?,
        _ = term.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await?;
    Ok(())
}
