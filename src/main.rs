//! Backup Agent
//!
//! Periodically archives a directory of backup files, uploads the archives to
//! S3-compatible storage in parts and mails a summary of what was shipped.

// backupagent/src/main.rs
mod backup;
mod config;
mod errors;
mod scheduler;
mod server;
mod utils;

use anyhow::{Context, Result};
use backup::RunOutcome;
use config::AppConfig;
use scheduler::Scheduler;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{error, info, warn};

const CONFIG_ENV: &str = "BACKUP_AGENT_CONFIG";

/// Main entry point for the backup agent
#[tokio::main]
async fn main() -> ExitCode {
    dotenv::dotenv().ok();
    utils::logging::init_tracing();

    match run_app().await {
        Ok(_) => {
            info!("✅ Backup agent stopped.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

async fn run_app() -> Result<()> {
    // Defaults to config.json in the working directory.
    let config_path = env::var(CONFIG_ENV)
        .map(PathBuf::from)
        .unwrap_or_else(|_| PathBuf::from("config.json"));
    let app_config = AppConfig::load_from_json(&config_path).with_context(|| {
        format!(
            "Failed to load application configuration from {}",
            config_path.display()
        )
    })?;
    info!(
        source = %app_config.pipeline.source_dir.display(),
        bucket = %app_config.storage.bucket_name,
        interval_secs = app_config.schedule_interval.as_secs(),
        "Configuration loaded"
    );

    let orchestrator = Arc::new(
        backup::build_orchestrator(&app_config)
            .await
            .context("Failed to set up the backup pipeline")?,
    );

    // `backupagent once` runs a single pass and exits, for cron-style use.
    if env::args().nth(1).as_deref() == Some("once") {
        return match orchestrator.tick().await {
            RunOutcome::Failed(e) => Err(e).context("Backup run failed"),
            _ => Ok(()),
        };
    }

    let listener = server::bind(app_config.server.listen_addr).await?;

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    tokio::spawn(async move {
        shutdown_signal().await;
        info!("Shutdown signal received");
        let _ = shutdown_tx.send(true);
    });

    let server_task = tokio::spawn(server::serve(
        listener,
        orchestrator.clone(),
        wait_for_shutdown(shutdown_rx.clone()),
    ));

    // Long enough for one in-flight store request to finish.
    let ticks = Scheduler::new(orchestrator, app_config.schedule_interval)
        .with_shutdown_grace(app_config.pipeline.request_timeout)
        .run(wait_for_shutdown(shutdown_rx))
        .await;
    info!(ticks, "Scheduler stopped");

    match server_task.await {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(e),
        Err(e) => Err(e).context("Health server task panicked"),
    }
}

async fn wait_for_shutdown(mut rx: watch::Receiver<bool>) {
    let _ = rx.wait_for(|stop| *stop).await;
}

/// Resolves on Ctrl-C, or SIGTERM on unix.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl-C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
