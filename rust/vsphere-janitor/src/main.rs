//! vsphere-janitor - Main Entry Point
//!
//! Periodically powers off and destroys stale VMs below the configured
//! vSphere inventory paths.

use std::sync::Arc;

use anyhow::Context;
use chrono::Utc;
use clap::Parser;
use tokio_util::sync::CancellationToken;

use vsphere_janitor::config::{redact_url, Args, RunConfig};
use vsphere_janitor::logging::init_logging;
use vsphere_janitor::{metrics, vsphere, Janitor};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = RunConfig::from_args(Args::parse())?;

    init_logging(config.log_format)?;

    tracing::info!(
        version = env!("CARGO_PKG_VERSION"),
        url = %redact_url(&config.vsphere_url),
        paths = ?config.paths,
        "vsphere janitor starting"
    );

    metrics::init_metrics().context("Failed to initialize metrics")?;
    if let Some(port) = config.metrics_port {
        tokio::spawn(async move {
            if let Err(e) = metrics::start_metrics_server(port).await {
                tracing::error!(error = %e, "metrics server stopped");
            }
        });
    }

    let shutdown = CancellationToken::new();
    tokio::spawn(shutdown_signal(shutdown.clone()));

    let client = vsphere::Client::connect(&config.vsphere_url, &config.connect)
        .await
        .context("couldn't create vsphere client")?;

    let janitor = Janitor::new(Arc::new(client), config.options.clone())?
        .with_shutdown(shutdown.clone());

    loop {
        for path in &config.paths {
            if shutdown.is_cancelled() {
                break;
            }

            match janitor.cleanup(path, Utc::now()).await {
                Ok(stats) if !stats.is_clean() => {
                    tracing::warn!(
                        path = %path,
                        errors = stats.error_count(),
                        "cleanup finished with errors"
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    tracing::error!(path = %path, error = %e, "error cleaning up");
                }
            }
        }

        if config.once {
            break;
        }

        tracing::info!(sleep_secs = config.loop_sleep.as_secs(), "sleeping");
        tokio::select! {
            () = shutdown.cancelled() => break,
            () = tokio::time::sleep(config.loop_sleep) => {}
        }
    }

    tracing::info!("vsphere janitor stopped");
    Ok(())
}

/// Cancel `token` on Ctrl+C or SIGTERM.
async fn shutdown_signal(token: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install signal handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            tracing::info!("Received Ctrl+C, shutting down...");
        }
        () = terminate => {
            tracing::info!("Received SIGTERM, shutting down...");
        }
    }

    token.cancel();
}
