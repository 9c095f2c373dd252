//! Service entry points: run the capture pipeline and HTTP facade, or tear down

use std::net::{IpAddr, SocketAddr};
use std::sync::Arc;
use std::time::{Duration, Instant};

use color_eyre::{eyre::WrapErr, Result};
use tracing::{error, info};

use crate::capture::{FrameReader, RetryPolicy, V4l2Opener};
use crate::http::{self, AppState};
use crate::pipeline::{FrameCache, ProcessHost, ProcessSupervisor, SystemHost};
use crate::Config;

const MONITOR_JOIN_TIMEOUT: Duration = Duration::from_secs(5);

fn supervisor(config: &Config) -> Arc<ProcessSupervisor> {
    let host: Arc<dyn ProcessHost> = Arc::new(SystemHost);
    Arc::new(ProcessSupervisor::new(
        host,
        config.pipeline.clone(),
        &config.capture.device,
    ))
}

/// Set up the pipeline, start the frame reader and serve HTTP until ctrl-c or
/// SIGTERM, then tear everything down.
pub async fn start(config: Config) -> Result<()> {
    let started = Instant::now();
    let addr = SocketAddr::new(
        config
            .http
            .bind
            .parse::<IpAddr>()
            .wrap_err_with(|| format!("invalid bind address {}", config.http.bind))?,
        config.http.port,
    );

    let supervisor = supervisor(&config);
    let cache = Arc::new(FrameCache::new());

    let setup = Arc::clone(&supervisor);
    tokio::task::spawn_blocking(move || setup.setup())
        .await?
        .wrap_err("camera setup failed")?;

    let reader = FrameReader::new(
        V4l2Opener::new(&config.capture, config.retry.read_timeout()),
        Arc::clone(&cache),
        supervisor.clone(),
        RetryPolicy::from(&config.retry),
    )
    .spawn()?;

    let state = AppState {
        log_file: config.logging.file.clone(),
        ..AppState::new(cache, Arc::clone(&supervisor), started)
    };
    let served = http::serve(addr, state, shutdown_signal()).await;
    if let Err(e) = &served {
        error!("Error starting webcam service: {}", e);
    }

    info!("Shutting down capture pipeline");
    tokio::task::spawn_blocking(move || {
        if let Some(exit) = reader.stop() {
            info!("Frame reader finished: {:?}", exit);
        }
        supervisor.shutdown(MONITOR_JOIN_TIMEOUT);
    })
    .await?;

    served.wrap_err_with(|| format!("HTTP server on {} failed", addr))
}

/// Tear down any pipeline left behind by a previous run.
pub fn stop(config: &Config) {
    info!("Stopping webcam service...");
    supervisor(config).cleanup();
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for ctrl-c: {}", e);
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => info!("Interrupt received"),
        _ = terminate => info!("SIGTERM received"),
    }
}
