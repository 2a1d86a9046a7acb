use std::process::ExitCode;
use std::sync::Arc;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use scan_daemon::cli::Cli;
use scan_daemon::config::BrokerConfig;
use scan_daemon::host::{exit_code, RunningService, ServiceHost};
use scan_daemon::worker::{LocalSpawner, ProcessSpawner, WorkerSpawner};
use scan_worker::MockConfig;

#[tokio::main]
async fn main() -> ExitCode {
    // Initialize logging
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scan_daemon=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    match run(Cli::from_env()).await {
        Ok(code) => code,
        Err(e) => {
            error!("Scan broker failed to start: {:#}", e);
            ExitCode::from(exit_code::STARTUP_FAILED)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let mut config = match &cli.config {
        Some(path) => BrokerConfig::load(path)
            .with_context(|| format!("loading configuration from {}", path.display()))?,
        None => BrokerConfig::default(),
    };
    cli.apply(&mut config);
    config.validate().context("invalid configuration")?;

    let spawner: Arc<dyn WorkerSpawner> = if cli.in_process {
        let mut mock = MockConfig::default();
        if let Some(pages) = cli.mock_pages {
            mock.feeder_pages = pages;
        }
        info!("Hosting the simulated driver in-process");
        Arc::new(LocalSpawner::new(mock, config.worker.max_frame_len))
    } else {
        let spawner = ProcessSpawner::from_config(&config.worker);
        info!(program = %spawner.program().display(), "Using worker executable");
        Arc::new(spawner)
    };

    info!(port = config.service.port, "Scan broker starting...");
    let service = ServiceHost::new(config, spawner)
        .start()
        .await
        .context("starting service")?;

    wait_for_shutdown(&service).await;

    let report = service.shutdown().await;
    if !report.is_clean() {
        warn!(?report, "Shutdown was not clean");
    }
    Ok(ExitCode::from(report.exit_code()))
}

/// Block until the process is asked to stop. SIGHUP restarts the worker.
#[cfg(unix)]
async fn wait_for_shutdown(service: &RunningService) {
    use tokio::signal::unix::{signal, SignalKind};

    let (mut terminate, mut hangup) =
        match (signal(SignalKind::terminate()), signal(SignalKind::hangup())) {
            (Ok(terminate), Ok(hangup)) => (terminate, hangup),
            _ => {
                warn!("Could not install signal handlers, waiting for Ctrl-C only");
                let _ = tokio::signal::ctrl_c().await;
                return;
            }
        };

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupt received, shutting down");
                return;
            }
            _ = terminate.recv() => {
                info!("SIGTERM received, shutting down");
                return;
            }
            _ = hangup.recv() => {
                info!("SIGHUP received, restarting worker");
                service.bridge().restart_worker();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown(_service: &RunningService) {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "Failed to listen for Ctrl-C");
    }
    info!("Interrupt received, shutting down");
}
