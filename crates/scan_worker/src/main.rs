use std::time::Duration;

use anyhow::{bail, Context};
use clap::Parser;
use scan_types::DEFAULT_MAX_FRAME_LEN;
use scan_worker::{serve, MockConfig, MockScanner, ScanDriver};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Scan worker process. Spawned by `scan_daemon`; speaks the framed worker
/// protocol on stdin/stdout and logs to stderr.
#[derive(Parser, Debug)]
#[command(name = "scan_worker", version)]
struct Args {
    /// Driver backend to host
    #[arg(long, default_value = "mock")]
    driver: String,
    /// Pages the simulated feeder delivers per job
    #[arg(long, default_value_t = 3)]
    feeder_pages: u32,
    /// Width of simulated pages in pixels
    #[arg(long, default_value_t = 64)]
    page_width: u32,
    /// Height of simulated pages in pixels
    #[arg(long, default_value_t = 88)]
    page_height: u32,
    /// Simulated time per page
    #[arg(long, default_value_t = 0)]
    scan_delay_ms: u64,
    /// Largest accepted frame body in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_FRAME_LEN)]
    max_frame_len: usize,
}

fn main() -> anyhow::Result<()> {
    // stdout carries the channel, so logs go to stderr.
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "scan_worker=info".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();

    let args = Args::parse();
    let driver: Box<dyn ScanDriver> = match args.driver.as_str() {
        "mock" => Box::new(MockScanner::new(MockConfig {
            feeder_pages: args.feeder_pages,
            page_width_px: args.page_width,
            page_height_px: args.page_height,
            scan_delay: Duration::from_millis(args.scan_delay_ms),
            ..MockConfig::default()
        })),
        other => bail!("unknown driver '{}'", other),
    };

    tracing::info!(pid = std::process::id(), driver = %args.driver, "Scan worker starting");
    let runtime = tokio::runtime::Builder::new_current_thread()
        .enable_all()
        .build()
        .context("failed to build runtime")?;
    let outcome = runtime.block_on(serve(
        tokio::io::stdin(),
        tokio::io::stdout(),
        driver,
        args.max_frame_len,
    ));
    // A stdin read may still be parked on a blocking thread.
    runtime.shutdown_timeout(Duration::from_millis(200));

    outcome.context("worker loop failed")?;
    tracing::info!("Scan worker exiting");
    Ok(())
}
