//! The worker's request loop.

use futures::{SinkExt, StreamExt};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::{debug, info, warn};

use scan_types::worker::UNSOLICITED_ID;
use scan_types::{
    FrameCodec, FrameError, PageImage, ScanMetadata, ScanSummary, WorkerCommand, WorkerEvent,
    WorkerReply, WorkerRequest,
};

use crate::driver::{DriverError, PageSink, ScanDriver};

type WorkerCodec = FrameCodec<WorkerRequest, WorkerReply>;

/// Pages buffered between the driver thread and the channel writer.
const PAGE_PIPELINE_DEPTH: usize = 2;

#[derive(Debug, thiserror::Error)]
pub enum WorkerError {
    #[error("channel error: {0}")]
    Channel(#[from] FrameError),
    #[error("driver failed to initialize: {0}")]
    Init(DriverError),
    #[error("driver fault: {0}")]
    DriverFault(String),
}

/// Serve broker requests until the broker asks for shutdown or closes the
/// channel.
///
/// Sends `Ready` once the driver is initialized, then answers each request
/// in turn. Driver calls run on a blocking thread; a panicking driver ends
/// the loop with [`WorkerError::DriverFault`], which the broker observes as a
/// crash. Scan pages are written as they are acquired.
pub async fn serve<R, W>(
    reader: R,
    writer: W,
    driver: Box<dyn ScanDriver>,
    max_frame_len: usize,
) -> Result<(), WorkerError>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
{
    let mut requests = FramedRead::new(reader, WorkerCodec::with_max_frame_len(max_frame_len));
    let mut replies = FramedWrite::new(writer, WorkerCodec::with_max_frame_len(max_frame_len));

    let (mut driver, init) = run_blocking(driver, |d| d.initialize()).await?;
    init.map_err(WorkerError::Init)?;
    let driver_name = driver.name().to_string();

    replies
        .send(WorkerReply {
            id: UNSOLICITED_ID,
            event: WorkerEvent::Ready {
                pid: std::process::id(),
                driver: driver_name.clone(),
            },
        })
        .await?;
    info!(driver = %driver_name, "Worker ready");

    while let Some(frame) = requests.next().await {
        let request = frame?;
        debug!(request_id = request.id, command = request.command.name(), "Request received");

        let event = match request.command {
            WorkerCommand::Ping => WorkerEvent::Pong,
            WorkerCommand::Shutdown => {
                info!("Shutdown requested by broker");
                replies
                    .send(WorkerReply {
                        id: request.id,
                        event: WorkerEvent::ShuttingDown,
                    })
                    .await?;
                return Ok(());
            }
            WorkerCommand::EnumerateDevices => {
                let (returned, result) = run_blocking(driver, |d| d.enumerate_devices()).await?;
                driver = returned;
                match result {
                    Ok(devices) => WorkerEvent::Devices(devices),
                    Err(e) => failed(e),
                }
            }
            WorkerCommand::Scan { device_id, options } => {
                let (tx, rx) = mpsc::channel(PAGE_PIPELINE_DEPTH);
                let job = spawn_driver(driver, move |d| {
                    let mut sink = ChannelSink { tx, started: false };
                    let result = d.scan(&device_id, &options, &mut sink);
                    (result, sink.started)
                });
                let delivered = stream_scan(request.id, rx, &mut replies).await?;
                let (returned, (result, started)) = join_driver(job).await?;
                driver = returned;
                match (delivered, result) {
                    (Err(reason), _) => {
                        warn!(request_id = request.id, %reason, "Scan abandoned");
                        WorkerEvent::Failed { message: reason }
                    }
                    (Ok(_), Err(e)) => failed(e),
                    (Ok(summary), Ok(())) if started => WorkerEvent::ScanDone(summary),
                    (Ok(_), Ok(())) => WorkerEvent::Failed {
                        message: "driver finished without starting the scan".to_string(),
                    },
                }
            }
        };

        replies
            .send(WorkerReply {
                id: request.id,
                event,
            })
            .await?;
    }

    info!("Broker closed the channel");
    Ok(())
}

fn failed(err: DriverError) -> WorkerEvent {
    warn!(error = %err, "Driver rejected request");
    WorkerEvent::Failed {
        message: err.to_string(),
    }
}

/// Hands scan output from the driver thread to [`stream_scan`].
struct ChannelSink {
    tx: mpsc::Sender<WorkerEvent>,
    started: bool,
}

impl ChannelSink {
    fn forward(&self, event: WorkerEvent) -> Result<(), DriverError> {
        self.tx
            .blocking_send(event)
            .map_err(|_| DriverError::Aborted("scan output is no longer wanted".to_string()))
    }
}

impl PageSink for ChannelSink {
    fn begin(&mut self, metadata: ScanMetadata) -> Result<(), DriverError> {
        self.started = true;
        self.forward(WorkerEvent::ScanStarted(metadata))
    }

    fn page(&mut self, page: PageImage) -> Result<(), DriverError> {
        if !self.started {
            return Err(DriverError::Aborted(
                "page delivered before the scan started".to_string(),
            ));
        }
        self.forward(WorkerEvent::Page(page))
    }
}

/// Write scan output to the broker as it arrives.
///
/// Returns the totals written, or why delivery stopped when a message could
/// not be framed. The channel stays in step either way; only I/O errors are
/// fatal.
async fn stream_scan<W>(
    id: u64,
    mut rx: mpsc::Receiver<WorkerEvent>,
    replies: &mut FramedWrite<W, WorkerCodec>,
) -> Result<Result<ScanSummary, String>, FrameError>
where
    W: AsyncWrite + Unpin,
{
    let mut summary = ScanSummary::default();
    while let Some(event) = rx.recv().await {
        let page_index = match &event {
            WorkerEvent::Page(page) => {
                summary.record(page);
                Some(page.index)
            }
            _ => None,
        };
        match replies.send(WorkerReply { id, event }).await {
            Ok(()) => {}
            Err(FrameError::Oversized { max }) => {
                // Stops the driver at its next page.
                rx.close();
                while rx.recv().await.is_some() {}
                let what = match page_index {
                    Some(index) => format!("page {}", index + 1),
                    None => "scan metadata".to_string(),
                };
                return Ok(Err(format!(
                    "{} does not fit in a {} byte channel frame",
                    what, max
                )));
            }
            Err(e) => return Err(e),
        }
    }
    Ok(Ok(summary))
}

type DriverJob<T> = JoinHandle<(Box<dyn ScanDriver>, T)>;

/// Start `op` against the driver on a blocking thread.
fn spawn_driver<T, F>(mut driver: Box<dyn ScanDriver>, op: F) -> DriverJob<T>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn ScanDriver>) -> T + Send + 'static,
{
    tokio::task::spawn_blocking(move || {
        let out = op(&mut driver);
        (driver, out)
    })
}

/// Wait for a driver call, handing the driver back.
async fn join_driver<T>(job: DriverJob<T>) -> Result<(Box<dyn ScanDriver>, T), WorkerError> {
    job.await.map_err(|e| {
        let reason = if e.is_panic() {
            let payload = e.into_panic();
            if let Some(s) = payload.downcast_ref::<&'static str>() {
                s.to_string()
            } else if let Some(s) = payload.downcast_ref::<String>() {
                s.clone()
            } else {
                "unknown panic payload".to_string()
            }
        } else {
            e.to_string()
        };
        WorkerError::DriverFault(reason)
    })
}

async fn run_blocking<T, F>(
    driver: Box<dyn ScanDriver>,
    op: F,
) -> Result<(Box<dyn ScanDriver>, T), WorkerError>
where
    T: Send + 'static,
    F: FnOnce(&mut Box<dyn ScanDriver>) -> T + Send + 'static,
{
    join_driver(spawn_driver(driver, op)).await
}
