//! Device operation bridge.
//!
//! Any number of callers submit operations; a single dispatch task takes them
//! in submission order and runs them against the worker one at a time. The
//! dispatch task is the only owner of the [`WorkerSupervisor`]. Scan output
//! reaches the caller page by page while the scan is in service.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::sync::{mpsc, oneshot, watch, Notify};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use scan_types::{
    DeviceDescriptor, ScanOptions, ScanResult, ScanSummary, WorkerCommand, WorkerEvent,
};

use crate::config::BridgeConfig;
use crate::error::BrokerError;
pub use crate::worker::supervisor::ScanProgress;
use crate::worker::supervisor::{StopOutcome, WorkerState, WorkerSupervisor};

/// Scan updates buffered between the dispatch task and a caller.
const PROGRESS_DEPTH: usize = 4;

/// A capability invocation.
#[derive(Debug, Clone, PartialEq)]
pub enum Operation {
    EnumerateDevices,
    Scan {
        device_id: String,
        options: ScanOptions,
    },
}

impl Operation {
    pub fn name(&self) -> &'static str {
        match self {
            Operation::EnumerateDevices => "enumerate_devices",
            Operation::Scan { .. } => "scan",
        }
    }

    fn command(&self) -> WorkerCommand {
        match self {
            Operation::EnumerateDevices => WorkerCommand::EnumerateDevices,
            Operation::Scan { device_id, options } => WorkerCommand::Scan {
                device_id: device_id.clone(),
                options: options.clone(),
            },
        }
    }
}

#[derive(Debug)]
pub enum OperationOutput {
    Devices(Vec<DeviceDescriptor>),
    /// The pages went out through [`PendingHandle::next_progress`].
    ScanComplete(ScanSummary),
}

type Outcome = Result<OperationOutput, BrokerError>;

struct PendingRequest {
    id: u64,
    operation: Operation,
    submitted_at: Instant,
    progress: Option<mpsc::Sender<ScanProgress>>,
    responder: oneshot::Sender<Outcome>,
}

/// Snapshot of the bridge counters.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    /// Withdrawn by their caller before entering service.
    pub cancelled: u64,
    /// Refused at submission.
    pub rejected: u64,
    /// Most requests ever in service at the same time.
    pub peak_in_service: usize,
}

#[derive(Default)]
struct Counters {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    cancelled: AtomicU64,
    rejected: AtomicU64,
    in_service: AtomicUsize,
    peak_in_service: AtomicUsize,
}

struct QueueState {
    waiting: VecDeque<PendingRequest>,
    accepting: bool,
    in_service: Option<u64>,
}

struct Shared {
    config: BridgeConfig,
    queue: Mutex<QueueState>,
    /// Wakes the dispatcher for new work or a restart request.
    wake: Notify,
    /// Waiting plus in-service requests.
    outstanding: watch::Sender<usize>,
    next_id: AtomicU64,
    /// Set while the worker sits at its restart ceiling.
    unavailable: AtomicBool,
    failures: AtomicU64,
    restart_requested: AtomicBool,
    counters: Counters,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, QueueState> {
        self.queue
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn publish(&self, queue: &QueueState) {
        let outstanding = queue.waiting.len() + usize::from(queue.in_service.is_some());
        self.outstanding.send_replace(outstanding);
    }

    /// Take the next live request and mark it in service.
    fn next_request(&self) -> Option<PendingRequest> {
        let mut queue = self.lock();
        while let Some(request) = queue.waiting.pop_front() {
            if request.responder.is_closed() {
                self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = request.id, "Skipping request abandoned by its caller");
                continue;
            }
            queue.in_service = Some(request.id);
            self.publish(&queue);
            return Some(request);
        }
        self.publish(&queue);
        None
    }

    fn finish(&self, id: u64) {
        let mut queue = self.lock();
        if queue.in_service == Some(id) {
            queue.in_service = None;
        }
        self.publish(&queue);
    }

    fn cancel(&self, id: u64) {
        let mut queue = self.lock();
        let before = queue.waiting.len();
        queue.waiting.retain(|request| request.id != id);
        if queue.waiting.len() != before {
            self.counters.cancelled.fetch_add(1, Ordering::Relaxed);
            debug!(request_id = id, "Queued request cancelled");
            self.publish(&queue);
        }
    }

    /// Fail every waiting request with `error`.
    fn fail_waiting(&self, error: &BrokerError) -> usize {
        let drained: Vec<PendingRequest> = {
            let mut queue = self.lock();
            let drained = queue.waiting.drain(..).collect();
            self.publish(&queue);
            drained
        };
        let count = drained.len();
        for request in drained {
            self.counters.failed.fetch_add(1, Ordering::Relaxed);
            let _ = request.responder.send(Err(error.clone()));
        }
        count
    }

    fn unavailable_error(&self) -> BrokerError {
        BrokerError::WorkerUnavailable {
            failures: self.failures.load(Ordering::SeqCst) as u32,
        }
    }
}

/// Handle to a submitted operation.
///
/// Dropping it before the operation enters service withdraws it from the
/// queue. Once in service the operation runs to completion and its result is
/// discarded.
pub struct PendingHandle {
    id: u64,
    rx: Option<oneshot::Receiver<Outcome>>,
    progress: Option<mpsc::Receiver<ScanProgress>>,
    shared: Arc<Shared>,
}

impl PendingHandle {
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Next piece of scan output. `None` once the operation has left service,
    /// after which [`outcome`](Self::outcome) tells how it ended.
    pub async fn next_progress(&mut self) -> Option<ScanProgress> {
        self.progress.as_mut()?.recv().await
    }

    /// Final result. Scan output not yet taken is dropped.
    pub async fn outcome(mut self) -> Outcome {
        self.progress = None;
        let Some(rx) = self.rx.as_mut() else {
            return Err(BrokerError::ShuttingDown);
        };
        let outcome = rx.await.unwrap_or(Err(BrokerError::ShuttingDown));
        self.rx = None;
        outcome
    }

    pub async fn devices(self) -> Result<Vec<DeviceDescriptor>, BrokerError> {
        match self.outcome().await? {
            OperationOutput::Devices(devices) => Ok(devices),
            OperationOutput::ScanComplete(_) => Err(BrokerError::ProtocolDesync(
                "scan result for a device enumeration".to_string(),
            )),
        }
    }

    /// Collect a whole scan in memory.
    pub async fn scan_result(mut self) -> Result<ScanResult, BrokerError> {
        let mut metadata = None;
        let mut pages = Vec::new();
        while let Some(update) = self.next_progress().await {
            match update {
                ScanProgress::Started(started) => metadata = Some(started),
                ScanProgress::Page(page) => pages.push(page),
            }
        }
        match self.outcome().await? {
            OperationOutput::ScanComplete(_) => match metadata {
                Some(metadata) => Ok(ScanResult { metadata, pages }),
                None => Err(BrokerError::ProtocolDesync(
                    "scan completed without metadata".to_string(),
                )),
            },
            OperationOutput::Devices(_) => Err(BrokerError::ProtocolDesync(
                "device list for a scan".to_string(),
            )),
        }
    }
}

impl Drop for PendingHandle {
    fn drop(&mut self) {
        if self.rx.is_some() {
            self.shared.cancel(self.id);
        }
    }
}

/// Entry point for device operations. Cheap to clone.
#[derive(Clone)]
pub struct DeviceBridge {
    shared: Arc<Shared>,
    worker_state: watch::Receiver<WorkerState>,
}

impl DeviceBridge {
    /// Start the dispatch loop around an already started supervisor.
    ///
    /// The loop runs until `shutdown` fires, then stops the worker; the
    /// returned handle yields how that went.
    pub fn start(
        supervisor: WorkerSupervisor,
        config: BridgeConfig,
        shutdown: CancellationToken,
    ) -> (Self, JoinHandle<StopOutcome>) {
        let (outstanding, _) = watch::channel(0);
        let shared = Arc::new(Shared {
            config,
            queue: Mutex::new(QueueState {
                waiting: VecDeque::new(),
                accepting: true,
                in_service: None,
            }),
            wake: Notify::new(),
            outstanding,
            next_id: AtomicU64::new(1),
            unavailable: AtomicBool::new(false),
            failures: AtomicU64::new(0),
            restart_requested: AtomicBool::new(false),
            counters: Counters::default(),
        });
        let bridge = Self {
            shared: shared.clone(),
            worker_state: supervisor.subscribe(),
        };
        let dispatcher = Dispatcher {
            shared,
            supervisor,
            shutdown,
            interrupted: false,
        };
        (bridge, tokio::spawn(dispatcher.run()))
    }

    /// Queue an operation.
    pub fn submit(&self, operation: Operation) -> Result<PendingHandle, BrokerError> {
        let shared = &self.shared;
        let result = {
            let mut queue = shared.lock();
            if !queue.accepting {
                Err(BrokerError::ShuttingDown)
            } else if shared.unavailable.load(Ordering::SeqCst) {
                Err(shared.unavailable_error())
            } else if queue.waiting.len() >= shared.config.queue_depth {
                Err(BrokerError::Overloaded {
                    depth: queue.waiting.len(),
                })
            } else {
                let id = shared.next_id.fetch_add(1, Ordering::SeqCst);
                let (responder, rx) = oneshot::channel();
                let (progress_tx, progress_rx) = match operation {
                    Operation::Scan { .. } => {
                        let (tx, rx) = mpsc::channel(PROGRESS_DEPTH);
                        (Some(tx), Some(rx))
                    }
                    Operation::EnumerateDevices => (None, None),
                };
                debug!(request_id = id, operation = operation.name(), "Request queued");
                queue.waiting.push_back(PendingRequest {
                    id,
                    operation,
                    submitted_at: Instant::now(),
                    progress: progress_tx,
                    responder,
                });
                shared.publish(&queue);
                Ok(PendingHandle {
                    id,
                    rx: Some(rx),
                    progress: progress_rx,
                    shared: shared.clone(),
                })
            }
        };
        match &result {
            Ok(_) => {
                shared.counters.submitted.fetch_add(1, Ordering::Relaxed);
                shared.wake.notify_one();
            }
            Err(e) => {
                shared.counters.rejected.fetch_add(1, Ordering::Relaxed);
                debug!(error = %e, "Request rejected");
            }
        }
        result
    }

    pub async fn enumerate_devices(&self) -> Result<Vec<DeviceDescriptor>, BrokerError> {
        self.submit(Operation::EnumerateDevices)?.devices().await
    }

    pub async fn scan(&self, device_id: &str, options: ScanOptions) -> Result<ScanResult, BrokerError> {
        self.submit(Operation::Scan {
            device_id: device_id.to_string(),
            options,
        })?
        .scan_result()
        .await
    }

    /// Ask for the worker to be replaced and its failure count cleared.
    pub fn restart_worker(&self) {
        self.shared.restart_requested.store(true, Ordering::SeqCst);
        self.shared.wake.notify_one();
    }

    pub fn worker_state(&self) -> watch::Receiver<WorkerState> {
        self.worker_state.clone()
    }

    /// Refuse further submissions. Already queued requests still run.
    pub fn close(&self) {
        let mut queue = self.shared.lock();
        if queue.accepting {
            queue.accepting = false;
            info!(waiting = queue.waiting.len(), "Bridge closed to new requests");
        }
    }

    /// Wait up to `grace` for queued and in-service requests to finish.
    ///
    /// On timeout the still-queued ones fail with `ServiceShuttingDown` and
    /// `false` is returned. An in-service request is left to the dispatch
    /// loop's shutdown.
    pub async fn drain(&self, grace: Duration) -> bool {
        let mut outstanding = self.shared.outstanding.subscribe();
        let idle = tokio::time::timeout(grace, outstanding.wait_for(|n| *n == 0))
            .await
            .is_ok();
        if idle {
            return true;
        }
        let failed = self.shared.fail_waiting(&BrokerError::ShuttingDown);
        warn!(failed, ?grace, "Drain grace exceeded");
        false
    }

    /// Requests waiting to enter service.
    pub fn queued(&self) -> usize {
        self.shared.lock().waiting.len()
    }

    pub fn stats(&self) -> BridgeStats {
        let c = &self.shared.counters;
        BridgeStats {
            submitted: c.submitted.load(Ordering::Relaxed),
            completed: c.completed.load(Ordering::Relaxed),
            failed: c.failed.load(Ordering::Relaxed),
            cancelled: c.cancelled.load(Ordering::Relaxed),
            rejected: c.rejected.load(Ordering::Relaxed),
            peak_in_service: c.peak_in_service.load(Ordering::Relaxed),
        }
    }
}

struct Dispatcher {
    shared: Arc<Shared>,
    supervisor: WorkerSupervisor,
    shutdown: CancellationToken,
    /// A request was cut short by shutdown.
    interrupted: bool,
}

impl Dispatcher {
    async fn run(mut self) -> StopOutcome {
        let mut heartbeat = tokio::time::interval(self.supervisor.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        heartbeat.reset();
        info!("Dispatch loop started");

        loop {
            if self.shutdown.is_cancelled() {
                break;
            }
            if self.shared.restart_requested.swap(false, Ordering::SeqCst) {
                self.restart().await;
                continue;
            }
            if !self.supervisor.is_ready() && !self.shared.unavailable.load(Ordering::SeqCst) {
                self.recover().await;
                continue;
            }
            if let Some(request) = self.shared.next_request() {
                self.serve(request).await;
                heartbeat.reset();
                continue;
            }

            tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => break,
                _ = self.shared.wake.notified() => {}
                fault = self.supervisor.idle_fault() => {
                    self.supervisor.discard(&fault).await;
                }
                _ = heartbeat.tick() => {
                    if self.supervisor.is_ready() {
                        self.heartbeat().await;
                    }
                }
            }
        }

        let failed = self.shared.fail_waiting(&BrokerError::ShuttingDown);
        if failed > 0 {
            info!(failed, "Failed queued requests at shutdown");
        }
        let mut outcome = self.supervisor.stop().await;
        if self.interrupted {
            outcome = StopOutcome::Forced;
        }
        info!(?outcome, "Dispatch loop stopped");
        outcome
    }

    async fn serve(&mut self, request: PendingRequest) {
        let PendingRequest {
            id,
            operation,
            submitted_at,
            progress,
            responder,
        } = request;

        let counters = &self.shared.counters;
        let now_in_service = counters.in_service.fetch_add(1, Ordering::SeqCst) + 1;
        counters.peak_in_service.fetch_max(now_in_service, Ordering::SeqCst);

        let deadline = match operation {
            Operation::EnumerateDevices => self.shared.config.enumerate_timeout,
            Operation::Scan { .. } => self.shared.config.scan_timeout,
        };
        debug!(
            request_id = id,
            operation = operation.name(),
            queued_ms = submitted_at.elapsed().as_millis() as u64,
            "Request entering service"
        );

        let outcome = if self.supervisor.is_ready() {
            let command = operation.command();
            let executed = tokio::select! {
                biased;
                _ = self.shutdown.cancelled() => None,
                result = self.supervisor.execute(command, deadline, progress.as_ref()) => Some(result),
            };
            match executed {
                Some(Ok(event)) => into_output(event),
                Some(Err(e)) => Err(e),
                None => {
                    // Interrupted mid-request; the channel is out of step.
                    self.interrupted = true;
                    self.supervisor.discard(&BrokerError::ShuttingDown).await;
                    Err(BrokerError::ShuttingDown)
                }
            }
        } else {
            Err(self.shared.unavailable_error())
        };

        // Ends the caller's progress stream ahead of the outcome.
        drop(progress);
        counters.in_service.fetch_sub(1, Ordering::SeqCst);
        match &outcome {
            Ok(_) => {
                counters.completed.fetch_add(1, Ordering::Relaxed);
                debug!(request_id = id, "Request completed");
            }
            Err(e) => {
                counters.failed.fetch_add(1, Ordering::Relaxed);
                warn!(request_id = id, operation = operation.name(), error = %e, "Request failed");
            }
        }
        if responder.send(outcome).is_err() {
            debug!(request_id = id, "Caller went away; result discarded");
        }
        self.shared.finish(id);
    }

    /// Ping the idle worker unless shutdown begins first. A failed check
    /// has already discarded the worker.
    async fn heartbeat(&mut self) {
        let checked = tokio::select! {
            biased;
            _ = self.shutdown.cancelled() => None,
            result = self.supervisor.check_liveness() => Some(result),
        };
        match checked {
            Some(Ok(())) => {}
            Some(Err(e)) => debug!(error = %e, "Heartbeat failed"),
            None => debug!("Heartbeat abandoned for shutdown"),
        }
    }

    async fn recover(&mut self) {
        if self.supervisor.recover(&self.shutdown).await {
            return;
        }
        if self.supervisor.is_exhausted() {
            self.mark_unavailable();
        }
    }

    async fn restart(&mut self) {
        if self.supervisor.restart(&self.shutdown).await {
            self.shared.unavailable.store(false, Ordering::SeqCst);
            info!("Worker restarted by operator");
        } else if self.supervisor.is_exhausted() {
            self.mark_unavailable();
        }
    }

    fn mark_unavailable(&self) {
        self.shared.failures.store(
            u64::from(self.supervisor.consecutive_failures()),
            Ordering::SeqCst,
        );
        self.shared.unavailable.store(true, Ordering::SeqCst);
        let failed = self.shared.fail_waiting(&self.shared.unavailable_error());
        warn!(failed, "Worker unavailable until restarted");
    }
}

fn into_output(event: WorkerEvent) -> Outcome {
    match event {
        WorkerEvent::Devices(devices) => Ok(OperationOutput::Devices(devices)),
        WorkerEvent::ScanDone(summary) => Ok(OperationOutput::ScanComplete(summary)),
        WorkerEvent::Failed { message } => Err(BrokerError::DeviceFailure(message)),
        other => Err(BrokerError::ProtocolDesync(format!(
            "unexpected '{}' reply",
            other.name()
        ))),
    }
}
