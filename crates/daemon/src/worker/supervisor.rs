//! Worker process supervision.
//!
//! The supervisor owns the one live worker. It is driven exclusively by the
//! bridge's dispatch loop, which is what keeps requests to the worker strictly
//! one at a time.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, trace, warn};

use scan_types::{PageImage, ScanMetadata, WorkerCommand, WorkerEvent};

use crate::config::{RestartPolicy, WorkerConfig};
use crate::error::BrokerError;
use crate::worker::channel::{ChannelError, WorkerChannel};
use crate::worker::spawner::{WorkerControl, WorkerSpawner};

/// Health of the supervised worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    /// Spawned, waiting for `Ready`.
    Starting,
    Ready,
    /// A request is in service.
    Busy,
    /// No usable worker. Either a replacement is pending or the restart
    /// ceiling was hit.
    Crashed,
    ShuttingDown,
    Stopped,
}

/// How [`WorkerSupervisor::stop`] ended the worker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StopOutcome {
    /// Acknowledged `Shutdown` and exited within the grace period.
    Graceful,
    /// Had to be killed.
    Forced,
    /// There was no worker to stop.
    NotRunning,
}

/// Partial output of a scan in service, in worker order.
#[derive(Debug, Clone, PartialEq)]
pub enum ScanProgress {
    Started(ScanMetadata),
    Page(PageImage),
}

struct WorkerProcess {
    generation: u64,
    pid: Option<u32>,
    started_at: DateTime<Utc>,
    channel: WorkerChannel,
    control: Box<dyn WorkerControl>,
}

pub struct WorkerSupervisor {
    spawner: Arc<dyn WorkerSpawner>,
    config: WorkerConfig,
    policy: RestartPolicy,
    current: Option<WorkerProcess>,
    generation: u64,
    consecutive_failures: u32,
    state: watch::Sender<WorkerState>,
}

impl WorkerSupervisor {
    pub fn new(spawner: Arc<dyn WorkerSpawner>, config: WorkerConfig, policy: RestartPolicy) -> Self {
        let (state, _) = watch::channel(WorkerState::Stopped);
        Self {
            spawner,
            config,
            policy,
            current: None,
            generation: 0,
            consecutive_failures: 0,
            state,
        }
    }

    pub fn subscribe(&self) -> watch::Receiver<WorkerState> {
        self.state.subscribe()
    }

    pub fn state(&self) -> WorkerState {
        *self.state.borrow()
    }

    pub fn is_ready(&self) -> bool {
        self.current.is_some()
    }

    /// The restart ceiling has been reached.
    pub fn is_exhausted(&self) -> bool {
        self.consecutive_failures >= self.policy.max_consecutive_failures
    }

    pub fn consecutive_failures(&self) -> u32 {
        self.consecutive_failures
    }

    /// Restart count of the current worker; the first worker is generation 1.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    pub fn heartbeat_interval(&self) -> Duration {
        self.config.heartbeat_interval
    }

    fn set_state(&self, state: WorkerState) {
        self.state.send_replace(state);
    }

    /// Bring up the first worker. One retry after the initial backoff, then
    /// the failure is returned.
    pub async fn start(&mut self) -> Result<(), BrokerError> {
        if let Err(first) = self.launch().await {
            let delay = self.policy.delay(0);
            warn!(error = %first, ?delay, "Worker failed to start, retrying once");
            tokio::time::sleep(delay).await;
            if let Err(second) = self.launch().await {
                error!(error = %second, "Worker failed to start");
                self.set_state(WorkerState::Stopped);
                return Err(second);
            }
        }
        Ok(())
    }

    async fn launch(&mut self) -> Result<(), BrokerError> {
        self.set_state(WorkerState::Starting);
        self.generation += 1;
        let generation = self.generation;

        let link = self
            .spawner
            .spawn()
            .await
            .map_err(|e| BrokerError::StartupFailed(format!("spawn failed: {}", e)))?;
        let mut channel = WorkerChannel::new(link.reader, link.writer, self.config.max_frame_len);
        let mut control = link.control;

        let ready = tokio::select! {
            ready = tokio::time::timeout(self.config.startup_timeout, channel.await_ready()) => {
                match ready {
                    Ok(Ok(ready)) => Ok(ready),
                    Ok(Err(e)) => Err(BrokerError::StartupFailed(e.to_string())),
                    Err(_) => Err(BrokerError::StartupTimeout(self.config.startup_timeout)),
                }
            }
            exit = control.wait() => Err(BrokerError::StartupFailed(format!("worker {} before ready", exit))),
        };

        match ready {
            Ok((reported_pid, driver)) => {
                let pid = control.pid().or(Some(reported_pid));
                info!(generation, ?pid, driver = %driver, "Worker ready");
                self.current = Some(WorkerProcess {
                    generation,
                    pid,
                    started_at: Utc::now(),
                    channel,
                    control,
                });
                self.set_state(WorkerState::Ready);
                Ok(())
            }
            Err(e) => {
                control.kill().await;
                self.set_state(WorkerState::Crashed);
                Err(e)
            }
        }
    }

    /// Run one request against the ready worker.
    ///
    /// Worker faults (crash, desync, deadline) discard the worker before
    /// returning; the caller is expected to [`recover`](Self::recover) before
    /// the next request. A driver-level `Failed` reply is returned as an
    /// event and leaves the worker in place.
    ///
    /// Scan output is passed to `progress` as it arrives. If that receiver
    /// goes away the scan still runs to its final reply so the channel stays
    /// in step.
    pub async fn execute(
        &mut self,
        command: WorkerCommand,
        deadline: Duration,
        progress: Option<&mpsc::Sender<ScanProgress>>,
    ) -> Result<WorkerEvent, BrokerError> {
        self.set_state(WorkerState::Busy);
        match self.exchange(command, deadline, progress).await {
            Ok(event) => {
                self.consecutive_failures = 0;
                self.set_state(WorkerState::Ready);
                Ok(event)
            }
            Err(e) => {
                self.discard(&e).await;
                Err(e)
            }
        }
    }

    /// Idle liveness check.
    pub async fn check_liveness(&mut self) -> Result<(), BrokerError> {
        match self
            .exchange(WorkerCommand::Ping, self.config.heartbeat_timeout, None)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                warn!(error = %e, "Worker failed its liveness check");
                self.discard(&e).await;
                Err(e)
            }
        }
    }

    async fn exchange(
        &mut self,
        command: WorkerCommand,
        deadline: Duration,
        progress: Option<&mpsc::Sender<ScanProgress>>,
    ) -> Result<WorkerEvent, BrokerError> {
        let Some(worker) = self.current.as_mut() else {
            return Err(BrokerError::WorkerCrashed("no worker running".to_string()));
        };
        let expected = command.clone();

        let reply = tokio::select! {
            reply = tokio::time::timeout(deadline, converse(&mut worker.channel, command, progress)) => reply,
            exit = worker.control.wait() => {
                return Err(BrokerError::WorkerCrashed(format!("worker {}", exit)));
            }
        };

        match reply {
            Err(_) => Err(BrokerError::OperationTimeout {
                operation: expected.name(),
                timeout: deadline,
            }),
            Ok(Err(e)) if e.is_protocol_error() => Err(BrokerError::ProtocolDesync(e.to_string())),
            Ok(Err(e)) => {
                // Prefer the exit status over "channel closed" when it is at hand.
                let exit = tokio::time::timeout(Duration::from_millis(250), worker.control.wait()).await;
                Err(BrokerError::WorkerCrashed(match exit {
                    Ok(exit) => format!("worker {}", exit),
                    Err(_) => e.to_string(),
                }))
            }
            Ok(Ok(event)) if reply_matches(&expected, &event) => Ok(event),
            Ok(Ok(event)) => Err(BrokerError::ProtocolDesync(format!(
                "'{}' reply to '{}' request",
                event.name(),
                expected.name()
            ))),
        }
    }

    /// Resolve with the fault if the idle worker exits or speaks out of turn.
    ///
    /// Pending forever when there is no worker. Cancel safe.
    pub async fn idle_fault(&mut self) -> BrokerError {
        let Some(worker) = self.current.as_mut() else {
            return std::future::pending().await;
        };
        tokio::select! {
            exit = worker.control.wait() => BrokerError::WorkerCrashed(format!("worker {} while idle", exit)),
            message = worker.channel.recv() => match message {
                Ok(reply) => BrokerError::ProtocolDesync(format!(
                    "unsolicited '{}' from idle worker",
                    reply.event.name()
                )),
                Err(ChannelError::Closed) => {
                    BrokerError::WorkerCrashed("worker closed its channel while idle".to_string())
                }
                Err(e) if e.is_protocol_error() => BrokerError::ProtocolDesync(e.to_string()),
                Err(e) => BrokerError::WorkerCrashed(e.to_string()),
            },
        }
    }

    /// Kill and drop the current worker after a fault.
    pub async fn discard(&mut self, reason: &BrokerError) {
        self.consecutive_failures += 1;
        if let Some(mut worker) = self.current.take() {
            error!(
                generation = worker.generation,
                pid = ?worker.pid,
                uptime_secs = (Utc::now() - worker.started_at).num_seconds(),
                failures = self.consecutive_failures,
                error = %reason,
                "Discarding worker"
            );
            worker.control.kill().await;
        }
        self.set_state(WorkerState::Crashed);
    }

    /// Replace a discarded worker, backing off between attempts.
    ///
    /// Returns `false` when the restart ceiling is hit or `cancel` fires.
    pub async fn recover(&mut self, cancel: &CancellationToken) -> bool {
        while self.current.is_none() {
            if self.is_exhausted() {
                error!(
                    failures = self.consecutive_failures,
                    "Worker restart ceiling reached; waiting for an operator restart"
                );
                self.set_state(WorkerState::Crashed);
                return false;
            }
            let delay = self.policy.delay(self.consecutive_failures.saturating_sub(1));
            info!(?delay, failures = self.consecutive_failures, "Restarting worker");
            tokio::select! {
                _ = cancel.cancelled() => return false,
                _ = tokio::time::sleep(delay) => {}
            }
            if let Err(e) = self.launch().await {
                self.consecutive_failures += 1;
                warn!(error = %e, failures = self.consecutive_failures, "Worker restart failed");
            }
        }
        true
    }

    /// Operator restart: replace whatever is running and clear the failure
    /// count.
    pub async fn restart(&mut self, cancel: &CancellationToken) -> bool {
        info!("Explicit worker restart requested");
        if let Some(mut worker) = self.current.take() {
            worker.control.kill().await;
        }
        self.consecutive_failures = 0;
        match self.launch().await {
            Ok(()) => true,
            Err(e) => {
                self.consecutive_failures = 1;
                warn!(error = %e, "Worker restart failed");
                self.recover(cancel).await
            }
        }
    }

    /// Ask the worker to exit, killing it if it does not within the grace
    /// period.
    pub async fn stop(&mut self) -> StopOutcome {
        let Some(worker) = self.current.take() else {
            self.set_state(WorkerState::Stopped);
            return StopOutcome::NotRunning;
        };
        self.set_state(WorkerState::ShuttingDown);
        let WorkerProcess {
            generation,
            mut channel,
            mut control,
            ..
        } = worker;

        let acknowledged = tokio::time::timeout(self.config.shutdown_grace, async {
            let ack = channel
                .round_trip_after_abandoned(WorkerCommand::Shutdown)
                .await;
            // Closing stdin lets a worker that ignored the request see EOF.
            drop(channel);
            let exit = control.wait().await;
            debug!(generation, %exit, "Worker exited");
            matches!(ack, Ok(WorkerEvent::ShuttingDown))
        })
        .await;

        let outcome = match acknowledged {
            Ok(true) => StopOutcome::Graceful,
            Ok(false) | Err(_) => {
                warn!(generation, "Worker did not shut down cleanly, killing it");
                control.kill().await;
                StopOutcome::Forced
            }
        };
        info!(generation, ?outcome, "Worker stopped");
        self.set_state(WorkerState::Stopped);
        outcome
    }
}

/// Send `command` and follow its replies to the final one.
///
/// Only a scan may report progress, and only as `ScanStarted` followed by
/// its pages in order.
async fn converse(
    channel: &mut WorkerChannel,
    command: WorkerCommand,
    progress: Option<&mpsc::Sender<ScanProgress>>,
) -> Result<WorkerEvent, ChannelError> {
    let is_scan = matches!(command, WorkerCommand::Scan { .. });
    let id = channel.send(command).await?;
    let mut forward = progress;
    let mut started = false;
    let mut pages = 0u32;

    loop {
        let event = channel.recv_for(id).await?;
        let update = match event {
            WorkerEvent::ScanStarted(metadata) if is_scan && !started => {
                started = true;
                ScanProgress::Started(metadata)
            }
            WorkerEvent::Page(page) if started && page.index == pages => {
                pages += 1;
                trace!(request_id = id, page = page.index, "Page from worker");
                ScanProgress::Page(page)
            }
            WorkerEvent::ScanDone(summary) if !started || summary.page_count != pages => {
                return Err(ChannelError::Unexpected("scan_done"));
            }
            event if event.is_progress() => return Err(ChannelError::Unexpected(event.name())),
            event => return Ok(event),
        };
        if let Some(tx) = forward {
            if tx.send(update).await.is_err() {
                debug!(request_id = id, "Scan output no longer wanted, draining");
                forward = None;
            }
        }
    }
}

fn reply_matches(command: &WorkerCommand, event: &WorkerEvent) -> bool {
    matches!(
        (command, event),
        (_, WorkerEvent::Failed { .. })
            | (WorkerCommand::EnumerateDevices, WorkerEvent::Devices(_))
            | (WorkerCommand::Scan { .. }, WorkerEvent::ScanDone(_))
            | (WorkerCommand::Ping, WorkerEvent::Pong)
            | (WorkerCommand::Shutdown, WorkerEvent::ShuttingDown)
    )
}
