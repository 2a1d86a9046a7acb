//! Service lifecycle: bring the worker up before accepting connections and
//! tear things down in order on shutdown.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::Serialize;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{error, info, warn};

use crate::bridge::DeviceBridge;
use crate::config::BrokerConfig;
use crate::error::HostError;
use crate::server::{self, ListenerState, Sessions};
use crate::worker::spawner::WorkerSpawner;
use crate::worker::supervisor::{StopOutcome, WorkerSupervisor};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum HostState {
    Unstarted,
    Starting,
    Listening,
    Draining,
    Stopped,
}

/// Process exit codes.
pub mod exit_code {
    pub const CLEAN: u8 = 0;
    /// Bad configuration, bind failure or a worker that never became ready.
    pub const STARTUP_FAILED: u8 = 1;
    /// Shutdown finished, but requests were cut off or the worker was killed.
    pub const FORCED: u8 = 2;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ShutdownReport {
    /// Every in-flight request finished within the drain grace.
    pub drained: bool,
    pub worker: StopOutcome,
    /// Every session flushed its replies and closed within the close grace.
    pub sessions_closed: bool,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.drained && self.sessions_closed && self.worker != StopOutcome::Forced
    }

    pub fn exit_code(&self) -> u8 {
        if self.is_clean() {
            exit_code::CLEAN
        } else {
            exit_code::FORCED
        }
    }
}

pub struct ServiceHost {
    config: BrokerConfig,
    spawner: Arc<dyn WorkerSpawner>,
    state: watch::Sender<HostState>,
}

impl ServiceHost {
    pub fn new(config: BrokerConfig, spawner: Arc<dyn WorkerSpawner>) -> Self {
        let (state, _) = watch::channel(HostState::Unstarted);
        Self {
            config,
            spawner,
            state,
        }
    }

    pub fn state(&self) -> watch::Receiver<HostState> {
        self.state.subscribe()
    }

    /// Start the worker, then bind the listener.
    ///
    /// Nothing is listening until the worker has reported ready. Any failure
    /// here is fatal for the service.
    pub async fn start(self) -> Result<RunningService, HostError> {
        let ServiceHost {
            config,
            spawner,
            state,
        } = self;
        config.validate()?;
        state.send_replace(HostState::Starting);

        let mut supervisor =
            WorkerSupervisor::new(spawner, config.worker.clone(), config.restart.clone());
        if let Err(e) = supervisor.start().await {
            state.send_replace(HostState::Stopped);
            return Err(HostError::Worker(e));
        }

        let addr = config.service.socket_addr();
        let bound = match TcpListener::bind(addr).await {
            Ok(listener) => listener.local_addr().map(|local| (listener, local)),
            Err(e) => Err(e),
        };
        let (listener, local_addr) = match bound {
            Ok(bound) => bound,
            Err(source) => {
                error!(%addr, error = %source, "Failed to bind listener");
                supervisor.stop().await;
                state.send_replace(HostState::Stopped);
                return Err(HostError::Bind { addr, source });
            }
        };

        let dispatch_stop = CancellationToken::new();
        let (bridge, dispatcher) =
            DeviceBridge::start(supervisor, config.bridge.clone(), dispatch_stop.clone());

        let sessions: Sessions = Arc::new(DashMap::new());
        let close_sessions = CancellationToken::new();
        let session_tasks = TaskTracker::new();
        let stop_accepting = CancellationToken::new();
        let listener_state = ListenerState {
            bridge: bridge.clone(),
            sessions: sessions.clone(),
            session_config: config.session.clone(),
            close_sessions: close_sessions.clone(),
            session_tasks: session_tasks.clone(),
        };
        let server = tokio::spawn(server::run(listener, listener_state, stop_accepting.clone()));

        state.send_replace(HostState::Listening);
        info!(%local_addr, "Scan broker listening");

        Ok(RunningService {
            local_addr,
            bridge,
            sessions,
            state,
            drain_grace: config.service.drain_grace,
            close_grace: config.session.close_grace,
            stop_accepting,
            dispatch_stop,
            close_sessions,
            session_tasks,
            server,
            dispatcher,
        })
    }
}

/// A started service. Dropping it without [`shutdown`](Self::shutdown)
/// leaves the tasks running.
pub struct RunningService {
    local_addr: SocketAddr,
    bridge: DeviceBridge,
    sessions: Sessions,
    state: watch::Sender<HostState>,
    drain_grace: Duration,
    close_grace: Duration,
    stop_accepting: CancellationToken,
    dispatch_stop: CancellationToken,
    close_sessions: CancellationToken,
    session_tasks: TaskTracker,
    server: JoinHandle<std::io::Result<()>>,
    dispatcher: JoinHandle<StopOutcome>,
}

impl RunningService {
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    pub fn bridge(&self) -> &DeviceBridge {
        &self.bridge
    }

    pub fn state(&self) -> watch::Receiver<HostState> {
        self.state.subscribe()
    }

    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Stop accepting, drain, stop the worker, close sessions and wait for
    /// them to finish.
    pub async fn shutdown(self) -> ShutdownReport {
        self.state.send_replace(HostState::Draining);
        info!(grace = ?self.drain_grace, sessions = self.sessions.len(), "Draining");

        self.stop_accepting.cancel();
        self.bridge.close();
        let drained = self.bridge.drain(self.drain_grace).await;

        self.dispatch_stop.cancel();
        let worker = match self.dispatcher.await {
            Ok(outcome) => outcome,
            Err(e) => {
                error!(error = %e, "Dispatch loop ended abnormally");
                StopOutcome::Forced
            }
        };

        self.close_sessions.cancel();
        match self.server.await {
            Ok(Ok(())) => {}
            Ok(Err(e)) => warn!(error = %e, "Listener ended with an error"),
            Err(e) => warn!(error = %e, "Listener task failed"),
        }

        // The listener is gone, so no session can be added after this.
        self.session_tasks.close();
        let sessions_closed = tokio::time::timeout(self.close_grace, self.session_tasks.wait())
            .await
            .is_ok();
        if !sessions_closed {
            warn!(
                grace = ?self.close_grace,
                remaining = self.session_tasks.len(),
                "Sessions still open after close grace"
            );
        }

        let report = ShutdownReport {
            drained,
            worker,
            sessions_closed,
        };
        self.state.send_replace(HostState::Stopped);
        info!(?report, "Scan broker stopped");
        report
    }
}
