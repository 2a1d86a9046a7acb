use std::net::SocketAddr;
use std::time::Duration;

use thiserror::Error;

use scan_types::{ErrorKind, ScanError};

use crate::config::ConfigError;

/// Why a broker operation failed.
///
/// Cloned freely: a single worker crash may fail several requests at once.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BrokerError {
    #[error("worker did not become ready within {0:?}")]
    StartupTimeout(Duration),
    #[error("worker failed to start: {0}")]
    StartupFailed(String),
    #[error("worker crashed: {0}")]
    WorkerCrashed(String),
    #[error("worker unavailable after {failures} consecutive failures; an operator restart is required")]
    WorkerUnavailable { failures: u32 },
    #[error("worker protocol desync: {0}")]
    ProtocolDesync(String),
    #[error("{operation} did not complete within {timeout:?}")]
    OperationTimeout {
        operation: &'static str,
        timeout: Duration,
    },
    #[error("request queue is full ({depth} requests waiting)")]
    Overloaded { depth: usize },
    #[error("service is shutting down")]
    ShuttingDown,
    #[error("{0}")]
    DeviceFailure(String),
    #[error("{0}")]
    InvalidRequest(String),
}

impl BrokerError {
    /// The client-visible kind of this failure.
    pub fn kind(&self) -> ErrorKind {
        match self {
            BrokerError::StartupTimeout(_) | BrokerError::StartupFailed(_) => {
                ErrorKind::WorkerStartupTimeout
            }
            BrokerError::WorkerCrashed(_) => ErrorKind::WorkerCrashed,
            BrokerError::WorkerUnavailable { .. } => ErrorKind::WorkerUnavailable,
            BrokerError::ProtocolDesync(_) => ErrorKind::ProtocolDesync,
            BrokerError::OperationTimeout { .. } => ErrorKind::OperationTimeout,
            BrokerError::Overloaded { .. } => ErrorKind::Overloaded,
            BrokerError::ShuttingDown => ErrorKind::ServiceShuttingDown,
            BrokerError::DeviceFailure(_) => ErrorKind::DeviceFailure,
            BrokerError::InvalidRequest(_) => ErrorKind::InvalidRequest,
        }
    }

    /// Whether this failure means the worker had to be discarded.
    pub fn is_worker_fault(&self) -> bool {
        matches!(
            self,
            BrokerError::WorkerCrashed(_)
                | BrokerError::ProtocolDesync(_)
                | BrokerError::OperationTimeout { .. }
        )
    }
}

impl From<&BrokerError> for ScanError {
    fn from(err: &BrokerError) -> Self {
        ScanError::new(err.kind(), err.to_string())
    }
}

impl From<BrokerError> for ScanError {
    fn from(err: BrokerError) -> Self {
        ScanError::from(&err)
    }
}

/// Fatal errors while bringing the service up.
#[derive(Error, Debug)]
pub enum HostError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("worker never became ready: {0}")]
    Worker(BrokerError),
    #[error("could not bind {addr}: {source}")]
    Bind {
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },
}
