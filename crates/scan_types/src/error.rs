//! Client-visible error taxonomy.

use serde::{Deserialize, Serialize};
use std::fmt;

/// The kind of failure reported to a remote caller.
///
/// Every failed call carries exactly one kind plus a human-readable message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ErrorKind {
    /// The worker did not report readiness in time.
    WorkerStartupTimeout,
    /// The worker exited while serving the request.
    WorkerCrashed,
    /// The worker exhausted its restart attempts and awaits an operator restart.
    WorkerUnavailable,
    /// The worker answered out of turn or sent an unreadable frame.
    ProtocolDesync,
    /// The worker did not answer before the request deadline.
    OperationTimeout,
    /// The request queue is full.
    Overloaded,
    /// The service is draining and accepts no further work.
    ServiceShuttingDown,
    /// The driver reported an error for this request.
    DeviceFailure,
    /// The call could not be understood.
    InvalidRequest,
}

impl ErrorKind {
    pub fn as_str(self) -> &'static str {
        match self {
            ErrorKind::WorkerStartupTimeout => "WorkerStartupTimeout",
            ErrorKind::WorkerCrashed => "WorkerCrashed",
            ErrorKind::WorkerUnavailable => "WorkerUnavailable",
            ErrorKind::ProtocolDesync => "ProtocolDesync",
            ErrorKind::OperationTimeout => "OperationTimeout",
            ErrorKind::Overloaded => "Overloaded",
            ErrorKind::ServiceShuttingDown => "ServiceShuttingDown",
            ErrorKind::DeviceFailure => "DeviceFailure",
            ErrorKind::InvalidRequest => "InvalidRequest",
        }
    }
}

impl fmt::Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A failure as seen by a remote client.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[error("{kind}: {message}")]
pub struct ScanError {
    pub kind: ErrorKind,
    pub message: String,
}

impl ScanError {
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}
