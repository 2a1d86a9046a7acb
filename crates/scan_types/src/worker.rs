//! Messages exchanged between the broker and its worker process.
//!
//! The broker writes [`WorkerRequest`]s to the worker's stdin and reads
//! [`WorkerReply`]s from its stdout, one frame per message (see
//! [`crate::codec`]). Exactly one request is outstanding at a time; every
//! reply echoes the request id so that a desynchronised stream is detected
//! instead of being misattributed.
//!
//! A scan is answered by several replies: `ScanStarted`, one `Page` per page,
//! then `ScanDone` or `Failed`. Each page is its own frame, so a job may be
//! far larger than the frame limit.

use serde::{Deserialize, Serialize};

use crate::data::{DeviceDescriptor, PageImage, ScanMetadata, ScanOptions, ScanSummary};

/// Id carried by messages the worker sends on its own initiative.
pub const UNSOLICITED_ID: u64 = 0;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerRequest {
    pub id: u64,
    pub command: WorkerCommand,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerCommand {
    EnumerateDevices,
    Scan {
        device_id: String,
        options: ScanOptions,
    },
    /// Liveness check, answered with [`WorkerEvent::Pong`].
    Ping,
    /// Ask the worker to release the driver and exit.
    Shutdown,
}

impl WorkerCommand {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerCommand::EnumerateDevices => "enumerate_devices",
            WorkerCommand::Scan { .. } => "scan",
            WorkerCommand::Ping => "ping",
            WorkerCommand::Shutdown => "shutdown",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerReply {
    /// Id of the request this answers, or [`UNSOLICITED_ID`].
    pub id: u64,
    pub event: WorkerEvent,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WorkerEvent {
    /// First message of every worker: the driver is open and requests may flow.
    Ready { pid: u32, driver: String },
    Devices(Vec<DeviceDescriptor>),
    /// Opens the reply stream of a scan.
    ScanStarted(ScanMetadata),
    Page(PageImage),
    /// Closes the reply stream of a scan.
    ScanDone(ScanSummary),
    Pong,
    /// Acknowledges [`WorkerCommand::Shutdown`]; the worker exits next.
    ShuttingDown,
    /// The driver rejected the request. The worker stays usable.
    Failed { message: String },
}

impl WorkerEvent {
    pub fn name(&self) -> &'static str {
        match self {
            WorkerEvent::Ready { .. } => "ready",
            WorkerEvent::Devices(_) => "devices",
            WorkerEvent::ScanStarted(_) => "scan_started",
            WorkerEvent::Page(_) => "page",
            WorkerEvent::ScanDone(_) => "scan_done",
            WorkerEvent::Pong => "pong",
            WorkerEvent::ShuttingDown => "shutting_down",
            WorkerEvent::Failed { .. } => "failed",
        }
    }

    /// More replies to the same request follow this one.
    pub fn is_progress(&self) -> bool {
        matches!(self, WorkerEvent::ScanStarted(_) | WorkerEvent::Page(_))
    }
}
