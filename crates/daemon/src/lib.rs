//! Remote scan broker.
//!
//! Clients connect over a WebSocket and ask for device enumeration or scans.
//! The scanning driver is not safe to share, so every operation is funnelled,
//! one at a time, through a single supervised worker process.

pub mod bridge;
pub mod cli;
pub mod config;
pub mod error;
pub mod host;
pub mod server;
pub mod worker;

pub use bridge::{BridgeStats, DeviceBridge, Operation, OperationOutput, PendingHandle};
pub use config::BrokerConfig;
pub use error::{BrokerError, HostError};
pub use host::{HostState, RunningService, ServiceHost, ShutdownReport};
pub use worker::{LocalSpawner, ProcessSpawner, StopOutcome, WorkerSpawner, WorkerState};

// Test modules
#[cfg(test)]
mod bridge_test;
