//! Shared types for the scan broker system
//!
//! This crate contains the types exchanged between the broker daemon, its
//! worker process and remote clients: device and scan descriptions, the
//! client-visible error taxonomy, the worker channel protocol and its frame
//! codec, and the client RPC messages.

pub mod codec;
pub mod data;
pub mod error;
pub mod rpc;
pub mod worker;

// Re-export commonly used types
pub use codec::{FrameCodec, FrameError, DEFAULT_MAX_FRAME_LEN};
pub use data::*;
pub use error::{ErrorKind, ScanError};
pub use worker::{WorkerCommand, WorkerEvent, WorkerReply, WorkerRequest};
