//! Request/response transport to one worker process.

use std::cmp::Ordering;

use futures::{SinkExt, StreamExt};
use thiserror::Error;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio_util::codec::{FramedRead, FramedWrite};
use tracing::trace;

use scan_types::worker::UNSOLICITED_ID;
use scan_types::{FrameCodec, FrameError, WorkerCommand, WorkerEvent, WorkerReply, WorkerRequest};

pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;
pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;

type BrokerCodec = FrameCodec<WorkerReply, WorkerRequest>;

#[derive(Error, Debug)]
pub enum ChannelError {
    #[error("worker closed its channel")]
    Closed,
    #[error(transparent)]
    Frame(#[from] FrameError),
    #[error("reply for request {got} while waiting for request {expected}")]
    Desync { expected: u64, got: u64 },
    #[error("unexpected '{0}' message from worker")]
    Unexpected(&'static str),
}

impl ChannelError {
    /// Broken framing or ordering, as opposed to a closed pipe.
    pub fn is_protocol_error(&self) -> bool {
        match self {
            ChannelError::Closed => false,
            ChannelError::Frame(FrameError::Io(_)) => false,
            ChannelError::Frame(_) => true,
            ChannelError::Desync { .. } | ChannelError::Unexpected(_) => true,
        }
    }
}

/// Framed stdin/stdout pair of a worker.
///
/// Only one request is ever outstanding. Every request gets a fresh id and
/// the reply must echo it; anything else is a desync.
pub struct WorkerChannel {
    replies: FramedRead<BoxedReader, BrokerCodec>,
    requests: FramedWrite<BoxedWriter, BrokerCodec>,
    next_id: u64,
}

impl WorkerChannel {
    pub fn new(reader: BoxedReader, writer: BoxedWriter, max_frame_len: usize) -> Self {
        Self {
            replies: FramedRead::new(reader, BrokerCodec::with_max_frame_len(max_frame_len)),
            requests: FramedWrite::new(writer, BrokerCodec::with_max_frame_len(max_frame_len)),
            next_id: UNSOLICITED_ID + 1,
        }
    }

    /// Wait for the worker's opening `Ready`. Returns its pid and driver name.
    pub async fn await_ready(&mut self) -> Result<(u32, String), ChannelError> {
        let reply = self.recv().await?;
        match reply.event {
            WorkerEvent::Ready { pid, driver } if reply.id == UNSOLICITED_ID => Ok((pid, driver)),
            other => Err(ChannelError::Unexpected(other.name())),
        }
    }

    /// Send `command` and wait for its reply.
    ///
    /// Not cancel safe: if the future is dropped after the request went out
    /// the stream is out of step and the worker must be replaced.
    pub async fn round_trip(&mut self, command: WorkerCommand) -> Result<WorkerEvent, ChannelError> {
        let id = self.send(command).await?;
        self.recv_for(id).await
    }

    /// Like [`round_trip`](Self::round_trip), but first skips replies to
    /// earlier requests that were abandoned in flight.
    pub async fn round_trip_after_abandoned(
        &mut self,
        command: WorkerCommand,
    ) -> Result<WorkerEvent, ChannelError> {
        let id = self.send(command).await?;
        loop {
            let reply = self.recv().await?;
            match reply.id.cmp(&id) {
                Ordering::Equal => return Ok(reply.event),
                Ordering::Less => {
                    trace!(request_id = reply.id, event = reply.event.name(), "Skipping stale reply");
                }
                Ordering::Greater => {
                    return Err(ChannelError::Desync {
                        expected: id,
                        got: reply.id,
                    })
                }
            }
        }
    }

    /// Next message, which must belong to request `id`. Cancel safe.
    pub async fn recv_for(&mut self, id: u64) -> Result<WorkerEvent, ChannelError> {
        let reply = self.recv().await?;
        if reply.id != id {
            return Err(ChannelError::Desync {
                expected: id,
                got: reply.id,
            });
        }
        Ok(reply.event)
    }

    /// Write a request without waiting for the reply.
    pub async fn send(&mut self, command: WorkerCommand) -> Result<u64, ChannelError> {
        let id = self.next_id;
        self.next_id += 1;
        trace!(request_id = id, command = command.name(), "Sending to worker");
        self.requests.send(WorkerRequest { id, command }).await?;
        Ok(id)
    }

    /// Next message from the worker. Cancel safe.
    pub async fn recv(&mut self) -> Result<WorkerReply, ChannelError> {
        match self.replies.next().await {
            Some(frame) => Ok(frame?),
            None => Err(ChannelError::Closed),
        }
    }
}
