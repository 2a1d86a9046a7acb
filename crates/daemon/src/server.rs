//! RPC listener: the `/scan` WebSocket endpoint.
//!
//! A connection must open with `hello` naming [`CONTRACT`]. After that the
//! client may issue any number of `enumerate_devices` and `scan` calls; each
//! is submitted to the bridge the moment it is read, so calls from every
//! connection share one FIFO queue. Replies carry the call id.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket},
        ConnectInfo, State, WebSocketUpgrade,
    },
    response::IntoResponse,
    routing::get,
    Router,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use futures::{stream::SplitStream, SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use uuid::Uuid;

use scan_types::rpc::{ClientCall, PageFrame, ServerMessage, CONTRACT};
use scan_types::{ErrorKind, ScanError};

use crate::bridge::{DeviceBridge, Operation, OperationOutput, PendingHandle, ScanProgress};
use crate::config::SessionConfig;
use crate::error::BrokerError;

const OUTGOING_BUFFER: usize = 64;

/// A connected client.
#[derive(Debug, Clone)]
pub struct SessionInfo {
    pub peer: SocketAddr,
    pub connected_at: DateTime<Utc>,
    pub idle_timeout: Duration,
    pub send_timeout: Duration,
}

pub type Sessions = Arc<DashMap<Uuid, SessionInfo>>;

#[derive(Clone)]
pub struct ListenerState {
    pub bridge: DeviceBridge,
    pub sessions: Sessions,
    pub session_config: SessionConfig,
    /// Closes every open session.
    pub close_sessions: CancellationToken,
    /// Upgraded connections, so shutdown can wait for their last replies.
    pub session_tasks: TaskTracker,
}

pub fn router(state: ListenerState) -> Router {
    Router::new()
        .route("/scan", get(scan_socket))
        .with_state(state)
        .layer(TraceLayer::new_for_http())
}

/// Serve connections until `stop_accepting` fires.
pub async fn run(
    listener: TcpListener,
    state: ListenerState,
    stop_accepting: CancellationToken,
) -> std::io::Result<()> {
    let app = router(state);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(async move { stop_accepting.cancelled().await })
    .await
}

async fn scan_socket(
    ws: WebSocketUpgrade,
    ConnectInfo(peer): ConnectInfo<SocketAddr>,
    State(state): State<ListenerState>,
) -> impl IntoResponse {
    let tasks = state.session_tasks.clone();
    ws.on_upgrade(move |socket| tasks.track_future(run_session(socket, peer, state)))
}

fn encode(message: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(text) => Some(Message::Text(text)),
        Err(e) => {
            warn!(error = %e, "Failed to serialize server message");
            None
        }
    }
}

fn error_message(id: Option<u64>, err: &BrokerError) -> Option<Message> {
    encode(&ServerMessage::error(id, &ScanError::from(err)))
}

/// Lower the server's timeout to the client's request, never raise it.
fn negotiate(server: Duration, requested_secs: Option<u64>) -> Duration {
    match requested_secs {
        Some(secs) if secs > 0 => server.min(Duration::from_secs(secs)),
        _ => server,
    }
}

async fn run_session(socket: WebSocket, peer: SocketAddr, state: ListenerState) {
    let session_id = Uuid::new_v4();
    let (mut sink, mut stream) = socket.split();
    info!(session_id = %session_id, %peer, "Client connected");

    let (idle_timeout, send_timeout) = match await_hello(&mut stream, &state.session_config).await {
        Ok(timeouts) => timeouts,
        Err(err) => {
            warn!(session_id = %session_id, error = %err, "Rejecting connection");
            if let Some(message) = error_message(None, &err) {
                let _ = sink.send(message).await;
            }
            let _ = sink.send(Message::Close(None)).await;
            return;
        }
    };

    let welcome = ServerMessage::Welcome {
        contract: CONTRACT.to_string(),
        server_version: env!("CARGO_PKG_VERSION").to_string(),
        session_id: session_id.to_string(),
        idle_timeout_secs: idle_timeout.as_secs(),
        send_timeout_secs: send_timeout.as_secs(),
    };
    let Some(welcome) = encode(&welcome) else {
        return;
    };
    if sink.send(welcome).await.is_err() {
        return;
    }
    state.sessions.insert(
        session_id,
        SessionInfo {
            peer,
            connected_at: Utc::now(),
            idle_timeout,
            send_timeout,
        },
    );

    // All outgoing frames go through one writer so concurrent calls never
    // interleave inside a message.
    let (tx, mut rx) = mpsc::channel::<Message>(OUTGOING_BUFFER);
    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            match tokio::time::timeout(send_timeout, sink.send(message)).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    debug!(session_id = %session_id, error = %e, "Send failed");
                    break;
                }
                Err(_) => {
                    warn!(session_id = %session_id, ?send_timeout, "Send timed out");
                    break;
                }
            }
        }
        let _ = sink.close().await;
    });

    let mut calls = JoinSet::new();
    let closed_by_server = loop {
        tokio::select! {
            _ = state.close_sessions.cancelled() => break true,
            Some(_) = calls.join_next(), if !calls.is_empty() => {}
            next = tokio::time::timeout(idle_timeout, stream.next()) => match next {
                Err(_) if !calls.is_empty() => {
                    debug!(session_id = %session_id, outstanding = calls.len(), "Idle period elapsed during calls");
                }
                Err(_) => {
                    info!(session_id = %session_id, ?idle_timeout, "Session idle, closing");
                    break false;
                }
                Ok(None) | Ok(Some(Err(_))) | Ok(Some(Ok(Message::Close(_)))) => break false,
                Ok(Some(Ok(Message::Text(text)))) => {
                    if let Some(reply) = dispatch_call(&text, &state.bridge, &tx, &mut calls) {
                        if tx.send(reply).await.is_err() {
                            break false;
                        }
                    }
                }
                Ok(Some(Ok(_))) => {}
            },
        }
    };

    if closed_by_server {
        // Everything still pending settles once the dispatch loop has stopped.
        while calls.join_next().await.is_some() {}
    } else {
        // Queued calls are withdrawn; one already in service runs to the end.
        calls.shutdown().await;
    }
    drop(tx);
    let _ = writer.await;
    state.sessions.remove(&session_id);
    info!(session_id = %session_id, "Client disconnected");
}

async fn await_hello(
    stream: &mut SplitStream<WebSocket>,
    config: &SessionConfig,
) -> Result<(Duration, Duration), BrokerError> {
    let first = tokio::time::timeout(config.idle_timeout, stream.next())
        .await
        .map_err(|_| BrokerError::InvalidRequest("no hello received".to_string()))?;
    let text = match first {
        Some(Ok(Message::Text(text))) => text,
        _ => {
            return Err(BrokerError::InvalidRequest(
                "expected a hello text message".to_string(),
            ))
        }
    };
    match serde_json::from_str::<ClientCall>(&text) {
        Ok(ClientCall::Hello {
            contract,
            idle_timeout_secs,
            send_timeout_secs,
        }) => {
            if contract != CONTRACT {
                return Err(BrokerError::InvalidRequest(format!(
                    "unsupported contract '{}', expected '{}'",
                    contract, CONTRACT
                )));
            }
            Ok((
                negotiate(config.idle_timeout, idle_timeout_secs),
                negotiate(config.send_timeout, send_timeout_secs),
            ))
        }
        Ok(_) => Err(BrokerError::InvalidRequest(
            "first message must be hello".to_string(),
        )),
        Err(e) => Err(BrokerError::InvalidRequest(format!("malformed hello: {}", e))),
    }
}

/// Submit one call. Returns an immediate reply when the call is refused.
fn dispatch_call(
    text: &str,
    bridge: &DeviceBridge,
    tx: &mpsc::Sender<Message>,
    calls: &mut JoinSet<()>,
) -> Option<Message> {
    let call = match serde_json::from_str::<ClientCall>(text) {
        Ok(call) => call,
        Err(e) => {
            return encode(&ServerMessage::Error {
                id: None,
                kind: ErrorKind::InvalidRequest,
                message: format!("malformed call: {}", e),
            });
        }
    };

    let (id, operation) = match call {
        ClientCall::Hello { .. } => {
            return error_message(
                None,
                &BrokerError::InvalidRequest("hello already received".to_string()),
            );
        }
        ClientCall::EnumerateDevices { id } => (id, Operation::EnumerateDevices),
        ClientCall::Scan {
            id,
            device_id,
            options,
        } => (id, Operation::Scan { device_id, options }),
    };

    debug!(call_id = id, operation = operation.name(), "Call received");
    let is_scan = matches!(operation, Operation::Scan { .. });
    let handle = match bridge.submit(operation) {
        Ok(handle) => handle,
        Err(e) => return error_message(Some(id), &e),
    };
    if is_scan {
        calls.spawn(deliver_scan(id, handle, tx.clone()));
    } else {
        calls.spawn(deliver_devices(id, handle, tx.clone()));
    }
    None
}

async fn deliver_devices(id: u64, handle: PendingHandle, tx: mpsc::Sender<Message>) {
    let reply = match handle.devices().await {
        Ok(devices) => encode(&ServerMessage::Devices { id, devices }),
        Err(e) => error_message(Some(id), &e),
    };
    send(id, reply, &tx).await;
}

/// `scan_started`, then one binary frame per page as the worker produces it,
/// then `scan_complete`. A scan that fails part way ends with an error
/// after the pages already sent.
async fn deliver_scan(id: u64, mut handle: PendingHandle, tx: mpsc::Sender<Message>) {
    while let Some(update) = handle.next_progress().await {
        let message = match update {
            ScanProgress::Started(metadata) => encode(&ServerMessage::ScanStarted { id, metadata }),
            ScanProgress::Page(page) => Some(Message::Binary(PageFrame::encode(
                id,
                page.index,
                &page.data,
            ))),
        };
        if !send(id, message, &tx).await {
            return;
        }
    }
    let reply = match handle.outcome().await {
        Ok(OperationOutput::ScanComplete(summary)) => encode(&ServerMessage::ScanComplete {
            id,
            page_count: summary.page_count,
            total_bytes: summary.total_bytes,
        }),
        Ok(OperationOutput::Devices(_)) => error_message(
            Some(id),
            &BrokerError::ProtocolDesync("device list for a scan".to_string()),
        ),
        Err(e) => error_message(Some(id), &e),
    };
    send(id, reply, &tx).await;
}

/// Queue `message` for the writer. `false` once the session is gone.
async fn send(id: u64, message: Option<Message>, tx: &mpsc::Sender<Message>) -> bool {
    let Some(message) = message else {
        return true;
    };
    if tx.send(message).await.is_err() {
        debug!(call_id = id, "Session closed before reply was sent");
        return false;
    }
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_may_only_lower_timeouts() {
        let server = Duration::from_secs(3600);
        assert_eq!(negotiate(server, None), server);
        assert_eq!(negotiate(server, Some(0)), server);
        assert_eq!(negotiate(server, Some(30)), Duration::from_secs(30));
        assert_eq!(negotiate(server, Some(7200)), server);
    }

    #[test]
    fn test_errors_encode_kind_and_call_id() {
        let message = error_message(Some(9), &BrokerError::Overloaded { depth: 32 }).unwrap();
        let Message::Text(text) = message else {
            panic!("expected a text message");
        };
        let parsed: ServerMessage = serde_json::from_str(&text).unwrap();
        assert_eq!(
            parsed,
            ServerMessage::Error {
                id: Some(9),
                kind: ErrorKind::Overloaded,
                message: "request queue is full (32 requests waiting)".to_string(),
            }
        );
    }
}
