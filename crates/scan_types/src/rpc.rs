//! Client RPC messages carried over the broker's WebSocket endpoint.
//!
//! Calls and replies are JSON text messages. Page data travels as binary
//! messages laid out as described on [`PageFrame`].

use serde::{Deserialize, Serialize};

use crate::data::{DeviceDescriptor, ScanMetadata, ScanOptions};
use crate::error::{ErrorKind, ScanError};

/// Capability contract spoken by this broker. Clients name it in `hello`.
pub const CONTRACT: &str = "scan-broker/1";

/// A message sent by a client.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "method", rename_all = "snake_case")]
pub enum ClientCall {
    /// Must be the first message of a connection.
    Hello {
        contract: String,
        /// Requested idle timeout; the server may only lower its own default.
        #[serde(default)]
        idle_timeout_secs: Option<u64>,
        /// Requested per-message send timeout.
        #[serde(default)]
        send_timeout_secs: Option<u64>,
    },
    EnumerateDevices {
        id: u64,
    },
    Scan {
        id: u64,
        device_id: String,
        #[serde(default)]
        options: ScanOptions,
    },
}

/// A message sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    Welcome {
        contract: String,
        server_version: String,
        session_id: String,
        idle_timeout_secs: u64,
        send_timeout_secs: u64,
    },
    Devices {
        id: u64,
        devices: Vec<DeviceDescriptor>,
    },
    /// Precedes the binary page frames of a scan. Pages are sent as the
    /// device produces them.
    ScanStarted {
        id: u64,
        metadata: ScanMetadata,
    },
    ScanComplete {
        id: u64,
        page_count: u32,
        total_bytes: u64,
    },
    /// Ends a call. For a scan it may follow pages already sent.
    Error {
        /// `None` when the failure is not tied to a call, e.g. a bad hello.
        id: Option<u64>,
        kind: ErrorKind,
        message: String,
    },
}

impl ServerMessage {
    pub fn error(id: Option<u64>, err: &ScanError) -> Self {
        ServerMessage::Error {
            id,
            kind: err.kind,
            message: err.message.clone(),
        }
    }
}

/// One page of a streamed scan.
///
/// # Binary Format Layout:
///
/// | Part       | Type  | Size (bytes) | Description                        |
/// |------------|-------|--------------|------------------------------------|
/// | Call id    | `u64` | 8            | Id of the `scan` call (LE).        |
/// | Page index | `u32` | 4            | Zero-based page number (LE).       |
/// | Image data | `u8[]`| remainder    | The page bytes, unaltered.         |
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PageFrame {
    pub call_id: u64,
    pub page_index: u32,
    pub data: Vec<u8>,
}

impl PageFrame {
    pub const HEADER_LEN: usize = 12;

    pub fn encode(call_id: u64, page_index: u32, data: &[u8]) -> Vec<u8> {
        let mut buffer = Vec::with_capacity(Self::HEADER_LEN + data.len());
        buffer.extend_from_slice(&call_id.to_le_bytes());
        buffer.extend_from_slice(&page_index.to_le_bytes());
        buffer.extend_from_slice(data);
        buffer
    }

    pub fn decode(bytes: &[u8]) -> Option<Self> {
        if bytes.len() < Self::HEADER_LEN {
            return None;
        }
        let (call_id, rest) = bytes.split_at(8);
        let (page_index, data) = rest.split_at(4);
        Some(Self {
            call_id: u64::from_le_bytes(call_id.try_into().ok()?),
            page_index: u32::from_le_bytes(page_index.try_into().ok()?),
            data: data.to_vec(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::data::{ColorMode, PaperSource};
    use serde_json::json;

    #[test]
    fn scan_call_parses_with_default_options() {
        let call: ClientCall = serde_json::from_value(json!({
            "method": "scan",
            "id": 4,
            "device_id": "mock-flatbed"
        }))
        .unwrap();
        assert_eq!(
            call,
            ClientCall::Scan {
                id: 4,
                device_id: "mock-flatbed".into(),
                options: ScanOptions::default(),
            }
        );
    }

    #[test]
    fn scan_call_parses_partial_options() {
        let call: ClientCall = serde_json::from_value(json!({
            "method": "scan",
            "id": 5,
            "device_id": "mock-feeder",
            "options": { "dpi": 150, "source": "feeder", "color_mode": "grayscale" }
        }))
        .unwrap();
        let ClientCall::Scan { options, .. } = call else {
            panic!("expected a scan call");
        };
        assert_eq!(options.dpi, 150);
        assert_eq!(options.source, PaperSource::Feeder);
        assert_eq!(options.color_mode, ColorMode::Grayscale);
        assert_eq!(options.max_pages, None);
    }

    #[test]
    fn error_message_is_tagged() {
        let msg = ServerMessage::error(
            Some(9),
            &ScanError::new(ErrorKind::Overloaded, "queue is full"),
        );
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "error");
        assert_eq!(value["kind"], "Overloaded");
        assert_eq!(value["id"], 9);
    }

    #[test]
    fn page_frame_layout() {
        let bytes = PageFrame::encode(0x0102, 3, &[9, 8, 7]);
        assert_eq!(bytes.len(), PageFrame::HEADER_LEN + 3);
        assert_eq!(&bytes[..8], &0x0102u64.to_le_bytes());
        assert_eq!(&bytes[8..12], &3u32.to_le_bytes());

        let frame = PageFrame::decode(&bytes).unwrap();
        assert_eq!(frame.call_id, 0x0102);
        assert_eq!(frame.page_index, 3);
        assert_eq!(frame.data, vec![9, 8, 7]);
        assert!(PageFrame::decode(&bytes[..5]).is_none());
    }
}
