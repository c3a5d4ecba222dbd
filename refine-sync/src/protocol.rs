//! Binary wire protocol between providers and the relay.
//!
//! One bincode-encoded [`WireMessage`] per binary WebSocket frame:
//! ```text
//! ┌─────────┬──────────────────────────────────────────────┐
//! │ variant │ fields                                       │
//! ├─────────┼──────────────────────────────────────────────┤
//! │ Ping    │ (none)                                       │
//! │ Pong    │ (none)                                       │
//! │ Diff    │ guid: String, payload: Option<Vec<u8>>       │
//! │ Update  │ guid: String, update: Vec<u8>                │
//! └─────────┴──────────────────────────────────────────────┘
//! ```
//!
//! `Diff` without payload is a pull: the relay answers with a `Diff`
//! carrying its stored state for the guid. With payload it is a pull and a
//! push at once. `Update` is only ever a live edit, never a reply, so a
//! client can tell state it asked for from broadcasts.

use serde::{Deserialize, Serialize};

use crate::error::{SyncError, SyncResult};

/// Message kind, for logging and stats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
pub enum MessageType {
    Ping = 1,
    Pong = 2,
    Diff = 3,
    Update = 4,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum WireMessage {
    Ping,
    Pong,
    Diff {
        guid: String,
        payload: Option<Vec<u8>>,
    },
    Update {
        guid: String,
        update: Vec<u8>,
    },
}

impl WireMessage {
    pub fn diff(guid: impl Into<String>, payload: Option<Vec<u8>>) -> Self {
        Self::Diff {
            guid: guid.into(),
            payload,
        }
    }

    pub fn update(guid: impl Into<String>, update: Vec<u8>) -> Self {
        Self::Update {
            guid: guid.into(),
            update,
        }
    }

    pub fn message_type(&self) -> MessageType {
        match self {
            Self::Ping => MessageType::Ping,
            Self::Pong => MessageType::Pong,
            Self::Diff { .. } => MessageType::Diff,
            Self::Update { .. } => MessageType::Update,
        }
    }

    /// Document the message is about, if any.
    pub fn guid(&self) -> Option<&str> {
        match self {
            Self::Diff { guid, .. } | Self::Update { guid, .. } => Some(guid),
            Self::Ping | Self::Pong => None,
        }
    }

    /// Serialize to binary wire format.
    pub fn encode(&self) -> SyncResult<Vec<u8>> {
        bincode::serde::encode_to_vec(self, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(format!("encode: {e}")))
    }

    /// Deserialize from binary wire format. Trailing bytes are rejected.
    pub fn decode(bytes: &[u8]) -> SyncResult<Self> {
        let (msg, read) = bincode::serde::decode_from_slice(bytes, bincode::config::standard())
            .map_err(|e| SyncError::Protocol(format!("decode: {e}")))?;
        if read != bytes.len() {
            return Err(SyncError::Protocol(format!(
                "{} trailing bytes after message",
                bytes.len() - read
            )));
        }
        Ok(msg)
    }
}
