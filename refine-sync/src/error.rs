//! Error taxonomy for the sync engine.
//!
//! Transport and storage failures are reported through [`SyncError`] and
//! mirrored into the provider's [`Status`](crate::status::Status). Contract
//! violations (double setup, unknown guid) are returned as their own
//! variants so callers can tell an internal bug from an external failure.

use std::collections::HashMap;

use yrs::block::ClientID;

/// Result alias used across the crate.
pub type SyncResult<T> = Result<T, SyncError>;

#[derive(Debug, thiserror::Error)]
pub enum SyncError {
    /// Payload claimed to be a CRDT update but does not decode.
    #[error("malformed update: {0}")]
    MalformedUpdate(String),

    /// Applying the update would leave a hole in a client's history.
    #[error("causal gap in {guid}: missing clocks {missing:?}")]
    CausalGap {
        guid: String,
        missing: HashMap<ClientID, u32>,
    },

    /// Storage read or write failed.
    #[error("storage I/O error: {0}")]
    StorageIo(String),

    /// No live document is registered under this guid.
    #[error("document not found: {0}")]
    DocumentNotFound(String),

    /// An operation referenced a guid that was never set up.
    #[error("document not set up: {0}")]
    DocumentNotSetup(String),

    /// The same guid was set up twice.
    #[error("document already set up: {0}")]
    DocumentAlreadySetup(String),

    /// Wire frame could not be encoded or decoded.
    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("connection closed")]
    ConnectionClosed,

    #[error("request timed out")]
    Timeout,

    /// Registering a document observer failed.
    #[error("observer registration failed: {0}")]
    Observer(String),
}

impl SyncError {
    /// Whether this error originates outside the process (network, disk).
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            SyncError::StorageIo(_)
                | SyncError::ConnectionClosed
                | SyncError::Timeout
                | SyncError::Protocol(_)
        )
    }
}

impl From<std::io::Error> for SyncError {
    fn from(e: std::io::Error) -> Self {
        SyncError::StorageIo(e.to_string())
    }
}

impl From<rocksdb::Error> for SyncError {
    fn from(e: rocksdb::Error) -> Self {
        SyncError::StorageIo(e.to_string())
    }
}

impl From<rusqlite::Error> for SyncError {
    fn from(e: rusqlite::Error) -> Self {
        SyncError::StorageIo(e.to_string())
    }
}

impl From<tokio_tungstenite::tungstenite::Error> for SyncError {
    fn from(e: tokio_tungstenite::tungstenite::Error) -> Self {
        SyncError::Protocol(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = SyncError::MalformedUpdate("unexpected end of buffer".into());
        assert_eq!(err.to_string(), "malformed update: unexpected end of buffer");

        let err = SyncError::DocumentAlreadySetup("page-1".into());
        assert_eq!(err.to_string(), "document already set up: page-1");
    }

    #[test]
    fn test_external_classification() {
        assert!(SyncError::Timeout.is_external());
        assert!(SyncError::StorageIo("disk full".into()).is_external());
        assert!(!SyncError::DocumentNotSetup("x".into()).is_external());
        assert!(!SyncError::MalformedUpdate("x".into()).is_external());
    }

    #[test]
    fn test_io_error_conversion() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing");
        let err: SyncError = io.into();
        assert!(matches!(err, SyncError::StorageIo(_)));
    }
}
