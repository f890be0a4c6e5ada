//! Error taxonomy for the collaboration layer.
//!
//! Failures split into two families:
//! - "the resource cannot be read" (`NotFound`, `Storage`, `SyncConnection`)
//!   always propagate to the caller of `get`/`save`.
//! - "collaboration could not be established" (`Connection`, `SyncTimeout`,
//!   `DuplicateProvider`, ...) degrade to the plain storage path.

use crate::protocol::ProtocolError;

/// Errors produced by the drive, providers and the awareness channel.
///
/// `Clone` so a failure can be published to every waiter of a provider's
/// ready state.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CollabError {
    /// Transport-level failure opening a socket.
    #[error("connection error: {0}")]
    Connection(String),

    /// The initial handshake with the synchronization endpoint failed.
    #[error("sync connection error for {path}: {reason}")]
    SyncConnection { path: String, reason: String },

    /// The initial handshake did not complete in time.
    #[error("sync handshake for {path} timed out after {millis}ms")]
    SyncTimeout { path: String, millis: u64 },

    /// A live provider was already registered for this document identity.
    #[error("duplicate provider for {0}")]
    DuplicateProvider(String),

    /// A factory was already registered for this content type.
    #[error("duplicate factory for content type {0}")]
    DuplicateFactory(String),

    /// Use after `dispose()`.
    #[error("{0} has been disposed")]
    Disposed(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("storage error: {0}")]
    Storage(String),

    #[error("protocol error: {0}")]
    Protocol(String),

    #[error("document error: {0}")]
    Document(String),

    #[error("config error: {0}")]
    Config(String),

    #[error("unknown document format {0:?}")]
    UnknownFormat(String),

    #[error("unknown content type {0:?}")]
    UnknownContentType(String),
}

impl CollabError {
    /// Whether this failure means the resource itself is unreadable, as
    /// opposed to collaboration merely being unavailable.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            CollabError::NotFound(_) | CollabError::Storage(_) | CollabError::SyncConnection { .. }
        )
    }
}

impl From<ProtocolError> for CollabError {
    fn from(e: ProtocolError) -> Self {
        CollabError::Protocol(e.to_string())
    }
}

impl From<std::io::Error> for CollabError {
    fn from(e: std::io::Error) -> Self {
        if e.kind() == std::io::ErrorKind::NotFound {
            CollabError::NotFound(e.to_string())
        } else {
            CollabError::Storage(e.to_string())
        }
    }
}

impl From<serde_json::Error> for CollabError {
    fn from(e: serde_json::Error) -> Self {
        CollabError::Document(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, CollabError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fatal_classification() {
        assert!(CollabError::NotFound("a.txt".into()).is_fatal());
        assert!(CollabError::SyncConnection { path: "a".into(), reason: "gone".into() }.is_fatal());
        assert!(!CollabError::Connection("refused".into()).is_fatal());
        assert!(!CollabError::SyncTimeout { path: "a".into(), millis: 10 }.is_fatal());
    }

    #[test]
    fn test_io_not_found_maps_to_not_found() {
        let io = std::io::Error::new(std::io::ErrorKind::NotFound, "missing.txt");
        assert!(matches!(CollabError::from(io), CollabError::NotFound(_)));

        let io = std::io::Error::new(std::io::ErrorKind::PermissionDenied, "nope");
        assert!(matches!(CollabError::from(io), CollabError::Storage(_)));
    }

    #[test]
    fn test_display() {
        let err = CollabError::SyncTimeout { path: "notes.txt".into(), millis: 250 };
        assert_eq!(err.to_string(), "sync handshake for notes.txt timed out after 250ms");
    }
}
