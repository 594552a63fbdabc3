#![forbid(unsafe_code)]

// Signaling error taxonomy. Every error reaching the dispatcher is turned into
// a structured error response; none of them tear down the room.

use crate::media::types::MediaError;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use thiserror::Error;

/// Coarse error class reported to clients
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ErrorKind {
    /// Malformed or missing field, rejected before any mutation
    Validation,
    /// Unknown room, peer, transport, producer or consumer
    NotFound,
    /// Operation incompatible with the resource's lifecycle state
    InvalidState,
    /// The media engine refused the operation
    Engine,
    /// A bounded wait elapsed
    Timeout,
}

#[derive(Error, Debug)]
pub enum SignalError {
    #[error("Invalid request: {0}")]
    Validation(String),

    #[error("Room not found: {0}")]
    RoomNotFound(String),

    #[error("Peer not found: {0}")]
    PeerNotFound(String),

    #[error("Unknown transport: {0}")]
    UnknownTransport(String),

    #[error("Producer not found: {0}")]
    ProducerNotFound(String),

    #[error("Consumer not found: {0}")]
    ConsumerNotFound(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Resource closed: {0}")]
    ResourceClosed(String),

    #[error("Limit exceeded: {0}")]
    LimitExceeded(String),

    /// Backpressure on the connection; the same request may succeed shortly
    #[error("Rate limited: {0}")]
    RateLimited(String),

    #[error("Failed to create room {room_id}: {source}")]
    RoomCreationFailed {
        room_id: String,
        #[source]
        source: MediaError,
    },

    #[error("Failed to create transport: {0}")]
    TransportCreationFailed(#[source] MediaError),

    #[error("Transport {transport_id} did not connect within {timeout:?}")]
    TransportConnectTimeout { transport_id: String, timeout: Duration },

    #[error("Media engine error: {0}")]
    Engine(#[from] MediaError),
}

/// Result type alias for signaling operations
pub type SignalResult<T> = Result<T, SignalError>;

impl SignalError {
    pub fn kind(&self) -> ErrorKind {
        match self {
            SignalError::Validation(_) => ErrorKind::Validation,
            SignalError::RoomNotFound(_)
            | SignalError::PeerNotFound(_)
            | SignalError::UnknownTransport(_)
            | SignalError::ProducerNotFound(_)
            | SignalError::ConsumerNotFound(_) => ErrorKind::NotFound,
            SignalError::InvalidState(_)
            | SignalError::ResourceClosed(_)
            | SignalError::LimitExceeded(_)
            | SignalError::RateLimited(_) => ErrorKind::InvalidState,
            SignalError::RoomCreationFailed { .. }
            | SignalError::TransportCreationFailed(_)
            | SignalError::Engine(_) => ErrorKind::Engine,
            SignalError::TransportConnectTimeout { .. } => ErrorKind::Timeout,
        }
    }

    /// Stable machine-readable code, finer than [`ErrorKind`]
    pub fn code(&self) -> &'static str {
        match self {
            SignalError::Validation(_) => "ValidationError",
            SignalError::RoomNotFound(_) => "RoomNotFound",
            SignalError::PeerNotFound(_) => "PeerNotFound",
            SignalError::UnknownTransport(_) => "UnknownTransport",
            SignalError::ProducerNotFound(_) => "ProducerNotFound",
            SignalError::ConsumerNotFound(_) => "ConsumerNotFound",
            SignalError::InvalidState(_) => "InvalidState",
            SignalError::ResourceClosed(_) => "ResourceClosed",
            SignalError::LimitExceeded(_) => "LimitExceeded",
            SignalError::RateLimited(_) => "RateLimited",
            SignalError::RoomCreationFailed { .. } => "RoomCreationFailed",
            SignalError::TransportCreationFailed(_) => "TransportCreationFailed",
            SignalError::TransportConnectTimeout { .. } => "TransportConnectTimeout",
            SignalError::Engine(_) => "EngineError",
        }
    }

    /// Whether the client may retry the same request
    pub fn retriable(&self) -> bool {
        match self {
            SignalError::TransportConnectTimeout { .. } | SignalError::RateLimited(_) => true,
            SignalError::RoomCreationFailed { source, .. }
            | SignalError::TransportCreationFailed(source)
            | SignalError::Engine(source) => source.is_transient(),
            _ => false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_found_family() {
        for err in [
            SignalError::RoomNotFound("r".into()),
            SignalError::UnknownTransport("t".into()),
            SignalError::ProducerNotFound("p".into()),
            SignalError::ConsumerNotFound("c".into()),
        ] {
            assert_eq!(err.kind(), ErrorKind::NotFound);
            assert!(!err.retriable());
        }
    }

    #[test]
    fn test_retry_hint() {
        let timeout = SignalError::TransportConnectTimeout {
            transport_id: "t1".into(),
            timeout: Duration::from_secs(10),
        };
        assert_eq!(timeout.kind(), ErrorKind::Timeout);
        assert!(timeout.retriable());

        let transient = SignalError::Engine(MediaError::Unavailable("worker restarting".into()));
        assert!(transient.retriable());

        let rejected = SignalError::TransportCreationFailed(MediaError::Rejected("no ports".into()));
        assert_eq!(rejected.kind(), ErrorKind::Engine);
        assert!(!rejected.retriable());

        assert!(!SignalError::Validation("missing producerId".into()).retriable());
    }

    #[test]
    fn test_backpressure_is_retriable_but_caps_are_not() {
        let throttled = SignalError::RateLimited("100 requests/second".into());
        assert!(throttled.retriable());
        assert_eq!(throttled.code(), "RateLimited");

        let capped = SignalError::LimitExceeded("peer b already holds 16 consumers".into());
        assert!(!capped.retriable());
        assert_eq!(capped.code(), "LimitExceeded");
    }

    #[test]
    fn test_closed_resource_is_state_error() {
        let err = SignalError::ResourceClosed("producer p1".into());
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(err.code(), "ResourceClosed");
    }
}
