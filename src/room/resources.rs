#![forbid(unsafe_code)]

// Transports, producers and consumers owned by a peer, with their lifecycle
// state machines. Closed is terminal; closed entries stay in the owning peer's
// maps so later requests naming them fail with ResourceClosed rather than
// looking unknown.

use crate::error::{SignalError, SignalResult};
use crate::media::handle::{ConsumerHandle, ProducerHandle, TransportHandle};
use crate::media::types::{MediaKind, TransportKind};
use serde::Serialize;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportState {
    Created,
    Connecting,
    Connected,
    Closed,
}

/// Lifecycle of producers and consumers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub enum ResourceState {
    Open,
    Paused,
    Closed,
}

#[derive(Debug)]
pub struct Transport {
    pub id: String,
    pub kind: TransportKind,
    pub handle: TransportHandle,
    pub state: TransportState,
}

impl Transport {
    pub fn new(id: String, kind: TransportKind) -> Self {
        Self {
            handle: TransportHandle::new(id.clone()),
            id,
            kind,
            state: TransportState::Created,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == TransportState::Closed
    }

    /// Created -> Connecting
    pub fn begin_connect(&mut self) -> SignalResult<()> {
        match self.state {
            TransportState::Created => {
                self.state = TransportState::Connecting;
                Ok(())
            }
            TransportState::Closed => Err(SignalError::ResourceClosed(format!("transport {}", self.id))),
            other => Err(SignalError::InvalidState(format!(
                "transport {} is {other:?}, expected Created",
                self.id
            ))),
        }
    }

    /// Connecting -> Connected. Returns false if the transport was closed meanwhile.
    pub fn finish_connect(&mut self) -> bool {
        if self.state == TransportState::Connecting {
            self.state = TransportState::Connected;
            true
        } else {
            false
        }
    }

    /// Connecting -> Created after the engine refused the remote parameters
    pub fn abort_connect(&mut self) {
        if self.state == TransportState::Connecting {
            self.state = TransportState::Created;
        }
    }

    /// Moves to Closed. Returns true if the engine handle still has to be released.
    pub fn close(&mut self) -> bool {
        self.state = TransportState::Closed;
        self.handle.release()
    }

    /// Guard for operations that need a live transport
    pub fn ensure_open(&self) -> SignalResult<()> {
        if self.is_closed() {
            Err(SignalError::ResourceClosed(format!("transport {}", self.id)))
        } else {
            Ok(())
        }
    }
}

#[derive(Debug)]
pub struct Producer {
    pub id: String,
    pub transport_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub handle: ProducerHandle,
    pub state: ResourceState,
}

impl Producer {
    pub fn new(id: String, transport_id: String, peer_id: String, kind: MediaKind) -> Self {
        Self {
            handle: ProducerHandle::new(id.clone()),
            id,
            transport_id,
            peer_id,
            kind,
            state: ResourceState::Open,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ResourceState::Closed
    }

    pub fn ensure_open(&self) -> SignalResult<()> {
        if self.is_closed() {
            Err(SignalError::ResourceClosed(format!("producer {}", self.id)))
        } else {
            Ok(())
        }
    }

    pub fn close(&mut self) -> bool {
        self.state = ResourceState::Closed;
        self.handle.release()
    }
}

#[derive(Debug)]
pub struct Consumer {
    pub id: String,
    pub producer_id: String,
    pub transport_id: String,
    pub peer_id: String,
    pub kind: MediaKind,
    pub handle: ConsumerHandle,
    pub state: ResourceState,
}

impl Consumer {
    pub fn new(
        id: String,
        producer_id: String,
        transport_id: String,
        peer_id: String,
        kind: MediaKind,
    ) -> Self {
        Self {
            handle: ConsumerHandle::new(id.clone()),
            id,
            producer_id,
            transport_id,
            peer_id,
            kind,
            state: ResourceState::Open,
        }
    }

    pub fn is_closed(&self) -> bool {
        self.state == ResourceState::Closed
    }

    pub fn ensure_open(&self) -> SignalResult<()> {
        if self.is_closed() {
            Err(SignalError::ResourceClosed(format!("consumer {}", self.id)))
        } else {
            Ok(())
        }
    }

    pub fn close(&mut self) -> bool {
        self.state = ResourceState::Closed;
        self.handle.release()
    }
}
