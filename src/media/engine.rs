#![forbid(unsafe_code)]

// Boundary to the external media-routing engine.
//
// The core only creates, configures and closes handles through this trait and
// listens to the events the engine reports back per router.

use crate::media::config::TransportSettings;
use crate::media::types::{
    ConsumerParams, IceParameters, MediaKind, MediaResult, RemoteParameters, RtpCapabilities, RtpParameters,
    StreamScore, TransportInfo,
};
use async_trait::async_trait;
use tokio::sync::mpsc;

/// Event raised by the engine about a resource it hosts
#[derive(Debug, Clone, PartialEq)]
pub enum EngineEvent {
    /// The engine closed a transport on its own (ICE/DTLS failure, worker loss)
    TransportClosed { transport_id: String },
    /// The engine closed a producer on its own
    ProducerClosed { producer_id: String },
    ProducerScore { producer_id: String, score: StreamScore },
    ConsumerScore { consumer_id: String, score: StreamScore },
}

/// Channel a router's events are delivered on. One per room.
pub type EngineEventSender = mpsc::UnboundedSender<EngineEvent>;

/// Operations the signaling core needs from a media engine.
///
/// Close operations are best-effort and idempotent: closing an unknown id is
/// a no-op, so callers can release handles without tracking engine-side
/// cascades.
#[async_trait]
pub trait MediaEngine: Send + Sync + 'static {
    /// Allocates a router for a room. Events for everything created on it go to `events`.
    async fn create_router(&self, room_id: &str, events: EngineEventSender) -> MediaResult<String>;

    async fn close_router(&self, router_id: &str);

    async fn router_rtp_capabilities(&self, router_id: &str) -> MediaResult<RtpCapabilities>;

    async fn create_transport(&self, router_id: &str, settings: &TransportSettings) -> MediaResult<TransportInfo>;

    async fn connect_transport(&self, transport_id: &str, remote: &RemoteParameters) -> MediaResult<()>;

    async fn restart_ice(&self, transport_id: &str) -> MediaResult<IceParameters>;

    async fn close_transport(&self, transport_id: &str);

    async fn produce(&self, transport_id: &str, kind: MediaKind, rtp_parameters: &RtpParameters)
        -> MediaResult<String>;

    async fn pause_producer(&self, producer_id: &str) -> MediaResult<()>;

    async fn resume_producer(&self, producer_id: &str) -> MediaResult<()>;

    async fn close_producer(&self, producer_id: &str);

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> MediaResult<ConsumerParams>;

    async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()>;

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()>;

    async fn close_consumer(&self, consumer_id: &str);
}
