#![forbid(unsafe_code)]

// Maps decoded requests onto room operations and shapes their responses.
//
// The dispatcher is stateless apart from the registry handle; everything a
// request needs about its caller travels in `PeerContext`.

use super::protocol::{ClientRequest, RequestEnvelope, Response};
use crate::error::{SignalError, SignalResult};
use crate::media::types::TransportKind;
use crate::room::RoomRegistry;
use serde_json::{json, Value};
use std::time::Instant;
use tracing::{debug, warn};

/// Longest room, peer or resource id accepted at the boundary
pub const MAX_ID_LEN: usize = 128;

/// Identity of the connection a request arrived on
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerContext {
    pub room_id: String,
    pub peer_id: String,
    /// Session handed out by `RoomRegistry::join`
    pub session: u64,
}

/// What the connection should do after a request was handled
#[derive(Debug, Clone)]
pub struct Dispatched {
    pub response: Response,
    /// The peer left the room; no further requests will be served
    pub left: bool,
}

/// Checks a client-supplied id: non-empty and at most `MAX_ID_LEN` characters
pub fn validate_id(field: &str, value: &str) -> SignalResult<()> {
    if value.is_empty() {
        return Err(SignalError::Validation(format!("{field} must not be empty")));
    }
    if value.chars().count() > MAX_ID_LEN {
        return Err(SignalError::Validation(format!(
            "{field} must be at most {MAX_ID_LEN} characters"
        )));
    }
    Ok(())
}

#[derive(Clone)]
pub struct SignalingDispatcher {
    registry: RoomRegistry,
}

impl SignalingDispatcher {
    pub fn new(registry: RoomRegistry) -> Self {
        Self { registry }
    }

    pub fn registry(&self) -> &RoomRegistry {
        &self.registry
    }

    /// Handles one inbound text frame end to end, always producing a response
    pub async fn handle_text(&self, ctx: &PeerContext, text: &str) -> Dispatched {
        let metrics = self.registry.services().metrics.clone();
        metrics.inc_requests();
        let start = Instant::now();

        let envelope = match RequestEnvelope::parse(text) {
            Ok(envelope) => envelope,
            Err((id, err)) => {
                metrics.inc_request_errors();
                warn!("Rejected frame from peer {}: {}", ctx.peer_id, err);
                let response = match id {
                    Some(id) => Response::failure(id, &err),
                    None => Response::uncorrelated(&err),
                };
                return Dispatched { response, left: false };
            }
        };

        let id = envelope.id;
        let outcome = match ClientRequest::from_method(&envelope.method, envelope.data) {
            Ok(request) => {
                let left = matches!(request, ClientRequest::Leave);
                self.dispatch(ctx, request).await.map(|data| (data, left))
            }
            Err(e) => Err(e),
        };
        metrics.observe_request_handling(start.elapsed());

        match outcome {
            Ok((data, left)) => Dispatched {
                response: Response::success(id, data),
                left,
            },
            Err(err) => {
                metrics.inc_request_errors();
                debug!(
                    "Request {} ({}) from peer {} failed: {}",
                    id, envelope.method, ctx.peer_id, err
                );
                Dispatched {
                    response: Response::failure(id, &err),
                    left: false,
                }
            }
        }
    }

    /// Runs one decoded request for the calling peer
    pub async fn dispatch(&self, ctx: &PeerContext, request: ClientRequest) -> SignalResult<Value> {
        if let ClientRequest::Leave = request {
            let left = self.registry.leave(&ctx.room_id, &ctx.peer_id, Some(ctx.session)).await;
            if !left {
                return Err(SignalError::PeerNotFound(ctx.peer_id.clone()));
            }
            return Ok(json!({ "left": true }));
        }

        let room_lock = self.registry.get_room(&ctx.room_id)?;
        let room = room_lock.read().await;
        let peer_id = ctx.peer_id.as_str();

        match request {
            ClientRequest::GetRouterRtpCapabilities => {
                let caps = room.router_rtp_capabilities().await?;
                Ok(json!({ "rtpCapabilities": caps }))
            }
            ClientRequest::CreateTransport(data) => {
                if let Some(claimed) = data.peer_id.as_deref() {
                    if claimed != peer_id {
                        return Err(SignalError::Validation(format!(
                            "peerId {claimed} does not match the connection's peer"
                        )));
                    }
                }
                let info = room.create_transport(peer_id, data.kind, &data.options).await?;
                let mut body = to_value(&info)?;
                if data.kind != TransportKind::Plain {
                    if let Some(turn) = room.settings().turn.as_ref() {
                        body["iceServers"] = to_value(&[turn.credentials_for(peer_id)])?;
                    }
                }
                Ok(body)
            }
            ClientRequest::ConnectTransport(data) => {
                validate_id("transportId", &data.transport_id)?;
                let remote = data.remote_parameters()?;
                room.connect_transport(peer_id, &data.transport_id, &remote).await?;
                Ok(json!({ "connected": true }))
            }
            ClientRequest::RestartIce(data) => {
                validate_id("transportId", &data.transport_id)?;
                let ice = room.restart_ice(peer_id, &data.transport_id).await?;
                Ok(json!({ "iceParameters": ice }))
            }
            ClientRequest::CloseTransport(data) => {
                validate_id("transportId", &data.transport_id)?;
                room.close_transport(peer_id, &data.transport_id).await?;
                Ok(json!({ "closed": true }))
            }
            ClientRequest::Produce(data) => {
                validate_id("transportId", &data.transport_id)?;
                let producer_id = room
                    .produce(peer_id, &data.transport_id, data.kind, &data.rtp_parameters)
                    .await?;
                Ok(json!({ "id": producer_id }))
            }
            ClientRequest::CloseProducer(data) => {
                validate_id("producerId", &data.producer_id)?;
                room.close_producer(peer_id, &data.producer_id).await?;
                Ok(json!({ "closed": true }))
            }
            ClientRequest::PauseProducer(data) => {
                validate_id("producerId", &data.producer_id)?;
                room.pause_producer(peer_id, &data.producer_id).await?;
                Ok(json!({ "paused": true }))
            }
            ClientRequest::ResumeProducer(data) => {
                validate_id("producerId", &data.producer_id)?;
                room.resume_producer(peer_id, &data.producer_id).await?;
                Ok(json!({ "paused": false }))
            }
            ClientRequest::Consume(data) => {
                validate_id("producerId", &data.producer_id)?;
                if let Some(transport_id) = data.transport_id.as_deref() {
                    validate_id("transportId", transport_id)?;
                }
                let created = room
                    .consume(
                        peer_id,
                        &data.producer_id,
                        &data.rtp_capabilities,
                        data.transport_id.as_deref(),
                    )
                    .await?;
                Ok(json!({
                    "id": created.params.id,
                    "producerId": created.producer_id,
                    "kind": created.params.kind,
                    "rtpParameters": created.params.rtp_parameters,
                    "producerPaused": created.params.producer_paused,
                    "transportId": created.transport_id,
                }))
            }
            ClientRequest::CloseConsumer(data) => {
                validate_id("consumerId", &data.consumer_id)?;
                room.close_consumer(peer_id, &data.consumer_id).await?;
                Ok(json!({ "closed": true }))
            }
            ClientRequest::PauseConsumer(data) => {
                validate_id("consumerId", &data.consumer_id)?;
                room.pause_consumer(peer_id, &data.consumer_id).await?;
                Ok(json!({ "paused": true }))
            }
            ClientRequest::ResumeConsumer(data) => {
                validate_id("consumerId", &data.consumer_id)?;
                room.resume_consumer(peer_id, &data.consumer_id).await?;
                Ok(json!({ "paused": false }))
            }
            // Served above without the room lock
            ClientRequest::Leave => Ok(json!({ "left": true })),
        }
    }
}

fn to_value<T: serde::Serialize + ?Sized>(value: &T) -> SignalResult<Value> {
    serde_json::to_value(value).map_err(|e| SignalError::Validation(format!("unserializable response: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::media::LocalEngine;
    use crate::metrics::ServerMetrics;
    use crate::room::settings::RoomSettings;
    use crate::room::RoomServices;
    use crate::turn::TurnConfig;
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn dispatcher_with(settings: RoomSettings) -> SignalingDispatcher {
        let services = RoomServices::new(Arc::new(LocalEngine::new()), settings, ServerMetrics::new());
        SignalingDispatcher::new(RoomRegistry::new(services))
    }

    async fn joined(dispatcher: &SignalingDispatcher, room: &str, peer: &str) -> (PeerContext, mpsc::Receiver<Arc<String>>) {
        let (tx, rx) = mpsc::channel(64);
        let outcome = dispatcher.registry().join(room, peer, tx).await.unwrap();
        let ctx = PeerContext {
            room_id: room.into(),
            peer_id: peer.into(),
            session: outcome.session,
        };
        (ctx, rx)
    }

    fn request(id: u64, method: &str, data: Value) -> String {
        json!({ "request": true, "id": id, "method": method, "data": data }).to_string()
    }

    #[test]
    fn test_validate_id() {
        assert!(validate_id("peerId", "alice").is_ok());
        assert!(validate_id("peerId", "").is_err());
        assert!(validate_id("peerId", &"x".repeat(MAX_ID_LEN)).is_ok());
        assert!(validate_id("peerId", &"x".repeat(MAX_ID_LEN + 1)).is_err());
    }

    #[tokio::test]
    async fn test_malformed_frame_is_uncorrelated() {
        let dispatcher = dispatcher_with(RoomSettings::default());
        let (ctx, _rx) = joined(&dispatcher, "r1", "a").await;
        let out = dispatcher.handle_text(&ctx, "{not json").await;
        assert!(!out.response.ok);
        assert_eq!(out.response.id, 0);
        assert_eq!(out.response.error.as_ref().unwrap().code, "ValidationError");
    }

    #[tokio::test]
    async fn test_unknown_method_is_correlated() {
        let dispatcher = dispatcher_with(RoomSettings::default());
        let (ctx, _rx) = joined(&dispatcher, "r1", "a").await;
        let out = dispatcher.handle_text(&ctx, &request(4, "teleport", json!({}))).await;
        assert_eq!(out.response.id, 4);
        assert!(!out.response.ok);
    }

    #[tokio::test]
    async fn test_empty_producer_id_rejected() {
        let dispatcher = dispatcher_with(RoomSettings::default());
        let (ctx, _rx) = joined(&dispatcher, "r1", "a").await;
        let out = dispatcher.handle_text(&ctx, &request(1, "pauseProducer", json!({}))).await;
        let error = out.response.error.unwrap();
        assert_eq!(error.code, "ValidationError");
        assert!(!error.retriable);
    }

    #[tokio::test]
    async fn test_create_transport_peer_mismatch() {
        let dispatcher = dispatcher_with(RoomSettings::default());
        let (ctx, _rx) = joined(&dispatcher, "r1", "a").await;
        let out = dispatcher
            .handle_text(&ctx, &request(1, "createTransport", json!({ "kind": "webRtcSend", "peerId": "b" })))
            .await;
        assert!(!out.response.ok);
        assert_eq!(out.response.error.unwrap().code, "ValidationError");
    }

    #[tokio::test]
    async fn test_webrtc_transport_carries_ice_servers() {
        let turn = TurnConfig::new("turn:turn.example.org:3478", "s3cret".into(), 600);
        let settings = RoomSettings { turn, ..RoomSettings::default() };
        let dispatcher = dispatcher_with(settings);
        let (ctx, _rx) = joined(&dispatcher, "r1", "a").await;

        let out = dispatcher
            .handle_text(&ctx, &request(1, "createTransport", json!({ "kind": "webRtcRecv", "peerId": "a" })))
            .await;
        let data = out.response.data.unwrap();
        assert!(data["iceParameters"].is_object());
        assert_eq!(data["iceServers"][0]["urls"][0], "turn:turn.example.org:3478");

        let out = dispatcher
            .handle_text(&ctx, &request(2, "createTransport", json!({ "kind": "plain" })))
            .await;
        let data = out.response.data.unwrap();
        assert!(data.get("iceServers").is_none());
        assert!(data["port"].is_u64());
    }

    #[tokio::test]
    async fn test_leave_reports_left_once() {
        let dispatcher = dispatcher_with(RoomSettings::default());
        let (ctx, _rx) = joined(&dispatcher, "r1", "a").await;
        let out = dispatcher.handle_text(&ctx, &request(9, "leave", Value::Null)).await;
        assert!(out.left);
        assert!(out.response.ok);
        assert!(!dispatcher.registry().has_room("r1"));

        let again = dispatcher.handle_text(&ctx, &request(10, "leave", Value::Null)).await;
        assert!(!again.left);
        assert!(!again.response.ok);
    }
}
