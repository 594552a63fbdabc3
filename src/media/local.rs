#![forbid(unsafe_code)]

// In-process loopback engine.
//
// Allocates ids and connection parameters the way a real SFU worker would but
// forwards no RTP. Used when the server runs without a mediasoup worker pool,
// and by tests, which can inject failures, latency and engine-side events.

use crate::media::config::TransportSettings;
use crate::media::engine::{EngineEvent, EngineEventSender, MediaEngine};
use crate::media::types::{
    ConsumerParams, DtlsFingerprint, DtlsParameters, DtlsRole, IceCandidate, IceParameters, MediaError, MediaKind,
    MediaResult, RemoteParameters, RtpCapabilities, RtpParameters, SctpParameters, StreamScore, TransportInfo,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::{IpAddr, Ipv4Addr};
use std::sync::atomic::{AtomicBool, AtomicU16, AtomicUsize, Ordering};
use std::sync::Mutex as StdMutex;
use std::time::Duration;
use tracing::{debug, info};
use uuid::Uuid;

const FIRST_PORT: u16 = 40_000;

struct LocalRouter {
    room_id: String,
    events: EngineEventSender,
}

struct LocalTransport {
    router_id: String,
    webrtc: bool,
    connected: bool,
}

struct LocalProducer {
    transport_id: String,
    kind: MediaKind,
    paused: bool,
    rtp_parameters: RtpParameters,
}

struct LocalConsumer {
    transport_id: String,
    producer_id: String,
}

#[derive(Default)]
struct LocalState {
    routers: HashMap<String, LocalRouter>,
    transports: HashMap<String, LocalTransport>,
    producers: HashMap<String, LocalProducer>,
    consumers: HashMap<String, LocalConsumer>,
}

impl LocalState {
    /// Drops a transport and everything hosted on it, returning whether it existed
    fn drop_transport(&mut self, transport_id: &str) -> bool {
        if self.transports.remove(transport_id).is_none() {
            return false;
        }
        let producers: Vec<String> = self
            .producers
            .iter()
            .filter(|(_, p)| p.transport_id == transport_id)
            .map(|(id, _)| id.clone())
            .collect();
        for producer_id in producers {
            self.drop_producer(&producer_id);
        }
        self.consumers.retain(|_, c| c.transport_id != transport_id);
        true
    }

    fn drop_producer(&mut self, producer_id: &str) {
        if self.producers.remove(producer_id).is_some() {
            self.consumers.retain(|_, c| c.producer_id != producer_id);
        }
    }

    fn events_for_transport(&self, transport_id: &str) -> Option<EngineEventSender> {
        let transport = self.transports.get(transport_id)?;
        self.routers.get(&transport.router_id).map(|r| r.events.clone())
    }
}

/// Loopback media engine
pub struct LocalEngine {
    state: StdMutex<LocalState>,
    next_port: AtomicU16,
    routers_created: AtomicUsize,
    fail_router_creation: AtomicBool,
    reject_transports: AtomicBool,
    stall_connects: AtomicBool,
    router_latency: StdMutex<Duration>,
}

impl Default for LocalEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalEngine {
    pub fn new() -> Self {
        Self {
            state: StdMutex::new(LocalState::default()),
            next_port: AtomicU16::new(FIRST_PORT),
            routers_created: AtomicUsize::new(0),
            fail_router_creation: AtomicBool::new(false),
            reject_transports: AtomicBool::new(false),
            stall_connects: AtomicBool::new(false),
            router_latency: StdMutex::new(Duration::ZERO),
        }
    }

    fn state(&self) -> std::sync::MutexGuard<'_, LocalState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn allocate_port(&self) -> u16 {
        let port = self.next_port.fetch_add(1, Ordering::Relaxed);
        if port == u16::MAX {
            self.next_port.store(FIRST_PORT, Ordering::Relaxed);
        }
        port
    }

    // --- Fault injection ---

    /// Makes every subsequent router allocation fail
    pub fn set_fail_router_creation(&self, fail: bool) {
        self.fail_router_creation.store(fail, Ordering::Relaxed);
    }

    /// Makes every subsequent transport allocation fail with `Rejected`
    pub fn set_reject_transports(&self, reject: bool) {
        self.reject_transports.store(reject, Ordering::Relaxed);
    }

    /// Makes transport connects hang until the caller gives up
    pub fn set_stall_connects(&self, stall: bool) {
        self.stall_connects.store(stall, Ordering::Relaxed);
    }

    /// Delay applied to router allocation, widening race windows in tests
    pub fn set_router_latency(&self, latency: Duration) {
        *self.router_latency.lock().unwrap_or_else(|e| e.into_inner()) = latency;
    }

    // --- Introspection ---

    pub fn routers_created(&self) -> usize {
        self.routers_created.load(Ordering::Relaxed)
    }

    pub fn live_routers(&self) -> usize {
        self.state().routers.len()
    }

    pub fn live_transports(&self) -> usize {
        self.state().transports.len()
    }

    pub fn live_producers(&self) -> usize {
        self.state().producers.len()
    }

    pub fn live_consumers(&self) -> usize {
        self.state().consumers.len()
    }

    pub fn has_router_for_room(&self, room_id: &str) -> bool {
        self.state().routers.values().any(|r| r.room_id == room_id)
    }

    // --- Engine-originated events ---

    /// Simulates the engine closing a transport by itself (e.g. DTLS failure)
    pub fn fail_transport(&self, transport_id: &str) {
        let mut state = self.state();
        let events = state.events_for_transport(transport_id);
        if state.drop_transport(transport_id) {
            if let Some(events) = events {
                let _ = events.send(EngineEvent::TransportClosed {
                    transport_id: transport_id.to_string(),
                });
            }
        }
    }

    /// Reports a new score for a producer
    pub fn report_producer_score(&self, producer_id: &str, score: u8) {
        let state = self.state();
        let events = state
            .producers
            .get(producer_id)
            .and_then(|p| state.events_for_transport(&p.transport_id));
        if let Some(events) = events {
            let _ = events.send(EngineEvent::ProducerScore {
                producer_id: producer_id.to_string(),
                score: StreamScore { score, producer_score: None },
            });
        }
    }

    /// Reports a new score for a consumer, carrying its producer's current score
    pub fn report_consumer_score(&self, consumer_id: &str, score: u8, producer_score: u8) {
        let state = self.state();
        let events = state
            .consumers
            .get(consumer_id)
            .and_then(|c| state.events_for_transport(&c.transport_id));
        if let Some(events) = events {
            let _ = events.send(EngineEvent::ConsumerScore {
                consumer_id: consumer_id.to_string(),
                score: StreamScore {
                    score,
                    producer_score: Some(producer_score),
                },
            });
        }
    }

    fn default_capabilities() -> RtpCapabilities {
        RtpCapabilities(serde_json::json!({
            "codecs": [
                {
                    "kind": "audio",
                    "mimeType": "audio/opus",
                    "preferredPayloadType": 100,
                    "clockRate": 48000,
                    "channels": 2,
                    "parameters": { "minptime": 10, "useinbandfec": 1 },
                    "rtcpFeedback": [{ "type": "transport-cc", "parameter": "" }]
                },
                {
                    "kind": "video",
                    "mimeType": "video/VP8",
                    "preferredPayloadType": 101,
                    "clockRate": 90000,
                    "parameters": {},
                    "rtcpFeedback": [
                        { "type": "nack", "parameter": "" },
                        { "type": "nack", "parameter": "pli" },
                        { "type": "ccm", "parameter": "fir" },
                        { "type": "transport-cc", "parameter": "" }
                    ]
                }
            ],
            "headerExtensions": []
        }))
    }

    fn local_address(listen_ip: IpAddr, announced: &Option<String>) -> String {
        match announced {
            Some(addr) => addr.clone(),
            None if listen_ip.is_unspecified() => Ipv4Addr::LOCALHOST.to_string(),
            None => listen_ip.to_string(),
        }
    }

    fn fingerprint() -> String {
        let bytes: Vec<u8> = Uuid::new_v4()
            .as_bytes()
            .iter()
            .chain(Uuid::new_v4().as_bytes().iter())
            .copied()
            .collect();
        bytes.iter().map(|b| format!("{b:02X}")).collect::<Vec<_>>().join(":")
    }
}

#[async_trait]
impl MediaEngine for LocalEngine {
    async fn create_router(&self, room_id: &str, events: EngineEventSender) -> MediaResult<String> {
        let latency = *self.router_latency.lock().unwrap_or_else(|e| e.into_inner());
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        if self.fail_router_creation.load(Ordering::Relaxed) {
            return Err(MediaError::Unavailable("no worker available".into()));
        }

        let router_id = Uuid::new_v4().to_string();
        self.state().routers.insert(
            router_id.clone(),
            LocalRouter {
                room_id: room_id.to_string(),
                events,
            },
        );
        self.routers_created.fetch_add(1, Ordering::Relaxed);
        info!("Created loopback router {} for room {}", router_id, room_id);
        Ok(router_id)
    }

    async fn close_router(&self, router_id: &str) {
        let mut state = self.state();
        if state.routers.remove(router_id).is_none() {
            return;
        }
        let transports: Vec<String> = state
            .transports
            .iter()
            .filter(|(_, t)| t.router_id == router_id)
            .map(|(id, _)| id.clone())
            .collect();
        for transport_id in transports {
            state.drop_transport(&transport_id);
        }
        debug!("Closed loopback router {}", router_id);
    }

    async fn router_rtp_capabilities(&self, router_id: &str) -> MediaResult<RtpCapabilities> {
        if !self.state().routers.contains_key(router_id) {
            return Err(MediaError::UnknownHandle(format!("router {router_id}")));
        }
        Ok(Self::default_capabilities())
    }

    async fn create_transport(&self, router_id: &str, settings: &TransportSettings) -> MediaResult<TransportInfo> {
        if self.reject_transports.load(Ordering::Relaxed) {
            return Err(MediaError::Rejected("transport options refused by engine".into()));
        }
        if !self.state().routers.contains_key(router_id) {
            return Err(MediaError::UnknownHandle(format!("router {router_id}")));
        }

        let transport_id = Uuid::new_v4().to_string();
        let info = match settings {
            TransportSettings::WebRtc(s) => {
                let address = Self::local_address(s.listen_ip, &s.announced_address);
                let mut ice_candidates = Vec::new();
                if s.enable_udp {
                    ice_candidates.push(IceCandidate {
                        foundation: "udpcandidate".into(),
                        priority: if s.prefer_udp { 1_076_302_079 } else { 1_076_302_078 },
                        address: address.clone(),
                        protocol: "udp".into(),
                        port: self.allocate_port(),
                        candidate_type: "host".into(),
                        tcp_type: None,
                    });
                }
                if s.enable_tcp {
                    ice_candidates.push(IceCandidate {
                        foundation: "tcpcandidate".into(),
                        priority: if s.prefer_tcp { 1_076_302_079 } else { 1_076_276_479 },
                        address,
                        protocol: "tcp".into(),
                        port: self.allocate_port(),
                        candidate_type: "host".into(),
                        tcp_type: Some("passive".into()),
                    });
                }
                let ufrag = Uuid::new_v4().simple().to_string();
                TransportInfo {
                    id: transport_id.clone(),
                    ice_parameters: Some(IceParameters {
                        username_fragment: ufrag[..16].to_string(),
                        password: Uuid::new_v4().simple().to_string(),
                        ice_lite: Some(true),
                    }),
                    ice_candidates,
                    dtls_parameters: Some(DtlsParameters {
                        role: DtlsRole::Auto,
                        fingerprints: vec![DtlsFingerprint {
                            algorithm: "sha-256".into(),
                            value: Self::fingerprint(),
                        }],
                    }),
                    sctp_parameters: s.enable_sctp.then(|| SctpParameters {
                        port: 5000,
                        os: s.num_sctp_streams.os,
                        mis: s.num_sctp_streams.mis,
                        max_message_size: s.max_sctp_message_size,
                    }),
                    ip: None,
                    port: None,
                    rtcp_port: None,
                }
            }
            TransportSettings::Plain(s) => {
                let address = Self::local_address(s.listen_ip, &s.announced_address);
                let ip = address.parse().map_err(|_| {
                    MediaError::Rejected(format!("plain transport needs an IP address, got {address}"))
                })?;
                let port = self.allocate_port();
                let rtcp_port = (!s.rtcp_mux).then(|| self.allocate_port());
                TransportInfo {
                    id: transport_id.clone(),
                    ice_parameters: None,
                    ice_candidates: Vec::new(),
                    dtls_parameters: None,
                    sctp_parameters: None,
                    ip: Some(ip),
                    port: Some(port),
                    rtcp_port,
                }
            }
        };

        self.state().transports.insert(
            transport_id,
            LocalTransport {
                router_id: router_id.to_string(),
                webrtc: matches!(settings, TransportSettings::WebRtc(_)),
                connected: false,
            },
        );
        Ok(info)
    }

    async fn connect_transport(&self, transport_id: &str, remote: &RemoteParameters) -> MediaResult<()> {
        if self.stall_connects.load(Ordering::Relaxed) {
            std::future::pending::<()>().await;
        }
        let mut state = self.state();
        let transport = state
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| MediaError::UnknownHandle(format!("transport {transport_id}")))?;
        match (transport.webrtc, remote) {
            (true, RemoteParameters::WebRtc { dtls_parameters }) => {
                if dtls_parameters.fingerprints.is_empty() {
                    return Err(MediaError::Rejected("DTLS parameters carry no fingerprint".into()));
                }
            }
            (false, RemoteParameters::Plain { port, .. }) => {
                if *port == 0 {
                    return Err(MediaError::Rejected("remote port must be non-zero".into()));
                }
            }
            _ => return Err(MediaError::Rejected("remote parameters do not match transport type".into())),
        }
        if transport.connected {
            return Err(MediaError::Rejected("transport already connected".into()));
        }
        transport.connected = true;
        Ok(())
    }

    async fn restart_ice(&self, transport_id: &str) -> MediaResult<IceParameters> {
        let state = self.state();
        match state.transports.get(transport_id) {
            Some(t) if t.webrtc => Ok(IceParameters {
                username_fragment: Uuid::new_v4().simple().to_string()[..16].to_string(),
                password: Uuid::new_v4().simple().to_string(),
                ice_lite: Some(true),
            }),
            Some(_) => Err(MediaError::Rejected("ICE restart on a plain transport".into())),
            None => Err(MediaError::UnknownHandle(format!("transport {transport_id}"))),
        }
    }

    async fn close_transport(&self, transport_id: &str) {
        self.state().drop_transport(transport_id);
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> MediaResult<String> {
        let mut state = self.state();
        if !state.transports.contains_key(transport_id) {
            return Err(MediaError::UnknownHandle(format!("transport {transport_id}")));
        }
        if !rtp_parameters.0.is_null() && !rtp_parameters.0.is_object() {
            return Err(MediaError::Rejected("rtpParameters must be an object".into()));
        }
        let producer_id = Uuid::new_v4().to_string();
        state.producers.insert(
            producer_id.clone(),
            LocalProducer {
                transport_id: transport_id.to_string(),
                kind,
                paused: false,
                rtp_parameters: rtp_parameters.clone(),
            },
        );
        Ok(producer_id)
    }

    async fn pause_producer(&self, producer_id: &str) -> MediaResult<()> {
        let mut state = self.state();
        let producer = state
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| MediaError::UnknownHandle(format!("producer {producer_id}")))?;
        producer.paused = true;
        Ok(())
    }

    async fn resume_producer(&self, producer_id: &str) -> MediaResult<()> {
        let mut state = self.state();
        let producer = state
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| MediaError::UnknownHandle(format!("producer {producer_id}")))?;
        producer.paused = false;
        Ok(())
    }

    async fn close_producer(&self, producer_id: &str) {
        self.state().drop_producer(producer_id);
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> MediaResult<ConsumerParams> {
        let mut state = self.state();
        if !state.transports.contains_key(transport_id) {
            return Err(MediaError::UnknownHandle(format!("transport {transport_id}")));
        }
        let producer = state
            .producers
            .get(producer_id)
            .ok_or_else(|| MediaError::Rejected(format!("producer {producer_id} is not hosted here")))?;
        let no_codecs = rtp_capabilities
            .0
            .get("codecs")
            .and_then(|c| c.as_array())
            .is_some_and(|codecs| codecs.is_empty());
        if no_codecs {
            return Err(MediaError::Rejected("receiver cannot decode any producer codec".into()));
        }

        let params = ConsumerParams {
            id: Uuid::new_v4().to_string(),
            kind: producer.kind,
            rtp_parameters: producer.rtp_parameters.clone(),
            producer_paused: producer.paused,
        };
        state.consumers.insert(
            params.id.clone(),
            LocalConsumer {
                transport_id: transport_id.to_string(),
                producer_id: producer_id.to_string(),
            },
        );
        Ok(params)
    }

    async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        if self.state().consumers.contains_key(consumer_id) {
            Ok(())
        } else {
            Err(MediaError::UnknownHandle(format!("consumer {consumer_id}")))
        }
    }

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        self.pause_consumer(consumer_id).await
    }

    async fn close_consumer(&self, consumer_id: &str) {
        self.state().consumers.remove(consumer_id);
    }
}
