#![forbid(unsafe_code)]

// mediasoup-backed engine: a worker pool, one router per room, and the
// transports/producers/consumers hosted on them.
//
// Handles are kept in plain maps keyed by id. The map lock is only held to
// clone a handle out; every mediasoup call happens after it is released.
// Dropping the last clone of a handle closes it on the worker.

use crate::media::config::{PlainTransportSettings, TransportSettings, WebRtcTransportSettings};
use crate::media::engine::{EngineEvent, EngineEventSender, MediaEngine};
use crate::media::types::{
    ConsumerParams, IceParameters, MediaError, MediaKind, MediaResult, RemoteParameters,
    RtpCapabilities, RtpParameters, StreamScore, TransportInfo,
};
use async_trait::async_trait;
use mediasoup::consumer::{Consumer, ConsumerOptions};
use mediasoup::data_structures::{DtlsState, ListenInfo, Protocol};
use mediasoup::plain_transport::{PlainTransport, PlainTransportOptions, PlainTransportRemoteParameters};
use mediasoup::producer::{Producer, ProducerId, ProducerOptions};
use mediasoup::router::{Router, RouterOptions};
use mediasoup::rtp_parameters::{
    MimeTypeAudio, MimeTypeVideo, RtcpFeedback, RtpCodecCapability, RtpCodecParametersParameters,
};
use mediasoup::sctp_parameters::NumSctpStreams;
use mediasoup::transport::Transport;
use mediasoup::webrtc_transport::{
    WebRtcTransport, WebRtcTransportListenInfos, WebRtcTransportOptions, WebRtcTransportRemoteParameters,
};
use mediasoup::worker::{Worker, WorkerLogLevel, WorkerLogTag, WorkerSettings};
use mediasoup::worker_manager::WorkerManager;
use serde::de::DeserializeOwned;
use serde::Serialize;
use std::collections::HashMap;
use std::fmt::Display;
use std::net::IpAddr;
use std::num::{NonZeroU32, NonZeroU8};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use tracing::{debug, error, info, warn};

const OPUS_CLOCK_RATE: NonZeroU32 = NonZeroU32::new(48_000).unwrap();
const VIDEO_CLOCK_RATE: NonZeroU32 = NonZeroU32::new(90_000).unwrap();
const STEREO: NonZeroU8 = NonZeroU8::new(2).unwrap();

/// Worker pool settings
#[derive(Debug, Clone)]
pub struct MediasoupConfig {
    pub num_workers: usize,
    pub rtc_min_port: u16,
    pub rtc_max_port: u16,
    pub log_level: WorkerLogLevel,
}

impl Default for MediasoupConfig {
    fn default() -> Self {
        Self {
            num_workers: num_cpus::get(),
            rtc_min_port: 10000,
            rtc_max_port: 59999,
            log_level: WorkerLogLevel::Warn,
        }
    }
}

impl MediasoupConfig {
    fn to_worker_settings(&self) -> WorkerSettings {
        let mut settings = WorkerSettings::default();
        settings.log_level = self.log_level;
        settings.log_tags = vec![WorkerLogTag::Info, WorkerLogTag::Ice, WorkerLogTag::Dtls];
        settings.rtc_port_range = self.rtc_min_port..=self.rtc_max_port;
        settings
    }
}

/// Codecs every router offers
fn default_codecs() -> Vec<RtpCodecCapability> {
    let video_feedback = || {
        vec![
            RtcpFeedback::Nack,
            RtcpFeedback::NackPli,
            RtcpFeedback::CcmFir,
            RtcpFeedback::GoogRemb,
            RtcpFeedback::TransportCc,
        ]
    };
    vec![
        RtpCodecCapability::Audio {
            mime_type: MimeTypeAudio::Opus,
            preferred_payload_type: Some(111),
            clock_rate: OPUS_CLOCK_RATE,
            channels: STEREO,
            parameters: RtpCodecParametersParameters::from([("minptime", 10_u32.into()), ("useinbandfec", 1_u32.into())]),
            rtcp_feedback: vec![RtcpFeedback::TransportCc],
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::Vp8,
            preferred_payload_type: Some(96),
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::default(),
            rtcp_feedback: video_feedback(),
        },
        RtpCodecCapability::Video {
            mime_type: MimeTypeVideo::H264,
            preferred_payload_type: Some(102),
            clock_rate: VIDEO_CLOCK_RATE,
            parameters: RtpCodecParametersParameters::from([
                ("level-asymmetry-allowed", 1_u32.into()),
                ("packetization-mode", 1_u32.into()),
                ("profile-level-id", "42e01f".into()),
            ]),
            rtcp_feedback: video_feedback(),
        },
    ]
}

#[derive(Clone)]
enum HostedTransport {
    WebRtc(WebRtcTransport),
    Plain(PlainTransport),
}

impl HostedTransport {
    async fn produce(&self, options: ProducerOptions) -> Result<Producer, String> {
        match self {
            HostedTransport::WebRtc(t) => t.produce(options).await.map_err(|e| e.to_string()),
            HostedTransport::Plain(t) => t.produce(options).await.map_err(|e| e.to_string()),
        }
    }

    async fn consume(&self, options: ConsumerOptions) -> Result<Consumer, String> {
        match self {
            HostedTransport::WebRtc(t) => t.consume(options).await.map_err(|e| e.to_string()),
            HostedTransport::Plain(t) => t.consume(options).await.map_err(|e| e.to_string()),
        }
    }
}

struct HostedRouter {
    router: Router,
    events: EngineEventSender,
}

#[derive(Default)]
struct Handles {
    routers: HashMap<String, HostedRouter>,
    /// transport id -> (transport, router id)
    transports: HashMap<String, (HostedTransport, String)>,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
}

/// Engine backed by a pool of mediasoup workers
pub struct MediasoupEngine {
    _manager: WorkerManager,
    workers: Arc<StdMutex<Vec<Worker>>>,
    next_worker: AtomicUsize,
    handles: StdMutex<Handles>,
}

fn rejected(e: impl Display) -> MediaError {
    MediaError::Rejected(e.to_string())
}

/// Converts between the core's JSON-shaped types and mediasoup's typed ones
fn convert<T: Serialize, U: DeserializeOwned>(value: &T) -> MediaResult<U> {
    serde_json::to_value(value)
        .and_then(serde_json::from_value)
        .map_err(rejected)
}

fn to_mediasoup_kind(kind: MediaKind) -> mediasoup::rtp_parameters::MediaKind {
    match kind {
        MediaKind::Audio => mediasoup::rtp_parameters::MediaKind::Audio,
        MediaKind::Video => mediasoup::rtp_parameters::MediaKind::Video,
    }
}

fn from_mediasoup_kind(kind: mediasoup::rtp_parameters::MediaKind) -> MediaKind {
    match kind {
        mediasoup::rtp_parameters::MediaKind::Audio => MediaKind::Audio,
        mediasoup::rtp_parameters::MediaKind::Video => MediaKind::Video,
    }
}

fn listen_info(protocol: Protocol, ip: IpAddr, announced_address: Option<String>) -> ListenInfo {
    ListenInfo {
        protocol,
        ip,
        announced_address,
        port: None,
        port_range: None,
        flags: None,
        send_buffer_size: None,
        recv_buffer_size: None,
        expose_internal_ip: false,
    }
}

/// Close callback that reports the transport as closed by the engine
fn closed_event(events: &EngineEventSender, transport_id: &str) -> impl FnOnce() + Send + 'static {
    let events = events.clone();
    let transport_id = transport_id.to_string();
    move || {
        let _ = events.send(EngineEvent::TransportClosed { transport_id });
    }
}

impl MediasoupEngine {
    /// Spawns the worker pool
    pub async fn new(config: MediasoupConfig) -> anyhow::Result<Self> {
        info!("Creating mediasoup engine with {} workers", config.num_workers);
        let manager = WorkerManager::new();
        let workers = Arc::new(StdMutex::new(Vec::with_capacity(config.num_workers)));

        for index in 0..config.num_workers.max(1) {
            let worker = manager
                .create_worker(config.to_worker_settings())
                .await
                .map_err(|e| anyhow::anyhow!("Failed to create worker {index}: {e}"))?;
            let worker_id = worker.id();
            info!("Created worker {} with id: {}", index, worker_id);

            // A dead worker leaves the pool; its routers close and report through their transports.
            let pool = Arc::downgrade(&workers);
            worker
                .on_dead(move |reason| {
                    error!("Worker {} died: {:?}", worker_id, reason);
                    if let Some(pool) = pool.upgrade() {
                        pool.lock().unwrap_or_else(|e| e.into_inner()).retain(|w| w.id() != worker_id);
                    }
                })
                .detach();

            workers.lock().unwrap_or_else(|e| e.into_inner()).push(worker);
        }

        Ok(Self {
            _manager: manager,
            workers,
            next_worker: AtomicUsize::new(0),
            handles: StdMutex::new(Handles::default()),
        })
    }

    fn handles(&self) -> std::sync::MutexGuard<'_, Handles> {
        self.handles.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Round-robin over the live workers
    fn pick_worker(&self) -> MediaResult<Worker> {
        let workers = self.workers.lock().unwrap_or_else(|e| e.into_inner());
        if workers.is_empty() {
            return Err(MediaError::Unavailable("no live mediasoup workers".into()));
        }
        let idx = self.next_worker.fetch_add(1, Ordering::Relaxed) % workers.len();
        Ok(workers[idx].clone())
    }

    fn router(&self, router_id: &str) -> MediaResult<(Router, EngineEventSender)> {
        self.handles()
            .routers
            .get(router_id)
            .map(|r| (r.router.clone(), r.events.clone()))
            .ok_or_else(|| MediaError::UnknownHandle(format!("router {router_id}")))
    }

    fn transport(&self, transport_id: &str) -> MediaResult<(HostedTransport, EngineEventSender)> {
        let handles = self.handles();
        let (transport, router_id) = handles
            .transports
            .get(transport_id)
            .ok_or_else(|| MediaError::UnknownHandle(format!("transport {transport_id}")))?;
        let events = handles
            .routers
            .get(router_id)
            .map(|r| r.events.clone())
            .ok_or_else(|| MediaError::UnknownHandle(format!("router {router_id}")))?;
        Ok((transport.clone(), events))
    }

    fn producer(&self, producer_id: &str) -> MediaResult<Producer> {
        self.handles()
            .producers
            .get(producer_id)
            .cloned()
            .ok_or_else(|| MediaError::UnknownHandle(format!("producer {producer_id}")))
    }

    fn consumer(&self, consumer_id: &str) -> MediaResult<Consumer> {
        self.handles()
            .consumers
            .get(consumer_id)
            .cloned()
            .ok_or_else(|| MediaError::UnknownHandle(format!("consumer {consumer_id}")))
    }

    async fn create_webrtc(
        &self,
        router: &Router,
        events: EngineEventSender,
        s: &WebRtcTransportSettings,
    ) -> MediaResult<(HostedTransport, TransportInfo)> {
        let udp = listen_info(Protocol::Udp, s.listen_ip, s.announced_address.clone());
        let tcp = listen_info(Protocol::Tcp, s.listen_ip, s.announced_address.clone());
        let listen = match (s.enable_udp, s.enable_tcp) {
            (true, true) => WebRtcTransportListenInfos::new(udp).insert(tcp),
            (false, true) => WebRtcTransportListenInfos::new(tcp),
            _ => WebRtcTransportListenInfos::new(udp),
        };
        let mut options = WebRtcTransportOptions::new(listen);
        options.enable_udp = s.enable_udp;
        options.enable_tcp = s.enable_tcp;
        options.prefer_udp = s.prefer_udp;
        options.prefer_tcp = s.prefer_tcp;
        options.initial_available_outgoing_bitrate = s.initial_available_outgoing_bitrate;
        options.enable_sctp = s.enable_sctp;
        options.num_sctp_streams = NumSctpStreams {
            os: s.num_sctp_streams.os,
            mis: s.num_sctp_streams.mis,
        };
        options.max_sctp_message_size = s.max_sctp_message_size;

        let transport = router.create_webrtc_transport(options).await.map_err(rejected)?;
        if let Some(bitrate) = s.max_incoming_bitrate {
            if let Err(e) = transport.set_max_incoming_bitrate(bitrate).await {
                warn!("Failed to cap incoming bitrate on transport {}: {}", transport.id(), e);
            }
        }

        let id = transport.id().to_string();
        let info = TransportInfo {
            id: id.clone(),
            ice_parameters: Some(convert(transport.ice_parameters())?),
            ice_candidates: convert(transport.ice_candidates())?,
            dtls_parameters: Some(convert(&transport.dtls_parameters())?),
            sctp_parameters: match transport.sctp_parameters() {
                Some(p) => Some(convert(&p)?),
                None => None,
            },
            ip: None,
            port: None,
            rtcp_port: None,
        };

        transport
            .on_dtls_state_change({
                let events = events.clone();
                let id = id.clone();
                move |state| {
                    if matches!(state, DtlsState::Failed | DtlsState::Closed) {
                        debug!("DTLS {:?} on transport {}", state, id);
                        let _ = events.send(EngineEvent::TransportClosed { transport_id: id.clone() });
                    }
                }
            })
            .detach();
        transport.on_close(closed_event(&events, &id)).detach();

        Ok((HostedTransport::WebRtc(transport), info))
    }

    async fn create_plain(
        &self,
        router: &Router,
        events: EngineEventSender,
        s: &PlainTransportSettings,
    ) -> MediaResult<(HostedTransport, TransportInfo)> {
        let mut options = PlainTransportOptions::new(listen_info(Protocol::Udp, s.listen_ip, s.announced_address.clone()));
        options.rtcp_mux = s.rtcp_mux;
        options.comedia = s.comedia;

        let transport = router.create_plain_transport(options).await.map_err(rejected)?;
        let id = transport.id().to_string();

        let tuple = serde_json::to_value(transport.tuple()).map_err(rejected)?;
        let ip = tuple
            .get("localAddress")
            .or_else(|| tuple.get("localIp"))
            .and_then(|v| v.as_str())
            .and_then(|v| v.parse().ok())
            .unwrap_or(s.listen_ip);
        let port = tuple.get("localPort").and_then(|v| v.as_u64()).and_then(|p| u16::try_from(p).ok());
        let rtcp_port = match transport.rtcp_tuple() {
            Some(rtcp) => serde_json::to_value(rtcp)
                .ok()
                .and_then(|v| v.get("localPort").and_then(|p| p.as_u64()))
                .and_then(|p| u16::try_from(p).ok()),
            None => None,
        };

        transport.on_close(closed_event(&events, &id)).detach();

        let info = TransportInfo {
            id,
            ice_parameters: None,
            ice_candidates: Vec::new(),
            dtls_parameters: None,
            sctp_parameters: None,
            ip: Some(ip),
            port,
            rtcp_port,
        };
        Ok((HostedTransport::Plain(transport), info))
    }
}

#[async_trait]
impl MediaEngine for MediasoupEngine {
    async fn create_router(&self, room_id: &str, events: EngineEventSender) -> MediaResult<String> {
        let worker = self.pick_worker()?;
        let router = worker
            .create_router(RouterOptions::new(default_codecs()))
            .await
            .map_err(|e| MediaError::Unavailable(format!("Failed to create router: {e}")))?;
        let router_id = router.id().to_string();
        info!("Created router {} for room {} on worker {}", router_id, room_id, worker.id());
        self.handles()
            .routers
            .insert(router_id.clone(), HostedRouter { router, events });
        Ok(router_id)
    }

    async fn close_router(&self, router_id: &str) {
        let mut handles = self.handles();
        if handles.routers.remove(router_id).is_some() {
            let transports: Vec<String> = handles
                .transports
                .iter()
                .filter(|(_, (_, r))| r == router_id)
                .map(|(id, _)| id.clone())
                .collect();
            for id in transports {
                handles.transports.remove(&id);
            }
            debug!("Closed router {}", router_id);
        }
    }

    async fn router_rtp_capabilities(&self, router_id: &str) -> MediaResult<RtpCapabilities> {
        let (router, _) = self.router(router_id)?;
        Ok(RtpCapabilities(serde_json::to_value(router.rtp_capabilities()).map_err(rejected)?))
    }

    async fn create_transport(&self, router_id: &str, settings: &TransportSettings) -> MediaResult<TransportInfo> {
        let (router, events) = self.router(router_id)?;
        let (transport, info) = match settings {
            TransportSettings::WebRtc(s) => self.create_webrtc(&router, events, s).await?,
            TransportSettings::Plain(s) => self.create_plain(&router, events, s).await?,
        };
        self.handles()
            .transports
            .insert(info.id.clone(), (transport, router_id.to_string()));
        Ok(info)
    }

    async fn connect_transport(&self, transport_id: &str, remote: &RemoteParameters) -> MediaResult<()> {
        let (transport, _) = self.transport(transport_id)?;
        match (transport, remote) {
            (HostedTransport::WebRtc(t), RemoteParameters::WebRtc { dtls_parameters }) => t
                .connect(WebRtcTransportRemoteParameters {
                    dtls_parameters: convert(dtls_parameters)?,
                })
                .await
                .map_err(rejected),
            (HostedTransport::Plain(t), RemoteParameters::Plain { ip, port, rtcp_port }) => t
                .connect(PlainTransportRemoteParameters {
                    ip: Some(*ip),
                    port: Some(*port),
                    rtcp_port: *rtcp_port,
                    srtp_parameters: None,
                })
                .await
                .map_err(rejected),
            _ => Err(MediaError::Rejected(format!(
                "remote parameters do not match transport {transport_id}"
            ))),
        }
    }

    async fn restart_ice(&self, transport_id: &str) -> MediaResult<IceParameters> {
        match self.transport(transport_id)?.0 {
            HostedTransport::WebRtc(t) => convert(&t.restart_ice().await.map_err(rejected)?),
            HostedTransport::Plain(_) => Err(MediaError::Rejected("plain transports have no ICE".into())),
        }
    }

    async fn close_transport(&self, transport_id: &str) {
        if self.handles().transports.remove(transport_id).is_some() {
            debug!("Closed transport {}", transport_id);
        }
    }

    async fn produce(
        &self,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> MediaResult<String> {
        let (transport, events) = self.transport(transport_id)?;
        let options = ProducerOptions::new(to_mediasoup_kind(kind), convert(&rtp_parameters.0)?);
        let producer = transport.produce(options).await.map_err(MediaError::Rejected)?;
        let id = producer.id().to_string();

        producer
            .on_score({
                let events = events.clone();
                let id = id.clone();
                move |scores| {
                    if let Some(score) = scores.iter().map(|s| s.score).max() {
                        let _ = events.send(EngineEvent::ProducerScore {
                            producer_id: id.clone(),
                            score: StreamScore { score, producer_score: None },
                        });
                    }
                }
            })
            .detach();
        producer
            .on_close({
                let id = id.clone();
                move || {
                    let _ = events.send(EngineEvent::ProducerClosed { producer_id: id });
                }
            })
            .detach();

        self.handles().producers.insert(id.clone(), producer);
        Ok(id)
    }

    async fn pause_producer(&self, producer_id: &str) -> MediaResult<()> {
        self.producer(producer_id)?.pause().await.map_err(rejected)
    }

    async fn resume_producer(&self, producer_id: &str) -> MediaResult<()> {
        self.producer(producer_id)?.resume().await.map_err(rejected)
    }

    async fn close_producer(&self, producer_id: &str) {
        self.handles().producers.remove(producer_id);
    }

    async fn consume(
        &self,
        transport_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
    ) -> MediaResult<ConsumerParams> {
        let (transport, events) = self.transport(transport_id)?;
        let producer_ref: ProducerId = producer_id
            .parse()
            .map_err(|_| MediaError::UnknownHandle(format!("producer {producer_id}")))?;
        let options = ConsumerOptions::new(producer_ref, convert(&rtp_capabilities.0)?);
        let consumer = transport.consume(options).await.map_err(MediaError::Rejected)?;
        let id = consumer.id().to_string();

        consumer
            .on_score({
                let id = id.clone();
                move |score| {
                    let _ = events.send(EngineEvent::ConsumerScore {
                        consumer_id: id.clone(),
                        score: StreamScore {
                            score: score.score,
                            producer_score: Some(score.producer_score),
                        },
                    });
                }
            })
            .detach();

        let params = ConsumerParams {
            id: id.clone(),
            kind: from_mediasoup_kind(consumer.kind()),
            rtp_parameters: RtpParameters(serde_json::to_value(consumer.rtp_parameters()).map_err(rejected)?),
            producer_paused: consumer.producer_paused(),
        };
        self.handles().consumers.insert(id, consumer);
        Ok(params)
    }

    async fn pause_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        self.consumer(consumer_id)?.pause().await.map_err(rejected)
    }

    async fn resume_consumer(&self, consumer_id: &str) -> MediaResult<()> {
        self.consumer(consumer_id)?.resume().await.map_err(rejected)
    }

    async fn close_consumer(&self, consumer_id: &str) {
        self.handles().consumers.remove(consumer_id);
    }
}
