#![forbid(unsafe_code)]

// Peer resource tree and the peer-scoped operations on it.
//
// Every operation here runs with the room read lock held and the peer's own
// mutex locked. Cascades that reach other peers (closing their consumers of a
// producer) are handed back to the room and run after this peer is unlocked.

use crate::error::{SignalError, SignalResult};
use crate::media::config::TransportOptions;
use crate::media::types::{
    ConsumerParams, IceParameters, MediaError, MediaKind, RemoteParameters, RtpCapabilities, RtpParameters,
    TransportInfo, TransportKind,
};
use crate::room::ledger::RetiredProducer;
use crate::room::resources::{Consumer, Producer, ResourceState, Transport, TransportState};
use crate::room::{PeerResourceCounts, Room};
use crate::signaling::protocol::{Notification, ResumedSession};
use std::collections::HashMap;
use tracing::{debug, info, warn};

pub struct Peer {
    id: String,
    transports: HashMap<String, Transport>,
    producers: HashMap<String, Producer>,
    consumers: HashMap<String, Consumer>,
}

/// Consumer created by `consume`, as returned to the client
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerCreated {
    pub params: ConsumerParams,
    pub producer_id: String,
    pub transport_id: String,
}

fn sorted_ids<'a>(ids: impl Iterator<Item = &'a String>) -> Vec<String> {
    let mut ids: Vec<String> = ids.cloned().collect();
    ids.sort();
    ids
}

impl Peer {
    pub fn new(id: String) -> Self {
        Self {
            id,
            transports: HashMap::new(),
            producers: HashMap::new(),
            consumers: HashMap::new(),
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn transport_state(&self, transport_id: &str) -> Option<TransportState> {
        self.transports.get(transport_id).map(|t| t.state)
    }

    pub fn producer_state(&self, producer_id: &str) -> Option<ResourceState> {
        self.producers.get(producer_id).map(|p| p.state)
    }

    pub fn consumer_state(&self, consumer_id: &str) -> Option<ResourceState> {
        self.consumers.get(consumer_id).map(|c| c.state)
    }

    pub fn open_counts(&self) -> PeerResourceCounts {
        PeerResourceCounts {
            transports: self.transports.values().filter(|t| !t.is_closed()).count(),
            producers: self.producers.values().filter(|p| !p.is_closed()).count(),
            consumers: self.consumers.values().filter(|c| !c.is_closed()).count(),
        }
    }

    pub fn open_resources(&self) -> ResumedSession {
        ResumedSession {
            transport_ids: sorted_ids(self.transports.values().filter(|t| !t.is_closed()).map(|t| &t.id)),
            producer_ids: sorted_ids(self.producers.values().filter(|p| !p.is_closed()).map(|p| &p.id)),
            consumer_ids: sorted_ids(self.consumers.values().filter(|c| !c.is_closed()).map(|c| &c.id)),
        }
    }

    fn owned_transport(&mut self, transport_id: &str) -> SignalResult<&mut Transport> {
        let transport = self
            .transports
            .get_mut(transport_id)
            .ok_or_else(|| SignalError::UnknownTransport(transport_id.to_string()))?;
        transport.ensure_open()?;
        Ok(transport)
    }

    fn owned_producer(&mut self, producer_id: &str) -> SignalResult<&mut Producer> {
        let producer = self
            .producers
            .get_mut(producer_id)
            .ok_or_else(|| SignalError::ProducerNotFound(producer_id.to_string()))?;
        producer.ensure_open()?;
        Ok(producer)
    }

    fn owned_consumer(&mut self, consumer_id: &str) -> SignalResult<&mut Consumer> {
        let consumer = self
            .consumers
            .get_mut(consumer_id)
            .ok_or_else(|| SignalError::ConsumerNotFound(consumer_id.to_string()))?;
        consumer.ensure_open()?;
        Ok(consumer)
    }

    // --- Closing (shared by explicit requests, cascades and engine events) ---

    /// Closes a consumer if it is still open. Returns true if this call closed it.
    pub(crate) async fn close_consumer_entry(&mut self, room: &Room, consumer_id: &str) -> bool {
        let Some(consumer) = self.consumers.get_mut(consumer_id) else {
            return false;
        };
        if consumer.is_closed() {
            return false;
        }
        let release = consumer.close();
        room.publish(|ledger, _| ledger.detach_consumer(consumer_id));
        if release {
            room.engine().close_consumer(consumer_id).await;
        }
        true
    }

    /// Closes a producer if it is still open: ledger entry, `producerClosed`
    /// broadcast, engine handle. The consumers to cascade to are returned.
    pub(crate) async fn close_producer_entry(
        &mut self,
        room: &Room,
        producer_id: &str,
        exclude: Option<&str>,
    ) -> Option<RetiredProducer> {
        let producer = self.producers.get_mut(producer_id)?;
        if producer.is_closed() {
            return None;
        }
        let release = producer.close();
        let retired = room.retire_producer(producer_id, exclude);
        if release {
            room.engine().close_producer(producer_id).await;
        }
        debug!("Producer {} of peer {} closed", producer_id, self.id);
        retired
    }

    /// Closes a transport together with the producers and consumers on it.
    /// Returns None if it was already closed.
    pub(crate) async fn close_transport_entry(
        &mut self,
        room: &Room,
        transport_id: &str,
        exclude: Option<&str>,
    ) -> Option<Vec<RetiredProducer>> {
        let transport = self.transports.get_mut(transport_id)?;
        if transport.is_closed() {
            return None;
        }
        let release = transport.close();

        let producer_ids: Vec<String> = self
            .producers
            .values()
            .filter(|p| p.transport_id == transport_id && !p.is_closed())
            .map(|p| p.id.clone())
            .collect();
        let consumer_ids: Vec<String> = self
            .consumers
            .values()
            .filter(|c| c.transport_id == transport_id && !c.is_closed())
            .map(|c| c.id.clone())
            .collect();

        let mut retired = Vec::with_capacity(producer_ids.len());
        for producer_id in producer_ids {
            if let Some(r) = self.close_producer_entry(room, &producer_id, exclude).await {
                retired.push(r);
            }
        }
        for consumer_id in consumer_ids {
            self.close_consumer_entry(room, &consumer_id).await;
        }

        room.publish(|ledger, _| ledger.forget_transport(transport_id));
        if release {
            room.engine().close_transport(transport_id).await;
        }
        debug!("Transport {} of peer {} closed", transport_id, self.id);
        Some(retired)
    }

    /// Closes everything the peer owns
    pub(crate) async fn close_all(&mut self, room: &Room) -> Vec<RetiredProducer> {
        let mut retired = Vec::new();
        for transport_id in sorted_ids(self.transports.keys()) {
            if let Some(mut r) = self.close_transport_entry(room, &transport_id, None).await {
                retired.append(&mut r);
            }
        }
        // Producers and consumers always sit on one of the peer's transports;
        // this only catches entries whose transport was dropped engine-side.
        for producer_id in sorted_ids(self.producers.keys()) {
            if let Some(r) = self.close_producer_entry(room, &producer_id, None).await {
                retired.push(r);
            }
        }
        for consumer_id in sorted_ids(self.consumers.keys()) {
            self.close_consumer_entry(room, &consumer_id).await;
        }
        retired
    }

    // --- Transports ---

    pub async fn create_transport(
        &mut self,
        room: &Room,
        kind: TransportKind,
        options: &TransportOptions,
    ) -> SignalResult<TransportInfo> {
        let settings = options.resolve(kind, &room.settings().media)?;
        let router_id = room.router_id()?;
        let info = room
            .engine()
            .create_transport(router_id, &settings)
            .await
            .map_err(SignalError::TransportCreationFailed)?;

        if self.transports.contains_key(&info.id) {
            room.engine().close_transport(&info.id).await;
            return Err(SignalError::TransportCreationFailed(MediaError::Rejected(format!(
                "engine reused transport id {}",
                info.id
            ))));
        }
        self.transports
            .insert(info.id.clone(), Transport::new(info.id.clone(), kind));
        room.publish(|ledger, _| ledger.register_transport(&info.id, &self.id));
        debug!("Peer {} created {:?} transport {}", self.id, kind, info.id);
        Ok(info)
    }

    /// Created -> Connecting -> Connected, bounded by the connect timeout.
    ///
    /// On engine failure the transport returns to Created so the client can
    /// retry; on timeout it is closed.
    pub async fn connect_transport(
        &mut self,
        room: &Room,
        transport_id: &str,
        remote: &RemoteParameters,
    ) -> SignalResult<()> {
        let transport = self.owned_transport(transport_id)?;
        let remote_is_webrtc = matches!(remote, RemoteParameters::WebRtc { .. });
        if transport.kind.is_webrtc() != remote_is_webrtc {
            return Err(SignalError::Validation(format!(
                "remote parameters do not match {:?} transport {}",
                transport.kind, transport_id
            )));
        }
        transport.begin_connect()?;

        let timeout = room.settings().transport_connect_timeout;
        let outcome = tokio::time::timeout(timeout, room.engine().connect_transport(transport_id, remote)).await;

        match outcome {
            Ok(Ok(())) => {
                if let Some(transport) = self.transports.get_mut(transport_id) {
                    transport.finish_connect();
                }
                debug!("Transport {} of peer {} connected", transport_id, self.id);
                Ok(())
            }
            Ok(Err(e)) => {
                if let Some(transport) = self.transports.get_mut(transport_id) {
                    transport.abort_connect();
                }
                warn!("Engine refused to connect transport {}: {}", transport_id, e);
                Err(SignalError::Engine(e))
            }
            Err(_) => {
                room.metrics().inc_connect_timeouts();
                warn!("Transport {} of peer {} did not connect within {:?}", transport_id, self.id, timeout);
                // A transport that never connected hosts no producers, so nothing cascades
                let retired = self.close_transport_entry(room, transport_id, None).await;
                debug_assert!(retired.map_or(true, |r| r.is_empty()));
                Err(SignalError::TransportConnectTimeout {
                    transport_id: transport_id.to_string(),
                    timeout,
                })
            }
        }
    }

    pub async fn restart_ice(&mut self, room: &Room, transport_id: &str) -> SignalResult<IceParameters> {
        let transport = self.owned_transport(transport_id)?;
        if !transport.kind.is_webrtc() {
            return Err(SignalError::Validation(format!(
                "transport {transport_id} is plain RTP, ICE restart does not apply"
            )));
        }
        Ok(room.engine().restart_ice(transport_id).await?)
    }

    pub async fn close_transport(&mut self, room: &Room, transport_id: &str) -> SignalResult<Vec<RetiredProducer>> {
        self.owned_transport(transport_id)?;
        let peer_id = self.id.clone();
        Ok(self
            .close_transport_entry(room, transport_id, Some(peer_id.as_str()))
            .await
            .unwrap_or_default())
    }

    // --- Producers ---

    /// Creates a producer on a connected sending transport and announces it
    /// to every other peer
    pub async fn produce(
        &mut self,
        room: &Room,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> SignalResult<String> {
        let transport = self.owned_transport(transport_id)?;
        if !transport.kind.can_send() {
            return Err(SignalError::Validation(format!(
                "transport {transport_id} is a receive transport"
            )));
        }
        if transport.state != TransportState::Connected {
            return Err(SignalError::InvalidState(format!(
                "transport {transport_id} is {:?}, expected Connected",
                transport.state
            )));
        }

        let producer_id = room.engine().produce(transport_id, kind, rtp_parameters).await?;
        let registered = room.publish(|ledger, out| {
            if !ledger.register_producer(&producer_id, &self.id, kind) {
                return false;
            }
            out.broadcast(
                &Notification::NewProducer {
                    producer_id: producer_id.clone(),
                    peer_id: self.id.clone(),
                    kind,
                },
                Some(self.id.as_str()),
            );
            true
        });
        if !registered {
            room.engine().close_producer(&producer_id).await;
            return Err(SignalError::Engine(MediaError::Rejected(format!(
                "engine reused producer id {producer_id}"
            ))));
        }

        self.producers.insert(
            producer_id.clone(),
            Producer::new(producer_id.clone(), transport_id.to_string(), self.id.clone(), kind),
        );
        room.metrics().inc_producers_created();
        info!("Peer {} producing {} ({})", self.id, kind, producer_id);
        Ok(producer_id)
    }

    pub async fn close_producer(&mut self, room: &Room, producer_id: &str) -> SignalResult<Option<RetiredProducer>> {
        self.owned_producer(producer_id)?;
        let peer_id = self.id.clone();
        Ok(self.close_producer_entry(room, producer_id, Some(peer_id.as_str())).await)
    }

    /// Open <-> Paused. Setting the current state again is a no-op.
    pub async fn set_producer_paused(&mut self, room: &Room, producer_id: &str, paused: bool) -> SignalResult<()> {
        let producer = self.owned_producer(producer_id)?;
        let target = if paused { ResourceState::Paused } else { ResourceState::Open };
        if producer.state == target {
            return Ok(());
        }
        if paused {
            room.engine().pause_producer(producer_id).await?;
        } else {
            room.engine().resume_producer(producer_id).await?;
        }
        if let Some(producer) = self.producers.get_mut(producer_id) {
            producer.state = target;
        }

        let notification = if paused {
            Notification::ProducerPaused {
                producer_id: producer_id.to_string(),
            }
        } else {
            Notification::ProducerResumed {
                producer_id: producer_id.to_string(),
            }
        };
        room.publish(|ledger, out| {
            if ledger.set_paused(producer_id, paused) {
                out.broadcast(&notification, Some(self.id.as_str()));
            }
        });
        Ok(())
    }

    // --- Consumers ---

    /// Picks the receive transport a new consumer binds to
    fn receive_transport(&self, requested: Option<&str>) -> SignalResult<String> {
        if let Some(transport_id) = requested {
            let transport = self
                .transports
                .get(transport_id)
                .ok_or_else(|| SignalError::UnknownTransport(transport_id.to_string()))?;
            transport.ensure_open()?;
            if !transport.kind.can_receive() {
                return Err(SignalError::Validation(format!(
                    "transport {transport_id} is a send transport"
                )));
            }
            return Ok(transport_id.to_string());
        }

        let mut candidates: Vec<&Transport> = self
            .transports
            .values()
            .filter(|t| t.kind.can_receive() && !t.is_closed())
            .collect();
        // Prefer connected transports, then the oldest-looking id for determinism
        candidates.sort_by_key(|t| (t.state != TransportState::Connected, t.id.clone()));
        candidates
            .first()
            .map(|t| t.id.clone())
            .ok_or_else(|| SignalError::InvalidState(format!("peer {} has no receive transport", self.id)))
    }

    /// Creates a consumer of another peer's open producer in the same room
    pub async fn consume(
        &mut self,
        room: &Room,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        transport_id: Option<&str>,
    ) -> SignalResult<ConsumerCreated> {
        // Unknown or closed producers are NotFound whatever else is wrong with the request
        let producer = room
            .publish(|ledger, _| ledger.lookup(producer_id))
            .ok_or_else(|| SignalError::ProducerNotFound(producer_id.to_string()))?;
        if producer.owner == self.id {
            return Err(SignalError::Validation(format!(
                "peer {} cannot consume its own producer {producer_id}",
                self.id
            )));
        }
        let limit = room.settings().max_consumers_per_peer;
        if self.open_counts().consumers >= limit {
            return Err(SignalError::LimitExceeded(format!(
                "peer {} already holds {limit} consumers",
                self.id
            )));
        }
        let transport_id = self.receive_transport(transport_id)?;

        let params = match room.engine().consume(&transport_id, producer_id, rtp_capabilities).await {
            Ok(params) => params,
            Err(e) => {
                // The producer may have gone away while the engine was working
                if !room.publish(|ledger, _| ledger.is_open(producer_id)) {
                    return Err(SignalError::ProducerNotFound(producer_id.to_string()));
                }
                return Err(SignalError::Engine(e));
            }
        };

        if self.consumers.contains_key(&params.id) {
            room.engine().close_consumer(&params.id).await;
            return Err(SignalError::Engine(MediaError::Rejected(format!(
                "engine reused consumer id {}",
                params.id
            ))));
        }
        let attached = room.publish(|ledger, _| ledger.attach_consumer(producer_id, &params.id, &self.id));
        if !attached {
            room.engine().close_consumer(&params.id).await;
            return Err(SignalError::ProducerNotFound(producer_id.to_string()));
        }

        self.consumers.insert(
            params.id.clone(),
            Consumer::new(
                params.id.clone(),
                producer_id.to_string(),
                transport_id.clone(),
                self.id.clone(),
                params.kind,
            ),
        );
        room.metrics().inc_consumers_created();
        debug!("Peer {} consuming {} as {}", self.id, producer_id, params.id);
        Ok(ConsumerCreated {
            params,
            producer_id: producer_id.to_string(),
            transport_id,
        })
    }

    pub async fn close_consumer(&mut self, room: &Room, consumer_id: &str) -> SignalResult<()> {
        self.owned_consumer(consumer_id)?;
        self.close_consumer_entry(room, consumer_id).await;
        Ok(())
    }

    pub async fn set_consumer_paused(&mut self, room: &Room, consumer_id: &str, paused: bool) -> SignalResult<()> {
        let consumer = self.owned_consumer(consumer_id)?;
        let target = if paused { ResourceState::Paused } else { ResourceState::Open };
        if consumer.state == target {
            return Ok(());
        }
        if paused {
            room.engine().pause_consumer(consumer_id).await?;
        } else {
            room.engine().resume_consumer(consumer_id).await?;
        }
        if let Some(consumer) = self.consumers.get_mut(consumer_id) {
            consumer.state = target;
        }
        Ok(())
    }
}

/// Peer-scoped entry points: lock the peer, run the operation, then run any
/// cascade with the peer unlocked
impl Room {
    pub async fn router_rtp_capabilities(&self) -> SignalResult<RtpCapabilities> {
        let router_id = self.router_id()?;
        Ok(self.engine().router_rtp_capabilities(router_id).await?)
    }

    pub async fn create_transport(
        &self,
        peer_id: &str,
        kind: TransportKind,
        options: &TransportOptions,
    ) -> SignalResult<TransportInfo> {
        let handle = self.peer(peer_id)?;
        let mut peer = handle.lock().await;
        peer.create_transport(self, kind, options).await
    }

    pub async fn connect_transport(
        &self,
        peer_id: &str,
        transport_id: &str,
        remote: &RemoteParameters,
    ) -> SignalResult<()> {
        let handle = self.peer(peer_id)?;
        let mut peer = handle.lock().await;
        peer.connect_transport(self, transport_id, remote).await
    }

    pub async fn restart_ice(&self, peer_id: &str, transport_id: &str) -> SignalResult<IceParameters> {
        let handle = self.peer(peer_id)?;
        let mut peer = handle.lock().await;
        peer.restart_ice(self, transport_id).await
    }

    pub async fn close_transport(&self, peer_id: &str, transport_id: &str) -> SignalResult<()> {
        let retired = {
            let handle = self.peer(peer_id)?;
            let mut peer = handle.lock().await;
            peer.close_transport(self, transport_id).await?
        };
        self.close_dependents(&retired).await;
        Ok(())
    }

    pub async fn produce(
        &self,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: &RtpParameters,
    ) -> SignalResult<String> {
        let handle = self.peer(peer_id)?;
        let mut peer = handle.lock().await;
        peer.produce(self, transport_id, kind, rtp_parameters).await
    }

    /// Closes a producer and every consumer of it across the room
    pub async fn close_producer(&self, peer_id: &str, producer_id: &str) -> SignalResult<()> {
        let retired = {
            let handle = self.peer(peer_id)?;
            let mut peer = handle.lock().await;
            peer.close_producer(self, producer_id).await?
        };
        if let Some(retired) = retired {
            self.close_dependents(std::slice::from_ref(&retired)).await;
        }
        Ok(())
    }

    pub async fn pause_producer(&self, peer_id: &str, producer_id: &str) -> SignalResult<()> {
        let handle = self.peer(peer_id)?;
        let mut peer = handle.lock().await;
        peer.set_producer_paused(self, producer_id, true).await
    }

    pub async fn resume_producer(&self, peer_id: &str, producer_id: &str) -> SignalResult<()> {
        let handle = self.peer(peer_id)?;
        let mut peer = handle.lock().await;
        peer.set_producer_paused(self, producer_id, false).await
    }

    pub async fn consume(
        &self,
        peer_id: &str,
        producer_id: &str,
        rtp_capabilities: &RtpCapabilities,
        transport_id: Option<&str>,
    ) -> SignalResult<ConsumerCreated> {
        let handle = self.peer(peer_id)?;
        let mut peer = handle.lock().await;
        peer.consume(self, producer_id, rtp_capabilities, transport_id).await
    }

    pub async fn close_consumer(&self, peer_id: &str, consumer_id: &str) -> SignalResult<()> {
        let handle = self.peer(peer_id)?;
        let mut peer = handle.lock().await;
        peer.close_consumer(self, consumer_id).await
    }

    pub async fn pause_consumer(&self, peer_id: &str, consumer_id: &str) -> SignalResult<()> {
        let handle = self.peer(peer_id)?;
        let mut peer = handle.lock().await;
        peer.set_consumer_paused(self, consumer_id, true).await
    }

    pub async fn resume_consumer(&self, peer_id: &str, consumer_id: &str) -> SignalResult<()> {
        let handle = self.peer(peer_id)?;
        let mut peer = handle.lock().await;
        peer.set_consumer_paused(self, consumer_id, false).await
    }

    pub async fn transport_state(&self, peer_id: &str, transport_id: &str) -> Option<TransportState> {
        let handle = self.peer(peer_id).ok()?;
        let peer = handle.lock().await;
        peer.transport_state(transport_id)
    }

    pub async fn producer_state(&self, peer_id: &str, producer_id: &str) -> Option<ResourceState> {
        let handle = self.peer(peer_id).ok()?;
        let peer = handle.lock().await;
        peer.producer_state(producer_id)
    }

    pub async fn consumer_state(&self, peer_id: &str, consumer_id: &str) -> Option<ResourceState> {
        let handle = self.peer(peer_id).ok()?;
        let peer = handle.lock().await;
        peer.consumer_state(consumer_id)
    }
}
