#![forbid(unsafe_code)]

// Room module - one media router per room, the peers in it and the events between them
pub mod ledger;
pub mod peer;
pub mod registry;
pub mod resources;
pub mod settings;

use crate::error::{SignalError, SignalResult};
use crate::media::engine::{EngineEvent, MediaEngine};
use crate::media::handle::RouterHandle;
use crate::metrics::ServerMetrics;
use crate::signaling::protocol::{Notification, PeerSummary, ProducerSummary, ResumedSession};
use ledger::{Ledger, RetiredProducer};
use peer::Peer;
use settings::RoomSettings;
use std::collections::HashMap;
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};
use tokio::sync::mpsc;
use tokio::sync::Mutex as TokioMutex;
use tokio::sync::RwLock as TokioRwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

pub use registry::RoomRegistry;

/// Outbound channel of a peer's connection. Frames are serialized once and shared.
pub type PeerSender = mpsc::Sender<Arc<String>>;

/// Collaborators every room needs
#[derive(Clone)]
pub struct RoomServices {
    pub engine: Arc<dyn MediaEngine>,
    pub settings: Arc<RoomSettings>,
    pub metrics: ServerMetrics,
}

impl RoomServices {
    pub fn new(engine: Arc<dyn MediaEngine>, settings: RoomSettings, metrics: ServerMetrics) -> Self {
        Self {
            engine,
            settings: Arc::new(settings),
            metrics,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Connected,
    /// Connection lost; resources kept until the grace period ends
    Disconnected,
}

/// Membership record of a peer. The resource tree sits behind its own mutex
/// so operations of different peers do not serialize on each other.
pub(crate) struct PeerSlot {
    peer: Arc<TokioMutex<Peer>>,
    sender: PeerSender,
    state: ConnectionState,
    /// Bumped on every (re)connect; a grace timer only acts on the session it was armed for
    session: u64,
    grace_timer: Option<JoinHandle<()>>,
}

/// Open resource counts of one peer
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PeerResourceCounts {
    pub transports: usize,
    pub producers: usize,
    pub consumers: usize,
}

/// Room state
pub struct Room {
    id: String,
    router: Option<RouterHandle>,
    closed: bool,
    peers: HashMap<String, PeerSlot>,
    ledger: StdMutex<Ledger>,
    services: RoomServices,
}

/// Sends notifications while the ledger lock is held, so delivery order
/// matches the order ledger changes were made in
pub(crate) struct Outbox<'a> {
    room: &'a Room,
}

impl Outbox<'_> {
    pub fn broadcast(&self, notification: &Notification, exclude: Option<&str>) {
        self.room.deliver(notification, |id| Some(id) != exclude);
    }

    pub fn send_to(&self, peer_id: &str, notification: &Notification) {
        self.room.deliver(notification, |id| id == peer_id);
    }
}

impl Room {
    fn new(id: String, services: RoomServices) -> Self {
        Self {
            id,
            router: None,
            closed: false,
            peers: HashMap::new(),
            ledger: StdMutex::new(Ledger::new()),
            services,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }

    pub(crate) fn engine(&self) -> &Arc<dyn MediaEngine> {
        &self.services.engine
    }

    pub(crate) fn settings(&self) -> &RoomSettings {
        &self.services.settings
    }

    pub(crate) fn metrics(&self) -> &ServerMetrics {
        &self.services.metrics
    }

    /// Engine id of the room's router while it is live
    pub fn router_id(&self) -> SignalResult<&str> {
        match &self.router {
            Some(handle) if handle.is_live() => Ok(handle.id()),
            _ => Err(SignalError::InvalidState(format!("room {} has no live router", self.id))),
        }
    }

    pub fn has_router(&self) -> bool {
        self.router.as_ref().is_some_and(|h| h.is_live())
    }

    pub fn peer_count(&self) -> usize {
        self.peers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn has_peer(&self, peer_id: &str) -> bool {
        self.peers.contains_key(peer_id)
    }

    pub fn peer_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.peers.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn connection_state(&self, peer_id: &str) -> Option<ConnectionState> {
        self.peers.get(peer_id).map(|s| s.state)
    }

    pub fn disconnected_count(&self) -> usize {
        self.peers
            .values()
            .filter(|s| s.state == ConnectionState::Disconnected)
            .count()
    }

    pub(crate) fn peer(&self, peer_id: &str) -> SignalResult<Arc<TokioMutex<Peer>>> {
        self.peers
            .get(peer_id)
            .map(|slot| slot.peer.clone())
            .ok_or_else(|| SignalError::PeerNotFound(peer_id.to_string()))
    }

    /// Open resources held by a peer
    pub async fn peer_resources(&self, peer_id: &str) -> SignalResult<PeerResourceCounts> {
        let handle = self.peer(peer_id)?;
        let peer = handle.lock().await;
        Ok(peer.open_counts())
    }

    // --- Publishing ---

    fn deliver(&self, notification: &Notification, include: impl Fn(&str) -> bool) {
        let frame = match notification.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                warn!("Failed to serialize {} notification: {}", notification.method(), e);
                return;
            }
        };
        let mut delivered = 0;
        for (id, slot) in &self.peers {
            if !include(id) {
                continue;
            }
            match slot.sender.try_send(frame.clone()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    warn!("Channel full for peer {} in room {}, dropping {}", id, self.id, notification.method());
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!("Channel closed for peer {} in room {} (disconnected)", id, self.id);
                }
            }
        }
        self.services.metrics.inc_notifications(delivered);
    }

    /// Runs a ledger change and the notifications it causes as one step
    pub(crate) fn publish<R>(&self, step: impl FnOnce(&mut Ledger, &Outbox<'_>) -> R) -> R {
        let mut ledger = self.ledger.lock().unwrap_or_else(|e| e.into_inner());
        step(&mut ledger, &Outbox { room: self })
    }

    /// Sends a notification to every peer except `exclude`
    pub fn broadcast(&self, notification: &Notification, exclude: Option<&str>) {
        self.publish(|_, out| out.broadcast(notification, exclude));
    }

    pub fn send_to(&self, peer_id: &str, notification: &Notification) {
        self.publish(|_, out| out.send_to(peer_id, notification));
    }

    /// Open producers of every other peer, grouped by peer
    fn snapshot_for(&self, peer_id: &str) -> Vec<PeerSummary> {
        let views = self.publish(|ledger, _| ledger.visible_to(peer_id));
        let mut peers: Vec<PeerSummary> = self
            .peer_ids()
            .into_iter()
            .filter(|id| id != peer_id)
            .map(|id| PeerSummary {
                peer_id: id,
                producers: Vec::new(),
            })
            .collect();
        for view in views {
            if let Some(summary) = peers.iter_mut().find(|p| p.peer_id == view.owner) {
                summary.producers.push(ProducerSummary {
                    producer_id: view.producer_id,
                    kind: view.kind,
                    paused: view.paused,
                });
            }
        }
        peers
    }

    // --- Router lifecycle (write lock) ---

    /// Allocates the room's router. Called once, by the task that created the room.
    async fn open_router(&mut self) -> SignalResult<mpsc::UnboundedReceiver<EngineEvent>> {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let router_id = self
            .services
            .engine
            .create_router(&self.id, events_tx)
            .await
            .map_err(|source| SignalError::RoomCreationFailed {
                room_id: self.id.clone(),
                source,
            })?;
        info!("Room {} opened with router {}", self.id, router_id);
        self.router = Some(RouterHandle::new(router_id));
        self.services.metrics.inc_rooms_created();
        Ok(events_rx)
    }

    /// Closes the room if nobody is in it. Returns true if this call closed it.
    async fn close_if_empty(&mut self) -> bool {
        if self.closed || !self.peers.is_empty() {
            return false;
        }
        self.closed = true;
        if let Some(router) = self.router.as_mut() {
            if router.release() {
                self.services.engine.close_router(router.id()).await;
                debug!("Released router {} of room {}", router.id(), self.id);
            }
        }
        self.services.metrics.inc_rooms_closed();
        info!("Room {} is empty, closed", self.id);
        true
    }

    // --- Membership (write lock) ---

    /// Adds a new peer and announces it. Returns the join snapshot.
    fn add_peer(&mut self, peer_id: &str, sender: PeerSender, session: u64) -> SignalResult<Vec<PeerSummary>> {
        if self.closed {
            return Err(SignalError::InvalidState(format!("room {} is closed", self.id)));
        }
        if self.peers.contains_key(peer_id) {
            return Err(SignalError::InvalidState(format!(
                "peer {peer_id} is already connected to room {}",
                self.id
            )));
        }
        self.peers.insert(
            peer_id.to_string(),
            PeerSlot {
                peer: Arc::new(TokioMutex::new(Peer::new(peer_id.to_string()))),
                sender,
                state: ConnectionState::Connected,
                session,
                grace_timer: None,
            },
        );
        self.broadcast(
            &Notification::PeerJoined {
                peer_id: peer_id.to_string(),
            },
            Some(peer_id),
        );
        info!("Peer {} joined room {}", peer_id, self.id);
        Ok(self.snapshot_for(peer_id))
    }

    /// Rebinds a disconnected peer to a new connection, cancelling its grace timer
    async fn resume_peer(
        &mut self,
        peer_id: &str,
        sender: PeerSender,
        session: u64,
    ) -> SignalResult<(Vec<PeerSummary>, ResumedSession)> {
        let slot = self
            .peers
            .get_mut(peer_id)
            .ok_or_else(|| SignalError::PeerNotFound(peer_id.to_string()))?;
        if slot.state == ConnectionState::Connected {
            return Err(SignalError::InvalidState(format!(
                "peer {peer_id} is already connected to room {}",
                self.id
            )));
        }
        if let Some(timer) = slot.grace_timer.take() {
            timer.abort();
        }
        slot.state = ConnectionState::Connected;
        slot.session = session;
        slot.sender = sender;
        let peer = slot.peer.clone();
        let resumed = peer.lock().await.open_resources();
        info!("Peer {} reconnected to room {}", peer_id, self.id);
        Ok((self.snapshot_for(peer_id), resumed))
    }

    /// Marks a peer disconnected if `session` is still its current connection
    fn mark_disconnected(&mut self, peer_id: &str, session: u64) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(slot) if slot.session == session && slot.state == ConnectionState::Connected => {
                slot.state = ConnectionState::Disconnected;
                true
            }
            _ => false,
        }
    }

    fn arm_grace_timer(&mut self, peer_id: &str, timer: JoinHandle<()>) {
        match self.peers.get_mut(peer_id) {
            Some(slot) => {
                if let Some(previous) = slot.grace_timer.replace(timer) {
                    previous.abort();
                }
            }
            None => timer.abort(),
        }
    }

    /// Decides whether a fired grace timer still applies. Detaches (without
    /// aborting) the calling timer's own handle when it does.
    fn claim_expired(&mut self, peer_id: &str, session: u64) -> bool {
        match self.peers.get_mut(peer_id) {
            Some(slot) if slot.session == session && slot.state == ConnectionState::Disconnected => {
                slot.grace_timer.take();
                true
            }
            _ => false,
        }
    }

    fn session_of(&self, peer_id: &str) -> Option<u64> {
        self.peers.get(peer_id).map(|s| s.session)
    }

    /// Removes a peer: detach from the broadcast set, release its resources,
    /// cascade-close other peers' consumers of its producers, announce `peerLeft`.
    async fn remove_peer(&mut self, peer_id: &str) -> bool {
        let Some(mut slot) = self.peers.remove(peer_id) else {
            return false;
        };
        if let Some(timer) = slot.grace_timer.take() {
            timer.abort();
        }

        let retired = {
            let mut peer = slot.peer.lock().await;
            peer.close_all(self).await
        };
        self.publish(|ledger, _| ledger.forget_peer(peer_id));
        let cascaded = self.close_dependents(&retired).await;

        self.broadcast(
            &Notification::PeerLeft {
                peer_id: peer_id.to_string(),
            },
            None,
        );
        self.services.metrics.inc_leaves();
        info!(
            "Peer {} left room {} ({} producers closed, {} remote consumers closed)",
            peer_id,
            self.id,
            retired.len(),
            cascaded
        );
        true
    }

    /// Removes every peer without grace, then closes the router
    async fn close_all_peers(&mut self) {
        for peer_id in self.peer_ids() {
            self.remove_peer(&peer_id).await;
        }
        self.close_if_empty().await;
    }

    // --- Cascades (read lock is enough) ---

    /// Removes producers from the ledger and announces them closed.
    /// Returns what is left to cascade.
    pub(crate) fn retire_producer(&self, producer_id: &str, exclude: Option<&str>) -> Option<RetiredProducer> {
        self.publish(|ledger, out| {
            let retired = ledger.retire_producer(producer_id)?;
            out.broadcast(
                &Notification::ProducerClosed {
                    producer_id: producer_id.to_string(),
                },
                exclude,
            );
            Some(retired)
        })
    }

    /// Closes consumers of retired producers, locking one consuming peer at a time.
    /// Returns how many consumers this call closed.
    pub(crate) async fn close_dependents(&self, retired: &[RetiredProducer]) -> usize {
        let mut closed = 0;
        for producer in retired {
            for (consumer_id, peer_id) in &producer.consumers {
                let Some(slot) = self.peers.get(peer_id) else {
                    continue;
                };
                let handle = slot.peer.clone();
                let mut peer = handle.lock().await;
                if peer.close_consumer_entry(self, consumer_id).await {
                    closed += 1;
                    self.send_to(
                        peer_id,
                        &Notification::ConsumerClosed {
                            consumer_id: consumer_id.clone(),
                            producer_id: producer.producer_id.clone(),
                        },
                    );
                }
            }
        }
        if closed > 0 {
            self.services.metrics.inc_cascade_closed_consumers(closed as u64);
        }
        closed
    }

    // --- Engine events ---

    async fn handle_engine_event(&self, event: EngineEvent) {
        match event {
            EngineEvent::TransportClosed { transport_id } => {
                let owner = self.publish(|ledger, _| ledger.transport_owner(&transport_id).map(str::to_string));
                let Some(owner) = owner else { return };
                let Ok(handle) = self.peer(&owner) else { return };
                let retired = {
                    let mut peer = handle.lock().await;
                    match peer.close_transport_entry(self, &transport_id, None).await {
                        Some(retired) => retired,
                        None => return,
                    }
                };
                warn!("Engine closed transport {} of peer {} in room {}", transport_id, owner, self.id);
                self.send_to(&owner, &Notification::TransportClosed { transport_id });
                self.close_dependents(&retired).await;
            }
            EngineEvent::ProducerClosed { producer_id } => {
                let owner = self.publish(|ledger, _| ledger.lookup(&producer_id).map(|v| v.owner));
                let Some(owner) = owner else { return };
                let Ok(handle) = self.peer(&owner) else { return };
                let retired = {
                    let mut peer = handle.lock().await;
                    peer.close_producer_entry(self, &producer_id, None).await
                };
                if let Some(retired) = retired {
                    self.close_dependents(std::slice::from_ref(&retired)).await;
                }
            }
            EngineEvent::ProducerScore { producer_id, score } => {
                self.publish(|ledger, out| {
                    if let Some(view) = ledger.lookup(&producer_id) {
                        out.send_to(&view.owner, &Notification::ProducerScore { producer_id, score });
                    }
                });
            }
            EngineEvent::ConsumerScore { consumer_id, score } => {
                self.publish(|ledger, out| {
                    if let Some(owner) = ledger.consumer_owner(&consumer_id) {
                        out.send_to(owner, &Notification::ConsumerScore { consumer_id, score });
                    }
                });
            }
        }
    }
}

/// Translates engine events into tree changes. Holds a Weak reference so the
/// task ends once the room is dropped; it also ends when the router closes
/// and the engine drops its sender.
async fn engine_event_task(mut rx: mpsc::UnboundedReceiver<EngineEvent>, weak_room: Weak<TokioRwLock<Room>>) {
    while let Some(event) = rx.recv().await {
        let Some(room_arc) = weak_room.upgrade() else {
            break;
        };
        let room = room_arc.read().await;
        if room.is_closed() {
            break;
        }
        room.handle_engine_event(event).await;
    }
}
