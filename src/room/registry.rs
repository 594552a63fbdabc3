#![forbid(unsafe_code)]

// Room registry - room lookup/creation, membership and the reconnect grace period.
//
// Locking: the outer HashMap is protected by a std::sync::RwLock held only for
// brief lookups/inserts, never across an await. Each room is protected by its
// own tokio::sync::RwLock; membership changes (join, leave, grace expiry,
// reconnect, router creation and release) take it for writing, peer resource
// operations take it for reading.

use crate::error::{SignalError, SignalResult};
use crate::metrics::RegistryGauges;
use crate::room::{engine_event_task, ConnectionState, PeerSender, Room, RoomServices};
use crate::signaling::protocol::{Notification, PeerSummary, ResumedSession};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock as StdRwLock;
use std::sync::Arc;
use tokio::sync::{OwnedRwLockWriteGuard, RwLock as TokioRwLock};
use tracing::{debug, info};

type RoomMap = HashMap<String, Arc<TokioRwLock<Room>>>;

/// Result of a successful join
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct JoinOutcome {
    /// Identifies this connection's tenure; pass it back to `disconnect`/`leave`
    pub session: u64,
    /// Other peers in the room and their open producers
    pub peers: Vec<PeerSummary>,
    /// Set when the join resumed a disconnected peer
    pub resumed: Option<ResumedSession>,
}

/// Owns all rooms. Cloning shares the same registry.
#[derive(Clone)]
pub struct RoomRegistry {
    rooms: Arc<StdRwLock<RoomMap>>,
    services: RoomServices,
    next_session: Arc<AtomicU64>,
}

impl RoomRegistry {
    pub fn new(services: RoomServices) -> Self {
        Self {
            rooms: Arc::new(StdRwLock::new(HashMap::new())),
            services,
            next_session: Arc::new(AtomicU64::new(1)),
        }
    }

    pub fn services(&self) -> &RoomServices {
        &self.services
    }

    /// Looks up a room (brief outer read lock, no await)
    pub fn get_room(&self, room_id: &str) -> SignalResult<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms
            .get(room_id)
            .cloned()
            .ok_or_else(|| SignalError::RoomNotFound(room_id.to_string()))
    }

    pub fn has_room(&self, room_id: &str) -> bool {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.contains_key(room_id)
    }

    pub fn room_count(&self) -> usize {
        self.rooms.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn room_handles(&self) -> Vec<Arc<TokioRwLock<Room>>> {
        let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.values().cloned().collect()
    }

    /// Removes `room` from the map if it is still the entry registered under its id
    fn evict(&self, room_id: &str, room: &Arc<TokioRwLock<Room>>) {
        let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
        if rooms.get(room_id).is_some_and(|current| Arc::ptr_eq(current, room)) {
            rooms.remove(room_id);
            debug!("Room {} evicted from registry", room_id);
        }
    }

    /// Returns the room write-locked, creating it and its router if needed.
    ///
    /// Creation inserts the room already write-locked by the creating task, so
    /// concurrent callers for the same id wait on that lock instead of
    /// allocating a second router. A closed room found here is being torn
    /// down; the lookup is retried until a live room is found or created.
    async fn lock_or_create(
        &self,
        room_id: &str,
    ) -> SignalResult<(Arc<TokioRwLock<Room>>, OwnedRwLockWriteGuard<Room>)> {
        loop {
            let existing = {
                let rooms = self.rooms.read().unwrap_or_else(|e| e.into_inner());
                rooms.get(room_id).cloned()
            };
            if let Some(room) = existing {
                let guard = room.clone().write_owned().await;
                if guard.is_closed() {
                    drop(guard);
                    self.evict(room_id, &room);
                    tokio::task::yield_now().await;
                    continue;
                }
                return Ok((room, guard));
            }

            // Slow path: insert a fresh room that we already hold write-locked
            let (room, mut guard) = {
                let mut rooms = self.rooms.write().unwrap_or_else(|e| e.into_inner());
                if rooms.contains_key(room_id) {
                    continue;
                }
                let room = Arc::new(TokioRwLock::new(Room::new(room_id.to_string(), self.services.clone())));
                let Ok(guard) = room.clone().try_write_owned() else {
                    continue;
                };
                rooms.insert(room_id.to_string(), room.clone());
                (room, guard)
            };

            info!("Creating new room: {}", room_id);
            match guard.open_router().await {
                Ok(events) => {
                    tokio::spawn(engine_event_task(events, Arc::downgrade(&room)));
                    return Ok((room, guard));
                }
                Err(e) => {
                    guard.closed = true;
                    drop(guard);
                    self.evict(room_id, &room);
                    return Err(e);
                }
            }
        }
    }

    /// Returns the room for `room_id`, creating it (and its router) if absent
    pub async fn get_or_create_room(&self, room_id: &str) -> SignalResult<Arc<TokioRwLock<Room>>> {
        let (room, _guard) = self.lock_or_create(room_id).await?;
        Ok(room)
    }

    /// Closes and evicts the room if its peer set is empty; otherwise a no-op.
    /// Returns true if the room was closed by this call.
    pub async fn remove_room_if_empty(&self, room_id: &str) -> bool {
        let Ok(room) = self.get_room(room_id) else {
            return false;
        };
        let mut guard = room.write().await;
        let closed = guard.close_if_empty().await;
        if guard.is_closed() {
            self.evict(room_id, &room);
        }
        closed
    }

    /// Joins a peer to a room, creating the room on first join.
    ///
    /// A peer id that is present but disconnected resumes its session; a peer
    /// id that is present and connected is rejected.
    pub async fn join(&self, room_id: &str, peer_id: &str, sender: PeerSender) -> SignalResult<JoinOutcome> {
        let (handle, mut room) = self.lock_or_create(room_id).await?;
        let session = self.next_session.fetch_add(1, Ordering::Relaxed);

        let outcome = match room.connection_state(peer_id) {
            Some(ConnectionState::Disconnected) => {
                let (peers, resumed) = room.resume_peer(peer_id, sender, session).await?;
                self.services.metrics.inc_reconnects();
                JoinOutcome {
                    session,
                    peers,
                    resumed: Some(resumed),
                }
            }
            Some(ConnectionState::Connected) => {
                return Err(SignalError::InvalidState(format!(
                    "peer {peer_id} is already connected to room {room_id}"
                )));
            }
            None => {
                let peers = match room.add_peer(peer_id, sender, session) {
                    Ok(peers) => peers,
                    Err(e) => {
                        // A room created for this join must not outlive it
                        if room.close_if_empty().await {
                            drop(room);
                            self.evict(room_id, &handle);
                        }
                        return Err(e);
                    }
                };
                self.services.metrics.inc_joins();
                JoinOutcome {
                    session,
                    peers,
                    resumed: None,
                }
            }
        };
        // Sent under the write lock so it precedes every later room event on this connection
        room.send_to(
            peer_id,
            &Notification::RoomJoined {
                room_id: room_id.to_string(),
                peer_id: peer_id.to_string(),
                peers: outcome.peers.clone(),
                resumed: outcome.resumed.clone(),
            },
        );
        Ok(outcome)
    }

    /// Removes a peer immediately. With `session`, only if that connection is
    /// still the peer's current one. Returns true if the peer was removed.
    pub async fn leave(&self, room_id: &str, peer_id: &str, session: Option<u64>) -> bool {
        let Ok(room) = self.get_room(room_id) else {
            return false;
        };
        let mut guard = room.write().await;
        if let Some(session) = session {
            if guard.session_of(peer_id) != Some(session) {
                return false;
            }
        }
        let removed = guard.remove_peer(peer_id).await;
        guard.close_if_empty().await;
        if guard.is_closed() {
            drop(guard);
            self.evict(room_id, &room);
        }
        removed
    }

    /// Marks the peer disconnected and starts its grace period. Resources stay
    /// allocated until the period ends without a reconnect.
    pub async fn disconnect(&self, room_id: &str, peer_id: &str, session: u64) -> bool {
        let Ok(room) = self.get_room(room_id) else {
            return false;
        };
        let mut guard = room.write().await;
        if !guard.mark_disconnected(peer_id, session) {
            return false;
        }

        let grace = self.services.settings.reconnect_grace;
        let registry = self.clone();
        let (room_key, peer_key) = (room_id.to_string(), peer_id.to_string());
        let timer = tokio::spawn(async move {
            tokio::time::sleep(grace).await;
            registry.expire_grace(&room_key, &peer_key, session).await;
        });
        guard.arm_grace_timer(peer_id, timer);
        info!(
            "Peer {} disconnected from room {}, removing in {:?} unless it reconnects",
            peer_id, room_id, grace
        );
        true
    }

    /// Grace timer body: removes the peer unless it reconnected meanwhile
    async fn expire_grace(&self, room_id: &str, peer_id: &str, session: u64) {
        let Ok(room) = self.get_room(room_id) else {
            return;
        };
        let mut guard = room.write().await;
        if !guard.claim_expired(peer_id, session) {
            debug!("Grace timer for peer {} in room {} no longer applies", peer_id, room_id);
            return;
        }
        info!("Grace period expired for peer {} in room {}", peer_id, room_id);
        guard.remove_peer(peer_id).await;
        self.services.metrics.inc_grace_expiries();
        guard.close_if_empty().await;
        if guard.is_closed() {
            drop(guard);
            self.evict(room_id, &room);
        }
    }

    /// Closes every room, removing all peers without grace
    pub async fn shutdown(&self) {
        for room in self.room_handles() {
            let mut guard = room.write().await;
            let room_id = guard.id().to_string();
            guard.close_all_peers().await;
            drop(guard);
            self.evict(&room_id, &room);
        }
        info!("All rooms closed");
    }

    /// Peers across all rooms, connected or within their grace period
    pub async fn peer_count(&self) -> usize {
        self.gauges().await.peers
    }

    /// Rooms whose router is currently allocated
    pub async fn router_count(&self) -> usize {
        let mut count = 0;
        for room in self.room_handles() {
            if room.read().await.has_router() {
                count += 1;
            }
        }
        count
    }

    pub async fn gauges(&self) -> RegistryGauges {
        let mut gauges = RegistryGauges::default();
        for room in self.room_handles() {
            let room = room.read().await;
            if room.is_closed() {
                continue;
            }
            gauges.rooms += 1;
            gauges.peers += room.peer_count();
            gauges.disconnected_peers += room.disconnected_count();
        }
        gauges
    }
}
