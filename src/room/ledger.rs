#![forbid(unsafe_code)]

// Room-wide index of producers and the consumers attached to them, plus
// owner lookups for transports and consumers.
//
// Consumers hold their producer by id only. The ledger is where that id is
// resolved: a producer is open exactly while it has an entry here, and the
// entry lists which consumers must be closed when it goes away.

use crate::media::types::MediaKind;
use std::collections::HashMap;

#[derive(Debug, Clone)]
struct ProducerEntry {
    owner: String,
    kind: MediaKind,
    paused: bool,
    /// consumer id -> consuming peer id
    consumers: HashMap<String, String>,
}

/// Open producer as seen by other peers
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProducerView {
    pub producer_id: String,
    pub owner: String,
    pub kind: MediaKind,
    pub paused: bool,
}

/// What is left to clean up after a producer was removed from the ledger
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetiredProducer {
    pub producer_id: String,
    pub owner: String,
    /// (consumer id, consuming peer id)
    pub consumers: Vec<(String, String)>,
}

#[derive(Debug, Default)]
pub struct Ledger {
    producers: HashMap<String, ProducerEntry>,
    /// transport id -> owning peer
    transports: HashMap<String, String>,
    /// consumer id -> (consuming peer, producer id)
    consumers: HashMap<String, (String, String)>,
}

impl Ledger {
    pub fn new() -> Self {
        Self::default()
    }

    /// Returns false if the id is already registered
    pub fn register_producer(&mut self, producer_id: &str, owner: &str, kind: MediaKind) -> bool {
        if self.producers.contains_key(producer_id) {
            return false;
        }
        self.producers.insert(
            producer_id.to_string(),
            ProducerEntry {
                owner: owner.to_string(),
                kind,
                paused: false,
                consumers: HashMap::new(),
            },
        );
        true
    }

    pub fn lookup(&self, producer_id: &str) -> Option<ProducerView> {
        self.producers.get(producer_id).map(|e| ProducerView {
            producer_id: producer_id.to_string(),
            owner: e.owner.clone(),
            kind: e.kind,
            paused: e.paused,
        })
    }

    pub fn is_open(&self, producer_id: &str) -> bool {
        self.producers.contains_key(producer_id)
    }

    /// Returns false if the producer is no longer open
    pub fn set_paused(&mut self, producer_id: &str, paused: bool) -> bool {
        match self.producers.get_mut(producer_id) {
            Some(entry) => {
                entry.paused = paused;
                true
            }
            None => false,
        }
    }

    /// Records a consumer of an open producer. Returns false if the producer
    /// closed in the meantime; the caller then owns closing the consumer.
    pub fn attach_consumer(&mut self, producer_id: &str, consumer_id: &str, peer_id: &str) -> bool {
        match self.producers.get_mut(producer_id) {
            Some(entry) => {
                entry.consumers.insert(consumer_id.to_string(), peer_id.to_string());
                self.consumers
                    .insert(consumer_id.to_string(), (peer_id.to_string(), producer_id.to_string()));
                true
            }
            None => false,
        }
    }

    pub fn detach_consumer(&mut self, consumer_id: &str) {
        if let Some((_, producer_id)) = self.consumers.remove(consumer_id) {
            if let Some(entry) = self.producers.get_mut(&producer_id) {
                entry.consumers.remove(consumer_id);
            }
        }
    }

    pub fn consumer_owner(&self, consumer_id: &str) -> Option<&str> {
        self.consumers.get(consumer_id).map(|(peer, _)| peer.as_str())
    }

    pub fn register_transport(&mut self, transport_id: &str, owner: &str) {
        self.transports.insert(transport_id.to_string(), owner.to_string());
    }

    pub fn forget_transport(&mut self, transport_id: &str) {
        self.transports.remove(transport_id);
    }

    pub fn transport_owner(&self, transport_id: &str) -> Option<&str> {
        self.transports.get(transport_id).map(String::as_str)
    }

    /// Removes a producer, handing back its consumers for cascade closure.
    /// Only the first call for a given id returns `Some`.
    pub fn retire_producer(&mut self, producer_id: &str) -> Option<RetiredProducer> {
        let entry = self.producers.remove(producer_id)?;
        for consumer_id in entry.consumers.keys() {
            self.consumers.remove(consumer_id);
        }
        let mut consumers: Vec<(String, String)> = entry.consumers.into_iter().collect();
        consumers.sort();
        Some(RetiredProducer {
            producer_id: producer_id.to_string(),
            owner: entry.owner,
            consumers,
        })
    }

    /// Drops every consumer and transport entry held by `peer_id`
    pub fn forget_peer(&mut self, peer_id: &str) {
        for entry in self.producers.values_mut() {
            entry.consumers.retain(|_, owner| owner != peer_id);
        }
        self.consumers.retain(|_, (owner, _)| owner != peer_id);
        self.transports.retain(|_, owner| owner != peer_id);
    }

    /// Open producers not owned by `peer_id`, ordered by owner then id
    pub fn visible_to(&self, peer_id: &str) -> Vec<ProducerView> {
        let mut views: Vec<ProducerView> = self
            .producers
            .iter()
            .filter(|(_, e)| e.owner != peer_id)
            .map(|(id, e)| ProducerView {
                producer_id: id.clone(),
                owner: e.owner.clone(),
                kind: e.kind,
                paused: e.paused,
            })
            .collect();
        views.sort_by(|a, b| (&a.owner, &a.producer_id).cmp(&(&b.owner, &b.producer_id)));
        views
    }
}
