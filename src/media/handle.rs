#![forbid(unsafe_code)]

// Typed handles into the media engine

use std::fmt;
use std::marker::PhantomData;

/// Marker trait naming the engine resource a handle points at
pub trait HandleKind: Send + Sync + 'static {
    const NAME: &'static str;
}

#[derive(Debug)]
pub enum RouterKind {}
#[derive(Debug)]
pub enum TransportHandleKind {}
#[derive(Debug)]
pub enum ProducerHandleKind {}
#[derive(Debug)]
pub enum ConsumerHandleKind {}

impl HandleKind for RouterKind {
    const NAME: &'static str = "router";
}
impl HandleKind for TransportHandleKind {
    const NAME: &'static str = "transport";
}
impl HandleKind for ProducerHandleKind {
    const NAME: &'static str = "producer";
}
impl HandleKind for ConsumerHandleKind {
    const NAME: &'static str = "consumer";
}

/// Whether the engine side of a handle is still allocated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandleState {
    Live,
    Released,
}

/// Handle into the external media engine: the engine id plus whether it is
/// still allocated. `release` succeeds once, so engine close calls guarded by
/// it run exactly once.
pub struct ResourceHandle<K: HandleKind> {
    id: String,
    state: HandleState,
    _kind: PhantomData<K>,
}

pub type RouterHandle = ResourceHandle<RouterKind>;
pub type TransportHandle = ResourceHandle<TransportHandleKind>;
pub type ProducerHandle = ResourceHandle<ProducerHandleKind>;
pub type ConsumerHandle = ResourceHandle<ConsumerHandleKind>;

impl<K: HandleKind> ResourceHandle<K> {
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            state: HandleState::Live,
            _kind: PhantomData,
        }
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn state(&self) -> HandleState {
        self.state
    }

    pub fn is_live(&self) -> bool {
        self.state == HandleState::Live
    }

    /// Marks the handle released. Returns `true` only for the call that
    /// performed the transition.
    pub fn release(&mut self) -> bool {
        let was_live = self.is_live();
        self.state = HandleState::Released;
        was_live
    }
}

impl<K: HandleKind> fmt::Debug for ResourceHandle<K> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResourceHandle")
            .field("kind", &K::NAME)
            .field("id", &self.id)
            .field("state", &self.state)
            .finish()
    }
}
