#![forbid(unsafe_code)]

// Process-wide policy applied to every room

use crate::media::MediaConfig;
use crate::turn::TurnConfig;
use std::time::Duration;

pub const DEFAULT_MAX_CONSUMERS_PER_PEER: usize = 16;
pub const DEFAULT_RECONNECT_GRACE: Duration = Duration::from_secs(30);
pub const DEFAULT_TRANSPORT_CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct RoomSettings {
    /// Server defaults merged under client transport options
    pub media: MediaConfig,
    /// Open consumers a single peer may hold at once
    pub max_consumers_per_peer: usize,
    /// How long a disconnected peer keeps its resources before it is removed
    pub reconnect_grace: Duration,
    /// Bound on a single `connectTransport` engine call
    pub transport_connect_timeout: Duration,
    pub turn: Option<TurnConfig>,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            media: MediaConfig::default(),
            max_consumers_per_peer: DEFAULT_MAX_CONSUMERS_PER_PEER,
            reconnect_grace: DEFAULT_RECONNECT_GRACE,
            transport_connect_timeout: DEFAULT_TRANSPORT_CONNECT_TIMEOUT,
            turn: None,
        }
    }
}

impl RoomSettings {
    pub fn with_reconnect_grace(mut self, grace: Duration) -> Self {
        self.reconnect_grace = grace;
        self
    }

    pub fn with_transport_connect_timeout(mut self, timeout: Duration) -> Self {
        self.transport_connect_timeout = timeout;
        self
    }

    pub fn with_max_consumers_per_peer(mut self, max: usize) -> Self {
        self.max_consumers_per_peer = max;
        self
    }
}
