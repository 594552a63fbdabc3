#![forbid(unsafe_code)]

// Media module - the engine boundary and its implementations
// The signaling core only sees `MediaEngine`; the loopback engine is always
// available, the mediasoup worker pool behind the `mediasoup` feature.

pub mod config;
pub mod engine;
pub mod handle;
pub mod local;
#[cfg(feature = "mediasoup")]
pub mod mediasoup_engine;
pub mod types;

pub use config::{MediaConfig, TransportOptions, TransportSettings};
pub use engine::{EngineEvent, EngineEventSender, MediaEngine};
pub use local::LocalEngine;
#[cfg(feature = "mediasoup")]
pub use mediasoup_engine::{MediasoupConfig, MediasoupEngine};
pub use types::{MediaError, MediaKind, MediaResult, TransportInfo, TransportKind};
