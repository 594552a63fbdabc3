#![forbid(unsafe_code)]

// roomsignal library - signaling core for multi-party SFU rooms

pub mod config;
pub mod error;
pub mod media;
pub mod metrics;
pub mod room;
pub mod signaling;
pub mod turn;
