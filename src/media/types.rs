#![forbid(unsafe_code)]

// Common types and error handling for the media engine boundary

use serde::{Deserialize, Serialize};
use std::fmt;
use std::net::IpAddr;
use thiserror::Error;

/// Error reported by the media engine for a single operation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum MediaError {
    /// The engine refused the request (bad options, incompatible parameters).
    #[error("Engine rejected request: {0}")]
    Rejected(String),

    /// The engine could not serve the request right now (worker gone, channel closed).
    #[error("Engine unavailable: {0}")]
    Unavailable(String),

    /// The handle does not exist on the engine side (already closed).
    #[error("Unknown engine handle: {0}")]
    UnknownHandle(String),
}

impl MediaError {
    /// Whether retrying the same call later can succeed
    pub fn is_transient(&self) -> bool {
        matches!(self, MediaError::Unavailable(_))
    }
}

/// Result type alias for engine operations
pub type MediaResult<T> = Result<T, MediaError>;

/// Kind of media carried by a producer or consumer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => f.write_str("audio"),
            MediaKind::Video => f.write_str("video"),
        }
    }
}

/// Kind of transport a peer can open
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum TransportKind {
    WebRtcSend,
    WebRtcRecv,
    Plain,
}

impl TransportKind {
    pub fn is_webrtc(self) -> bool {
        matches!(self, TransportKind::WebRtcSend | TransportKind::WebRtcRecv)
    }

    /// Whether producers may be created on this transport
    pub fn can_send(self) -> bool {
        matches!(self, TransportKind::WebRtcSend | TransportKind::Plain)
    }

    /// Whether consumers may be bound to this transport
    pub fn can_receive(self) -> bool {
        matches!(self, TransportKind::WebRtcRecv | TransportKind::Plain)
    }
}

/// RTP parameters of a producer or consumer. Opaque to the core, interpreted by the engine.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpParameters(pub serde_json::Value);

/// RTP capabilities of a receiving endpoint (or of a router). Opaque to the core.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RtpCapabilities(pub serde_json::Value);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceParameters {
    pub username_fragment: String,
    pub password: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_lite: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceCandidate {
    pub foundation: String,
    pub priority: u32,
    #[serde(alias = "ip")]
    pub address: String,
    pub protocol: String,
    pub port: u16,
    #[serde(rename = "type")]
    pub candidate_type: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tcp_type: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DtlsRole {
    Auto,
    Client,
    Server,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsFingerprint {
    pub algorithm: String,
    pub value: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DtlsParameters {
    pub role: DtlsRole,
    pub fingerprints: Vec<DtlsFingerprint>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SctpParameters {
    pub port: u16,
    #[serde(rename = "OS")]
    pub os: u16,
    #[serde(rename = "MIS")]
    pub mis: u16,
    pub max_message_size: u32,
}

/// Connection parameters returned to the client when a transport is created.
///
/// WebRTC transports fill the ICE/DTLS fields, plain transports fill the
/// local tuple (`ip`, `port`, `rtcpPort`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransportInfo {
    pub id: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ice_parameters: Option<IceParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ice_candidates: Vec<IceCandidate>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dtls_parameters: Option<DtlsParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sctp_parameters: Option<SctpParameters>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ip: Option<IpAddr>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp_port: Option<u16>,
}

/// Remote side parameters used to connect a transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteParameters {
    WebRtc {
        dtls_parameters: DtlsParameters,
    },
    Plain {
        ip: IpAddr,
        port: u16,
        rtcp_port: Option<u16>,
    },
}

/// Engine-side description of a freshly created consumer
#[derive(Debug, Clone, PartialEq)]
pub struct ConsumerParams {
    pub id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
    pub producer_paused: bool,
}

/// Quality score of a producer or consumer stream as reported by the engine (0-10)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StreamScore {
    pub score: u8,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub producer_score: Option<u8>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_kind_capabilities() {
        assert!(TransportKind::WebRtcSend.can_send());
        assert!(!TransportKind::WebRtcSend.can_receive());
        assert!(TransportKind::WebRtcRecv.can_receive());
        assert!(!TransportKind::WebRtcRecv.can_send());
        assert!(TransportKind::Plain.can_send() && TransportKind::Plain.can_receive());
        assert!(!TransportKind::Plain.is_webrtc());
    }

    #[test]
    fn test_plain_transport_info_omits_ice_fields() {
        let info = TransportInfo {
            id: "t1".into(),
            ice_parameters: None,
            ice_candidates: vec![],
            dtls_parameters: None,
            sctp_parameters: None,
            ip: Some("10.0.0.1".parse().unwrap()),
            port: Some(40000),
            rtcp_port: Some(40001),
        };
        let json = serde_json::to_value(&info).unwrap();
        assert_eq!(json["rtcpPort"], 40001);
        assert!(json.get("iceParameters").is_none());
        assert!(json.get("iceCandidates").is_none());
    }

    #[test]
    fn test_transient_errors() {
        assert!(MediaError::Unavailable("worker died".into()).is_transient());
        assert!(!MediaError::Rejected("bad codec".into()).is_transient());
    }
}
