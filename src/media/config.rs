#![forbid(unsafe_code)]

// Configuration for routers and transports, plus the client-facing transport options

use crate::error::SignalError;
use crate::media::types::TransportKind;
use serde::{Deserialize, Serialize};
use std::net::{IpAddr, Ipv4Addr};

/// Only version of the client transport options object currently understood
pub const TRANSPORT_OPTIONS_VERSION: u8 = 1;

const MAX_BITRATE: u32 = 100_000_000;

/// Main media configuration
#[derive(Debug, Clone, Default)]
pub struct MediaConfig {
    pub webrtc_transport_config: WebRtcTransportConfig,
    pub plain_transport_config: PlainTransportConfig,
}

/// Server-side defaults for WebRTC transports
#[derive(Debug, Clone)]
pub struct WebRtcTransportConfig {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub prefer_tcp: bool,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_sctp_message_size: u32,
}

impl Default for WebRtcTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: None,
            initial_available_outgoing_bitrate: 600_000,
            max_incoming_bitrate: Some(1_500_000),
            enable_udp: true,
            enable_tcp: true,
            prefer_udp: true,
            prefer_tcp: false,
            enable_sctp: false,
            num_sctp_streams: NumSctpStreams::default(),
            max_sctp_message_size: 262_144,
        }
    }
}

impl WebRtcTransportConfig {
    /// Sets the public IP address announced in ICE candidates
    pub fn with_public_ip(mut self, public_ip: IpAddr) -> Self {
        self.announced_address = Some(public_ip.to_string());
        self
    }
}

/// Server-side defaults for plain RTP transports
#[derive(Debug, Clone)]
pub struct PlainTransportConfig {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub rtcp_mux: bool,
    pub comedia: bool,
}

impl Default for PlainTransportConfig {
    fn default() -> Self {
        Self {
            listen_ip: IpAddr::V4(Ipv4Addr::UNSPECIFIED),
            announced_address: None,
            rtcp_mux: false,
            comedia: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumSctpStreams {
    #[serde(rename = "OS")]
    pub os: u16,
    #[serde(rename = "MIS")]
    pub mis: u16,
}

impl Default for NumSctpStreams {
    fn default() -> Self {
        Self { os: 1024, mis: 1024 }
    }
}

/// Transport options as sent by the client in `createTransport`.
///
/// Every field is optional and overrides the matching server default.
/// Unknown fields are rejected so typos surface as validation errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase", deny_unknown_fields)]
pub struct TransportOptions {
    pub version: u8,
    // WebRTC only
    pub enable_udp: Option<bool>,
    pub enable_tcp: Option<bool>,
    pub prefer_udp: Option<bool>,
    pub prefer_tcp: Option<bool>,
    pub initial_available_outgoing_bitrate: Option<u32>,
    pub enable_sctp: Option<bool>,
    pub num_sctp_streams: Option<NumSctpStreams>,
    // Plain only
    pub rtcp_mux: Option<bool>,
    pub comedia: Option<bool>,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            version: TRANSPORT_OPTIONS_VERSION,
            enable_udp: None,
            enable_tcp: None,
            prefer_udp: None,
            prefer_tcp: None,
            initial_available_outgoing_bitrate: None,
            enable_sctp: None,
            num_sctp_streams: None,
            rtcp_mux: None,
            comedia: None,
        }
    }
}

/// Validated, fully resolved settings handed to the engine
#[derive(Debug, Clone, PartialEq)]
pub enum TransportSettings {
    WebRtc(WebRtcTransportSettings),
    Plain(PlainTransportSettings),
}

#[derive(Debug, Clone, PartialEq)]
pub struct WebRtcTransportSettings {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub enable_udp: bool,
    pub enable_tcp: bool,
    pub prefer_udp: bool,
    pub prefer_tcp: bool,
    pub initial_available_outgoing_bitrate: u32,
    pub max_incoming_bitrate: Option<u32>,
    pub enable_sctp: bool,
    pub num_sctp_streams: NumSctpStreams,
    pub max_sctp_message_size: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PlainTransportSettings {
    pub listen_ip: IpAddr,
    pub announced_address: Option<String>,
    pub rtcp_mux: bool,
    pub comedia: bool,
}

impl TransportOptions {
    fn has_webrtc_fields(&self) -> bool {
        self.enable_udp.is_some()
            || self.enable_tcp.is_some()
            || self.prefer_udp.is_some()
            || self.prefer_tcp.is_some()
            || self.initial_available_outgoing_bitrate.is_some()
            || self.enable_sctp.is_some()
            || self.num_sctp_streams.is_some()
    }

    fn has_plain_fields(&self) -> bool {
        self.rtcp_mux.is_some() || self.comedia.is_some()
    }

    /// Checks the options against the transport kind and merges them over the server defaults
    pub fn resolve(&self, kind: TransportKind, config: &MediaConfig) -> Result<TransportSettings, SignalError> {
        if self.version != TRANSPORT_OPTIONS_VERSION {
            return Err(SignalError::Validation(format!(
                "unsupported transport options version {} (expected {TRANSPORT_OPTIONS_VERSION})",
                self.version
            )));
        }

        if kind.is_webrtc() {
            if self.has_plain_fields() {
                return Err(SignalError::Validation(
                    "rtcpMux and comedia only apply to plain transports".into(),
                ));
            }
            let defaults = &config.webrtc_transport_config;
            let settings = WebRtcTransportSettings {
                listen_ip: defaults.listen_ip,
                announced_address: defaults.announced_address.clone(),
                enable_udp: self.enable_udp.unwrap_or(defaults.enable_udp),
                enable_tcp: self.enable_tcp.unwrap_or(defaults.enable_tcp),
                prefer_udp: self.prefer_udp.unwrap_or(defaults.prefer_udp),
                prefer_tcp: self.prefer_tcp.unwrap_or(defaults.prefer_tcp),
                initial_available_outgoing_bitrate: self
                    .initial_available_outgoing_bitrate
                    .unwrap_or(defaults.initial_available_outgoing_bitrate),
                max_incoming_bitrate: defaults.max_incoming_bitrate,
                enable_sctp: self.enable_sctp.unwrap_or(defaults.enable_sctp),
                num_sctp_streams: self.num_sctp_streams.unwrap_or(defaults.num_sctp_streams),
                max_sctp_message_size: defaults.max_sctp_message_size,
            };
            if !settings.enable_udp && !settings.enable_tcp {
                return Err(SignalError::Validation("at least one of UDP or TCP must be enabled".into()));
            }
            if settings.prefer_udp && settings.prefer_tcp {
                return Err(SignalError::Validation("preferUdp and preferTcp are mutually exclusive".into()));
            }
            if settings.initial_available_outgoing_bitrate == 0
                || settings.initial_available_outgoing_bitrate > MAX_BITRATE
            {
                return Err(SignalError::Validation(format!(
                    "initialAvailableOutgoingBitrate must be 1-{MAX_BITRATE}"
                )));
            }
            if settings.enable_sctp && (settings.num_sctp_streams.os == 0 || settings.num_sctp_streams.mis == 0) {
                return Err(SignalError::Validation("numSctpStreams must be non-zero".into()));
            }
            Ok(TransportSettings::WebRtc(settings))
        } else {
            if self.has_webrtc_fields() {
                return Err(SignalError::Validation(
                    "ICE/SCTP options do not apply to plain transports".into(),
                ));
            }
            let defaults = &config.plain_transport_config;
            Ok(TransportSettings::Plain(PlainTransportSettings {
                listen_ip: defaults.listen_ip,
                announced_address: defaults.announced_address.clone(),
                rtcp_mux: self.rtcp_mux.unwrap_or(defaults.rtcp_mux),
                comedia: self.comedia.unwrap_or(defaults.comedia),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_options_use_defaults() {
        let opts: TransportOptions = serde_json::from_str("{}").unwrap();
        assert_eq!(opts.version, TRANSPORT_OPTIONS_VERSION);
        let settings = opts.resolve(TransportKind::WebRtcSend, &MediaConfig::default()).unwrap();
        match settings {
            TransportSettings::WebRtc(s) => {
                assert!(s.enable_udp);
                assert!(s.prefer_udp);
                assert_eq!(s.initial_available_outgoing_bitrate, 600_000);
            }
            other => panic!("unexpected settings: {other:?}"),
        }
    }

    #[test]
    fn test_unknown_fields_rejected() {
        let result = serde_json::from_str::<TransportOptions>(r#"{"enableUpd": true}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_unsupported_version() {
        let opts = TransportOptions { version: 2, ..Default::default() };
        let err = opts.resolve(TransportKind::WebRtcRecv, &MediaConfig::default()).unwrap_err();
        assert!(matches!(err, SignalError::Validation(_)));
    }

    #[test]
    fn test_plain_fields_on_webrtc_rejected() {
        let opts = TransportOptions { comedia: Some(true), ..Default::default() };
        assert!(opts.resolve(TransportKind::WebRtcSend, &MediaConfig::default()).is_err());
        let settings = opts.resolve(TransportKind::Plain, &MediaConfig::default()).unwrap();
        assert!(matches!(settings, TransportSettings::Plain(PlainTransportSettings { comedia: true, .. })));
    }

    #[test]
    fn test_no_protocol_enabled_rejected() {
        let opts = TransportOptions {
            enable_udp: Some(false),
            enable_tcp: Some(false),
            ..Default::default()
        };
        assert!(opts.resolve(TransportKind::WebRtcSend, &MediaConfig::default()).is_err());
    }

    #[test]
    fn test_announced_address_carried_through() {
        let mut config = MediaConfig::default();
        config.webrtc_transport_config = config
            .webrtc_transport_config
            .with_public_ip("203.0.113.7".parse().unwrap());
        let settings = TransportOptions::default()
            .resolve(TransportKind::WebRtcRecv, &config)
            .unwrap();
        match settings {
            TransportSettings::WebRtc(s) => assert_eq!(s.announced_address.as_deref(), Some("203.0.113.7")),
            other => panic!("unexpected settings: {other:?}"),
        }
    }
}
