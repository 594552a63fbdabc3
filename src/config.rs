#![forbid(unsafe_code)]

// Server configuration read from the environment at startup

use crate::media::MediaConfig;
use crate::room::settings::{
    RoomSettings, DEFAULT_MAX_CONSUMERS_PER_PEER, DEFAULT_RECONNECT_GRACE, DEFAULT_TRANSPORT_CONNECT_TIMEOUT,
};
use crate::turn::TurnConfig;
use anyhow::{anyhow, Result};
use std::collections::HashMap;
use std::net::IpAddr;
use std::time::Duration;
use tracing::{info, warn};

pub const DEFAULT_PORT: u16 = 3000;
pub const DEFAULT_TEST_PORT: u16 = 3001;
pub const DEFAULT_MAX_CONNECTIONS: usize = 10_000;
pub const DEFAULT_IDLE_TIMEOUT: Duration = Duration::from_secs(300);

#[derive(Debug, Clone)]
pub struct ServerConfig {
    pub port: u16,
    pub max_connections: usize,
    /// Close a connection that sends nothing for this long
    pub idle_timeout: Duration,
    /// Bearer token guarding `/metrics`; open when unset
    pub metrics_token: Option<String>,
    pub rooms: RoomSettings,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            max_connections: DEFAULT_MAX_CONNECTIONS,
            idle_timeout: DEFAULT_IDLE_TIMEOUT,
            metrics_token: None,
            rooms: RoomSettings::default(),
        }
    }
}

impl ServerConfig {
    /// Reads the process environment
    pub fn from_env() -> Result<Self> {
        let vars: HashMap<String, String> = std::env::vars().collect();
        let mut config = Self::from_vars(&vars)?;
        config.rooms.turn = TurnConfig::from_env();
        Ok(config)
    }

    /// Builds the configuration from an explicit variable map. Unset or empty
    /// variables take their defaults; malformed values are errors.
    pub fn from_vars(vars: &HashMap<String, String>) -> Result<Self> {
        let get = |name: &str| vars.get(name).map(|v| v.trim()).filter(|v| !v.is_empty());

        let port = match get("PORT") {
            Some(v) => v.parse().map_err(|_| anyhow!("Invalid PORT: {v}"))?,
            None if get("DEPLOYMENT_ENV") == Some("test") => DEFAULT_TEST_PORT,
            None => DEFAULT_PORT,
        };

        let mut max_connections = parse_or(get("MAX_CONNECTIONS"), "MAX_CONNECTIONS", DEFAULT_MAX_CONNECTIONS)?;
        if max_connections == 0 {
            warn!("MAX_CONNECTIONS=0 would reject all connections, using default {}", DEFAULT_MAX_CONNECTIONS);
            max_connections = DEFAULT_MAX_CONNECTIONS;
        }

        let idle_timeout = Duration::from_secs(parse_or(
            get("IDLE_TIMEOUT_SECS"),
            "IDLE_TIMEOUT_SECS",
            DEFAULT_IDLE_TIMEOUT.as_secs(),
        )?);

        let mut media = MediaConfig::default();
        if let Some(ip) = get("ANNOUNCE_IP") {
            let addr: IpAddr = ip.parse().map_err(|_| anyhow!("Invalid ANNOUNCE_IP: {ip}"))?;
            info!("Using ANNOUNCE_IP={}", addr);
            media.webrtc_transport_config = media.webrtc_transport_config.with_public_ip(addr);
            media.plain_transport_config.announced_address = Some(addr.to_string());
        }

        let rooms = RoomSettings {
            media,
            max_consumers_per_peer: parse_or(
                get("MAX_CONSUMERS_PER_PEER"),
                "MAX_CONSUMERS_PER_PEER",
                DEFAULT_MAX_CONSUMERS_PER_PEER,
            )?,
            reconnect_grace: Duration::from_secs(parse_or(
                get("RECONNECT_GRACE_SECS"),
                "RECONNECT_GRACE_SECS",
                DEFAULT_RECONNECT_GRACE.as_secs(),
            )?),
            transport_connect_timeout: Duration::from_millis(parse_or(
                get("TRANSPORT_CONNECT_TIMEOUT_MS"),
                "TRANSPORT_CONNECT_TIMEOUT_MS",
                DEFAULT_TRANSPORT_CONNECT_TIMEOUT.as_millis() as u64,
            )?),
            turn: None,
        };

        Ok(Self {
            port,
            max_connections,
            idle_timeout,
            metrics_token: get("METRICS_TOKEN").map(str::to_string),
            rooms,
        })
    }
}

fn parse_or<T: std::str::FromStr>(value: Option<&str>, name: &str, default: T) -> Result<T> {
    match value {
        Some(v) => v.parse().map_err(|_| anyhow!("Invalid {name}: {v}")),
        None => Ok(default),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[test]
    fn test_defaults() {
        let config = ServerConfig::from_vars(&HashMap::new()).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.rooms.reconnect_grace, Duration::from_secs(30));
        assert_eq!(config.rooms.max_consumers_per_peer, 16);
        assert!(config.metrics_token.is_none());
    }

    #[test]
    fn test_port_selection() {
        let config = ServerConfig::from_vars(&vars(&[("DEPLOYMENT_ENV", "test")])).unwrap();
        assert_eq!(config.port, DEFAULT_TEST_PORT);

        let config = ServerConfig::from_vars(&vars(&[("DEPLOYMENT_ENV", "test"), ("PORT", "8080")])).unwrap();
        assert_eq!(config.port, 8080);

        let config = ServerConfig::from_vars(&vars(&[("DEPLOYMENT_ENV", "production")])).unwrap();
        assert_eq!(config.port, DEFAULT_PORT);
    }

    #[test]
    fn test_overrides() {
        let config = ServerConfig::from_vars(&vars(&[
            ("RECONNECT_GRACE_SECS", "5"),
            ("TRANSPORT_CONNECT_TIMEOUT_MS", "250"),
            ("MAX_CONSUMERS_PER_PEER", "4"),
            ("MAX_CONNECTIONS", "0"),
            ("METRICS_TOKEN", "t0k"),
            ("ANNOUNCE_IP", "198.51.100.4"),
        ]))
        .unwrap();
        assert_eq!(config.rooms.reconnect_grace, Duration::from_secs(5));
        assert_eq!(config.rooms.transport_connect_timeout, Duration::from_millis(250));
        assert_eq!(config.rooms.max_consumers_per_peer, 4);
        assert_eq!(config.max_connections, DEFAULT_MAX_CONNECTIONS);
        assert_eq!(config.metrics_token.as_deref(), Some("t0k"));
        assert_eq!(
            config.rooms.media.webrtc_transport_config.announced_address.as_deref(),
            Some("198.51.100.4")
        );
    }

    #[test]
    fn test_malformed_values_rejected() {
        assert!(ServerConfig::from_vars(&vars(&[("PORT", "http")])).is_err());
        assert!(ServerConfig::from_vars(&vars(&[("ANNOUNCE_IP", "not-an-ip")])).is_err());
        assert!(ServerConfig::from_vars(&vars(&[("RECONNECT_GRACE_SECS", "-1")])).is_err());
    }
}
