#![forbid(unsafe_code)]

// Time-limited TURN credentials attached to WebRTC transport responses.
// HMAC-SHA1 over "expiry:peerId" as expected by coturn's --use-auth-secret mode.

use base64::Engine;
use hmac::{Hmac, Mac};
use serde::{Deserialize, Serialize};
use sha1::Sha1;
use std::time::{SystemTime, UNIX_EPOCH};

type HmacSha1 = Hmac<Sha1>;

const DEFAULT_TTL_SECS: u64 = 86_400;

#[derive(Debug, Clone)]
pub struct TurnConfig {
    pub urls: Vec<String>,
    pub secret: String,
    pub ttl_secs: u64,
}

/// ICE server entry returned as `iceServers` in `createTransport` responses
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IceServer {
    pub urls: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub credential: Option<String>,
}

impl TurnConfig {
    /// Reads `TURN_URLS` (comma separated), `TURN_SECRET` and `TURN_TTL`.
    /// Returns None unless both URLs and secret are set.
    pub fn from_env() -> Option<Self> {
        let urls = std::env::var("TURN_URLS").ok()?;
        let secret = std::env::var("TURN_SECRET").ok()?;
        let ttl_secs = std::env::var("TURN_TTL")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TTL_SECS);
        Self::new(&urls, secret, ttl_secs)
    }

    pub fn new(urls: &str, secret: String, ttl_secs: u64) -> Option<Self> {
        let urls: Vec<String> = urls
            .split(',')
            .map(str::trim)
            .filter(|u| !u.is_empty())
            .map(str::to_string)
            .collect();
        if urls.is_empty() || secret.is_empty() {
            return None;
        }
        Some(Self { urls, secret, ttl_secs })
    }

    /// Credentials for one peer, valid for `ttl_secs` from now
    pub fn credentials_for(&self, peer_id: &str) -> IceServer {
        let expiry = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_secs()
            + self.ttl_secs;
        self.credentials_at(peer_id, expiry)
    }

    fn credentials_at(&self, peer_id: &str, expiry: u64) -> IceServer {
        let username = format!("{expiry}:{peer_id}");
        // HMAC takes keys of any length, so new_from_slice cannot fail here
        let credential = match HmacSha1::new_from_slice(self.secret.as_bytes()) {
            Ok(mut mac) => {
                mac.update(username.as_bytes());
                Some(base64::engine::general_purpose::STANDARD.encode(mac.finalize().into_bytes()))
            }
            Err(_) => None,
        };
        IceServer {
            urls: self.urls.clone(),
            username: Some(username),
            credential,
        }
    }
}
