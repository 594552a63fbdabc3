#![forbid(unsafe_code)]

// WebSocket connection handler for a single peer.
//
// Three tasks per connection: the socket reader (this function), a request
// task that runs the peer's requests one at a time in arrival order, and a
// send task that drains the outbound channel into the socket. The reader never
// waits on engine calls, so pings and closes are noticed while a slow request
// is in flight.

use super::dispatcher::{PeerContext, SignalingDispatcher};
use super::protocol::Response;
use crate::error::SignalError;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};

/// Bounded channel capacity per client.
/// At 100 msg/s rate limit, 64 slots = 640ms of burst buffer.
const CHANNEL_CAPACITY: usize = 64;

/// Requests accepted but not yet run
const REQUEST_QUEUE_CAPACITY: usize = 32;

/// How long a leaving peer's last frames get to reach the socket
const FLUSH_TIMEOUT: Duration = Duration::from_secs(1);

/// Token bucket rate limiter: max tokens (burst capacity).
const RATE_LIMIT_MAX_TOKENS: u64 = 100;
/// Token bucket: refill rate in tokens per second.
const RATE_LIMIT_REFILL_RATE: u64 = 100;
/// Internal: 1 token in microseconds (for integer math).
const TOKEN_US: u64 = 1_000_000;
/// Internal: max tokens in microseconds.
const MAX_TOKENS_US: u64 = RATE_LIMIT_MAX_TOKENS * TOKEN_US;

/// Per-connection token bucket
#[derive(Debug)]
pub struct RateLimiter {
    tokens_us: u64,
    last_refill: Instant,
    warned: bool,
}

impl RateLimiter {
    pub fn new(now: Instant) -> Self {
        Self {
            tokens_us: MAX_TOKENS_US,
            last_refill: now,
            warned: false,
        }
    }

    /// Takes one token. Returns false when the bucket is empty.
    pub fn try_acquire(&mut self, now: Instant) -> bool {
        let elapsed_us = now.saturating_duration_since(self.last_refill).as_micros() as u64;
        self.last_refill = now;
        self.tokens_us = self
            .tokens_us
            .saturating_add(elapsed_us.saturating_mul(RATE_LIMIT_REFILL_RATE))
            .min(MAX_TOKENS_US);

        if self.tokens_us >= TOKEN_US {
            self.tokens_us -= TOKEN_US;
            self.warned = false;
            true
        } else {
            false
        }
    }

    /// True the first time it is called after the limit was hit
    fn should_warn(&mut self) -> bool {
        !std::mem::replace(&mut self.warned, true)
    }
}

/// Serialize a response and queue it as pre-serialized JSON
fn send_response(sender: &mpsc::Sender<Arc<String>>, response: &Response) {
    match serde_json::to_string(response) {
        Ok(json) => {
            if let Err(e) = sender.try_send(Arc::new(json)) {
                debug!("Dropping response {}: {}", response.id, e);
            }
        }
        Err(e) => warn!("Failed to serialize response {}: {}", response.id, e),
    }
}

/// Best-effort request id of a frame that will not be dispatched
fn peek_id(text: &str) -> u64 {
    serde_json::from_str::<serde_json::Value>(text)
        .ok()
        .and_then(|v| v.get("id").and_then(serde_json::Value::as_u64))
        .unwrap_or(0)
}

/// Answer for a frame turned away by backpressure, correlated when possible
fn throttled(text: &str, reason: impl Into<String>) -> Response {
    Response::failure(peek_id(text), &SignalError::RateLimited(reason.into()))
}

/// Handles a single WebSocket connection for `peer_id` in `room_id`
pub async fn handle_connection(
    socket: WebSocket,
    dispatcher: SignalingDispatcher,
    room_id: String,
    peer_id: String,
    idle_timeout: Duration,
    _permit: OwnedSemaphorePermit,
) {
    let registry = dispatcher.registry().clone();
    let metrics = registry.services().metrics.clone();
    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_peer_id = peer_id.clone();
    let mut send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            if ws_sender.send(Message::Text((*json).clone().into())).await.is_err() {
                break;
            }
        }
        let _ = ws_sender.close().await;
        debug!("Send task finished for peer: {}", send_peer_id);
    });

    let joined = match registry.join(&room_id, &peer_id, tx.clone()).await {
        Ok(joined) => joined,
        Err(e) => {
            warn!("Peer {} could not join room {}: {}", peer_id, room_id, e);
            send_response(&tx, &Response::uncorrelated(&e));
            drop(tx);
            let _ = tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await;
            send_task.abort();
            return;
        }
    };
    let session = joined.session;
    info!(
        "Peer {} connected to room {} (session {}{})",
        peer_id,
        room_id,
        session,
        if joined.resumed.is_some() { ", resumed" } else { "" }
    );

    let ctx = PeerContext {
        room_id: room_id.clone(),
        peer_id: peer_id.clone(),
        session,
    };
    let (req_tx, mut req_rx) = mpsc::channel::<String>(REQUEST_QUEUE_CAPACITY);
    let request_sender = tx.clone();
    let mut request_task = tokio::spawn(async move {
        while let Some(text) = req_rx.recv().await {
            let outcome = dispatcher.handle_text(&ctx, &text).await;
            send_response(&request_sender, &outcome.response);
            if outcome.left {
                return true;
            }
        }
        false
    });

    let mut limiter = RateLimiter::new(Instant::now());
    let mut left = None;

    loop {
        let next = tokio::select! {
            done = &mut request_task => {
                left = Some(matches!(done, Ok(true)));
                break;
            }
            next = tokio::time::timeout(idle_timeout, ws_receiver.next()) => next,
        };

        let msg = match next {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for peer {}", peer_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                let text = text.as_str();
                if !limiter.try_acquire(Instant::now()) {
                    metrics.inc_request_errors();
                    if limiter.should_warn() {
                        warn!("Rate limit exceeded for peer {}", peer_id);
                    }
                    let reason = format!("max {RATE_LIMIT_REFILL_RATE} requests/second");
                    send_response(&tx, &throttled(text, reason));
                    continue;
                }
                if let Err(e) = req_tx.try_send(text.to_owned()) {
                    metrics.inc_request_errors();
                    debug!("Request queue of peer {} rejected a frame: {}", peer_id, e);
                    send_response(&tx, &throttled(text, "too many requests in flight"));
                }
            }
            Message::Close(_) => {
                info!("Peer {} closed connection", peer_id);
                break;
            }
            Message::Ping(_) | Message::Pong(_) => {
                // WebSocket ping/pong handled automatically
            }
            Message::Binary(_) => {
                let err = SignalError::Validation("binary frames are not supported".into());
                send_response(&tx, &Response::uncorrelated(&err));
            }
        }
    }

    // Let already accepted requests finish in order before the peer is released
    drop(req_tx);
    let left = match left {
        Some(left) => left,
        None => request_task.await.unwrap_or(false),
    };

    if left {
        info!("Peer {} left room {}", peer_id, room_id);
        drop(tx);
        let _ = tokio::time::timeout(FLUSH_TIMEOUT, &mut send_task).await;
    } else if registry.disconnect(&room_id, &peer_id, session).await {
        info!(
            "Peer {} disconnected from room {}, starting {:?} grace period",
            peer_id,
            room_id,
            registry.services().settings.reconnect_grace
        );
    }
    send_task.abort();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rate_limiter_burst_then_refill() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(start);
        for _ in 0..RATE_LIMIT_MAX_TOKENS {
            assert!(limiter.try_acquire(start));
        }
        assert!(!limiter.try_acquire(start));
        assert!(limiter.should_warn());
        assert!(!limiter.should_warn());

        // 10ms at 100 tokens/s refills exactly one token
        let later = start + Duration::from_millis(10);
        assert!(limiter.try_acquire(later));
        assert!(!limiter.try_acquire(later));
    }

    #[test]
    fn test_rate_limiter_caps_at_burst() {
        let start = Instant::now();
        let mut limiter = RateLimiter::new(start);
        let much_later = start + Duration::from_secs(3600);
        let granted = (0..RATE_LIMIT_MAX_TOKENS * 2)
            .filter(|_| limiter.try_acquire(much_later))
            .count() as u64;
        assert_eq!(granted, RATE_LIMIT_MAX_TOKENS);
    }

    #[test]
    fn test_throttled_response_says_retry() {
        let response = throttled(r#"{"request":true,"id":9,"method":"produce"}"#, "too many requests in flight");
        let json = serde_json::to_value(&response).unwrap();
        assert_eq!(json["id"], 9);
        assert_eq!(json["ok"], false);
        assert_eq!(json["error"]["code"], "RateLimited");
        assert_eq!(json["error"]["retriable"], true);
    }

    #[test]
    fn test_peek_id() {
        assert_eq!(peek_id(r#"{"request":true,"id":42,"method":"produce"}"#), 42);
        assert_eq!(peek_id("garbage"), 0);
    }
}
