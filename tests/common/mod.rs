#![allow(dead_code)]

use roomsignal::media::types::{
    DtlsFingerprint, DtlsParameters, DtlsRole, MediaKind, RemoteParameters, RtpCapabilities, RtpParameters,
    TransportKind,
};
use roomsignal::media::{LocalEngine, TransportOptions};
use roomsignal::metrics::ServerMetrics;
use roomsignal::room::settings::RoomSettings;
use roomsignal::room::{Room, RoomRegistry, RoomServices};
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

pub type Inbox = mpsc::Receiver<Arc<String>>;

pub fn registry(engine: Arc<LocalEngine>, settings: RoomSettings) -> RoomRegistry {
    RoomRegistry::new(RoomServices::new(engine, settings, ServerMetrics::new()))
}

/// Joins and returns the session id plus the peer's notification inbox
pub async fn join(registry: &RoomRegistry, room: &str, peer: &str) -> (u64, Inbox) {
    let (tx, rx) = mpsc::channel(256);
    let outcome = registry.join(room, peer, tx).await.expect("join");
    (outcome.session, rx)
}

pub fn client_dtls() -> RemoteParameters {
    RemoteParameters::WebRtc {
        dtls_parameters: DtlsParameters {
            role: DtlsRole::Client,
            fingerprints: vec![DtlsFingerprint {
                algorithm: "sha-256".into(),
                value: "AB:CD:EF".into(),
            }],
        },
    }
}

pub fn client_dtls_json() -> Value {
    json!({
        "role": "client",
        "fingerprints": [{ "algorithm": "sha-256", "value": "AB:CD:EF" }]
    })
}

pub fn capabilities_json() -> Value {
    json!({
        "codecs": [
            { "kind": "audio", "mimeType": "audio/opus", "clockRate": 48000, "channels": 2 },
            { "kind": "video", "mimeType": "video/VP8", "clockRate": 90000 }
        ]
    })
}

pub fn capabilities() -> RtpCapabilities {
    RtpCapabilities(capabilities_json())
}

pub fn rtp_parameters_json() -> Value {
    json!({ "codecs": [{ "mimeType": "video/VP8", "payloadType": 101, "clockRate": 90000 }], "encodings": [{ "ssrc": 1111 }] })
}

pub fn rtp_parameters() -> RtpParameters {
    RtpParameters(rtp_parameters_json())
}

/// Creates and connects a transport of `kind` for `peer`
pub async fn connected_transport(room: &Room, peer: &str, kind: TransportKind) -> String {
    let info = room
        .create_transport(peer, kind, &TransportOptions::default())
        .await
        .expect("create transport");
    room.connect_transport(peer, &info.id, &client_dtls())
        .await
        .expect("connect transport");
    info.id
}

/// Send transport plus a video producer on it
pub async fn producing(room: &Room, peer: &str) -> (String, String) {
    let transport = connected_transport(room, peer, TransportKind::WebRtcSend).await;
    let producer = room
        .produce(peer, &transport, MediaKind::Video, &rtp_parameters())
        .await
        .expect("produce");
    (transport, producer)
}

/// Everything queued for a peer right now, decoded
pub fn drain(inbox: &mut Inbox) -> Vec<Value> {
    let mut frames = Vec::new();
    while let Ok(raw) = inbox.try_recv() {
        frames.push(serde_json::from_str(&raw).expect("frame is JSON"));
    }
    frames
}

pub fn methods(frames: &[Value]) -> Vec<String> {
    frames
        .iter()
        .filter_map(|f| f["method"].as_str().map(str::to_string))
        .collect()
}

/// Waits for a notification with `method`, skipping others
pub async fn expect_notification(inbox: &mut Inbox, method: &str) -> Value {
    let wait = async {
        loop {
            let raw = inbox.recv().await.expect("inbox open");
            let frame: Value = serde_json::from_str(&raw).expect("frame is JSON");
            if frame["method"] == method {
                return frame;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), wait)
        .await
        .unwrap_or_else(|_| panic!("no {method} notification"))
}
