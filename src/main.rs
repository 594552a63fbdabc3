#![forbid(unsafe_code)]

use anyhow::Result;
use roomsignal::config::ServerConfig;
use roomsignal::media::MediaEngine;
use roomsignal::metrics::ServerMetrics;
use roomsignal::room::{RoomRegistry, RoomServices};
use roomsignal::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[cfg(feature = "mediasoup")]
async fn media_engine() -> Result<Arc<dyn MediaEngine>> {
    use roomsignal::media::{MediasoupConfig, MediasoupEngine};
    let engine = MediasoupEngine::new(MediasoupConfig::default()).await?;
    Ok(Arc::new(engine))
}

#[cfg(not(feature = "mediasoup"))]
async fn media_engine() -> Result<Arc<dyn MediaEngine>> {
    info!("Built without the mediasoup feature, using the loopback engine (no media is forwarded)");
    Ok(Arc::new(roomsignal::media::LocalEngine::new()))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomsignal=debug,mediasoup=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("roomsignal - Starting server");

    let config = ServerConfig::from_env()?;
    if let Some(ref tc) = config.rooms.turn {
        info!("TURN configured: {} URL(s), TTL {}s", tc.urls.len(), tc.ttl_secs);
    } else {
        info!("No TURN configured (set TURN_URLS and TURN_SECRET to enable)");
    }
    info!(
        "Reconnect grace {:?}, transport connect timeout {:?}, max {} consumers per peer",
        config.rooms.reconnect_grace, config.rooms.transport_connect_timeout, config.rooms.max_consumers_per_peer
    );

    let engine = media_engine().await?;
    let metrics = ServerMetrics::new();
    let registry = RoomRegistry::new(RoomServices::new(engine, config.rooms.clone(), metrics));

    let signaling_server = SignalingServer::new(registry.clone(), &config);

    tokio::select! {
        result = signaling_server.serve(config.port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }
    registry.shutdown().await;

    info!("Server shutdown complete");
    Ok(())
}
