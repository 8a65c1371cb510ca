#![forbid(unsafe_code)]

use anyhow::Result;
use roomcast::config::ServerConfig;
use roomcast::metrics::ServerMetrics;
use roomcast::room::Rooms;
use roomcast::routing::{LoopbackEngine, RoutingEngine};
use roomcast::signaling::SignalingServer;
use std::sync::Arc;
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "roomcast=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("roomcast - starting server");

    let config = ServerConfig::from_env();

    // One routing capability per process, shared by every room. The loopback
    // engine carries the session layer in development; production wires a
    // real media engine behind the same traits.
    let engine: Arc<dyn RoutingEngine> =
        Arc::new(LoopbackEngine::new(config.media_codecs.clone()));

    let metrics = ServerMetrics::new();
    let rooms = Rooms::new(engine, metrics.clone());

    let sweep = rooms.spawn_presence_sweep();
    info!("Room registry initialized, presence sweep running");

    let server = SignalingServer::new(rooms, metrics, &config);
    let port = config.port;

    tokio::select! {
        result = server.serve(port) => {
            if let Err(e) = result {
                tracing::error!("Signaling server error: {}", e);
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down...");
        }
    }

    sweep.abort();
    info!("Server shutdown complete");
    Ok(())
}
