#![forbid(unsafe_code)]

// Ingest bridge — turns an externally delivered RTP stream (pushed by the
// RTSP gateway's ffmpeg relay) into a first-class producer inside a room.

pub mod gateway;

pub use gateway::{CameraPath, GatewayClient};

use crate::room::{Rooms, SessionError, SessionResult};
use crate::routing::{MediaKind, RtpParameters};
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use tracing::{error, info, warn};

/// Reply to an ingest allocation: where the sender must push RTP, and which
/// payload type the router expects.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IngestCreated {
    pub producer_id: String,
    pub ip: IpAddr,
    pub rtp_port: u16,
    pub rtcp_port: u16,
    pub payload_type: u8,
}

/// Creates an ingest producer in a room.
///
/// The endpoint ports are handed back immediately so the sender can start
/// pushing; address learning then completes in the background as the first
/// RTP and RTCP packets arrive (the sender cannot be contacted before it
/// starts sending, so there is nothing to wait for up front).
pub async fn create_ingest_producer(
    rooms: &Rooms,
    announced_ip: IpAddr,
    room_id: &str,
    label: &str,
    path: &str,
) -> SessionResult<IngestCreated> {
    // Resolve the deployment's video codec from the router-advertised table.
    // No codec means a misconfigured deployment; guessing a payload type
    // would produce an un-decodable stream, so this is a hard error.
    let codec = rooms
        .engine()
        .codecs()
        .into_iter()
        .find(|c| c.kind == MediaKind::Video)
        .ok_or_else(|| {
            error!(
                "Ingest request for room {} rejected: no video codec configured in router capabilities",
                room_id
            );
            SessionError::UnsupportedCodec
        })?;

    let endpoint = rooms.engine().create_ingest_transport().await?;
    let rtp_port = endpoint.rtp_port();
    let rtcp_port = endpoint.rtcp_port();

    // Producer parameters come from the advertised capability, not from
    // constants, so the bridge stays correct when the codec table changes.
    let rtp_parameters = RtpParameters::from_capability(&codec);
    let payload_type = codec.preferred_payload_type;

    let producer = match endpoint.produce(MediaKind::Video, rtp_parameters).await {
        Ok(producer) => producer,
        Err(e) => {
            endpoint.close().await;
            return Err(e.into());
        }
    };
    let producer_id = producer.id().to_string();

    rooms
        .register_ingest_producer(
            room_id,
            MediaKind::Video,
            label.to_string(),
            path.to_string(),
            producer,
            endpoint.clone(),
        )
        .await;

    // Two-phase address discovery: first RTP, then RTCP (separate channel).
    // Runs in the background; the stream is announced once both resolve.
    {
        let room_id = room_id.to_string();
        let label = label.to_string();
        let watch_producer_id = producer_id.clone();
        tokio::spawn(async move {
            match endpoint.remote_resolved().await {
                Ok((rtp_addr, rtcp_addr)) => info!(
                    "Ingest stream '{}' (producer {}) in room {} established: rtp from {}, rtcp from {}",
                    label, watch_producer_id, room_id, rtp_addr, rtcp_addr
                ),
                Err(e) => warn!(
                    "Ingest stream '{}' in room {} ended before address discovery: {}",
                    label, room_id, e
                ),
            }
        });
    }

    info!(
        "Ingest allocated for room {}: producer {}, rtp:{} rtcp:{} pt:{}",
        room_id, producer_id, rtp_port, rtcp_port, payload_type
    );

    Ok(IngestCreated {
        producer_id,
        ip: announced_ip,
        rtp_port,
        rtcp_port,
        payload_type,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::metrics::ServerMetrics;
    use crate::room::peer::PeerRole;
    use crate::routing::{LoopbackEngine, MediaKind, RoutingEngine, RtpCodecCapability};
    use crate::signaling::protocol::ServerMessage;
    use std::sync::Arc;

    fn rooms_with_codecs(codecs: Vec<RtpCodecCapability>) -> Rooms {
        let engine: Arc<dyn RoutingEngine> = Arc::new(LoopbackEngine::new(codecs));
        Rooms::new(engine, ServerMetrics::new())
    }

    fn local_ip() -> IpAddr {
        IpAddr::from([127, 0, 0, 1])
    }

    #[tokio::test]
    async fn ingest_registers_a_producer_and_announces_it() {
        let rooms = rooms_with_codecs(ServerConfig::default_codecs());
        let (tx, mut rx) = tokio::sync::mpsc::channel(64);
        rooms.join("lab", "viewer", PeerRole::Viewer, None, tx).await;
        while rx.try_recv().is_ok() {}

        let created = create_ingest_producer(&rooms, local_ip(), "lab", "Door cam", "door")
            .await
            .unwrap();

        // Payload type comes from the advertised codec table (VP8/96 first).
        assert_eq!(created.payload_type, 96);
        assert_ne!(created.rtp_port, 0);
        assert_ne!(created.rtcp_port, created.rtp_port);

        let listing = rooms.list_producers("lab").await;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].id, created.producer_id);
        assert_eq!(listing[0].label, "Door cam");
        assert_eq!(listing[0].path, "door");
        assert_eq!(listing[0].kind, MediaKind::Video);

        let announced: ServerMessage =
            serde_json::from_str(&rx.try_recv().unwrap()).unwrap();
        assert!(matches!(
            announced,
            ServerMessage::NewProducer { producer_id, .. } if producer_id == created.producer_id
        ));
    }

    #[tokio::test]
    async fn ingest_creates_the_room_when_it_does_not_exist() {
        let rooms = rooms_with_codecs(ServerConfig::default_codecs());
        assert_eq!(rooms.room_count(), 0);
        create_ingest_producer(&rooms, local_ip(), "garage", "Garage", "garage")
            .await
            .unwrap();
        assert_eq!(rooms.room_count(), 1);
        assert_eq!(rooms.list_producers("garage").await.len(), 1);
    }

    #[tokio::test]
    async fn missing_video_codec_is_a_hard_error_with_no_producer() {
        let audio_only: Vec<RtpCodecCapability> = ServerConfig::default_codecs()
            .into_iter()
            .filter(|c| c.kind == MediaKind::Audio)
            .collect();
        let rooms = rooms_with_codecs(audio_only);

        let result = create_ingest_producer(&rooms, local_ip(), "lab", "Door", "door").await;
        assert!(matches!(result, Err(SessionError::UnsupportedCodec)));
        assert!(rooms.list_producers("lab").await.is_empty());
    }

    #[tokio::test]
    async fn ingest_payload_type_tracks_the_codec_table() {
        // A deployment configured for H264 only must advertise 102, never a
        // silently substituted default.
        let h264_only: Vec<RtpCodecCapability> = ServerConfig::default_codecs()
            .into_iter()
            .filter(|c| c.mime_type == "video/H264")
            .collect();
        let rooms = rooms_with_codecs(h264_only);
        let created = create_ingest_producer(&rooms, local_ip(), "lab", "Door", "door")
            .await
            .unwrap();
        assert_eq!(created.payload_type, 102);
    }
}
