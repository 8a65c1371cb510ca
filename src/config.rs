#![forbid(unsafe_code)]

// Runtime configuration, resolved from the environment at startup.

use crate::routing::{MediaKind, RtcpFeedback, RtpCodecCapability};
use std::collections::BTreeMap;
use std::net::IpAddr;
use tracing::{info, warn};

/// Server-wide configuration.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Signaling/HTTP listen port.
    pub port: u16,
    /// Address advertised to ingest senders (must be reachable from the
    /// gateway; loopback only works for single-host deployments).
    pub announced_ip: IpAddr,
    /// Base URL of the media gateway control API, if one is deployed.
    pub gateway_api_url: Option<String>,
    /// Upper bound on concurrent signaling connections.
    pub max_connections: usize,
    /// Codec table the routing capability is configured with.
    pub media_codecs: Vec<RtpCodecCapability>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            port: 3000,
            announced_ip: IpAddr::from([127, 0, 0, 1]),
            gateway_api_url: None,
            max_connections: 10_000,
            media_codecs: Self::default_codecs(),
        }
    }
}

impl ServerConfig {
    /// Reads configuration from the environment, falling back to defaults.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(port) = std::env::var("PORT").ok().and_then(|v| v.parse().ok()) {
            config.port = port;
        }

        match std::env::var("ANNOUNCE_IP") {
            Ok(raw) => match raw.parse() {
                Ok(ip) => {
                    info!("Using ANNOUNCE_IP={}", ip);
                    config.announced_ip = ip;
                }
                Err(_) => warn!("Invalid ANNOUNCE_IP '{}', using {}", raw, config.announced_ip),
            },
            Err(_) => {
                info!("No ANNOUNCE_IP set, using {}", config.announced_ip);
            }
        }

        config.gateway_api_url = std::env::var("GATEWAY_API_URL").ok();
        if config.gateway_api_url.is_none() {
            info!("GATEWAY_API_URL not set — camera configuration endpoints disabled");
        }

        if let Some(max) = std::env::var("MAX_CONNECTIONS").ok().and_then(|v| v.parse().ok()) {
            if max == 0 {
                warn!("MAX_CONNECTIONS=0 would reject all connections, keeping default");
            } else {
                config.max_connections = max;
            }
        }

        config
    }

    /// Default codec table: Opus for audio; VP8, VP9 and H264 for video.
    pub fn default_codecs() -> Vec<RtpCodecCapability> {
        vec![
            RtpCodecCapability {
                kind: MediaKind::Audio,
                mime_type: "audio/opus".to_string(),
                preferred_payload_type: 111,
                clock_rate: 48000,
                channels: Some(2),
                parameters: BTreeMap::from([
                    ("minptime".to_string(), serde_json::json!(10)),
                    ("useinbandfec".to_string(), serde_json::json!(1)),
                ]),
                rtcp_feedback: vec![RtcpFeedback::new("transport-cc")],
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: BTreeMap::new(),
                rtcp_feedback: video_feedback(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP9".to_string(),
                preferred_payload_type: 98,
                clock_rate: 90000,
                channels: None,
                parameters: BTreeMap::new(),
                rtcp_feedback: video_feedback(),
            },
            RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/H264".to_string(),
                preferred_payload_type: 102,
                clock_rate: 90000,
                channels: None,
                parameters: BTreeMap::from([
                    ("level-asymmetry-allowed".to_string(), serde_json::json!(1)),
                    ("packetization-mode".to_string(), serde_json::json!(1)),
                    ("profile-level-id".to_string(), serde_json::json!("42e01f")),
                ]),
                rtcp_feedback: video_feedback(),
            },
        ]
    }
}

fn video_feedback() -> Vec<RtcpFeedback> {
    vec![
        RtcpFeedback::new("nack"),
        RtcpFeedback::with_parameter("nack", "pli"),
        RtcpFeedback::with_parameter("ccm", "fir"),
        RtcpFeedback::new("goog-remb"),
        RtcpFeedback::new("transport-cc"),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_codec_table_has_audio_and_video() {
        let codecs = ServerConfig::default_codecs();
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Audio));
        assert!(codecs.iter().any(|c| c.kind == MediaKind::Video));
        // Video codecs share the standard 90 kHz clock.
        for codec in codecs.iter().filter(|c| c.kind == MediaKind::Video) {
            assert_eq!(codec.clock_rate, 90000);
        }
    }
}
