#![forbid(unsafe_code)]

// RTP-level types exchanged with the routing engine and forwarded to clients.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// Media kind of a producer, consumer or codec.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MediaKind {
    Audio,
    Video,
}

impl fmt::Display for MediaKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MediaKind::Audio => write!(f, "audio"),
            MediaKind::Video => write!(f, "video"),
        }
    }
}

/// RTCP feedback mechanism advertised for a codec (e.g. "nack", "ccm fir").
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtcpFeedback {
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameter: Option<String>,
}

impl RtcpFeedback {
    pub fn new(kind: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: None,
        }
    }

    pub fn with_parameter(kind: &str, parameter: &str) -> Self {
        Self {
            kind: kind.to_string(),
            parameter: Some(parameter.to_string()),
        }
    }
}

/// One codec the routing engine is configured to route.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecCapability {
    pub kind: MediaKind,
    pub mime_type: String,
    pub preferred_payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// Codec set the engine advertises to joining peers.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCapabilities {
    pub codecs: Vec<RtpCodecCapability>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub header_extensions: Vec<serde_json::Value>,
}

impl RtpCapabilities {
    /// Whether these capabilities can receive a stream of the given codec.
    pub fn supports(&self, mime_type: &str, clock_rate: u32) -> bool {
        self.codecs.iter().any(|c| {
            c.mime_type.eq_ignore_ascii_case(mime_type) && c.clock_rate == clock_rate
        })
    }
}

/// Parameters of one codec within an RTP stream.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpCodecParameters {
    pub mime_type: String,
    pub payload_type: u8,
    pub clock_rate: u32,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub channels: Option<u8>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub parameters: BTreeMap<String, serde_json::Value>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub rtcp_feedback: Vec<RtcpFeedback>,
}

/// Parameters describing one RTP stream handed to the engine by a producer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RtpParameters {
    #[serde(default)]
    pub codecs: Vec<RtpCodecParameters>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub encodings: Vec<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rtcp: Option<serde_json::Value>,
}

impl RtpParameters {
    /// Builds send parameters from a router-advertised codec capability, so
    /// payload type, clock rate and feedback stay in sync with the engine's
    /// configuration instead of being hard-coded by the sender.
    pub fn from_capability(codec: &RtpCodecCapability) -> Self {
        Self {
            codecs: vec![RtpCodecParameters {
                mime_type: codec.mime_type.clone(),
                payload_type: codec.preferred_payload_type,
                clock_rate: codec.clock_rate,
                channels: codec.channels,
                parameters: codec.parameters.clone(),
                rtcp_feedback: codec.rtcp_feedback.clone(),
            }],
            encodings: Vec::new(),
            rtcp: None,
        }
    }

    /// Primary codec of the stream, if any.
    pub fn primary_codec(&self) -> Option<&RtpCodecParameters> {
        self.codecs.first()
    }
}

/// Direction of a peer-facing transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportDirection {
    Send,
    Recv,
}

impl TransportDirection {
    /// Parses the wire value; anything other than "send"/"recv" is rejected.
    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "send" => Some(TransportDirection::Send),
            "recv" => Some(TransportDirection::Recv),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            TransportDirection::Send => "send",
            TransportDirection::Recv => "recv",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn direction_parsing_accepts_only_send_and_recv() {
        assert_eq!(TransportDirection::parse("send"), Some(TransportDirection::Send));
        assert_eq!(TransportDirection::parse("recv"), Some(TransportDirection::Recv));
        assert_eq!(TransportDirection::parse("ingest"), None);
        assert_eq!(TransportDirection::parse(""), None);
    }

    #[test]
    fn parameters_follow_the_advertised_capability() {
        let codec = RtpCodecCapability {
            kind: MediaKind::Video,
            mime_type: "video/H264".to_string(),
            preferred_payload_type: 102,
            clock_rate: 90000,
            channels: None,
            parameters: BTreeMap::from([(
                "packetization-mode".to_string(),
                serde_json::json!(1),
            )]),
            rtcp_feedback: vec![RtcpFeedback::new("nack")],
        };

        let params = RtpParameters::from_capability(&codec);
        let primary = params.primary_codec().unwrap();
        assert_eq!(primary.payload_type, 102);
        assert_eq!(primary.clock_rate, 90000);
        assert_eq!(primary.mime_type, "video/H264");
        assert_eq!(primary.rtcp_feedback, codec.rtcp_feedback);
    }

    #[test]
    fn capability_support_matches_mime_and_clock_rate() {
        let caps = RtpCapabilities {
            codecs: vec![RtpCodecCapability {
                kind: MediaKind::Video,
                mime_type: "video/VP8".to_string(),
                preferred_payload_type: 96,
                clock_rate: 90000,
                channels: None,
                parameters: BTreeMap::new(),
                rtcp_feedback: Vec::new(),
            }],
            header_extensions: Vec::new(),
        };

        assert!(caps.supports("video/vp8", 90000));
        assert!(!caps.supports("video/VP8", 48000));
        assert!(!caps.supports("audio/opus", 90000));
    }
}
