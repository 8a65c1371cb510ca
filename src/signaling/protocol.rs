#![forbid(unsafe_code)]

// Signaling protocol — message types exchanged over the WebSocket channel.
// Event names are kebab-case tags, payload fields are camelCase.

use crate::room::peer::PeerRole;
use crate::room::presence::PublisherPresence;
use crate::room::producer::ProducerSummary;
use crate::routing::{MediaKind, RtpCapabilities, RtpParameters};
use serde::{Deserialize, Serialize};

/// Client-to-server messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    /// Join a room. Autonomous publishers declare their publisher id.
    #[serde(rename_all = "camelCase")]
    Join {
        room_id: String,
        role: PeerRole,
        #[serde(default, rename = "id")]
        publisher_id: Option<String>,
    },
    /// Allocate a transport; direction must be "send" or "recv".
    #[serde(rename_all = "camelCase")]
    CreateTransport {
        #[serde(default)]
        direction: String,
    },
    /// Complete transport establishment with client-side parameters.
    #[serde(rename_all = "camelCase")]
    ConnectTransport {
        transport_id: String,
        #[serde(default)]
        dtls_parameters: serde_json::Value,
    },
    /// Publish a stream on a send transport.
    #[serde(rename_all = "camelCase")]
    Produce {
        transport_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        #[serde(default)]
        label: String,
        #[serde(default)]
        path: String,
    },
    /// Snapshot of the room's producers.
    ListProducers,
    /// Late metadata lookup for a producer announced without metadata.
    #[serde(rename_all = "camelCase")]
    GetProducerInfo { producer_id: String },
    /// Subscribe to a producer.
    #[serde(rename_all = "camelCase")]
    Consume {
        transport_id: String,
        producer_id: String,
        rtp_capabilities: RtpCapabilities,
    },
    /// Resume a paused consumer once the playback sink is ready.
    #[serde(rename_all = "camelCase")]
    Resume { consumer_id: String },
    /// Camera control, relayed verbatim to every publisher bot.
    StartCamera {
        #[serde(flatten)]
        params: serde_json::Value,
    },
    StopCamera {
        #[serde(flatten)]
        params: serde_json::Value,
    },
    /// Liveness refresh from an autonomous publisher.
    #[serde(rename_all = "camelCase")]
    PublisherKeepalive {
        #[serde(default)]
        room_id: Option<String>,
        #[serde(rename = "id")]
        publisher_id: String,
    },
    /// Live publishers of the current room.
    ListPublishers,
}

/// Server-to-client messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Router codec capabilities, sent first after a join.
    #[serde(rename_all = "camelCase")]
    RouterRtpCapabilities { rtp_capabilities: RtpCapabilities },
    /// Join acknowledgment with a point-in-time producer snapshot.
    #[serde(rename_all = "camelCase")]
    Joined {
        peer_id: String,
        producers: Vec<ProducerSummary>,
    },
    #[serde(rename_all = "camelCase")]
    TransportCreated {
        transport_id: String,
        direction: String,
        parameters: serde_json::Value,
    },
    #[serde(rename_all = "camelCase")]
    TransportConnected { transport_id: String },
    #[serde(rename_all = "camelCase")]
    Produced { producer_id: String },
    Producers { producers: Vec<ProducerSummary> },
    /// Reply to a metadata lookup; absent when the producer is gone.
    ProducerInfo {
        producer: Option<ProducerSummary>,
    },
    /// Consumer created paused; the client resumes it explicitly.
    #[serde(rename_all = "camelCase")]
    ConsumerCreated {
        consumer_id: String,
        producer_id: String,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    },
    #[serde(rename_all = "camelCase")]
    ConsumerResumed { consumer_id: String },
    /// A producer appeared in the room.
    #[serde(rename_all = "camelCase")]
    NewProducer {
        producer_id: String,
        kind: MediaKind,
        label: String,
        path: String,
    },
    /// A producer left the room. Sent exactly once per producer.
    #[serde(rename_all = "camelCase")]
    ProducerClosed { producer_id: String },
    Publishers { publishers: Vec<PublisherPresence> },
    /// Camera control relayed to publisher bots.
    StartCamera {
        #[serde(flatten)]
        params: serde_json::Value,
    },
    StopCamera {
        #[serde(flatten)]
        params: serde_json::Value,
    },
    Error { message: String },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn join_accepts_the_publisher_bot_wire_shape() {
        let json = r#"{"type":"join","roomId":"_ingest_","role":"publisher-bot","id":"rtsp-publisher"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::Join {
                room_id,
                role,
                publisher_id,
            } => {
                assert_eq!(room_id, "_ingest_");
                assert_eq!(role, PeerRole::PublisherBot);
                assert_eq!(publisher_id.as_deref(), Some("rtsp-publisher"));
            }
            other => panic!("expected join, got {other:?}"),
        }
    }

    #[test]
    fn new_producer_uses_kebab_case_tag_and_camel_case_fields() {
        let msg = ServerMessage::NewProducer {
            producer_id: "p1".to_string(),
            kind: MediaKind::Video,
            label: "cam1".to_string(),
            path: "cams/cam1".to_string(),
        };
        let value = serde_json::to_value(&msg).unwrap();
        assert_eq!(value["type"], "new-producer");
        assert_eq!(value["producerId"], "p1");
        assert_eq!(value["kind"], "video");
        assert_eq!(value["label"], "cam1");
    }

    #[test]
    fn camera_commands_pass_extra_keys_through() {
        let json = r#"{"type":"start-camera","roomId":"lab","id":"cam-3","label":"Door","path":"door","rtspUrl":"rtsp://mediamtx:8554/door"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        let params = match msg {
            ClientMessage::StartCamera { params } => params,
            other => panic!("expected start-camera, got {other:?}"),
        };
        assert_eq!(params["rtspUrl"], "rtsp://mediamtx:8554/door");

        let relayed = serde_json::to_value(&ServerMessage::StartCamera { params }).unwrap();
        assert_eq!(relayed["type"], "start-camera");
        assert_eq!(relayed["id"], "cam-3");
        assert_eq!(relayed["rtspUrl"], "rtsp://mediamtx:8554/door");
    }

    #[test]
    fn keepalive_carries_room_and_publisher_ids() {
        let json = r#"{"type":"publisher-keepalive","roomId":"lab","id":"rtsp-publisher"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::PublisherKeepalive {
                room_id,
                publisher_id,
            } => {
                assert_eq!(room_id.as_deref(), Some("lab"));
                assert_eq!(publisher_id, "rtsp-publisher");
            }
            other => panic!("expected keepalive, got {other:?}"),
        }
    }

    #[test]
    fn create_transport_direction_defaults_to_empty() {
        // Direction validation happens in the handler so the client gets a
        // structured invalid-direction error, not a parse failure.
        let json = r#"{"type":"create-transport"}"#;
        let msg: ClientMessage = serde_json::from_str(json).unwrap();
        match msg {
            ClientMessage::CreateTransport { direction } => assert_eq!(direction, ""),
            other => panic!("expected create-transport, got {other:?}"),
        }
    }
}
