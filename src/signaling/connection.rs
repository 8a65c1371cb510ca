#![forbid(unsafe_code)]

// WebSocket connection handler for individual peers.

use super::protocol::{ClientMessage, ServerMessage};
use crate::metrics::ServerMetrics;
use crate::room::{Rooms, SessionError};
use crate::routing::TransportDirection;
use axum::extract::ws::{Message, WebSocket};
use futures_util::{SinkExt, StreamExt};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::sync::OwnedSemaphorePermit;
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Bounded channel capacity per client. Messages queued beyond this are
/// stale; broadcasts drop them rather than blocking the room.
const CHANNEL_CAPACITY: usize = 64;

/// Close the connection if nothing arrives within this window. Publisher
/// bots keep alive every 10 s, browsers are chatty enough.
const IDLE_TIMEOUT: Duration = Duration::from_secs(300);

/// Serialize a message and enqueue it on the client's channel.
fn send_json(sender: &mpsc::Sender<Arc<String>>, msg: &ServerMessage) {
    match serde_json::to_string(msg) {
        Ok(json) => {
            let _ = sender.try_send(Arc::new(json));
        }
        Err(e) => warn!("Failed to serialize server message: {}", e),
    }
}

/// Handles a single WebSocket connection from accept to teardown.
pub async fn handle_connection(
    socket: WebSocket,
    rooms: Rooms,
    metrics: ServerMetrics,
    _permit: OwnedSemaphorePermit,
) {
    let peer_id = Uuid::new_v4().to_string();
    info!("New signaling connection: {}", peer_id);

    metrics.inc_connections_total();
    let _conn_guard = metrics.connection_active_guard();

    let (mut ws_sender, mut ws_receiver) = socket.split();
    let (tx, mut rx) = mpsc::channel::<Arc<String>>(CHANNEL_CAPACITY);

    let send_peer_id = peer_id.clone();
    let send_metrics = metrics.clone();
    let send_task = tokio::spawn(async move {
        while let Some(json) = rx.recv().await {
            send_metrics.inc_messages_sent();
            if ws_sender
                .send(Message::Text((*json).clone().into()))
                .await
                .is_err()
            {
                break;
            }
        }
        debug!("Send task finished for peer {}", send_peer_id);
    });

    let mut current_room_id: Option<String> = None;

    loop {
        let msg = match tokio::time::timeout(IDLE_TIMEOUT, ws_receiver.next()).await {
            Ok(Some(Ok(message))) => message,
            Ok(Some(Err(_))) | Ok(None) => break,
            Err(_) => {
                warn!("Idle timeout for peer {}", peer_id);
                break;
            }
        };

        match msg {
            Message::Text(text) => {
                metrics.inc_messages_received();
                match serde_json::from_str::<ClientMessage>(&text) {
                    Ok(client_msg) => {
                        let result = handle_client_message(
                            client_msg,
                            &peer_id,
                            &mut current_room_id,
                            &tx,
                            &rooms,
                        )
                        .await;
                        if let Err(e) = result {
                            // A failed operation is reported to this caller
                            // only; the session and the room carry on.
                            debug!("Request from peer {} failed: {}", peer_id, e);
                            metrics.inc_errors();
                            if tx.is_closed() {
                                break;
                            }
                            send_json(
                                &tx,
                                &ServerMessage::Error {
                                    message: e.to_string(),
                                },
                            );
                        }
                    }
                    Err(e) => {
                        metrics.inc_errors();
                        send_json(
                            &tx,
                            &ServerMessage::Error {
                                message: format!("Malformed message: {e}"),
                            },
                        );
                    }
                }
            }
            Message::Close(_) => break,
            // Ping/pong is handled by the WebSocket layer.
            _ => {}
        }
    }

    info!("Signaling connection closed: {}", peer_id);
    rooms.remove_peer(&peer_id).await;
    send_task.abort();
}

async fn handle_client_message(
    msg: ClientMessage,
    peer_id: &str,
    current_room_id: &mut Option<String>,
    tx: &mpsc::Sender<Arc<String>>,
    rooms: &Rooms,
) -> Result<(), SessionError> {
    match msg {
        ClientMessage::Join {
            room_id,
            role,
            publisher_id,
        } => {
            if current_room_id.is_some() {
                send_json(
                    tx,
                    &ServerMessage::Error {
                        message: "already joined a room".to_string(),
                    },
                );
                return Ok(());
            }
            // join() replies with router-rtp-capabilities and the producer
            // snapshot itself, under the room lock.
            rooms
                .join(&room_id, peer_id, role, publisher_id, tx.clone())
                .await;
            *current_room_id = Some(room_id);
            Ok(())
        }

        ClientMessage::CreateTransport { direction } => {
            let room_id = joined_room(current_room_id, peer_id)?;
            let parsed = TransportDirection::parse(&direction)
                .ok_or_else(|| SessionError::InvalidDirection(direction.clone()))?;
            let created = rooms.create_transport(&room_id, peer_id, parsed).await?;
            send_json(
                tx,
                &ServerMessage::TransportCreated {
                    transport_id: created.transport_id,
                    direction: created.direction.as_str().to_string(),
                    parameters: created.parameters,
                },
            );
            Ok(())
        }

        ClientMessage::ConnectTransport {
            transport_id,
            dtls_parameters,
        } => {
            let room_id = joined_room(current_room_id, peer_id)?;
            rooms
                .connect_transport(&room_id, peer_id, &transport_id, dtls_parameters)
                .await?;
            send_json(tx, &ServerMessage::TransportConnected { transport_id });
            Ok(())
        }

        ClientMessage::Produce {
            transport_id,
            kind,
            rtp_parameters,
            label,
            path,
        } => {
            let room_id = joined_room(current_room_id, peer_id)?;
            let producer_id = rooms
                .produce(
                    &room_id,
                    peer_id,
                    &transport_id,
                    kind,
                    rtp_parameters,
                    label,
                    path,
                )
                .await?;
            send_json(tx, &ServerMessage::Produced { producer_id });
            Ok(())
        }

        ClientMessage::ListProducers => {
            let room_id = joined_room(current_room_id, peer_id)?;
            let producers = rooms.list_producers(&room_id).await;
            send_json(tx, &ServerMessage::Producers { producers });
            Ok(())
        }

        ClientMessage::GetProducerInfo { producer_id } => {
            let room_id = joined_room(current_room_id, peer_id)?;
            let producer = rooms.producer_info(&room_id, &producer_id).await;
            send_json(tx, &ServerMessage::ProducerInfo { producer });
            Ok(())
        }

        ClientMessage::Consume {
            transport_id,
            producer_id,
            rtp_capabilities,
        } => {
            let room_id = joined_room(current_room_id, peer_id)?;
            let reply = rooms
                .consume(&room_id, peer_id, &transport_id, &producer_id, rtp_capabilities)
                .await?;
            send_json(
                tx,
                &ServerMessage::ConsumerCreated {
                    consumer_id: reply.consumer_id,
                    producer_id: reply.producer_id,
                    kind: reply.kind,
                    rtp_parameters: reply.rtp_parameters,
                },
            );
            Ok(())
        }

        ClientMessage::Resume { consumer_id } => {
            let room_id = joined_room(current_room_id, peer_id)?;
            // No-op when the consumer is already gone; resume races with
            // disconnect are expected.
            rooms.resume_consumer(&room_id, peer_id, &consumer_id).await;
            send_json(tx, &ServerMessage::ConsumerResumed { consumer_id });
            Ok(())
        }

        ClientMessage::StartCamera { params } => {
            rooms
                .broadcast_to_publisher_bots(&ServerMessage::StartCamera { params })
                .await;
            Ok(())
        }

        ClientMessage::StopCamera { params } => {
            rooms
                .broadcast_to_publisher_bots(&ServerMessage::StopCamera { params })
                .await;
            Ok(())
        }

        ClientMessage::PublisherKeepalive {
            room_id,
            publisher_id,
        } => {
            // The keepalive may target a different room than the one the bot
            // joined (bots park in a staging room and publish elsewhere).
            let target = room_id.or_else(|| current_room_id.clone());
            if let Some(target) = target {
                rooms.touch_publisher(&target, &publisher_id).await;
            }
            Ok(())
        }

        ClientMessage::ListPublishers => {
            let room_id = joined_room(current_room_id, peer_id)?;
            let publishers = rooms.list_publishers(&room_id).await;
            send_json(tx, &ServerMessage::Publishers { publishers });
            Ok(())
        }
    }
}

fn joined_room(current_room_id: &Option<String>, peer_id: &str) -> Result<String, SessionError> {
    current_room_id
        .clone()
        .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))
}
