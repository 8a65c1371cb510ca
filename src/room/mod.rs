#![forbid(unsafe_code)]

// Room registry and peer session state.

pub mod peer;
pub mod presence;
pub mod producer;

use crate::metrics::ServerMetrics;
use crate::routing::{
    IngestEndpoint, MediaKind, MediaProducer, MediaTransport, RoutingEngine, RoutingError,
    RtpCapabilities, RtpParameters, TransportDirection,
};
use crate::signaling::protocol::ServerMessage;
use peer::{OwnedConsumer, OwnedTransport, Peer, PeerRole};
use presence::{PresenceTable, PublisherPresence, SWEEP_INTERVAL};
use producer::{ProducerRecord, ProducerSummary};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock as StdRwLock;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio::sync::RwLock as TokioRwLock;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Errors a signaling or ingest operation can report to its caller. A failed
/// operation never affects other peers; the caller gets one of these and the
/// room carries on.
#[derive(Error, Debug)]
pub enum SessionError {
    /// Rooms are created on demand, so this never reaches a caller; it exists
    /// for completeness of the taxonomy.
    #[error("room not found: {0}")]
    RoomNotFound(String),

    #[error("peer not found: {0}")]
    PeerNotFound(String),

    #[error("transport not found: {0}")]
    TransportNotFound(String),

    #[error("invalid transport direction: {0:?}")]
    InvalidDirection(String),

    #[error("cannot consume producer {0}")]
    CannotConsume(String),

    #[error("no video codec configured in router capabilities")]
    UnsupportedCodec,

    #[error("gateway error ({status}): {message}")]
    Gateway { status: u16, message: String },

    #[error(transparent)]
    Routing(#[from] RoutingError),
}

pub type SessionResult<T> = Result<T, SessionError>;

/// Reply to a successful transport creation.
pub struct TransportCreated {
    pub transport_id: String,
    pub direction: TransportDirection,
    pub parameters: serde_json::Value,
}

/// Reply to a successful consume request. The consumer starts paused.
pub struct ConsumerReply {
    pub consumer_id: String,
    pub producer_id: String,
    pub kind: MediaKind,
    pub rtp_parameters: RtpParameters,
}

/// One viewing session: peers, producers and publisher presence.
pub struct Room {
    pub id: String,
    peers: HashMap<String, Peer>,
    producers: HashMap<String, ProducerRecord>,
    next_seq: u64,
    pub presence: PresenceTable,
}

impl Room {
    fn new(id: String) -> Self {
        Self {
            id,
            peers: HashMap::new(),
            producers: HashMap::new(),
            next_seq: 0,
            presence: PresenceTable::default(),
        }
    }

    fn next_seq(&mut self) -> u64 {
        let seq = self.next_seq;
        self.next_seq += 1;
        seq
    }

    /// Point-in-time producer listing in creation order.
    fn producer_snapshot(&self) -> Vec<ProducerSummary> {
        let mut records: Vec<&ProducerRecord> = self.producers.values().collect();
        records.sort_by_key(|r| r.seq);
        records.iter().map(|r| r.summary()).collect()
    }

    /// Broadcast to every peer except the originator. Fire-and-forget: a full
    /// or closed channel drops the message for that recipient only.
    fn broadcast_except(&self, sender_id: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for (id, peer) in &self.peers {
            if id != sender_id {
                deliver(peer, &json, &self.id);
            }
        }
    }

    fn broadcast_all(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize broadcast message: {}", e);
                return;
            }
        };
        for peer in self.peers.values() {
            deliver(peer, &json, &self.id);
        }
    }

    fn send_to(&self, peer_id: &str, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize message: {}", e);
                return;
            }
        };
        if let Some(peer) = self.peers.get(peer_id) {
            deliver(peer, &json, &self.id);
        }
    }
}

fn deliver(peer: &Peer, json: &Arc<String>, room_id: &str) {
    match peer.sender.try_send(Arc::clone(json)) {
        Ok(()) => {}
        Err(mpsc::error::TrySendError::Full(_)) => {
            warn!(
                "Channel full for peer {} in room {}, dropping message",
                peer.id, room_id
            );
        }
        Err(mpsc::error::TrySendError::Closed(_)) => {
            debug!(
                "Channel closed for peer {} in room {} (disconnected)",
                peer.id, room_id
            );
        }
    }
}

/// The room registry. All signaling and ingest operations go through here.
///
/// Lock discipline: the outer map is a std::sync::RwLock held only for brief
/// lookups and inserts (never across an await), each room has its own
/// tokio::sync::RwLock. Engine calls run with no room lock held, and every
/// mutation after such a suspension point re-validates that the room, peer
/// and transport it is about to touch still exist; half-made engine objects
/// are closed instead of registered when they do not.
#[derive(Clone)]
pub struct Rooms {
    inner: Arc<RoomsInner>,
}

struct RoomsInner {
    rooms: StdRwLock<HashMap<String, Arc<TokioRwLock<Room>>>>,
    engine: Arc<dyn RoutingEngine>,
    metrics: ServerMetrics,
}

impl Rooms {
    pub fn new(engine: Arc<dyn RoutingEngine>, metrics: ServerMetrics) -> Self {
        Self {
            inner: Arc::new(RoomsInner {
                rooms: StdRwLock::new(HashMap::new()),
                engine,
                metrics,
            }),
        }
    }

    pub fn engine(&self) -> &Arc<dyn RoutingEngine> {
        &self.inner.engine
    }

    /// Idempotent get-or-create. Safe under concurrent joins for the same
    /// unseen id: the insert is re-checked under the write lock, so one Room
    /// object exists per id. Rooms are never removed.
    pub fn ensure_room(&self, room_id: &str) -> Arc<TokioRwLock<Room>> {
        {
            let rooms = self.inner.rooms.read().unwrap_or_else(|e| e.into_inner());
            if let Some(room) = rooms.get(room_id) {
                return Arc::clone(room);
            }
        }
        let mut rooms = self.inner.rooms.write().unwrap_or_else(|e| e.into_inner());
        if let Some(existing) = rooms.get(room_id) {
            return Arc::clone(existing);
        }
        info!("Creating room {}", room_id);
        self.inner.metrics.inc_rooms_created();
        let room = Arc::new(TokioRwLock::new(Room::new(room_id.to_string())));
        rooms.insert(room_id.to_string(), Arc::clone(&room));
        room
    }

    /// Existing room, no auto-create (lookups must not conjure rooms).
    fn room(&self, room_id: &str) -> Option<Arc<TokioRwLock<Room>>> {
        let rooms = self.inner.rooms.read().unwrap_or_else(|e| e.into_inner());
        rooms.get(room_id).cloned()
    }

    /// Registers a peer and hands it the router capabilities plus a
    /// point-in-time producer snapshot. Both messages are enqueued under the
    /// room's write lock, so the snapshot can neither miss nor duplicate a
    /// concurrently announced producer.
    pub async fn join(
        &self,
        room_id: &str,
        peer_id: &str,
        role: PeerRole,
        publisher_id: Option<String>,
        sender: mpsc::Sender<Arc<String>>,
    ) {
        let room_lock = self.ensure_room(room_id);
        let mut room = room_lock.write().await;

        if role.is_publisher() {
            if let Some(pid) = &publisher_id {
                room.presence.touch(pid);
            }
        }

        let producers = room.producer_snapshot();
        room.peers.insert(
            peer_id.to_string(),
            Peer::new(peer_id.to_string(), role, publisher_id, sender),
        );
        room.send_to(
            peer_id,
            &ServerMessage::RouterRtpCapabilities {
                rtp_capabilities: self.inner.engine.rtp_capabilities(),
            },
        );
        room.send_to(
            peer_id,
            &ServerMessage::Joined {
                peer_id: peer_id.to_string(),
                producers,
            },
        );

        self.inner.metrics.inc_joins();
        info!("Peer {} joined room {} as {:?}", peer_id, room_id, role);
    }

    /// Allocates a transport for a joined peer and installs a close observer
    /// that removes it from the peer's ledger.
    pub async fn create_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        direction: TransportDirection,
    ) -> SessionResult<TransportCreated> {
        let room_lock = self
            .room(room_id)
            .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))?;

        {
            let room = room_lock.read().await;
            if !room.peers.contains_key(peer_id) {
                return Err(SessionError::PeerNotFound(peer_id.to_string()));
            }
        }

        let transport = self.inner.engine.create_transport().await?;

        // The peer may have disconnected while the engine call was in flight.
        let mut room = room_lock.write().await;
        match room.peers.get_mut(peer_id) {
            Some(peer) => {
                peer.transports.push(OwnedTransport {
                    direction,
                    handle: Arc::clone(&transport),
                });
            }
            None => {
                drop(room);
                transport.close().await;
                return Err(SessionError::PeerNotFound(peer_id.to_string()));
            }
        }
        drop(room);

        self.install_transport_observer(room_id, peer_id, &transport);
        debug!(
            "Created {} transport {} for peer {} in room {}",
            direction.as_str(),
            transport.id(),
            peer_id,
            room_id
        );

        Ok(TransportCreated {
            transport_id: transport.id().to_string(),
            direction,
            parameters: transport.connect_payload(),
        })
    }

    /// Completes transport establishment with the client's remote parameters.
    pub async fn connect_transport(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &str,
        remote_parameters: serde_json::Value,
    ) -> SessionResult<()> {
        let room_lock = self
            .room(room_id)
            .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))?;

        let transport = {
            let room = room_lock.read().await;
            let peer = room
                .peers
                .get(peer_id)
                .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))?;
            let owned = peer
                .transport(transport_id)
                .ok_or_else(|| SessionError::TransportNotFound(transport_id.to_string()))?;
            Arc::clone(&owned.handle)
        };

        transport.connect(remote_parameters).await?;
        debug!("Connected transport {} for peer {}", transport_id, peer_id);
        Ok(())
    }

    /// Publishes a stream on one of the peer's send transports and announces
    /// it to every other peer in the room.
    #[allow(clippy::too_many_arguments)]
    pub async fn produce(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &str,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
        label: String,
        path: String,
    ) -> SessionResult<String> {
        let room_lock = self
            .room(room_id)
            .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))?;

        let transport = {
            let room = room_lock.read().await;
            let peer = room
                .peers
                .get(peer_id)
                .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))?;
            let owned = peer
                .transport(transport_id)
                .ok_or_else(|| SessionError::TransportNotFound(transport_id.to_string()))?;
            if owned.direction != TransportDirection::Send {
                return Err(SessionError::InvalidDirection(
                    owned.direction.as_str().to_string(),
                ));
            }
            Arc::clone(&owned.handle)
        };

        let producer = transport.produce(kind, rtp_parameters).await?;
        let producer_id = producer.id().to_string();

        {
            // Re-validate: the peer (or just this transport) may be gone, in
            // which case the half-made producer is discarded, not registered.
            let mut room = room_lock.write().await;
            let still_valid = room
                .peers
                .get(peer_id)
                .map(|p| p.transport(transport_id).is_some());
            match still_valid {
                Some(true) => {}
                Some(false) => {
                    drop(room);
                    producer.close().await;
                    return Err(SessionError::TransportNotFound(transport_id.to_string()));
                }
                None => {
                    drop(room);
                    producer.close().await;
                    return Err(SessionError::PeerNotFound(peer_id.to_string()));
                }
            }

            let seq = room.next_seq();
            room.producers.insert(
                producer_id.clone(),
                ProducerRecord {
                    id: producer_id.clone(),
                    kind,
                    label: label.clone(),
                    path: path.clone(),
                    owner: Some(peer_id.to_string()),
                    seq,
                    handle: Arc::clone(&producer),
                    ingest: None,
                },
            );
            if let Some(peer) = room.peers.get_mut(peer_id) {
                peer.producers.push(producer_id.clone());
            }
            room.broadcast_except(
                peer_id,
                &ServerMessage::NewProducer {
                    producer_id: producer_id.clone(),
                    kind,
                    label: label.clone(),
                    path: path.clone(),
                },
            );
        }

        self.install_producer_observer(room_id, &producer);
        self.inner.metrics.inc_producers();
        info!(
            "Peer {} produced {} '{}' ({}) in room {}",
            peer_id, kind, label, path, room_id
        );
        Ok(producer_id)
    }

    /// Registers an ingest-created producer (no owning peer) and announces it
    /// to the whole room. The address-learning endpoint is retired together
    /// with the producer.
    pub async fn register_ingest_producer(
        &self,
        room_id: &str,
        kind: MediaKind,
        label: String,
        path: String,
        producer: Arc<dyn MediaProducer>,
        endpoint: Arc<dyn IngestEndpoint>,
    ) {
        let room_lock = self.ensure_room(room_id);
        let producer_id = producer.id().to_string();
        {
            let mut room = room_lock.write().await;
            let seq = room.next_seq();
            room.producers.insert(
                producer_id.clone(),
                ProducerRecord {
                    id: producer_id.clone(),
                    kind,
                    label: label.clone(),
                    path: path.clone(),
                    owner: None,
                    seq,
                    handle: Arc::clone(&producer),
                    ingest: Some(endpoint),
                },
            );
            room.broadcast_all(&ServerMessage::NewProducer {
                producer_id: producer_id.clone(),
                kind,
                label: label.clone(),
                path: path.clone(),
            });
        }
        self.install_producer_observer(room_id, &producer);
        self.inner.metrics.inc_ingest_producers();
        info!(
            "Ingest producer {} '{}' ({}) registered in room {}",
            producer_id, label, path, room_id
        );
    }

    /// Deterministic snapshot of the room's producers in creation order.
    pub async fn list_producers(&self, room_id: &str) -> Vec<ProducerSummary> {
        match self.room(room_id) {
            Some(room_lock) => room_lock.read().await.producer_snapshot(),
            None => Vec::new(),
        }
    }

    /// Late metadata lookup for viewers that received a bare notification.
    pub async fn producer_info(&self, room_id: &str, producer_id: &str) -> Option<ProducerSummary> {
        let room_lock = self.room(room_id)?;
        let room = room_lock.read().await;
        room.producers.get(producer_id).map(|r| r.summary())
    }

    /// Subscribes a peer to a producer. The compatibility test runs first and
    /// an incompatible request leaves all tables untouched. The consumer is
    /// created paused.
    pub async fn consume(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &str,
        producer_id: &str,
        capabilities: RtpCapabilities,
    ) -> SessionResult<ConsumerReply> {
        let room_lock = self
            .room(room_id)
            .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))?;

        let transport = {
            let room = room_lock.read().await;
            let peer = room
                .peers
                .get(peer_id)
                .ok_or_else(|| SessionError::PeerNotFound(peer_id.to_string()))?;
            let owned = peer
                .transport(transport_id)
                .ok_or_else(|| SessionError::TransportNotFound(transport_id.to_string()))?;
            if !room.producers.contains_key(producer_id) {
                // Stale id, or a producer from another room.
                return Err(SessionError::CannotConsume(producer_id.to_string()));
            }
            Arc::clone(&owned.handle)
        };

        if !self
            .inner
            .engine
            .can_consume(producer_id, &capabilities)
            .await
        {
            return Err(SessionError::CannotConsume(producer_id.to_string()));
        }

        let consumer = transport.consume(producer_id, &capabilities).await?;

        // Re-validate before registering: a disconnect may have raced the
        // engine call.
        let mut room = room_lock.write().await;
        let still_valid = room
            .peers
            .get(peer_id)
            .map(|p| p.transport(transport_id).is_some());
        match still_valid {
            Some(true) => {}
            _ => {
                drop(room);
                consumer.close().await;
                return Err(SessionError::PeerNotFound(peer_id.to_string()));
            }
        }
        let reply = ConsumerReply {
            consumer_id: consumer.id().to_string(),
            producer_id: consumer.producer_id().to_string(),
            kind: consumer.kind(),
            rtp_parameters: consumer.rtp_parameters(),
        };
        if let Some(peer) = room.peers.get_mut(peer_id) {
            peer.consumers.push(OwnedConsumer {
                transport_id: transport_id.to_string(),
                handle: consumer,
            });
        }
        drop(room);

        self.inner.metrics.inc_consumers();
        debug!(
            "Peer {} consuming producer {} in room {}",
            peer_id, producer_id, room_id
        );
        Ok(reply)
    }

    /// Resumes one of the peer's consumers. Resume races with disconnect are
    /// expected and harmless, so a missing consumer is a no-op rather than an
    /// error.
    pub async fn resume_consumer(&self, room_id: &str, peer_id: &str, consumer_id: &str) {
        let Some(room_lock) = self.room(room_id) else {
            return;
        };
        let consumer = {
            let room = room_lock.read().await;
            room.peers
                .get(peer_id)
                .and_then(|p| p.consumer(consumer_id))
                .cloned()
        };
        if let Some(consumer) = consumer {
            if let Err(e) = consumer.resume().await {
                debug!("Resume of consumer {} ignored: {}", consumer_id, e);
            }
        }
    }

    /// Refreshes a publisher's presence entry. A keepalive for a room that
    /// does not exist yet is dropped; rooms are only created by joins and
    /// ingest requests.
    pub async fn touch_publisher(&self, room_id: &str, publisher_id: &str) {
        let Some(room_lock) = self.room(room_id) else {
            debug!("Keepalive for unknown room {} dropped", room_id);
            return;
        };
        room_lock.write().await.presence.touch(publisher_id);
    }

    /// Live publishers for a room (read-time TTL filtering included).
    pub async fn list_publishers(&self, room_id: &str) -> Vec<PublisherPresence> {
        match self.room(room_id) {
            Some(room_lock) => room_lock.read().await.presence.live(),
            None => Vec::new(),
        }
    }

    /// Relays a camera control command to every connected publisher-bot peer,
    /// in any room. Bots self-filter by camera id.
    pub async fn broadcast_to_publisher_bots(&self, message: &ServerMessage) {
        let json = match serde_json::to_string(message) {
            Ok(j) => Arc::new(j),
            Err(e) => {
                warn!("Failed to serialize camera command: {}", e);
                return;
            }
        };
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.inner.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        for room_lock in room_locks {
            let room = room_lock.read().await;
            for peer in room.peers.values() {
                if peer.role == PeerRole::PublisherBot {
                    deliver(peer, &json, &room.id);
                }
            }
        }
    }

    /// Terminal teardown for a disconnected peer: closes everything it owned,
    /// announces its producers as closed (exactly once), and removes it from
    /// every room it appears in. Other peers' state is untouched beyond
    /// dropping their subscriptions to the departed producers.
    pub async fn remove_peer(&self, peer_id: &str) {
        let room_locks: Vec<(String, Arc<TokioRwLock<Room>>)> = {
            let rooms = self.inner.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms
                .iter()
                .map(|(id, r)| (id.clone(), Arc::clone(r)))
                .collect()
        };

        for (room_id, room_lock) in room_locks {
            let mut removed: Option<Peer> = None;
            let mut closed_records: Vec<ProducerRecord> = Vec::new();
            let mut orphaned = Vec::new();
            {
                let mut room = room_lock.write().await;
                if let Some(mut peer) = room.peers.remove(peer_id) {
                    // Pull the peer's producer records out of the table and
                    // notify the room now; the engine-side close observers
                    // that fire later will find nothing left to announce.
                    for producer_id in peer.producers.drain(..) {
                        if let Some(record) = room.producers.remove(&producer_id) {
                            room.broadcast_all(&ServerMessage::ProducerClosed {
                                producer_id: record.id.clone(),
                            });
                            closed_records.push(record);
                        }
                    }
                    for record in &closed_records {
                        for other in room.peers.values_mut() {
                            other.consumers.retain(|c| {
                                if c.handle.producer_id() == record.id {
                                    orphaned.push(Arc::clone(&c.handle));
                                    false
                                } else {
                                    true
                                }
                            });
                        }
                    }
                    removed = Some(peer);
                }
            }

            if let Some(peer) = removed {
                info!("Peer {} left room {}", peer_id, room_id);
                for consumer in orphaned {
                    consumer.close().await;
                }
                for consumer in peer.consumers {
                    consumer.handle.close().await;
                }
                for record in closed_records {
                    record.handle.close().await;
                    if let Some(endpoint) = record.ingest {
                        endpoint.close().await;
                    }
                }
                for transport in peer.transports {
                    transport.handle.close().await;
                }
            }
        }
    }

    /// Idempotent close path shared by the "producer closed" and "owning
    /// transport closed" engine signals: whichever arrives first removes the
    /// record and broadcasts; the loser finds the table entry gone.
    async fn handle_producer_closed(&self, room_id: &str, producer_id: &str) {
        let Some(room_lock) = self.room(room_id) else {
            return;
        };
        let (record, orphaned) = {
            let mut room = room_lock.write().await;
            let Some(record) = room.producers.remove(producer_id) else {
                return;
            };
            if let Some(owner) = &record.owner {
                if let Some(peer) = room.peers.get_mut(owner) {
                    peer.producers.retain(|id| id != producer_id);
                }
            }
            let mut orphaned = Vec::new();
            for peer in room.peers.values_mut() {
                peer.consumers.retain(|c| {
                    if c.handle.producer_id() == producer_id {
                        orphaned.push(Arc::clone(&c.handle));
                        false
                    } else {
                        true
                    }
                });
            }
            room.broadcast_all(&ServerMessage::ProducerClosed {
                producer_id: producer_id.to_string(),
            });
            (record, orphaned)
        };

        info!("Producer {} closed in room {}", producer_id, room_id);
        for consumer in orphaned {
            consumer.close().await;
        }
        record.handle.close().await;
        if let Some(endpoint) = record.ingest {
            endpoint.close().await;
        }
    }

    async fn handle_transport_closed(&self, room_id: &str, peer_id: &str, transport_id: &str) {
        let Some(room_lock) = self.room(room_id) else {
            return;
        };
        let reaped = {
            let mut room = room_lock.write().await;
            match room.peers.get_mut(peer_id) {
                Some(peer) => {
                    peer.remove_transport(transport_id);
                    let mut reaped = Vec::new();
                    peer.consumers.retain(|c| {
                        if c.transport_id == transport_id {
                            reaped.push(Arc::clone(&c.handle));
                            false
                        } else {
                            true
                        }
                    });
                    reaped
                }
                None => Vec::new(),
            }
        };
        for consumer in reaped {
            consumer.close().await;
        }
        debug!(
            "Transport {} of peer {} retired from room {}",
            transport_id, peer_id, room_id
        );
    }

    fn install_transport_observer(
        &self,
        room_id: &str,
        peer_id: &str,
        transport: &Arc<dyn MediaTransport>,
    ) {
        let rooms = self.clone();
        let room_id = room_id.to_string();
        let peer_id = peer_id.to_string();
        let transport_id = transport.id().to_string();
        transport.on_close(Box::new(move || {
            tokio::spawn(async move {
                rooms
                    .handle_transport_closed(&room_id, &peer_id, &transport_id)
                    .await;
            });
        }));
    }

    fn install_producer_observer(&self, room_id: &str, producer: &Arc<dyn MediaProducer>) {
        let rooms = self.clone();
        let room_id = room_id.to_string();
        let producer_id = producer.id().to_string();
        producer.on_close(Box::new(move || {
            tokio::spawn(async move {
                rooms.handle_producer_closed(&room_id, &producer_id).await;
            });
        }));
    }

    /// Periodic publisher-presence sweep. Runs on the shared scheduler and
    /// does no I/O under room locks.
    pub fn spawn_presence_sweep(&self) -> JoinHandle<()> {
        let rooms = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(SWEEP_INTERVAL);
            loop {
                ticker.tick().await;
                let room_locks: Vec<(String, Arc<TokioRwLock<Room>>)> = {
                    let map = rooms.inner.rooms.read().unwrap_or_else(|e| e.into_inner());
                    map.iter()
                        .map(|(id, r)| (id.clone(), Arc::clone(r)))
                        .collect()
                };
                for (room_id, room_lock) in room_locks {
                    let swept = room_lock.write().await.presence.sweep();
                    if swept > 0 {
                        debug!("Swept {} stale publisher(s) from room {}", swept, room_id);
                    }
                }
            }
        })
    }

    pub fn room_count(&self) -> usize {
        self.inner
            .rooms
            .read()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }

    pub async fn peer_count(&self) -> usize {
        let room_locks: Vec<Arc<TokioRwLock<Room>>> = {
            let rooms = self.inner.rooms.read().unwrap_or_else(|e| e.into_inner());
            rooms.values().cloned().collect()
        };
        let mut total = 0;
        for room_lock in room_locks {
            total += room_lock.read().await.peers.len();
        }
        total
    }

    pub async fn has_peer(&self, room_id: &str, peer_id: &str) -> bool {
        match self.room(room_id) {
            Some(room_lock) => room_lock.read().await.peers.contains_key(peer_id),
            None => false,
        }
    }
}

#[cfg(test)]
impl Rooms {
    async fn transport_handle(
        &self,
        room_id: &str,
        peer_id: &str,
        transport_id: &str,
    ) -> Option<Arc<dyn MediaTransport>> {
        let room_lock = self.room(room_id)?;
        let room = room_lock.read().await;
        room.peers
            .get(peer_id)
            .and_then(|p| p.transport(transport_id))
            .map(|t| Arc::clone(&t.handle))
    }

    async fn producer_handle(
        &self,
        room_id: &str,
        producer_id: &str,
    ) -> Option<Arc<dyn MediaProducer>> {
        let room_lock = self.room(room_id)?;
        let room = room_lock.read().await;
        room.producers
            .get(producer_id)
            .map(|r| Arc::clone(&r.handle))
    }

    async fn consumer_handle(
        &self,
        room_id: &str,
        peer_id: &str,
        consumer_id: &str,
    ) -> Option<Arc<dyn crate::routing::MediaConsumer>> {
        let room_lock = self.room(room_id)?;
        let room = room_lock.read().await;
        room.peers
            .get(peer_id)
            .and_then(|p| p.consumer(consumer_id))
            .cloned()
    }

    async fn consumer_count(&self, room_id: &str, peer_id: &str) -> usize {
        match self.room(room_id) {
            Some(room_lock) => {
                let room = room_lock.read().await;
                room.peers
                    .get(peer_id)
                    .map(|p| p.consumers.len())
                    .unwrap_or(0)
            }
            None => 0,
        }
    }

    async fn transport_count(&self, room_id: &str, peer_id: &str) -> usize {
        match self.room(room_id) {
            Some(room_lock) => {
                let room = room_lock.read().await;
                room.peers
                    .get(peer_id)
                    .map(|p| p.transports.len())
                    .unwrap_or(0)
            }
            None => 0,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use crate::routing::LoopbackEngine;
    use std::time::Duration;

    fn setup() -> Rooms {
        let engine: Arc<dyn RoutingEngine> =
            Arc::new(LoopbackEngine::new(ServerConfig::default_codecs()));
        Rooms::new(engine, ServerMetrics::new())
    }

    async fn join(
        rooms: &Rooms,
        room_id: &str,
        peer_id: &str,
        role: PeerRole,
    ) -> mpsc::Receiver<Arc<String>> {
        let (tx, rx) = mpsc::channel(64);
        rooms.join(room_id, peer_id, role, None, tx).await;
        rx
    }

    fn drain(rx: &mut mpsc::Receiver<Arc<String>>) -> Vec<ServerMessage> {
        let mut messages = Vec::new();
        while let Ok(json) = rx.try_recv() {
            messages.push(serde_json::from_str(&json).expect("well-formed server message"));
        }
        messages
    }

    /// Give spawned close observers a chance to run.
    async fn settle() {
        tokio::time::sleep(Duration::from_millis(30)).await;
    }

    async fn publish(rooms: &Rooms, room_id: &str, peer_id: &str, label: &str) -> (String, String) {
        let created = rooms
            .create_transport(room_id, peer_id, TransportDirection::Send)
            .await
            .unwrap();
        let codec = ServerConfig::default_codecs()
            .into_iter()
            .find(|c| c.kind == MediaKind::Video)
            .unwrap();
        let producer_id = rooms
            .produce(
                room_id,
                peer_id,
                &created.transport_id,
                MediaKind::Video,
                RtpParameters::from_capability(&codec),
                label.to_string(),
                format!("cams/{label}"),
            )
            .await
            .unwrap();
        (created.transport_id, producer_id)
    }

    #[tokio::test]
    async fn join_delivers_capabilities_then_snapshot() {
        let rooms = setup();
        let mut rx = join(&rooms, "lab", "viewer-1", PeerRole::Viewer).await;
        let messages = drain(&mut rx);
        assert!(matches!(
            messages[0],
            ServerMessage::RouterRtpCapabilities { .. }
        ));
        match &messages[1] {
            ServerMessage::Joined { peer_id, producers } => {
                assert_eq!(peer_id, "viewer-1");
                assert!(producers.is_empty());
            }
            other => panic!("expected joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn ensure_room_is_idempotent() {
        let rooms = setup();
        let a = rooms.ensure_room("lab");
        let b = rooms.ensure_room("lab");
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(rooms.room_count(), 1);
    }

    #[tokio::test]
    async fn produce_announces_to_other_peers_only() {
        let rooms = setup();
        let mut viewer_rx = join(&rooms, "lab", "viewer", PeerRole::Viewer).await;
        let mut publisher_rx = join(&rooms, "lab", "pub", PeerRole::Publisher).await;
        drain(&mut viewer_rx);
        drain(&mut publisher_rx);

        let (_, producer_id) = publish(&rooms, "lab", "pub", "cam1").await;

        let viewer_messages = drain(&mut viewer_rx);
        match viewer_messages.as_slice() {
            [ServerMessage::NewProducer {
                producer_id: id,
                label,
                path,
                kind,
            }] => {
                assert_eq!(id, &producer_id);
                assert_eq!(label, "cam1");
                assert_eq!(path, "cams/cam1");
                assert_eq!(*kind, MediaKind::Video);
            }
            other => panic!("expected one new-producer, got {other:?}"),
        }
        // The producing peer does not hear about its own producer.
        assert!(drain(&mut publisher_rx).is_empty());

        let listing = rooms.list_producers("lab").await;
        assert_eq!(listing.len(), 1);
        assert_eq!(listing[0].id, producer_id);
        assert_eq!(listing[0].label, "cam1");
    }

    #[tokio::test]
    async fn producer_listing_is_in_creation_order() {
        let rooms = setup();
        let mut rx = join(&rooms, "lab", "pub", PeerRole::Publisher).await;
        drain(&mut rx);
        let (_, first) = publish(&rooms, "lab", "pub", "cam1").await;
        let (_, second) = publish(&rooms, "lab", "pub", "cam2").await;

        let listing = rooms.list_producers("lab").await;
        assert_eq!(
            listing.iter().map(|p| p.id.as_str()).collect::<Vec<_>>(),
            vec![first.as_str(), second.as_str()]
        );
    }

    #[tokio::test]
    async fn close_broadcast_fires_once_even_when_both_signals_race() {
        let rooms = setup();
        let mut viewer_rx = join(&rooms, "lab", "viewer", PeerRole::Viewer).await;
        let mut publisher_rx = join(&rooms, "lab", "pub", PeerRole::Publisher).await;
        drain(&mut viewer_rx);
        drain(&mut publisher_rx);

        let (transport_id, producer_id) = publish(&rooms, "lab", "pub", "cam1").await;
        drain(&mut viewer_rx);

        let transport = rooms
            .transport_handle("lab", "pub", &transport_id)
            .await
            .unwrap();
        let producer = rooms.producer_handle("lab", &producer_id).await.unwrap();

        // Both signals fire: transport close cascades to the producer, then
        // the producer is closed again directly.
        transport.close().await;
        producer.close().await;
        settle().await;

        let closes = drain(&mut viewer_rx)
            .into_iter()
            .filter(|m| matches!(m, ServerMessage::ProducerClosed { .. }))
            .count();
        assert_eq!(closes, 1);
        assert!(rooms.list_producers("lab").await.is_empty());
    }

    #[tokio::test]
    async fn incompatible_consume_is_rejected_without_side_effects() {
        let rooms = setup();
        let mut viewer_rx = join(&rooms, "lab", "viewer", PeerRole::Viewer).await;
        let mut publisher_rx = join(&rooms, "lab", "pub", PeerRole::Publisher).await;
        drain(&mut viewer_rx);
        drain(&mut publisher_rx);
        let (_, producer_id) = publish(&rooms, "lab", "pub", "cam1").await;

        let recv = rooms
            .create_transport("lab", "viewer", TransportDirection::Recv)
            .await
            .unwrap();
        let result = rooms
            .consume(
                "lab",
                "viewer",
                &recv.transport_id,
                &producer_id,
                RtpCapabilities::default(),
            )
            .await;
        assert!(matches!(result, Err(SessionError::CannotConsume(_))));
        assert_eq!(rooms.consumer_count("lab", "viewer").await, 0);
        assert_eq!(rooms.list_producers("lab").await.len(), 1);
    }

    #[tokio::test]
    async fn viewer_publisher_scenario_end_to_end() {
        let rooms = setup();

        // Viewer joins an empty room.
        let mut viewer_rx = join(&rooms, "lab", "viewer", PeerRole::Viewer).await;
        let messages = drain(&mut viewer_rx);
        match &messages[1] {
            ServerMessage::Joined { producers, .. } => assert!(producers.is_empty()),
            other => panic!("expected joined, got {other:?}"),
        }

        // Publisher joins and produces "cam1".
        let mut publisher_rx = join(&rooms, "lab", "pub", PeerRole::Publisher).await;
        drain(&mut publisher_rx);
        let (_, producer_id) = publish(&rooms, "lab", "pub", "cam1").await;

        let announced = drain(&mut viewer_rx);
        assert!(announced.iter().any(|m| matches!(
            m,
            ServerMessage::NewProducer { label, .. } if label == "cam1"
        )));

        // Viewer subscribes; the consumer starts paused and resumes on request.
        let recv = rooms
            .create_transport("lab", "viewer", TransportDirection::Recv)
            .await
            .unwrap();
        let caps = rooms.engine().rtp_capabilities();
        let reply = rooms
            .consume("lab", "viewer", &recv.transport_id, &producer_id, caps)
            .await
            .unwrap();
        assert_eq!(reply.producer_id, producer_id);

        let consumer = rooms
            .consumer_handle("lab", "viewer", &reply.consumer_id)
            .await
            .unwrap();
        assert!(consumer.paused());
        rooms
            .resume_consumer("lab", "viewer", &reply.consumer_id)
            .await;
        assert!(!consumer.paused());

        // Publisher disconnects; the viewer hears producer-closed.
        rooms.remove_peer("pub").await;
        settle().await;
        let closes = drain(&mut viewer_rx)
            .into_iter()
            .filter(|m| matches!(
                m,
                ServerMessage::ProducerClosed { producer_id: id } if id == &producer_id
            ))
            .count();
        assert_eq!(closes, 1);
    }

    #[tokio::test]
    async fn resume_of_unknown_consumer_is_silent() {
        let rooms = setup();
        let mut rx = join(&rooms, "lab", "viewer", PeerRole::Viewer).await;
        drain(&mut rx);
        // No panic, no error surface.
        rooms
            .resume_consumer("lab", "viewer", "no-such-consumer")
            .await;
        rooms
            .resume_consumer("ghost-room", "viewer", "no-such-consumer")
            .await;
    }

    #[tokio::test]
    async fn disconnect_reaps_everything_the_peer_owned() {
        let rooms = setup();
        let mut viewer_rx = join(&rooms, "lab", "viewer", PeerRole::Viewer).await;
        let mut publisher_rx = join(&rooms, "lab", "pub", PeerRole::Publisher).await;
        drain(&mut viewer_rx);
        drain(&mut publisher_rx);

        let (_, producer_id) = publish(&rooms, "lab", "pub", "cam1").await;
        let recv = rooms
            .create_transport("lab", "viewer", TransportDirection::Recv)
            .await
            .unwrap();
        let caps = rooms.engine().rtp_capabilities();
        rooms
            .consume("lab", "viewer", &recv.transport_id, &producer_id, caps)
            .await
            .unwrap();

        rooms.remove_peer("pub").await;
        settle().await;

        assert!(!rooms.has_peer("lab", "pub").await);
        assert!(rooms.list_producers("lab").await.is_empty());
        // The viewer's subscription to the departed producer is reaped...
        assert_eq!(rooms.consumer_count("lab", "viewer").await, 0);
        // ...but the viewer itself and its transport are untouched.
        assert!(rooms.has_peer("lab", "viewer").await);
        assert_eq!(rooms.transport_count("lab", "viewer").await, 1);
    }

    #[tokio::test]
    async fn produce_requires_a_send_transport() {
        let rooms = setup();
        let mut rx = join(&rooms, "lab", "pub", PeerRole::Publisher).await;
        drain(&mut rx);
        let recv = rooms
            .create_transport("lab", "pub", TransportDirection::Recv)
            .await
            .unwrap();
        let codec = ServerConfig::default_codecs()
            .into_iter()
            .find(|c| c.kind == MediaKind::Video)
            .unwrap();
        let result = rooms
            .produce(
                "lab",
                "pub",
                &recv.transport_id,
                MediaKind::Video,
                RtpParameters::from_capability(&codec),
                "cam1".to_string(),
                "cams/cam1".to_string(),
            )
            .await;
        assert!(matches!(result, Err(SessionError::InvalidDirection(_))));
    }

    #[tokio::test]
    async fn stale_ids_are_reported_not_fatal() {
        let rooms = setup();
        let mut rx = join(&rooms, "lab", "peer", PeerRole::Viewer).await;
        drain(&mut rx);

        let result = rooms
            .connect_transport("lab", "peer", "no-such-transport", serde_json::json!({}))
            .await;
        assert!(matches!(result, Err(SessionError::TransportNotFound(_))));

        let result = rooms
            .create_transport("lab", "ghost", TransportDirection::Send)
            .await;
        assert!(matches!(result, Err(SessionError::PeerNotFound(_))));
    }

    #[tokio::test]
    async fn joining_peer_sees_existing_producers_in_snapshot() {
        let rooms = setup();
        let mut publisher_rx = join(&rooms, "lab", "pub", PeerRole::Publisher).await;
        drain(&mut publisher_rx);
        let (_, producer_id) = publish(&rooms, "lab", "pub", "cam1").await;

        let mut late_rx = join(&rooms, "lab", "late-viewer", PeerRole::Viewer).await;
        let messages = drain(&mut late_rx);
        match &messages[1] {
            ServerMessage::Joined { producers, .. } => {
                assert_eq!(producers.len(), 1);
                assert_eq!(producers[0].id, producer_id);
            }
            other => panic!("expected joined, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn publisher_keepalive_tracks_presence_per_room() {
        let rooms = setup();
        let (tx, _rx) = mpsc::channel(8);
        rooms
            .join(
                "lab",
                "bot-conn",
                PeerRole::PublisherBot,
                Some("cam-bridge".to_string()),
                tx,
            )
            .await;

        let live = rooms.list_publishers("lab").await;
        assert_eq!(live.len(), 1);
        assert_eq!(live[0].id, "cam-bridge");

        rooms.touch_publisher("lab", "cam-bridge").await;
        assert_eq!(rooms.list_publishers("lab").await.len(), 1);
        // Keepalives never conjure rooms into existence.
        rooms.touch_publisher("never-seen", "cam-bridge").await;
        assert_eq!(rooms.room_count(), 1);
    }
}
