#![forbid(unsafe_code)]

// Loopback routing engine — an in-process implementation of the routing
// capability used for development and tests. It allocates ids, mirrors
// producer parameters into consumers, tracks close cascades, and learns
// ingest sender addresses from the first packet on each socket. No media is
// processed; production deployments wire the session layer to a real engine
// behind the same traits.

use super::types::{MediaKind, RtpCapabilities, RtpCodecCapability, RtpParameters};
use super::{
    CloseCallback, IngestEndpoint, MediaConsumer, MediaProducer, MediaTransport, RoutingEngine,
    RoutingError, RoutingResult,
};
use async_trait::async_trait;
use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex as StdMutex;
use std::sync::{Arc, Weak};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::debug;
use uuid::Uuid;

/// Close-callback plumbing shared by every engine object. Callbacks fire
/// exactly once; registration after close fires immediately.
#[derive(Default)]
struct CloseHooks {
    closed: AtomicBool,
    callbacks: StdMutex<Vec<CloseCallback>>,
}

impl CloseHooks {
    fn register(&self, callback: CloseCallback) {
        if self.closed.load(Ordering::SeqCst) {
            callback();
            return;
        }
        let mut callbacks = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
        // Re-check under the lock: fire() drains under this same lock after
        // flipping the flag, so a late registration must run immediately.
        if self.closed.load(Ordering::SeqCst) {
            drop(callbacks);
            callback();
            return;
        }
        callbacks.push(callback);
    }

    /// Returns true on the first call only.
    fn fire(&self) -> bool {
        if self.closed.swap(true, Ordering::SeqCst) {
            return false;
        }
        let callbacks: Vec<CloseCallback> = {
            let mut guard = self.callbacks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for callback in callbacks {
            callback();
        }
        true
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// What the engine knows about a live producer: enough to answer
/// compatibility tests and to mirror parameters into consumers.
struct ProducerEntry {
    kind: MediaKind,
    mime_type: String,
    clock_rate: u32,
    rtp_parameters: RtpParameters,
    consumers: Vec<Weak<LoopbackConsumer>>,
}

type Registry = Arc<StdMutex<HashMap<String, ProducerEntry>>>;

pub struct LoopbackEngine {
    codecs: Vec<RtpCodecCapability>,
    registry: Registry,
}

impl LoopbackEngine {
    pub fn new(codecs: Vec<RtpCodecCapability>) -> Self {
        Self {
            codecs,
            registry: Arc::new(StdMutex::new(HashMap::new())),
        }
    }

    fn register_producer(
        registry: &Registry,
        params: &RtpParameters,
        kind: MediaKind,
    ) -> RoutingResult<Arc<LoopbackProducer>> {
        let codec = params
            .primary_codec()
            .ok_or_else(|| RoutingError::Producer("rtp parameters carry no codec".to_string()))?;
        let producer = Arc::new(LoopbackProducer {
            id: Uuid::new_v4().to_string(),
            kind,
            registry: Arc::clone(registry),
            hooks: CloseHooks::default(),
        });
        let entry = ProducerEntry {
            kind,
            mime_type: codec.mime_type.clone(),
            clock_rate: codec.clock_rate,
            rtp_parameters: params.clone(),
            consumers: Vec::new(),
        };
        registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(producer.id.clone(), entry);
        Ok(producer)
    }
}

#[async_trait]
impl RoutingEngine for LoopbackEngine {
    fn rtp_capabilities(&self) -> RtpCapabilities {
        RtpCapabilities {
            codecs: self.codecs.clone(),
            header_extensions: Vec::new(),
        }
    }

    fn codecs(&self) -> Vec<RtpCodecCapability> {
        self.codecs.clone()
    }

    async fn create_transport(&self) -> RoutingResult<Arc<dyn MediaTransport>> {
        let transport = Arc::new(LoopbackTransport {
            id: Uuid::new_v4().to_string(),
            registry: Arc::clone(&self.registry),
            connected: AtomicBool::new(false),
            producers: StdMutex::new(Vec::new()),
            consumers: StdMutex::new(Vec::new()),
            hooks: CloseHooks::default(),
        });
        debug!("Loopback transport {} created", transport.id);
        Ok(transport)
    }

    async fn create_ingest_transport(&self) -> RoutingResult<Arc<dyn IngestEndpoint>> {
        let rtp_socket = Arc::new(
            UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| RoutingError::Ingest(format!("failed to bind RTP socket: {e}")))?,
        );
        let rtcp_socket = Arc::new(
            UdpSocket::bind("0.0.0.0:0")
                .await
                .map_err(|e| RoutingError::Ingest(format!("failed to bind RTCP socket: {e}")))?,
        );
        let rtp_port = rtp_socket
            .local_addr()
            .map_err(|e| RoutingError::Ingest(e.to_string()))?
            .port();
        let rtcp_port = rtcp_socket
            .local_addr()
            .map_err(|e| RoutingError::Ingest(e.to_string()))?
            .port();

        let (rtp_tx, rtp_rx) = watch::channel(None);
        let (rtcp_tx, rtcp_rx) = watch::channel(None);
        let tasks = vec![
            spawn_address_learner(Arc::clone(&rtp_socket), rtp_tx, "rtp"),
            spawn_address_learner(Arc::clone(&rtcp_socket), rtcp_tx, "rtcp"),
        ];

        let endpoint = Arc::new(LoopbackIngestEndpoint {
            id: Uuid::new_v4().to_string(),
            registry: Arc::clone(&self.registry),
            rtp_port,
            rtcp_port,
            _rtp_socket: rtp_socket,
            _rtcp_socket: rtcp_socket,
            rtp_remote: rtp_rx,
            rtcp_remote: rtcp_rx,
            tasks: StdMutex::new(tasks),
            producers: StdMutex::new(Vec::new()),
            hooks: CloseHooks::default(),
        });
        debug!(
            "Loopback ingest endpoint {} listening on rtp:{} rtcp:{}",
            endpoint.id, rtp_port, rtcp_port
        );
        Ok(endpoint)
    }

    async fn can_consume(&self, producer_id: &str, capabilities: &RtpCapabilities) -> bool {
        let registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        match registry.get(producer_id) {
            Some(entry) => capabilities.supports(&entry.mime_type, entry.clock_rate),
            None => false,
        }
    }
}

/// Reads exactly one packet to learn the sender address, then exits. The
/// session layer does not relay media.
fn spawn_address_learner(
    socket: Arc<UdpSocket>,
    tx: watch::Sender<Option<SocketAddr>>,
    channel: &'static str,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut buf = [0u8; 1500];
        match socket.recv_from(&mut buf).await {
            Ok((_, addr)) => {
                debug!("Learned {} sender address {}", channel, addr);
                let _ = tx.send(Some(addr));
            }
            Err(e) => debug!("Address learning on {} socket aborted: {}", channel, e),
        }
    })
}

struct LoopbackTransport {
    id: String,
    registry: Registry,
    connected: AtomicBool,
    producers: StdMutex<Vec<Arc<LoopbackProducer>>>,
    consumers: StdMutex<Vec<Arc<LoopbackConsumer>>>,
    hooks: CloseHooks,
}

#[async_trait]
impl MediaTransport for LoopbackTransport {
    fn id(&self) -> &str {
        &self.id
    }

    fn connect_payload(&self) -> serde_json::Value {
        serde_json::json!({ "transportId": self.id })
    }

    async fn connect(&self, _remote_parameters: serde_json::Value) -> RoutingResult<()> {
        if self.hooks.is_closed() {
            return Err(RoutingError::Transport("transport is closed".to_string()));
        }
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> RoutingResult<Arc<dyn MediaProducer>> {
        if self.hooks.is_closed() {
            return Err(RoutingError::Transport("transport is closed".to_string()));
        }
        let producer = LoopbackEngine::register_producer(&self.registry, &rtp_parameters, kind)?;
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn consume(
        &self,
        producer_id: &str,
        capabilities: &RtpCapabilities,
    ) -> RoutingResult<Arc<dyn MediaConsumer>> {
        if self.hooks.is_closed() {
            return Err(RoutingError::Transport("transport is closed".to_string()));
        }
        let mut registry = self.registry.lock().unwrap_or_else(|e| e.into_inner());
        let entry = registry
            .get_mut(producer_id)
            .ok_or_else(|| RoutingError::Consumer(format!("unknown producer: {producer_id}")))?;
        if !capabilities.supports(&entry.mime_type, entry.clock_rate) {
            return Err(RoutingError::Consumer(
                "subscriber capabilities cannot receive this producer".to_string(),
            ));
        }
        // Consumers start paused; the subscriber resumes once its sink is ready.
        let consumer = Arc::new(LoopbackConsumer {
            id: Uuid::new_v4().to_string(),
            producer_id: producer_id.to_string(),
            kind: entry.kind,
            rtp_parameters: entry.rtp_parameters.clone(),
            paused: AtomicBool::new(true),
            hooks: CloseHooks::default(),
        });
        entry.consumers.push(Arc::downgrade(&consumer));
        drop(registry);
        self.consumers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&consumer));
        Ok(consumer)
    }

    async fn close(&self) {
        if !self.hooks.fire() {
            return;
        }
        let producers: Vec<Arc<LoopbackProducer>> = {
            let mut guard = self.producers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for producer in producers {
            producer.shut();
        }
        let consumers: Vec<Arc<LoopbackConsumer>> = {
            let mut guard = self.consumers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for consumer in consumers {
            consumer.shut();
        }
    }

    fn closed(&self) -> bool {
        self.hooks.is_closed()
    }

    fn on_close(&self, callback: CloseCallback) {
        self.hooks.register(callback);
    }
}

struct LoopbackProducer {
    id: String,
    kind: MediaKind,
    registry: Registry,
    hooks: CloseHooks,
}

impl LoopbackProducer {
    /// Synchronous close used by both the producer's own close and the owning
    /// transport's cascade. Consumers of the producer are shut with it.
    fn shut(&self) {
        if !self.hooks.fire() {
            return;
        }
        let entry = self
            .registry
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
        if let Some(entry) = entry {
            for weak in entry.consumers {
                if let Some(consumer) = weak.upgrade() {
                    consumer.shut();
                }
            }
        }
    }
}

#[async_trait]
impl MediaProducer for LoopbackProducer {
    fn id(&self) -> &str {
        &self.id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    async fn close(&self) {
        self.shut();
    }

    fn closed(&self) -> bool {
        self.hooks.is_closed()
    }

    fn on_close(&self, callback: CloseCallback) {
        self.hooks.register(callback);
    }
}

struct LoopbackConsumer {
    id: String,
    producer_id: String,
    kind: MediaKind,
    rtp_parameters: RtpParameters,
    paused: AtomicBool,
    hooks: CloseHooks,
}

impl LoopbackConsumer {
    fn shut(&self) {
        self.hooks.fire();
    }
}

#[async_trait]
impl MediaConsumer for LoopbackConsumer {
    fn id(&self) -> &str {
        &self.id
    }

    fn producer_id(&self) -> &str {
        &self.producer_id
    }

    fn kind(&self) -> MediaKind {
        self.kind
    }

    fn rtp_parameters(&self) -> RtpParameters {
        self.rtp_parameters.clone()
    }

    fn paused(&self) -> bool {
        self.paused.load(Ordering::SeqCst)
    }

    async fn resume(&self) -> RoutingResult<()> {
        if self.hooks.is_closed() {
            return Err(RoutingError::Consumer("consumer is closed".to_string()));
        }
        self.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn pause(&self) -> RoutingResult<()> {
        if self.hooks.is_closed() {
            return Err(RoutingError::Consumer("consumer is closed".to_string()));
        }
        self.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        self.shut();
    }

    fn on_close(&self, callback: CloseCallback) {
        self.hooks.register(callback);
    }
}

struct LoopbackIngestEndpoint {
    id: String,
    registry: Registry,
    rtp_port: u16,
    rtcp_port: u16,
    // Sockets are held so the learned ports stay bound for the lifetime of
    // the endpoint.
    _rtp_socket: Arc<UdpSocket>,
    _rtcp_socket: Arc<UdpSocket>,
    rtp_remote: watch::Receiver<Option<SocketAddr>>,
    rtcp_remote: watch::Receiver<Option<SocketAddr>>,
    tasks: StdMutex<Vec<JoinHandle<()>>>,
    producers: StdMutex<Vec<Arc<LoopbackProducer>>>,
    hooks: CloseHooks,
}

#[async_trait]
impl IngestEndpoint for LoopbackIngestEndpoint {
    fn id(&self) -> &str {
        &self.id
    }

    fn rtp_port(&self) -> u16 {
        self.rtp_port
    }

    fn rtcp_port(&self) -> u16 {
        self.rtcp_port
    }

    async fn remote_resolved(&self) -> RoutingResult<(SocketAddr, SocketAddr)> {
        let rtp_addr = wait_for_address(self.rtp_remote.clone(), "RTP").await?;
        let rtcp_addr = wait_for_address(self.rtcp_remote.clone(), "RTCP").await?;
        Ok((rtp_addr, rtcp_addr))
    }

    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> RoutingResult<Arc<dyn MediaProducer>> {
        if self.hooks.is_closed() {
            return Err(RoutingError::Ingest("ingest endpoint is closed".to_string()));
        }
        let producer = LoopbackEngine::register_producer(&self.registry, &rtp_parameters, kind)?;
        self.producers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Arc::clone(&producer));
        Ok(producer)
    }

    async fn close(&self) {
        if !self.hooks.fire() {
            return;
        }
        let tasks: Vec<JoinHandle<()>> = {
            let mut guard = self.tasks.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for task in tasks {
            task.abort();
        }
        let producers: Vec<Arc<LoopbackProducer>> = {
            let mut guard = self.producers.lock().unwrap_or_else(|e| e.into_inner());
            guard.drain(..).collect()
        };
        for producer in producers {
            producer.shut();
        }
    }

    fn on_close(&self, callback: CloseCallback) {
        self.hooks.register(callback);
    }
}

async fn wait_for_address(
    mut remote: watch::Receiver<Option<SocketAddr>>,
    channel: &str,
) -> RoutingResult<SocketAddr> {
    let guard = remote.wait_for(|addr| addr.is_some()).await.map_err(|_| {
        RoutingError::Ingest(format!(
            "endpoint closed before the {channel} sender address was learned"
        ))
    })?;
    guard.ok_or_else(|| RoutingError::Ingest(format!("{channel} sender address missing")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ServerConfig;
    use std::sync::atomic::AtomicUsize;

    fn engine() -> LoopbackEngine {
        LoopbackEngine::new(ServerConfig::default_codecs())
    }

    fn video_parameters(engine: &LoopbackEngine) -> RtpParameters {
        let codec = engine
            .codecs()
            .into_iter()
            .find(|c| c.kind == MediaKind::Video)
            .unwrap();
        RtpParameters::from_capability(&codec)
    }

    #[tokio::test]
    async fn transport_close_cascades_to_producers_exactly_once() {
        let engine = engine();
        let transport = engine.create_transport().await.unwrap();
        let params = video_parameters(&engine);
        let producer = transport.produce(MediaKind::Video, params).await.unwrap();

        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        producer.on_close(Box::new(move || {
            counter.fetch_add(1, Ordering::SeqCst);
        }));

        transport.close().await;
        // Second close of either object must not re-fire the callback.
        transport.close().await;
        producer.close().await;

        assert!(producer.closed());
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn consumers_start_paused_and_require_compatible_capabilities() {
        let engine = engine();
        let send = engine.create_transport().await.unwrap();
        let recv = engine.create_transport().await.unwrap();
        let params = video_parameters(&engine);
        let producer = send.produce(MediaKind::Video, params).await.unwrap();

        let empty = RtpCapabilities::default();
        assert!(!engine.can_consume(producer.id(), &empty).await);
        assert!(recv.consume(producer.id(), &empty).await.is_err());

        let caps = engine.rtp_capabilities();
        assert!(engine.can_consume(producer.id(), &caps).await);
        let consumer = recv.consume(producer.id(), &caps).await.unwrap();
        assert!(consumer.paused());
        consumer.resume().await.unwrap();
        assert!(!consumer.paused());
    }

    #[tokio::test]
    async fn unknown_producers_are_not_consumable() {
        let engine = engine();
        let caps = engine.rtp_capabilities();
        assert!(!engine.can_consume("nonexistent", &caps).await);
    }

    #[tokio::test]
    async fn ingest_endpoint_learns_sender_addresses_from_first_packets() {
        let engine = engine();
        let endpoint = engine.create_ingest_transport().await.unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender
            .send_to(b"rtp", ("127.0.0.1", endpoint.rtp_port()))
            .await
            .unwrap();
        sender
            .send_to(b"rtcp", ("127.0.0.1", endpoint.rtcp_port()))
            .await
            .unwrap();

        let (rtp_addr, rtcp_addr) = endpoint.remote_resolved().await.unwrap();
        let local = sender.local_addr().unwrap();
        assert_eq!(rtp_addr, local);
        assert_eq!(rtcp_addr, local);
    }

    #[tokio::test]
    async fn ingest_close_before_traffic_fails_the_address_wait() {
        let engine = engine();
        let endpoint = engine.create_ingest_transport().await.unwrap();
        endpoint.close().await;
        // Learner tasks are aborted; the watch senders drop without a value.
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        assert!(endpoint.remote_resolved().await.is_err());
    }
}
