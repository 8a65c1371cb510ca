#![forbid(unsafe_code)]

// Routing capability seam — the media engine (ICE/DTLS/SRTP, RTP processing)
// is an external collaborator consumed through these traits. The session
// layer never touches packets; it only orchestrates transport, producer and
// consumer lifecycles on top of whatever engine is wired in.

pub mod local;
pub mod types;

pub use local::LoopbackEngine;
pub use types::{
    MediaKind, RtcpFeedback, RtpCapabilities, RtpCodecCapability, RtpCodecParameters,
    RtpParameters, TransportDirection,
};

use async_trait::async_trait;
use std::net::SocketAddr;
use std::sync::Arc;
use thiserror::Error;

/// Errors surfaced by the routing engine.
#[derive(Error, Debug)]
pub enum RoutingError {
    #[error("transport error: {0}")]
    Transport(String),

    #[error("producer error: {0}")]
    Producer(String),

    #[error("consumer error: {0}")]
    Consumer(String),

    #[error("ingest endpoint error: {0}")]
    Ingest(String),
}

pub type RoutingResult<T> = Result<T, RoutingError>;

/// Callback invoked when an engine object closes. Fires exactly once; if the
/// object is already closed at registration time the callback fires
/// immediately.
pub type CloseCallback = Box<dyn FnOnce() + Send + 'static>;

/// The external media-routing engine, one instance shared by every room in
/// the process.
#[async_trait]
pub trait RoutingEngine: Send + Sync {
    /// Codec capabilities advertised to joining peers.
    fn rtp_capabilities(&self) -> RtpCapabilities;

    /// The configured codec table (used by the ingest bridge to select the
    /// deployment's video codec).
    fn codecs(&self) -> Vec<RtpCodecCapability>;

    /// Allocates a peer-facing transport.
    async fn create_transport(&self) -> RoutingResult<Arc<dyn MediaTransport>>;

    /// Allocates an address-learning ingest endpoint: the remote sender's
    /// address is discovered from the first packet rather than configured.
    async fn create_ingest_transport(&self) -> RoutingResult<Arc<dyn IngestEndpoint>>;

    /// Compatibility test: can a subscriber with these capabilities receive
    /// the given producer? Unknown producers are not consumable.
    async fn can_consume(&self, producer_id: &str, capabilities: &RtpCapabilities) -> bool;
}

/// A peer-facing transport handle.
#[async_trait]
pub trait MediaTransport: Send + Sync {
    fn id(&self) -> &str;

    /// Engine-specific connection material (ICE candidates, DTLS
    /// fingerprints, ...) forwarded verbatim to the client.
    fn connect_payload(&self) -> serde_json::Value;

    /// Completes the client side of transport establishment.
    async fn connect(&self, remote_parameters: serde_json::Value) -> RoutingResult<()>;

    /// Publishes a stream arriving on this transport.
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> RoutingResult<Arc<dyn MediaProducer>>;

    /// Subscribes this transport to an existing producer. The consumer is
    /// created paused.
    async fn consume(
        &self,
        producer_id: &str,
        capabilities: &RtpCapabilities,
    ) -> RoutingResult<Arc<dyn MediaConsumer>>;

    /// Closes the transport and everything created on it.
    async fn close(&self);

    fn closed(&self) -> bool;

    fn on_close(&self, callback: CloseCallback);
}

/// A published media source inside the engine.
#[async_trait]
pub trait MediaProducer: Send + Sync {
    fn id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    async fn close(&self);

    fn closed(&self) -> bool;

    fn on_close(&self, callback: CloseCallback);
}

/// One subscription of a peer to a producer.
#[async_trait]
pub trait MediaConsumer: Send + Sync {
    fn id(&self) -> &str;

    fn producer_id(&self) -> &str;

    fn kind(&self) -> MediaKind;

    fn rtp_parameters(&self) -> RtpParameters;

    fn paused(&self) -> bool;

    async fn resume(&self) -> RoutingResult<()>;

    async fn pause(&self) -> RoutingResult<()>;

    async fn close(&self);

    fn on_close(&self, callback: CloseCallback);
}

/// An address-learning ingest endpoint. RTP and RTCP arrive on separate
/// ports; each remote address is resolved from the first packet received on
/// its socket.
#[async_trait]
pub trait IngestEndpoint: Send + Sync {
    fn id(&self) -> &str;

    fn rtp_port(&self) -> u16;

    fn rtcp_port(&self) -> u16;

    /// Resolves once both the RTP and the RTCP sender addresses are known.
    /// The sender cannot be contacted before it starts sending, so this is a
    /// two-phase wait that completes only after traffic arrives on both
    /// sockets.
    async fn remote_resolved(&self) -> RoutingResult<(SocketAddr, SocketAddr)>;

    /// Publishes the stream arriving on this endpoint.
    async fn produce(
        &self,
        kind: MediaKind,
        rtp_parameters: RtpParameters,
    ) -> RoutingResult<Arc<dyn MediaProducer>>;

    async fn close(&self);

    fn on_close(&self, callback: CloseCallback);
}
