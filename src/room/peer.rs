#![forbid(unsafe_code)]

// Peer session state — one signaling-connected endpoint and everything it owns.

use crate::routing::{MediaConsumer, MediaTransport, TransportDirection};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Role a peer declares when joining.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum PeerRole {
    Viewer,
    Publisher,
    /// Autonomous publisher process (camera bridge, analyzer, ...).
    #[serde(alias = "bot")]
    PublisherBot,
}

impl PeerRole {
    pub fn is_publisher(&self) -> bool {
        matches!(self, PeerRole::Publisher | PeerRole::PublisherBot)
    }
}

/// A transport owned by a peer, kept in creation order so stale ids can be
/// located and reported rather than panicking.
pub struct OwnedTransport {
    pub direction: TransportDirection,
    pub handle: Arc<dyn MediaTransport>,
}

/// A consumer owned by a peer, remembered together with the transport it was
/// created on so transport teardown can reap it.
pub struct OwnedConsumer {
    pub transport_id: String,
    pub handle: Arc<dyn MediaConsumer>,
}

/// One connected endpoint inside a room.
pub struct Peer {
    pub id: String,
    pub role: PeerRole,
    /// Self-declared id of an autonomous publisher process; distinct from the
    /// connection id.
    pub publisher_id: Option<String>,
    /// Pre-serialized JSON fan-out channel to this peer's connection.
    pub sender: mpsc::Sender<Arc<String>>,
    pub transports: Vec<OwnedTransport>,
    /// Ids of producers this peer owns; the records live in the room table.
    pub producers: Vec<String>,
    pub consumers: Vec<OwnedConsumer>,
}

impl Peer {
    pub fn new(
        id: String,
        role: PeerRole,
        publisher_id: Option<String>,
        sender: mpsc::Sender<Arc<String>>,
    ) -> Self {
        Self {
            id,
            role,
            publisher_id,
            sender,
            transports: Vec::new(),
            producers: Vec::new(),
            consumers: Vec::new(),
        }
    }

    pub fn transport(&self, transport_id: &str) -> Option<&OwnedTransport> {
        self.transports.iter().find(|t| t.handle.id() == transport_id)
    }

    pub fn remove_transport(&mut self, transport_id: &str) -> Option<OwnedTransport> {
        let index = self
            .transports
            .iter()
            .position(|t| t.handle.id() == transport_id)?;
        Some(self.transports.remove(index))
    }

    pub fn consumer(&self, consumer_id: &str) -> Option<&Arc<dyn MediaConsumer>> {
        self.consumers
            .iter()
            .find(|c| c.handle.id() == consumer_id)
            .map(|c| &c.handle)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn role_wire_values_are_kebab_case() {
        assert_eq!(serde_json::to_string(&PeerRole::Viewer).unwrap(), "\"viewer\"");
        assert_eq!(
            serde_json::to_string(&PeerRole::PublisherBot).unwrap(),
            "\"publisher-bot\""
        );
        // Legacy clients join with role "bot".
        let legacy: PeerRole = serde_json::from_str("\"bot\"").unwrap();
        assert_eq!(legacy, PeerRole::PublisherBot);
    }

    #[test]
    fn publisher_roles_are_recognized() {
        assert!(!PeerRole::Viewer.is_publisher());
        assert!(PeerRole::Publisher.is_publisher());
        assert!(PeerRole::PublisherBot.is_publisher());
    }
}
