#![forbid(unsafe_code)]

// Producer bookkeeping — descriptive metadata plus the engine handles that
// keep the published stream alive.

use crate::routing::{IngestEndpoint, MediaKind, MediaProducer};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// A producer registered in a room.
pub struct ProducerRecord {
    pub id: String,
    pub kind: MediaKind,
    /// Display name shown to viewers.
    pub label: String,
    /// Logical camera/path name the stream originates from.
    pub path: String,
    /// Owning peer; ingest-created producers have no owner.
    pub owner: Option<String>,
    /// Creation sequence, used for deterministic listing order.
    pub seq: u64,
    pub handle: Arc<dyn MediaProducer>,
    /// The address-learning endpoint feeding this producer, for
    /// ingest-created streams. Closed together with the producer.
    pub ingest: Option<Arc<dyn IngestEndpoint>>,
}

impl ProducerRecord {
    pub fn summary(&self) -> ProducerSummary {
        ProducerSummary {
            id: self.id.clone(),
            kind: self.kind,
            label: self.label.clone(),
            path: self.path.clone(),
        }
    }
}

/// Wire shape of one producer in listings and notifications.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProducerSummary {
    pub id: String,
    pub kind: MediaKind,
    pub label: String,
    pub path: String,
}
