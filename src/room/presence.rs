#![forbid(unsafe_code)]

// TTL-based liveness tracking for autonomous publisher processes.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

/// Entries older than this are considered gone.
pub const PRESENCE_TTL: Duration = Duration::from_secs(30);

/// How often the background sweep prunes stale entries.
pub const SWEEP_INTERVAL: Duration = Duration::from_secs(10);

struct Seen {
    at: Instant,
    epoch_ms: u64,
}

/// Per-room table of publisher id → last-seen time. Refreshed on join and on
/// keepalive; pruned by the periodic sweep and filtered again at read time so
/// listings are accurate between sweeps.
#[derive(Default)]
pub struct PresenceTable {
    entries: HashMap<String, Seen>,
}

/// Wire shape of one live publisher.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PublisherPresence {
    pub id: String,
    /// Milliseconds since the Unix epoch at the last keepalive.
    pub last_seen: u64,
}

impl PresenceTable {
    pub fn touch(&mut self, publisher_id: &str) {
        let epoch_ms = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        self.entries.insert(
            publisher_id.to_string(),
            Seen {
                at: Instant::now(),
                epoch_ms,
            },
        );
    }

    /// Removes expired entries; returns how many were dropped.
    pub fn sweep(&mut self) -> usize {
        self.sweep_at(Instant::now())
    }

    fn sweep_at(&mut self, now: Instant) -> usize {
        let before = self.entries.len();
        self.entries
            .retain(|_, seen| now.duration_since(seen.at) <= PRESENCE_TTL);
        before - self.entries.len()
    }

    /// Live publishers, filtering out anything past the TTL even if the
    /// sweep has not run yet.
    pub fn live(&self) -> Vec<PublisherPresence> {
        self.live_at(Instant::now())
    }

    fn live_at(&self, now: Instant) -> Vec<PublisherPresence> {
        let mut live: Vec<PublisherPresence> = self
            .entries
            .iter()
            .filter(|(_, seen)| now.duration_since(seen.at) <= PRESENCE_TTL)
            .map(|(id, seen)| PublisherPresence {
                id: id.clone(),
                last_seen: seen.epoch_ms,
            })
            .collect();
        live.sort_by(|a, b| a.id.cmp(&b.id));
        live
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stale_entries_are_invisible_before_the_sweep_runs() {
        let mut table = PresenceTable::default();
        table.touch("cam-bridge");
        assert_eq!(table.live().len(), 1);

        // Simulate time passing beyond the TTL without sweeping.
        let future = Instant::now() + PRESENCE_TTL + Duration::from_secs(1);
        assert!(table.live_at(future).is_empty());
        // The entry is still stored until a sweep prunes it.
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn sweep_prunes_expired_entries_only() {
        let mut table = PresenceTable::default();
        table.touch("old");
        let future = Instant::now() + PRESENCE_TTL + Duration::from_secs(1);
        assert_eq!(table.sweep_at(future), 1);
        assert!(table.is_empty());
    }

    #[test]
    fn touch_refreshes_an_existing_entry() {
        let mut table = PresenceTable::default();
        table.touch("bridge");
        table.touch("bridge");
        assert_eq!(table.len(), 1);
        assert_eq!(table.live()[0].id, "bridge");
    }
}
