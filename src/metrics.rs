#![forbid(unsafe_code)]

// Server metrics — lock-free counters rendered in Prometheus text format.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;

/// Server-wide metrics. Cheap to clone; all counters are shared.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Inner {
    connections_total: AtomicU64,
    connections_active: AtomicU64,
    messages_received_total: AtomicU64,
    messages_sent_total: AtomicU64,
    errors_total: AtomicU64,
    rooms_created_total: AtomicU64,
    joins_total: AtomicU64,
    producers_created_total: AtomicU64,
    consumers_created_total: AtomicU64,
    ingest_producers_total: AtomicU64,
}

/// Decrements the active-connection gauge when the connection handler exits.
pub struct ActiveConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ActiveConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner::default()),
        }
    }

    pub fn inc_connections_total(&self) {
        self.inner.connections_total.fetch_add(1, Relaxed);
    }

    pub fn connection_active_guard(&self) -> ActiveConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ActiveConnectionGuard {
            inner: Arc::clone(&self.inner),
        }
    }

    pub fn inc_messages_received(&self) {
        self.inner.messages_received_total.fetch_add(1, Relaxed);
    }

    pub fn inc_messages_sent(&self) {
        self.inner.messages_sent_total.fetch_add(1, Relaxed);
    }

    pub fn inc_errors(&self) {
        self.inner.errors_total.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.inner.rooms_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.inner.joins_total.fetch_add(1, Relaxed);
    }

    pub fn inc_producers(&self) {
        self.inner.producers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers(&self) {
        self.inner.consumers_created_total.fetch_add(1, Relaxed);
    }

    pub fn inc_ingest_producers(&self) {
        self.inner.ingest_producers_total.fetch_add(1, Relaxed);
    }

    /// Prometheus text exposition. Room and peer gauges are sampled by the
    /// caller since they live in the registry, not here.
    pub fn render_prometheus(&self, rooms: usize, peers: usize) -> String {
        let mut out = String::with_capacity(1024);
        counter(
            &mut out,
            "signaling_connections_total",
            "Total accepted signaling connections",
            self.inner.connections_total.load(Relaxed),
        );
        gauge(
            &mut out,
            "signaling_connections_active",
            "Currently open signaling connections",
            self.inner.connections_active.load(Relaxed),
        );
        counter(
            &mut out,
            "signaling_messages_received_total",
            "Client messages received",
            self.inner.messages_received_total.load(Relaxed),
        );
        counter(
            &mut out,
            "signaling_messages_sent_total",
            "Server messages sent",
            self.inner.messages_sent_total.load(Relaxed),
        );
        counter(
            &mut out,
            "signaling_errors_total",
            "Failed client requests",
            self.inner.errors_total.load(Relaxed),
        );
        counter(
            &mut out,
            "rooms_created_total",
            "Rooms created since start",
            self.inner.rooms_created_total.load(Relaxed),
        );
        counter(
            &mut out,
            "joins_total",
            "Peer joins since start",
            self.inner.joins_total.load(Relaxed),
        );
        counter(
            &mut out,
            "producers_created_total",
            "Producers created by peers",
            self.inner.producers_created_total.load(Relaxed),
        );
        counter(
            &mut out,
            "consumers_created_total",
            "Consumers created",
            self.inner.consumers_created_total.load(Relaxed),
        );
        counter(
            &mut out,
            "ingest_producers_total",
            "Producers created by the ingest bridge",
            self.inner.ingest_producers_total.load(Relaxed),
        );
        gauge(&mut out, "rooms_active", "Rooms in the registry", rooms as u64);
        gauge(&mut out, "peers_active", "Peers across all rooms", peers as u64);
        out
    }
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

fn counter(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} counter");
    let _ = writeln!(out, "{name} {value}");
}

fn gauge(out: &mut String, name: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP {name} {help}");
    let _ = writeln!(out, "# TYPE {name} gauge");
    let _ = writeln!(out, "{name} {value}");
}
