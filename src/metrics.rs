#![forbid(unsafe_code)]

// Server metrics: lock-free AtomicU64 counters and a Prometheus-compatible latency histogram.

use std::fmt::Write;
use std::sync::atomic::{AtomicU64, Ordering::Relaxed};
use std::sync::Arc;
use std::time::Duration;

/// Histogram bucket upper bounds in microseconds, with their Prometheus `le` labels
const BUCKETS: [(u64, &str); 10] = [
    (1_000, "0.001"),
    (5_000, "0.005"),
    (10_000, "0.01"),
    (25_000, "0.025"),
    (50_000, "0.05"),
    (100_000, "0.1"),
    (250_000, "0.25"),
    (500_000, "0.5"),
    (1_000_000, "1"),
    (5_000_000, "5"),
];

/// Cumulative histogram with fixed buckets
pub struct Histogram {
    buckets: [AtomicU64; BUCKETS.len()],
    count: AtomicU64,
    sum_us: AtomicU64,
}

impl Histogram {
    fn new() -> Self {
        Self {
            buckets: std::array::from_fn(|_| AtomicU64::new(0)),
            count: AtomicU64::new(0),
            sum_us: AtomicU64::new(0),
        }
    }

    pub fn observe(&self, duration: Duration) {
        let us = u64::try_from(duration.as_micros()).unwrap_or(u64::MAX);
        self.sum_us.fetch_add(us, Relaxed);
        self.count.fetch_add(1, Relaxed);
        for (counter, (bound, _)) in self.buckets.iter().zip(BUCKETS.iter()) {
            if us <= *bound {
                counter.fetch_add(1, Relaxed);
            }
        }
    }

    fn render(&self, name: &str, help: &str, out: &mut String) {
        let _ = writeln!(out, "# HELP {name} {help}");
        let _ = writeln!(out, "# TYPE {name} histogram");
        for (counter, (_, label)) in self.buckets.iter().zip(BUCKETS.iter()) {
            let _ = writeln!(out, "{name}_bucket{{le=\"{label}\"}} {}", counter.load(Relaxed));
        }
        let count = self.count.load(Relaxed);
        let _ = writeln!(out, "{name}_bucket{{le=\"+Inf\"}} {count}");
        let sum_us = self.sum_us.load(Relaxed);
        let _ = writeln!(out, "{name}_sum {}.{:06}", sum_us / 1_000_000, sum_us % 1_000_000);
        let _ = writeln!(out, "{name}_count {count}");
    }
}

/// Point-in-time gauges owned by the room registry, sampled when metrics are scraped
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RegistryGauges {
    pub rooms: usize,
    pub peers: usize,
    pub disconnected_peers: usize,
}

/// Server-wide metrics. Cloning shares the same counters.
#[derive(Clone)]
pub struct ServerMetrics {
    inner: Arc<Inner>,
}

#[derive(Default)]
struct Counters {
    connections: AtomicU64,
    requests: AtomicU64,
    request_errors: AtomicU64,
    notifications: AtomicU64,
    rooms_created: AtomicU64,
    rooms_closed: AtomicU64,
    joins: AtomicU64,
    reconnects: AtomicU64,
    leaves: AtomicU64,
    grace_expiries: AtomicU64,
    producers_created: AtomicU64,
    consumers_created: AtomicU64,
    cascade_closed_consumers: AtomicU64,
    connect_timeouts: AtomicU64,
}

struct Inner {
    counters: Counters,
    connections_active: AtomicU64,
    request_handling: Histogram,
}

impl Default for ServerMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerMetrics {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                counters: Counters::default(),
                connections_active: AtomicU64::new(0),
                request_handling: Histogram::new(),
            }),
        }
    }

    fn counters(&self) -> &Counters {
        &self.inner.counters
    }

    pub fn inc_connections_total(&self) {
        self.counters().connections.fetch_add(1, Relaxed);
    }

    pub fn inc_requests(&self) {
        self.counters().requests.fetch_add(1, Relaxed);
    }

    pub fn inc_request_errors(&self) {
        self.counters().request_errors.fetch_add(1, Relaxed);
    }

    pub fn inc_notifications(&self, recipients: u64) {
        self.counters().notifications.fetch_add(recipients, Relaxed);
    }

    pub fn inc_rooms_created(&self) {
        self.counters().rooms_created.fetch_add(1, Relaxed);
    }

    pub fn inc_rooms_closed(&self) {
        self.counters().rooms_closed.fetch_add(1, Relaxed);
    }

    pub fn inc_joins(&self) {
        self.counters().joins.fetch_add(1, Relaxed);
    }

    pub fn inc_reconnects(&self) {
        self.counters().reconnects.fetch_add(1, Relaxed);
    }

    pub fn inc_leaves(&self) {
        self.counters().leaves.fetch_add(1, Relaxed);
    }

    pub fn inc_grace_expiries(&self) {
        self.counters().grace_expiries.fetch_add(1, Relaxed);
    }

    pub fn inc_producers_created(&self) {
        self.counters().producers_created.fetch_add(1, Relaxed);
    }

    pub fn inc_consumers_created(&self) {
        self.counters().consumers_created.fetch_add(1, Relaxed);
    }

    pub fn inc_cascade_closed_consumers(&self, n: u64) {
        self.counters().cascade_closed_consumers.fetch_add(n, Relaxed);
    }

    pub fn inc_connect_timeouts(&self) {
        self.counters().connect_timeouts.fetch_add(1, Relaxed);
    }

    pub fn rooms_created(&self) -> u64 {
        self.counters().rooms_created.load(Relaxed)
    }

    pub fn grace_expiries(&self) -> u64 {
        self.counters().grace_expiries.load(Relaxed)
    }

    /// Increments connections_active and returns an RAII guard that decrements on drop
    pub fn connection_active_guard(&self) -> ConnectionGuard {
        self.inner.connections_active.fetch_add(1, Relaxed);
        ConnectionGuard {
            inner: self.inner.clone(),
        }
    }

    pub fn observe_request_handling(&self, duration: Duration) {
        self.inner.request_handling.observe(duration);
    }

    /// Renders all metrics in Prometheus text exposition format
    pub fn render_prometheus(&self, gauges: RegistryGauges) -> String {
        let mut out = String::with_capacity(4096);
        let c = self.counters();

        let counters: [(&str, &str, &AtomicU64); 14] = [
            ("connections_total", "Total WebSocket connections", &c.connections),
            ("requests_total", "Total signaling requests received", &c.requests),
            ("request_errors_total", "Total requests answered with an error", &c.request_errors),
            ("notifications_sent_total", "Total notifications queued to peers", &c.notifications),
            ("rooms_created_total", "Total rooms created", &c.rooms_created),
            ("rooms_closed_total", "Total rooms closed", &c.rooms_closed),
            ("joins_total", "Total room joins", &c.joins),
            ("reconnects_total", "Total peers resumed within the grace period", &c.reconnects),
            ("leaves_total", "Total peers removed from rooms", &c.leaves),
            ("grace_expiries_total", "Total peers removed after the grace period expired", &c.grace_expiries),
            ("producers_created_total", "Total producers created", &c.producers_created),
            ("consumers_created_total", "Total consumers created", &c.consumers_created),
            ("cascade_closed_consumers_total", "Total consumers closed because their producer closed", &c.cascade_closed_consumers),
            ("transport_connect_timeouts_total", "Total transport connects that timed out", &c.connect_timeouts),
        ];
        for (name, help, value) in counters {
            render_metric(&mut out, name, "counter", help, value.load(Relaxed));
        }

        render_metric(
            &mut out,
            "connections_active",
            "gauge",
            "Currently open WebSocket connections",
            self.inner.connections_active.load(Relaxed),
        );
        render_metric(&mut out, "rooms_active", "gauge", "Currently open rooms", gauges.rooms as u64);
        render_metric(&mut out, "peers_active", "gauge", "Peers currently in a room", gauges.peers as u64);
        render_metric(
            &mut out,
            "peers_disconnected",
            "gauge",
            "Peers inside their reconnect grace period",
            gauges.disconnected_peers as u64,
        );

        self.inner.request_handling.render(
            "roomsignal_request_handling_seconds",
            "Signaling request handling latency in seconds",
            &mut out,
        );

        out
    }
}

/// RAII guard that decrements `connections_active` on drop
pub struct ConnectionGuard {
    inner: Arc<Inner>,
}

impl Drop for ConnectionGuard {
    fn drop(&mut self) {
        self.inner.connections_active.fetch_sub(1, Relaxed);
    }
}

fn render_metric(out: &mut String, name: &str, metric_type: &str, help: &str, value: u64) {
    let _ = writeln!(out, "# HELP roomsignal_{name} {help}");
    let _ = writeln!(out, "# TYPE roomsignal_{name} {metric_type}");
    let _ = writeln!(out, "roomsignal_{name} {value}");
}
