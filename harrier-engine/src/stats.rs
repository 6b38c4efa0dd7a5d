//! Engine-wide statistics.

use serde::Serialize;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

/// Relaxed atomic counters shared across the engine's threads.
#[derive(Debug)]
pub struct EngineStats {
    start_time: Instant,

    pub packets_received: AtomicU64,
    pub packets_sent: AtomicU64,
    pub bytes_received: AtomicU64,
    pub bytes_sent: AtomicU64,

    pub tcp_packets: AtomicU64,
    pub udp_packets: AtomicU64,
    pub other_packets: AtomicU64,
    pub parse_errors: AtomicU64,

    pub tcp_connections_total: AtomicU64,
    pub udp_connections_total: AtomicU64,
    pub connections_active: AtomicU64,

    pub tls_connections: AtomicU64,
    pub tls_mitm_sessions: AtomicU64,
    pub tls_passthroughs: AtomicU64,
    pub tls_failures: AtomicU64,

    pub http_messages: AtomicU64,
    pub dns_replies: AtomicU64,
}

impl EngineStats {
    pub fn new() -> Self {
        Self {
            start_time: Instant::now(),
            packets_received: AtomicU64::new(0),
            packets_sent: AtomicU64::new(0),
            bytes_received: AtomicU64::new(0),
            bytes_sent: AtomicU64::new(0),
            tcp_packets: AtomicU64::new(0),
            udp_packets: AtomicU64::new(0),
            other_packets: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            tcp_connections_total: AtomicU64::new(0),
            udp_connections_total: AtomicU64::new(0),
            connections_active: AtomicU64::new(0),
            tls_connections: AtomicU64::new(0),
            tls_mitm_sessions: AtomicU64::new(0),
            tls_passthroughs: AtomicU64::new(0),
            tls_failures: AtomicU64::new(0),
            http_messages: AtomicU64::new(0),
            dns_replies: AtomicU64::new(0),
        }
    }

    pub fn uptime(&self) -> Duration {
        self.start_time.elapsed()
    }

    pub fn record_received(&self, bytes: usize) {
        self.packets_received.fetch_add(1, Ordering::Relaxed);
        self.bytes_received.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_sent(&self, bytes: usize) {
        self.packets_sent.fetch_add(1, Ordering::Relaxed);
        self.bytes_sent.fetch_add(bytes as u64, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_opened(&self, tcp: bool) {
        if tcp {
            self.tcp_connections_total.fetch_add(1, Ordering::Relaxed);
        } else {
            self.udp_connections_total.fetch_add(1, Ordering::Relaxed);
        }
        self.connections_active.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_connection_closed(&self) {
        let _ = self
            .connections_active
            .fetch_update(Ordering::Relaxed, Ordering::Relaxed, |v| v.checked_sub(1));
    }

    pub fn snapshot(&self) -> StatsSnapshot {
        StatsSnapshot {
            uptime_secs: self.uptime().as_secs(),
            packets_received: self.packets_received.load(Ordering::Relaxed),
            packets_sent: self.packets_sent.load(Ordering::Relaxed),
            bytes_received: self.bytes_received.load(Ordering::Relaxed),
            bytes_sent: self.bytes_sent.load(Ordering::Relaxed),
            tcp_packets: self.tcp_packets.load(Ordering::Relaxed),
            udp_packets: self.udp_packets.load(Ordering::Relaxed),
            other_packets: self.other_packets.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            tcp_connections_total: self.tcp_connections_total.load(Ordering::Relaxed),
            udp_connections_total: self.udp_connections_total.load(Ordering::Relaxed),
            connections_active: self.connections_active.load(Ordering::Relaxed),
            tls_connections: self.tls_connections.load(Ordering::Relaxed),
            tls_mitm_sessions: self.tls_mitm_sessions.load(Ordering::Relaxed),
            tls_passthroughs: self.tls_passthroughs.load(Ordering::Relaxed),
            tls_failures: self.tls_failures.load(Ordering::Relaxed),
            http_messages: self.http_messages.load(Ordering::Relaxed),
            dns_replies: self.dns_replies.load(Ordering::Relaxed),
        }
    }
}

impl Default for EngineStats {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSnapshot {
    pub uptime_secs: u64,
    pub packets_received: u64,
    pub packets_sent: u64,
    pub bytes_received: u64,
    pub bytes_sent: u64,
    pub tcp_packets: u64,
    pub udp_packets: u64,
    pub other_packets: u64,
    pub parse_errors: u64,
    pub tcp_connections_total: u64,
    pub udp_connections_total: u64,
    pub connections_active: u64,
    pub tls_connections: u64,
    pub tls_mitm_sessions: u64,
    pub tls_passthroughs: u64,
    pub tls_failures: u64,
    pub http_messages: u64,
    pub dns_replies: u64,
}
