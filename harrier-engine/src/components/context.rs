//! Shared state handed into every connection call.
//!
//! Connections hold no global references; the context travels down the call
//! chain as a plain borrow, which keeps the ownership graph acyclic and ties
//! every cache's lifecycle to the engine session instead of the process.

use crate::cache::{ConnectionCache, DnsCache, TlsPassthroughCache};
use crate::components::app_finder::AppFinder;
use crate::components::database::DatabaseConnector;
use crate::config::EngineConfig;
use crate::stats::EngineStats;
use bytes::BytesMut;
use crossbeam_channel::Sender;
use harrier_mitm::Authority;
use mio::event::Source;
use mio::{Interest, Registry, Token, Waker};
use std::io;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::warn;

/// Token 0 is reserved for the poll thread's waker.
pub const WAKER_TOKEN: Token = Token(0);

pub struct EngineContext {
    pub config: EngineConfig,
    pub session_id: i32,
    pub database: Arc<dyn DatabaseConnector>,
    pub app_finder: Arc<dyn AppFinder>,
    pub authority: Authority,
    pub connections: ConnectionCache,
    pub dns_cache: DnsCache,
    pub tls_passthrough: TlsPassthroughCache,
    pub stats: EngineStats,
    registry: Registry,
    waker: Arc<Waker>,
    device_tx: Sender<BytesMut>,
    next_token: AtomicUsize,
}

impl EngineContext {
    #[allow(clippy::too_many_arguments)]
    pub(crate) fn new(
        config: EngineConfig,
        session_id: i32,
        database: Arc<dyn DatabaseConnector>,
        app_finder: Arc<dyn AppFinder>,
        authority: Authority,
        registry: Registry,
        waker: Arc<Waker>,
        device_tx: Sender<BytesMut>,
    ) -> Self {
        Self {
            config,
            session_id,
            database,
            app_finder,
            authority,
            connections: ConnectionCache::new(),
            dns_cache: DnsCache::new(),
            tls_passthrough: TlsPassthroughCache::new(),
            stats: EngineStats::new(),
            registry,
            waker,
            device_tx,
            next_token: AtomicUsize::new(WAKER_TOKEN.0 + 1),
        }
    }

    pub fn next_token(&self) -> Token {
        Token(self.next_token.fetch_add(1, Ordering::Relaxed))
    }

    /// Registers a socket with the shared multiplexer. The poll thread is
    /// woken first so the fresh interest cannot sit unnoticed behind a
    /// blocked select.
    pub fn register(
        &self,
        source: &mut impl Source,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        let _ = self.waker.wake();
        self.registry.register(source, token, interests)
    }

    pub fn reregister(
        &self,
        source: &mut impl Source,
        token: Token,
        interests: Interest,
    ) -> io::Result<()> {
        self.registry.reregister(source, token, interests)
    }

    pub fn deregister(&self, source: &mut impl Source) {
        if let Err(e) = self.registry.deregister(source) {
            if e.kind() != io::ErrorKind::NotFound {
                warn!("Error deregistering channel: {}", e);
            }
        }
    }

    pub fn wake(&self) {
        let _ = self.waker.wake();
    }

    /// Queues a packet for the device-write thread.
    pub fn write_to_device(&self, packet: Vec<u8>) {
        if packet.is_empty() {
            return;
        }
        self.stats.record_sent(packet.len());
        if self.device_tx.send(BytesMut::from(&packet[..])).is_err() {
            warn!("Device write channel closed, dropping packet");
        }
    }
}

pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}
