//! Composition root: wires the caches, the MitM authority, the selector
//! loop and the device threads together and owns their lifecycle.

use crate::components::app_finder::AppFinder;
use crate::components::context::{now_millis, EngineContext, WAKER_TOKEN};
use crate::components::database::DatabaseConnector;
use crate::components::{device, poller};
use crate::config::EngineConfig;
use crate::error::Result;
use crate::packet::{self, ParsedPacket, TcpSegmentInfo, TransportInfo, UdpDatagramInfo};
use crate::transport::{ConnectionKey, ConnectionStack, TcpConnection, TransportLayer, UdpConnection};
use harrier_mitm::Authority;
use mio::{Poll, Waker};
use parking_lot::RwLock;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use tracing::{debug, info, trace, warn};

pub struct ComponentManager {
    ctx: Arc<EngineContext>,
    running: Arc<AtomicBool>,
    poll_thread: Option<JoinHandle<()>>,
    writer_thread: Option<JoinHandle<()>>,
}

impl ComponentManager {
    /// Builds the engine: persists a session row, sets up the certificate
    /// authority and the shared multiplexer, and starts the selector and
    /// device-write threads. `device_out` receives the raw IP packets the
    /// engine emits towards the intercepted client.
    pub fn new(
        config: EngineConfig,
        database: Arc<dyn DatabaseConnector>,
        app_finder: Arc<dyn AppFinder>,
        device_out: Box<dyn Write + Send>,
    ) -> Result<Self> {
        let authority = match (&config.ca_cert_pem, &config.ca_key_pem) {
            (Some(cert), Some(key)) => Authority::from_ca_pem(cert, key)?,
            _ => Authority::generate()?,
        };

        let session_id = database.persist_session(now_millis());

        let poll = Poll::new()?;
        let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN)?);
        let registry = poll.registry().try_clone()?;
        let (device_tx, device_rx) = crossbeam_channel::unbounded();

        let ctx = Arc::new(EngineContext::new(
            config, session_id, database, app_finder, authority, registry, waker, device_tx,
        ));
        let running = Arc::new(AtomicBool::new(true));

        let writer_running = running.clone();
        let writer_thread = thread::Builder::new()
            .name("device-writer".into())
            .spawn(move || device::run_device_writer(device_rx, device_out, writer_running))?;

        let poll_ctx = ctx.clone();
        let poll_running = running.clone();
        let poll_thread = thread::Builder::new()
            .name("selector-loop".into())
            .spawn(move || poller::run_selector_loop(poll, poll_ctx, poll_running))?;

        info!("Traffic engine started (session {})", session_id);

        Ok(Self {
            ctx,
            running,
            poll_thread: Some(poll_thread),
            writer_thread: Some(writer_thread),
        })
    }

    pub fn context(&self) -> &Arc<EngineContext> {
        &self.ctx
    }

    pub fn is_running(&self) -> bool {
        self.running.load(Ordering::Acquire)
    }

    /// Feeds one raw IP packet intercepted from the device interface into
    /// the engine. The whole transport → encryption → app chain runs
    /// synchronously on the calling thread.
    pub fn process_outbound_packet(&self, raw: &[u8]) {
        if !self.is_running() {
            return;
        }
        handle_outbound_packet(&self.ctx, raw);
    }

    /// Spawns the device-read loop over `device_in`, where each read yields
    /// one raw IP packet.
    pub fn spawn_device_reader(&self, device_in: Box<dyn Read + Send>) -> Result<JoinHandle<()>> {
        let ctx = self.ctx.clone();
        let running = self.running.clone();
        Ok(thread::Builder::new()
            .name("device-reader".into())
            .spawn(move || device::run_device_reader(ctx, running, device_in))?)
    }

    /// Stops the engine: closes every live connection, stops the threads and
    /// finalises the session row.
    pub fn shutdown(&mut self) {
        if !self.running.swap(false, Ordering::AcqRel) {
            return;
        }
        info!("Shutting down traffic engine (session {})", self.ctx.session_id);

        for stack in self.ctx.connections.drain() {
            stack.write().transport.close_hard(&self.ctx);
        }

        self.ctx.wake();
        if let Some(handle) = self.poll_thread.take() {
            let _ = handle.join();
        }
        if let Some(handle) = self.writer_thread.take() {
            let _ = handle.join();
        }

        self.ctx
            .database
            .update_session(self.ctx.session_id, now_millis());
    }
}

impl Drop for ComponentManager {
    fn drop(&mut self) {
        self.shutdown();
    }
}

/// Parses a raw outbound IP packet and dispatches it into the owning
/// connection stack, creating the connection for an unknown tuple.
pub(crate) fn handle_outbound_packet(ctx: &Arc<EngineContext>, raw: &[u8]) {
    ctx.stats.record_received(raw.len());

    let parsed = match packet::parse_packet(raw) {
        Ok(parsed) => parsed,
        Err(e) => {
            ctx.stats.record_parse_error();
            debug!("Packet parse error: {}", e);
            return;
        }
    };

    match parsed.transport.clone() {
        TransportInfo::Tcp(info) => {
            ctx.stats.tcp_packets.fetch_add(1, Ordering::Relaxed);
            handle_tcp_packet(ctx, &parsed, &info, raw);
        }
        TransportInfo::Udp(info) => {
            ctx.stats.udp_packets.fetch_add(1, Ordering::Relaxed);
            handle_udp_packet(ctx, &parsed, &info, raw);
        }
        TransportInfo::Other(proto) => {
            ctx.stats.other_packets.fetch_add(1, Ordering::Relaxed);
            trace!("Ignoring packet with unhandled IP protocol {}", proto);
        }
    }
}

fn handle_tcp_packet(
    ctx: &Arc<EngineContext>,
    parsed: &ParsedPacket,
    info: &TcpSegmentInfo,
    raw: &[u8],
) {
    let key = match ConnectionKey::from_packet(parsed) {
        Some(key) => key,
        None => return,
    };

    if let Some(stack) = ctx.connections.find(&key) {
        stack.write().unwrap_outbound(ctx, parsed, raw);
        return;
    }

    // a connection must begin with a plain SYN; reset anything else
    if info.flags.fin || info.flags.ack || info.flags.rst {
        let hostname = ctx.dns_cache.get(&parsed.dst_addr.to_string());
        warn!(
            "Resetting unknown TCP packet ({}{}{}) to {}:{} ({:?})",
            if info.flags.fin { "FIN" } else { "" },
            if info.flags.ack { "ACK" } else { "" },
            if info.flags.rst { "RST" } else { "" },
            parsed.dst_addr,
            info.dst_port,
            hostname
        );
        if let Some(rst) = packet::build_stray_tcp_rst(parsed) {
            ctx.write_to_device(rst);
        }
        return;
    }

    let hostname = ctx.dns_cache.get(&parsed.dst_addr.to_string());
    match TcpConnection::open(ctx, parsed, info, hostname) {
        Ok(connection) => {
            ctx.stats.record_connection_opened(true);
            insert_and_dispatch(ctx, TransportLayer::Tcp(connection), parsed, raw);
        }
        Err(e) => {
            warn!(
                "Failed to open TCP connection to {}:{}: {}",
                parsed.dst_addr, info.dst_port, e
            );
        }
    }
}

fn handle_udp_packet(
    ctx: &Arc<EngineContext>,
    parsed: &ParsedPacket,
    info: &UdpDatagramInfo,
    raw: &[u8],
) {
    let key = match ConnectionKey::from_packet(parsed) {
        Some(key) => key,
        None => return,
    };

    if let Some(stack) = ctx.connections.find(&key) {
        stack.write().unwrap_outbound(ctx, parsed, raw);
        return;
    }

    let hostname = ctx.dns_cache.get(&parsed.dst_addr.to_string());
    match UdpConnection::open(ctx, parsed, info, hostname) {
        Ok(connection) => {
            ctx.stats.record_connection_opened(false);
            insert_and_dispatch(ctx, TransportLayer::Udp(connection), parsed, raw);
        }
        Err(e) => {
            warn!(
                "Failed to open UDP connection to {}:{}: {}",
                parsed.dst_addr, info.dst_port, e
            );
        }
    }
}

fn insert_and_dispatch(
    ctx: &Arc<EngineContext>,
    transport: TransportLayer,
    parsed: &ParsedPacket,
    raw: &[u8],
) {
    let key = transport.key();
    let token = transport.token();
    let stack = Arc::new(RwLock::new(ConnectionStack::new(transport)));
    ctx.connections.insert(key, token, stack.clone());
    stack.write().unwrap_outbound(ctx, parsed, raw);
}
