//! TCP transport-layer connection.
//!
//! The engine does not implement real TCP reliability: every intercepted
//! segment is acknowledged on receipt and no retransmission or reordering is
//! modelled, since the device interface delivers packets in order and the
//! outward TCP socket provides the actual reliability. The client-facing
//! handshake is synthesized: a SYN-ACK once the outward socket connects, an
//! ACK for every data segment, a FIN/FIN-ACK exchange on close.

use crate::components::context::{now_millis, EngineContext};
use crate::components::database::ConnectionRecord;
use crate::error::{EngineError, Result};
use crate::packet::{IpPacketBuilder, ParsedPacket, TcpFlags, TcpSegmentInfo, TransportInfo};
use crate::socket_protect;
use crate::transport::{
    ConnMeta, ConnectionKey, InboundOutcome, TransportEvent, TransportLayerState,
    TransportProtocol,
};
use mio::net::TcpStream;
use mio::{Interest, Token};
use std::io::{self, Read, Write};
use std::net::SocketAddr;
use tracing::{debug, warn};

pub struct TcpConnection {
    id: i32,
    local_port: u16,
    remote_port: u16,
    remote_host: Option<String>,
    app_id: Option<i32>,
    app_package: Option<String>,
    state: TransportLayerState,
    window: u16,
    their_seq_num: u32,
    our_seq_num: u32,
    socket: TcpStream,
    token: Token,
    ip_builder: IpPacketBuilder,
}

impl TcpConnection {
    /// Creates the connection for the initial segment of an unknown flow:
    /// resolves the owning app, persists the connection record (skipped for
    /// port 53), opens a protected non-blocking socket towards the remote
    /// host and registers it for connect-readiness.
    pub fn open(
        ctx: &EngineContext,
        parsed: &ParsedPacket,
        info: &TcpSegmentInfo,
        remote_host: Option<String>,
    ) -> Result<Self> {
        let ip_builder = IpPacketBuilder::from_packet(parsed);
        let local_port = info.src_port;
        let remote_port = info.dst_port;

        let app_id = ctx.app_finder.app_id(
            ip_builder.local_address,
            ip_builder.remote_address,
            local_port,
            remote_port,
            TransportProtocol::Tcp.ip_number(),
        );
        let app_package = app_id.and_then(|id| ctx.app_finder.app_package(id));

        let id = if remote_port == 53 {
            0
        } else {
            ctx.database.persist_transport_connection(ConnectionRecord {
                session_id: ctx.session_id,
                protocol: TransportProtocol::Tcp.as_str(),
                ip_version: parsed.version,
                initial_timestamp: now_millis(),
                initiator_id: app_id.unwrap_or(-1),
                initiator_pkg: app_package.clone().unwrap_or_default(),
                local_port,
                remote_host: remote_host.clone().unwrap_or_default(),
                remote_ip: ip_builder.remote_address.to_string(),
                remote_port,
            })
        };

        if id > 0 {
            debug!(
                "tcp{} Creating TCP connection to {}:{} ({:?})",
                id, ip_builder.remote_address, remote_port, remote_host
            );
        }

        let remote = SocketAddr::new(ip_builder.remote_address, remote_port);
        let mut socket = match Self::open_channel(remote) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("tcp{} Error while creating TCP connection: {}", id, e);
                ctx.database.delete_transport_connection(id);
                return Err(e);
            }
        };

        let token = ctx.next_token();
        if let Err(e) = ctx.register(&mut socket, token, Interest::WRITABLE) {
            warn!("tcp{} Error registering socket: {}", id, e);
            ctx.database.delete_transport_connection(id);
            return Err(EngineError::Io(e));
        }

        Ok(Self {
            id,
            local_port,
            remote_port,
            remote_host,
            app_id,
            app_package,
            state: TransportLayerState::Connecting,
            window: info.window,
            // the client's SYN consumes one sequence number
            their_seq_num: info.seq.wrapping_add(1),
            our_seq_num: rand::random(),
            socket,
            token,
            ip_builder,
        })
    }

    fn open_channel(remote: SocketAddr) -> Result<TcpStream> {
        let socket = TcpStream::connect(remote)?;
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            socket_protect::protect_socket(socket.as_raw_fd());
        }
        let _ = socket.set_nodelay(true);
        Ok(socket)
    }

    pub fn id(&self) -> i32 {
        self.id
    }

    pub fn state(&self) -> TransportLayerState {
        self.state
    }

    pub(crate) fn token(&self) -> Token {
        self.token
    }

    pub fn key(&self) -> ConnectionKey {
        ConnectionKey {
            protocol: TransportProtocol::Tcp,
            local_port: self.local_port,
            remote_addr: self.ip_builder.remote_address,
            remote_port: self.remote_port,
        }
    }

    pub fn meta(&self) -> ConnMeta {
        ConnMeta {
            id: self.id,
            local_addr: self.ip_builder.local_address,
            remote_addr: self.ip_builder.remote_address,
            local_port: self.local_port,
            remote_port: self.remote_port,
            remote_host: self.remote_host.clone(),
            app_id: self.app_id,
            app_package: self.app_package.clone(),
        }
    }

    /// Interprets the TCP flags of an intercepted client segment.
    pub(crate) fn unwrap_outbound(
        &mut self,
        ctx: &EngineContext,
        parsed: &ParsedPacket,
        raw: &[u8],
    ) -> Vec<TransportEvent> {
        if self.state == TransportLayerState::Aborted {
            return Vec::new();
        }
        let info = match &parsed.transport {
            TransportInfo::Tcp(info) => info.clone(),
            _ => return Vec::new(),
        };
        let payload = parsed.payload(raw);

        let mut events = Vec::new();
        if info.flags.ack {
            if !payload.is_empty() {
                self.handle_ack_data(ctx, payload, &mut events);
            } else if !info.flags.syn && !info.flags.fin {
                self.handle_ack_empty(ctx);
            }
            if info.flags.syn {
                self.handle_syn_ack(ctx);
            } else if info.flags.fin {
                self.handle_fin_ack(ctx);
            }
        } else if info.flags.fin {
            self.handle_fin(ctx);
        }
        events
    }

    fn handle_ack_data(&mut self, ctx: &EngineContext, payload: &[u8], events: &mut Vec<TransportEvent>) {
        if self.state != TransportLayerState::Connected {
            warn!("tcp{} Got ACK with data in invalid state {}", self.id, self.state);
            self.close_hard(ctx);
            return;
        }
        self.their_seq_num = self.their_seq_num.wrapping_add(payload.len() as u32);

        // every segment is acknowledged on receipt, the outward socket
        // provides the real reliability
        self.write_segment(ctx, TcpFlags::ack_only(), &[]);

        events.push(TransportEvent::Outbound(payload.to_vec()));
    }

    fn handle_ack_empty(&mut self, ctx: &EngineContext) {
        match self.state {
            TransportLayerState::Connecting => {
                // establishing handshake complete
                self.state = TransportLayerState::Connected;
            }
            TransportLayerState::Connected | TransportLayerState::Closed => {
                // nothing to acknowledge, the device interface doesn't lose packets
            }
            TransportLayerState::Closing => {
                self.state = TransportLayerState::Closed;
                self.evict(ctx);
            }
            _ => {
                warn!("tcp{} Got empty ACK in invalid state {}", self.id, self.state);
                self.close_hard(ctx);
            }
        }
    }

    fn handle_syn_ack(&mut self, ctx: &EngineContext) {
        // the client never receives a SYN from us, so it must not answer one
        warn!("tcp{} Got SYN ACK (invalid)", self.id);
        self.close_hard(ctx);
    }

    fn handle_fin_ack(&mut self, ctx: &EngineContext) {
        if self.state == TransportLayerState::Closing {
            self.their_seq_num = self.their_seq_num.wrapping_add(1);
            self.write_segment(ctx, TcpFlags::ack_only(), &[]);
        } else {
            self.handle_fin(ctx);
        }
    }

    fn handle_fin(&mut self, ctx: &EngineContext) {
        if matches!(
            self.state,
            TransportLayerState::Closed | TransportLayerState::Aborted
        ) {
            self.close_hard(ctx);
            return;
        }
        self.close_soft(ctx);
        self.their_seq_num = self.their_seq_num.wrapping_add(1);
        self.write_segment(ctx, TcpFlags::fin_ack(), &[]);
        self.our_seq_num = self.our_seq_num.wrapping_add(1);
    }

    /// Handles a readiness event on the outward-facing socket.
    pub(crate) fn unwrap_inbound(
        &mut self,
        ctx: &EngineContext,
        readable: bool,
        writable: bool,
    ) -> InboundOutcome {
        let mut outcome = InboundOutcome::default();
        if self.state == TransportLayerState::Aborted {
            return outcome;
        }
        if writable && self.state == TransportLayerState::Connecting {
            self.finish_connect(ctx);
        }
        if readable {
            self.drain_readable(ctx, &mut outcome);
        }
        outcome
    }

    /// Completes the non-blocking connect and advances the client-facing
    /// handshake by synthesizing the SYN-ACK.
    fn finish_connect(&mut self, ctx: &EngineContext) {
        match self.socket.take_error() {
            Ok(Some(e)) => {
                warn!(
                    "tcp{} Error connecting socket to {}:{}: {}",
                    self.id, self.ip_builder.remote_address, self.remote_port, e
                );
                self.close_hard(ctx);
                return;
            }
            Err(e) => {
                warn!("tcp{} Error querying socket state: {}", self.id, e);
                self.close_hard(ctx);
                return;
            }
            Ok(None) => {}
        }

        match self.socket.peer_addr() {
            Ok(_) => {
                if let Err(e) = ctx.reregister(&mut self.socket, self.token, Interest::READABLE) {
                    warn!("tcp{} Error arming read interest: {}", self.id, e);
                    self.close_hard(ctx);
                    return;
                }
                self.write_segment(ctx, TcpFlags::syn_ack(), &[]);
                self.our_seq_num = self.our_seq_num.wrapping_add(1);
            }
            Err(e) if e.kind() == io::ErrorKind::NotConnected => {
                // spurious wakeup, the connect is still in flight
            }
            Err(e) => {
                warn!(
                    "tcp{} Error connecting socket to {}:{}: {}",
                    self.id, self.ip_builder.remote_address, self.remote_port, e
                );
                self.close_hard(ctx);
            }
        }
    }

    fn drain_readable(&mut self, ctx: &EngineContext, outcome: &mut InboundOutcome) {
        let mut buf = vec![0u8; ctx.config.max_packet_size];
        loop {
            match self.socket.read(&mut buf) {
                Ok(0) => {
                    outcome.eof = true;
                    return;
                }
                Ok(n) => outcome.events.push(TransportEvent::Inbound(buf[..n].to_vec())),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => return,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("tcp{} Error reading from socket: {}", self.id, e);
                    outcome.eof = true;
                    return;
                }
            }
        }
    }

    /// End-of-stream on the outward socket, after any drained data has been
    /// forwarded.
    pub(crate) fn handle_remote_eof(&mut self, ctx: &EngineContext) {
        ctx.deregister(&mut self.socket);
        if self.state == TransportLayerState::Closing {
            // client and server agree that the connection is closed
            self.state = TransportLayerState::Closed;
            self.evict(ctx);
        } else {
            debug!(
                "tcp{} Socket closed, state transition {} -> CLOSING",
                self.id, self.state
            );
            self.state = TransportLayerState::Closing;
            self.write_segment(ctx, TcpFlags::fin_only(), &[]);
            self.our_seq_num = self.our_seq_num.wrapping_add(1);
        }
    }

    /// Writes a payload to the outward-facing socket.
    pub fn wrap_outbound(&mut self, ctx: &EngineContext, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let mut written = 0;
        while written < payload.len() {
            match self.socket.write(&payload[written..]) {
                Ok(0) => {
                    warn!("tcp{} Socket refused write, closing connection", self.id);
                    self.close_hard(ctx);
                    return;
                }
                Ok(n) => written += n,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    std::thread::yield_now();
                }
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    warn!(
                        "tcp{} Error writing to socket, closing connection: {}",
                        self.id, e
                    );
                    self.close_hard(ctx);
                    return;
                }
            }
        }
    }

    /// Splits a payload into segments no larger than the configured maximum
    /// packet size and writes each as a synthesized PSH-ACK to the device.
    pub fn wrap_inbound(&mut self, ctx: &EngineContext, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let max = ctx.config.max_packet_size;
        if payload.len() > max {
            debug!(
                "tcp{} Splitting large payload ({} bytes) into segments of at most {} bytes",
                self.id,
                payload.len(),
                max
            );
        }
        for chunk in payload.chunks(max) {
            self.write_segment(ctx, TcpFlags::psh_ack(), chunk);
            self.our_seq_num = self.our_seq_num.wrapping_add(chunk.len() as u32);
        }
    }

    /// Closes the outward socket without evicting the connection; the
    /// client-facing closing handshake continues.
    pub fn close_soft(&mut self, ctx: &EngineContext) {
        if matches!(
            self.state,
            TransportLayerState::Closed | TransportLayerState::Aborted
        ) {
            return;
        }
        debug!(
            "tcp{} Closing transport-layer connection to {}:{} ({:?})",
            self.id, self.ip_builder.remote_address, self.remote_port, self.remote_host
        );
        self.state = TransportLayerState::Closing;
        ctx.deregister(&mut self.socket);
        let _ = self.socket.shutdown(std::net::Shutdown::Both);
    }

    /// Abort path: closes the socket, resets the client session and evicts
    /// the connection from the cache.
    pub fn close_hard(&mut self, ctx: &EngineContext) {
        if self.state == TransportLayerState::Aborted {
            self.evict(ctx);
            return;
        }
        self.close_soft(ctx);
        self.close_client_session(ctx);
        self.evict(ctx);
    }

    /// Closes the client-side session with an RST.
    fn close_client_session(&mut self, ctx: &EngineContext) {
        self.state = TransportLayerState::Aborted;
        self.write_segment(ctx, TcpFlags::rst_only(), &[]);
    }

    fn evict(&mut self, ctx: &EngineContext) {
        if ctx.connections.remove(&self.key(), self.token) {
            ctx.stats.record_connection_closed();
        }
    }

    fn write_segment(&mut self, ctx: &EngineContext, flags: TcpFlags, payload: &[u8]) {
        let packet = self.ip_builder.build_tcp_response(
            self.local_port,
            self.remote_port,
            self.our_seq_num,
            self.their_seq_num,
            flags,
            self.window,
            payload,
            None,
        );
        ctx.write_to_device(packet);
    }

    #[cfg(test)]
    pub(crate) fn seq_nums(&self) -> (u32, u32) {
        (self.our_seq_num, self.their_seq_num)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::packet::build_ipv4_tcp;
    use crate::tests::support::{test_context, RecordingConnector, TestHarness};
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::Arc;

    fn client_packet(port: u16, seq: u32, ack: u32, flags: TcpFlags, payload: &[u8]) -> Vec<u8> {
        build_ipv4_tcp(
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(127, 0, 0, 1),
            40022,
            port,
            seq,
            ack,
            flags,
            65535,
            payload,
            if flags.syn { Some(1360) } else { None },
            1,
        )
    }

    fn open_connection(harness: &TestHarness) -> (TcpConnection, TcpListener, u16) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let syn = client_packet(port, 1000, 0, TcpFlags { syn: true, ..Default::default() }, &[]);
        let parsed = crate::packet::parse_packet(&syn).unwrap();
        let info = match &parsed.transport {
            TransportInfo::Tcp(info) => info.clone(),
            _ => unreachable!(),
        };
        let conn = TcpConnection::open(&harness.ctx, &parsed, &info, None).unwrap();
        (conn, listener, port)
    }

    fn feed(harness: &TestHarness, conn: &mut TcpConnection, raw: &[u8]) -> Vec<TransportEvent> {
        let parsed = crate::packet::parse_packet(raw).unwrap();
        conn.unwrap_outbound(&harness.ctx, &parsed, raw)
    }

    #[test]
    fn pure_ack_completes_local_handshake_exactly_once() {
        let harness = test_context(Arc::new(RecordingConnector::default()));
        let (mut conn, _listener, port) = open_connection(&harness);
        assert_eq!(conn.state(), TransportLayerState::Connecting);

        let ack = client_packet(port, 1001, 1, TcpFlags::ack_only(), &[]);
        feed(&harness, &mut conn, &ack);
        assert_eq!(conn.state(), TransportLayerState::Connected);

        // a second pure ACK is ignored
        feed(&harness, &mut conn, &ack);
        assert_eq!(conn.state(), TransportLayerState::Connected);
    }

    #[test]
    fn data_segment_is_acked_and_forwarded() {
        let harness = test_context(Arc::new(RecordingConnector::default()));
        let (mut conn, _listener, port) = open_connection(&harness);
        feed(&harness, &mut conn, &client_packet(port, 1001, 1, TcpFlags::ack_only(), &[]));

        let (our_before, their_before) = conn.seq_nums();
        let events = feed(
            &harness,
            &mut conn,
            &client_packet(port, 1001, 1, TcpFlags::psh_ack(), b"hello"),
        );

        let (our_after, their_after) = conn.seq_nums();
        assert_eq!(their_after, their_before.wrapping_add(5));
        assert_eq!(our_after, our_before);

        match &events[..] {
            [TransportEvent::Outbound(payload)] => assert_eq!(payload, b"hello"),
            other => panic!("expected one outbound event, got {:?}", other),
        }

        // the client is acknowledged immediately with an empty ACK
        let ack = harness.device_rx.try_recv().expect("expected an ACK on the device");
        let parsed = crate::packet::parse_packet(&ack).unwrap();
        match &parsed.transport {
            TransportInfo::Tcp(info) => {
                assert!(info.flags.ack);
                assert!(!info.flags.psh);
                assert_eq!(info.payload_len, 0);
                assert_eq!(info.ack, their_after);
            }
            other => panic!("expected TCP, got {:?}", other),
        }
    }

    #[test]
    fn inbound_payload_is_segmented_with_monotonic_seq_nums() {
        let harness = test_context(Arc::new(RecordingConnector::default()));
        let (mut conn, _listener, port) = open_connection(&harness);
        feed(&harness, &mut conn, &client_packet(port, 1001, 1, TcpFlags::ack_only(), &[]));

        let max = harness.ctx.config.max_packet_size;
        let payload = vec![0x5A; max * 2 + 123];
        let (our_before, _) = conn.seq_nums();
        conn.wrap_inbound(&harness.ctx, &payload);
        let (our_after, _) = conn.seq_nums();
        assert_eq!(our_after, our_before.wrapping_add(payload.len() as u32));

        let mut expected_seq = our_before;
        let mut total = 0usize;
        while let Ok(packet) = harness.device_rx.try_recv() {
            let parsed = crate::packet::parse_packet(&packet).unwrap();
            let info = match &parsed.transport {
                TransportInfo::Tcp(info) => info.clone(),
                other => panic!("expected TCP, got {:?}", other),
            };
            assert!(info.flags.psh && info.flags.ack);
            assert!(info.payload_len <= max);
            assert_eq!(info.seq, expected_seq);
            expected_seq = expected_seq.wrapping_add(info.payload_len as u32);
            total += info.payload_len;
        }
        assert_eq!(total, payload.len());
    }

    #[test]
    fn fin_exchange_walks_closing_to_closed() {
        let harness = test_context(Arc::new(RecordingConnector::default()));
        let (mut conn, _listener, port) = open_connection(&harness);
        feed(&harness, &mut conn, &client_packet(port, 1001, 1, TcpFlags::ack_only(), &[]));

        feed(&harness, &mut conn, &client_packet(port, 1001, 1, TcpFlags::fin_ack(), &[]));
        assert_eq!(conn.state(), TransportLayerState::Closing);

        // the FIN-ACK reply carries the closing handshake
        let reply = harness.device_rx.try_recv().expect("expected a FIN-ACK");
        let parsed = crate::packet::parse_packet(&reply).unwrap();
        match &parsed.transport {
            TransportInfo::Tcp(info) => assert!(info.flags.fin && info.flags.ack),
            other => panic!("expected TCP, got {:?}", other),
        }

        feed(&harness, &mut conn, &client_packet(port, 1002, 2, TcpFlags::ack_only(), &[]));
        assert_eq!(conn.state(), TransportLayerState::Closed);
    }

    #[test]
    fn syn_ack_from_client_aborts_the_connection() {
        let harness = test_context(Arc::new(RecordingConnector::default()));
        let (mut conn, _listener, port) = open_connection(&harness);

        feed(&harness, &mut conn, &client_packet(port, 1001, 1, TcpFlags::syn_ack(), &[]));
        assert_eq!(conn.state(), TransportLayerState::Aborted);

        // the client session is torn down with an RST
        let mut saw_rst = false;
        while let Ok(packet) = harness.device_rx.try_recv() {
            let parsed = crate::packet::parse_packet(&packet).unwrap();
            if let TransportInfo::Tcp(info) = &parsed.transport {
                saw_rst |= info.flags.rst;
            }
        }
        assert!(saw_rst);
    }
}
