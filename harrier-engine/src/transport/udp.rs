//! UDP transport-layer connection.
//!
//! No handshake: the connection moves straight to `Connected` once the
//! outward socket is bound and connected. Datagrams are forwarded as opaque
//! payloads in both directions. DNS connections (remote port 53) are
//! one-shot and closed after the first inbound datagram.

use crate::components::context::{now_millis, EngineContext};
use crate::components::database::ConnectionRecord;
use crate::error::{EngineError, Result};
use crate::packet::{IpPacketBuilder, ParsedPacket, TransportInfo, UdpDatagramInfo};
use crate::socket_protect;
use crate::transport::{
    ConnMeta, ConnectionKey, InboundOutcome, TransportEvent, TransportLayerState,
    TransportProtocol,
};
use mio::net::UdpSocket;
use mio::{Interest, Token};
use std::io;
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr, SocketAddr};
use tracing::{debug, warn};

pub struct UdpConnection {
    id: i32,
    local_port: u16,
    remote_port: u16,
    remote_host: Option<String>,
    app_id: Option<i32>,
    app_package: Option<String>,
    state: TransportLayerState,
    socket: UdpSocket,
    token: Token,
    ip_builder: IpPacketBuilder,
}

impl UdpConnection {
    pub fn open(
        ctx: &EngineContext,
        parsed: &ParsedPacket,
        info: &UdpDatagramInfo,
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
            TransportProtocol::Udp.ip_number(),
        );
        let app_package = app_id.and_then(|id| ctx.app_finder.app_package(id));

        let id = if remote_port == 53 {
            0
        } else {
            ctx.database.persist_transport_connection(ConnectionRecord {
                session_id: ctx.session_id,
                protocol: TransportProtocol::Udp.as_str(),
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
                "udp{} Creating UDP connection to {}:{} ({:?})",
                id, ip_builder.remote_address, remote_port, remote_host
            );
        }

        let remote = SocketAddr::new(ip_builder.remote_address, remote_port);
        let mut socket = match Self::open_channel(remote) {
            Ok(socket) => socket,
            Err(e) => {
                warn!("udp{} Error while creating UDP connection: {}", id, e);
                ctx.database.delete_transport_connection(id);
                return Err(e);
            }
        };

        let token = ctx.next_token();
        if let Err(e) = ctx.register(&mut socket, token, Interest::READABLE) {
            warn!("udp{} Error registering socket: {}", id, e);
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
            state: TransportLayerState::Connected,
            socket,
            token,
            ip_builder,
        })
    }

    fn open_channel(remote: SocketAddr) -> Result<UdpSocket> {
        let bind_addr: SocketAddr = match remote.ip() {
            IpAddr::V4(_) => SocketAddr::new(IpAddr::V4(Ipv4Addr::UNSPECIFIED), 0),
            IpAddr::V6(_) => SocketAddr::new(IpAddr::V6(Ipv6Addr::UNSPECIFIED), 0),
        };
        let socket = UdpSocket::bind(bind_addr)?;
        #[cfg(unix)]
        {
            use std::os::fd::AsRawFd;
            socket_protect::protect_socket(socket.as_raw_fd());
        }
        socket.connect(remote)?;
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
            protocol: TransportProtocol::Udp,
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

    /// Each outbound datagram is forwarded as one opaque payload.
    pub(crate) fn unwrap_outbound(
        &mut self,
        _ctx: &EngineContext,
        parsed: &ParsedPacket,
        raw: &[u8],
    ) -> Vec<TransportEvent> {
        if self.state == TransportLayerState::Aborted {
            return Vec::new();
        }
        if !matches!(&parsed.transport, TransportInfo::Udp(_)) {
            return Vec::new();
        }
        let payload = parsed.payload(raw);
        if payload.is_empty() {
            return Vec::new();
        }
        vec![TransportEvent::Outbound(payload.to_vec())]
    }

    pub(crate) fn unwrap_inbound(
        &mut self,
        _ctx: &EngineContext,
        readable: bool,
        _writable: bool,
    ) -> InboundOutcome {
        let mut outcome = InboundOutcome::default();
        if self.state == TransportLayerState::Aborted {
            return outcome;
        }
        if !readable {
            warn!("udp{} Socket triggered an event that isn't readable", self.id);
            return outcome;
        }

        let mut buf = vec![0u8; u16::MAX as usize];
        loop {
            match self.socket.recv(&mut buf) {
                Ok(0) => {
                    outcome.eof = true;
                    break;
                }
                Ok(n) => outcome.events.push(TransportEvent::Inbound(buf[..n].to_vec())),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::Interrupted => {}
                Err(e) => {
                    debug!("udp{} Error reading from socket: {}", self.id, e);
                    outcome.eof = true;
                    break;
                }
            }
        }

        // DNS is one-shot, no need to keep the connection open after the
        // first reply
        if self.remote_port == 53 {
            outcome.eof = true;
        }
        outcome
    }

    pub(crate) fn handle_remote_eof(&mut self, ctx: &EngineContext) {
        self.close_hard(ctx);
    }

    /// Writes a datagram to the outward-facing socket.
    pub fn wrap_outbound(&mut self, ctx: &EngineContext, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        match self.socket.send(payload) {
            Ok(_) => {}
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                debug!("udp{} Socket not ready, dropping datagram", self.id);
            }
            Err(e) => {
                warn!(
                    "udp{} Error writing to socket, closing connection: {}",
                    self.id, e
                );
                self.close_hard(ctx);
            }
        }
    }

    /// Wraps an inbound payload into a synthesized datagram for the device.
    pub fn wrap_inbound(&mut self, ctx: &EngineContext, payload: &[u8]) {
        if self.state == TransportLayerState::Aborted {
            return;
        }
        let packet = self
            .ip_builder
            .build_udp_response(self.local_port, self.remote_port, payload);
        ctx.write_to_device(packet);
    }

    pub fn close_hard(&mut self, ctx: &EngineContext) {
        if self.state != TransportLayerState::Aborted {
            debug!(
                "udp{} Closing transport-layer connection to {}:{} ({:?})",
                self.id, self.ip_builder.remote_address, self.remote_port, self.remote_host
            );
        }
        self.state = TransportLayerState::Aborted;
        ctx.deregister(&mut self.socket);
        if ctx.connections.remove(&self.key(), self.token) {
            ctx.stats.record_connection_closed();
        }
    }
}
