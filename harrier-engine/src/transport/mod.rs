//! Transport-layer connections and the per-connection layer stack.
//!
//! Each intercepted flow is owned by one [`ConnectionStack`]: the transport
//! layer plus lazily-created encryption and application layers as sibling
//! fields. Upward calls (socket data towards the app layer) and downward
//! calls (payloads back towards the device or the remote host) are plain
//! method calls with the lower layers passed as explicit borrows, so the
//! ownership graph stays acyclic.

pub mod tcp;
pub mod udp;

use crate::app::AppLayerConnection;
use crate::components::context::EngineContext;
use crate::encryption::EncryptionLayer;
use crate::packet::ParsedPacket;
use std::net::IpAddr;

pub use tcp::TcpConnection;
pub use udp::UdpConnection;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TransportProtocol {
    Tcp,
    Udp,
}

impl TransportProtocol {
    pub fn as_str(self) -> &'static str {
        match self {
            TransportProtocol::Tcp => "TCP",
            TransportProtocol::Udp => "UDP",
        }
    }

    pub fn ip_number(self) -> u8 {
        match self {
            TransportProtocol::Tcp => 6,
            TransportProtocol::Udp => 17,
        }
    }
}

/// Cache key identifying a flow: exactly one transport connection exists per
/// key at a time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionKey {
    pub protocol: TransportProtocol,
    pub local_port: u16,
    pub remote_addr: IpAddr,
    pub remote_port: u16,
}

impl ConnectionKey {
    pub fn from_packet(parsed: &ParsedPacket) -> Option<Self> {
        use crate::packet::TransportInfo;
        match &parsed.transport {
            TransportInfo::Tcp(info) => Some(Self {
                protocol: TransportProtocol::Tcp,
                local_port: info.src_port,
                remote_addr: parsed.dst_addr,
                remote_port: info.dst_port,
            }),
            TransportInfo::Udp(info) => Some(Self {
                protocol: TransportProtocol::Udp,
                local_port: info.src_port,
                remote_addr: parsed.dst_addr,
                remote_port: info.dst_port,
            }),
            TransportInfo::Other(_) => None,
        }
    }
}

/// Possible states of a transport-layer connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportLayerState {
    /// The outward-facing socket is not yet connected.
    Connecting,
    /// The outward-facing socket is connected and ready for data.
    Connected,
    /// The outward-facing socket is closing and no longer accepts data.
    Closing,
    /// The outward-facing socket is fully closed.
    Closed,
    /// The connection hit an unrecoverable error and the socket is closed.
    Aborted,
}

impl std::fmt::Display for TransportLayerState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// Immutable snapshot of a connection's identity, handed to the upper layers
/// for logging and persistence.
#[derive(Debug, Clone)]
pub struct ConnMeta {
    pub id: i32,
    pub local_addr: IpAddr,
    pub remote_addr: IpAddr,
    pub local_port: u16,
    pub remote_port: u16,
    pub remote_host: Option<String>,
    pub app_id: Option<i32>,
    pub app_package: Option<String>,
}

impl ConnMeta {
    /// The hostname apps asked for, falling back to the literal remote IP.
    pub fn hostname(&self) -> String {
        self.remote_host
            .clone()
            .unwrap_or_else(|| self.remote_addr.to_string())
    }
}

/// Payloads surfaced by a transport-layer operation, to be forwarded to the
/// encryption layer by the owning stack after the transport bookkeeping is
/// done.
#[derive(Debug)]
pub(crate) enum TransportEvent {
    Outbound(Vec<u8>),
    Inbound(Vec<u8>),
}

#[derive(Debug, Default)]
pub(crate) struct InboundOutcome {
    pub events: Vec<TransportEvent>,
    /// The outward socket reached end-of-stream (or must be one-shot
    /// closed); the stack handles it after the events are dispatched so the
    /// synthesized FIN trails the data it acknowledges.
    pub eof: bool,
}

pub enum TransportLayer {
    Tcp(TcpConnection),
    Udp(UdpConnection),
}

impl TransportLayer {
    pub fn id(&self) -> i32 {
        match self {
            TransportLayer::Tcp(c) => c.id(),
            TransportLayer::Udp(c) => c.id(),
        }
    }

    pub fn state(&self) -> TransportLayerState {
        match self {
            TransportLayer::Tcp(c) => c.state(),
            TransportLayer::Udp(c) => c.state(),
        }
    }

    pub fn key(&self) -> ConnectionKey {
        match self {
            TransportLayer::Tcp(c) => c.key(),
            TransportLayer::Udp(c) => c.key(),
        }
    }

    pub fn meta(&self) -> ConnMeta {
        match self {
            TransportLayer::Tcp(c) => c.meta(),
            TransportLayer::Udp(c) => c.meta(),
        }
    }

    pub(crate) fn token(&self) -> mio::Token {
        match self {
            TransportLayer::Tcp(c) => c.token(),
            TransportLayer::Udp(c) => c.token(),
        }
    }

    pub fn remote_port(&self) -> u16 {
        match self {
            TransportLayer::Tcp(c) => c.meta().remote_port,
            TransportLayer::Udp(c) => c.meta().remote_port,
        }
    }

    /// Writes a payload to the outward-facing socket (towards the remote
    /// host).
    pub fn wrap_outbound(&mut self, ctx: &EngineContext, payload: &[u8]) {
        match self {
            TransportLayer::Tcp(c) => c.wrap_outbound(ctx, payload),
            TransportLayer::Udp(c) => c.wrap_outbound(ctx, payload),
        }
    }

    /// Wraps a payload into synthesized transport segments and writes them
    /// to the device interface (towards the intercepted client).
    pub fn wrap_inbound(&mut self, ctx: &EngineContext, payload: &[u8]) {
        match self {
            TransportLayer::Tcp(c) => c.wrap_inbound(ctx, payload),
            TransportLayer::Udp(c) => c.wrap_inbound(ctx, payload),
        }
    }

    pub fn close_hard(&mut self, ctx: &EngineContext) {
        match self {
            TransportLayer::Tcp(c) => c.close_hard(ctx),
            TransportLayer::Udp(c) => c.close_hard(ctx),
        }
    }

    pub(crate) fn unwrap_outbound(
        &mut self,
        ctx: &EngineContext,
        parsed: &ParsedPacket,
        raw: &[u8],
    ) -> Vec<TransportEvent> {
        match self {
            TransportLayer::Tcp(c) => c.unwrap_outbound(ctx, parsed, raw),
            TransportLayer::Udp(c) => c.unwrap_outbound(ctx, parsed, raw),
        }
    }

    pub(crate) fn unwrap_inbound(
        &mut self,
        ctx: &EngineContext,
        readable: bool,
        writable: bool,
    ) -> InboundOutcome {
        match self {
            TransportLayer::Tcp(c) => c.unwrap_inbound(ctx, readable, writable),
            TransportLayer::Udp(c) => c.unwrap_inbound(ctx, readable, writable),
        }
    }

    pub(crate) fn handle_remote_eof(&mut self, ctx: &EngineContext) {
        match self {
            TransportLayer::Tcp(c) => c.handle_remote_eof(ctx),
            TransportLayer::Udp(c) => c.handle_remote_eof(ctx),
        }
    }
}

/// One intercepted flow: the transport connection plus its lazily-created
/// encryption and application layers. Each layer is created exactly once,
/// from the first payload seen in its direction, and lives for the whole
/// connection.
pub struct ConnectionStack {
    pub transport: TransportLayer,
    encryption: Option<EncryptionLayer>,
    app: Option<AppLayerConnection>,
}

impl ConnectionStack {
    pub fn new(transport: TransportLayer) -> Self {
        Self {
            transport,
            encryption: None,
            app: None,
        }
    }

    /// Entry point for an intercepted client packet (device -> remote).
    pub fn unwrap_outbound(&mut self, ctx: &EngineContext, parsed: &ParsedPacket, raw: &[u8]) {
        let events = self.transport.unwrap_outbound(ctx, parsed, raw);
        self.dispatch(ctx, events);
    }

    /// Entry point for a readiness event on the outward-facing socket
    /// (remote -> device).
    pub fn unwrap_inbound(&mut self, ctx: &EngineContext, readable: bool, writable: bool) {
        let outcome = self.transport.unwrap_inbound(ctx, readable, writable);
        self.dispatch(ctx, outcome.events);
        if outcome.eof {
            self.transport.handle_remote_eof(ctx);
        }
    }

    fn dispatch(&mut self, ctx: &EngineContext, events: Vec<TransportEvent>) {
        for event in events {
            match event {
                TransportEvent::Outbound(payload) => {
                    self.pass_outbound_to_encryption(ctx, &payload)
                }
                TransportEvent::Inbound(payload) => {
                    self.pass_inbound_to_encryption(ctx, &payload)
                }
            }
        }
    }

    fn pass_outbound_to_encryption(&mut self, ctx: &EngineContext, payload: &[u8]) {
        if self.encryption.is_none() {
            self.encryption = Some(EncryptionLayer::classify(
                ctx,
                &self.transport,
                payload,
                false,
            ));
        }
        let Self {
            transport,
            encryption,
            app,
        } = self;
        if let Some(enc) = encryption.as_mut() {
            enc.unwrap_outbound(ctx, transport, app, payload);
        }
    }

    fn pass_inbound_to_encryption(&mut self, ctx: &EngineContext, payload: &[u8]) {
        if self.encryption.is_none() {
            tracing::warn!(
                "{}{} Inbound data without an encryption layer instance, creating one...",
                self.transport.key().protocol.as_str().to_lowercase(),
                self.transport.id()
            );
            self.encryption = Some(EncryptionLayer::classify(
                ctx,
                &self.transport,
                payload,
                true,
            ));
        }
        let Self {
            transport,
            encryption,
            app,
        } = self;
        if let Some(enc) = encryption.as_mut() {
            enc.unwrap_inbound(ctx, transport, app, payload);
        }
    }
}
