//! Encryption-layer connections.
//!
//! The protocol is sniffed from the very first outbound payload of a
//! connection: TLS is terminated (and optionally MitM'd), QUIC and anything
//! unrecognised pass through untouched. A connection created from inbound
//! data falls back to plaintext passthrough.

pub mod plaintext;
pub mod quic;
pub mod reassembly;
pub mod tls;

use crate::app::AppLayerConnection;
use crate::components::context::EngineContext;
use crate::transport::TransportLayer;

pub use plaintext::PlaintextConnection;
pub use quic::QuicConnection;
pub use tls::TlsConnection;

pub enum EncryptionLayer {
    Plaintext(PlaintextConnection),
    Tls(Box<TlsConnection>),
    Quic(QuicConnection),
}

impl EncryptionLayer {
    /// Classifies the first payload of a connection and constructs the
    /// matching variant. Called exactly once per connection per
    /// direction-of-first-use.
    pub fn classify(
        ctx: &EngineContext,
        transport: &TransportLayer,
        payload: &[u8],
        inbound: bool,
    ) -> Self {
        if inbound {
            EncryptionLayer::Plaintext(PlaintextConnection::new(transport))
        } else if detect_tls(payload) {
            EncryptionLayer::Tls(Box::new(TlsConnection::new(ctx, transport)))
        } else if detect_quic(payload) {
            EncryptionLayer::Quic(QuicConnection::new(transport))
        } else {
            EncryptionLayer::Plaintext(PlaintextConnection::new(transport))
        }
    }

    /// Processes a raw outbound transport payload and passes the result up
    /// to the application layer (and onward to the remote host).
    pub fn unwrap_outbound(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        app: &mut Option<AppLayerConnection>,
        payload: &[u8],
    ) {
        match self {
            EncryptionLayer::Plaintext(c) => c.unwrap_outbound(ctx, transport, app, payload),
            EncryptionLayer::Tls(c) => c.unwrap_outbound(ctx, transport, app, payload),
            EncryptionLayer::Quic(c) => c.unwrap_outbound(ctx, transport, app, payload),
        }
    }

    /// Processes a raw inbound transport payload and passes the result up
    /// to the application layer (and back to the intercepted client).
    pub fn unwrap_inbound(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        app: &mut Option<AppLayerConnection>,
        payload: &[u8],
    ) {
        match self {
            EncryptionLayer::Plaintext(c) => c.unwrap_inbound(ctx, transport, app, payload),
            EncryptionLayer::Tls(c) => c.unwrap_inbound(ctx, transport, app, payload),
            EncryptionLayer::Quic(c) => c.unwrap_inbound(ctx, transport, app, payload),
        }
    }
}

/// TLS: handshake content type, a plausible record length and a ClientHello
/// handshake type.
pub fn detect_tls(payload: &[u8]) -> bool {
    payload.len() > 6 && payload[0] == 0x16 && payload[5] == 0x01
}

/// QUIC long header: both the header-form bit and the fixed bit set, with a
/// version field of 0 (version negotiation) or 1.
pub fn detect_quic(payload: &[u8]) -> bool {
    if payload.len() < 5 {
        return false;
    }
    let first = payload[0];
    if first & 0x80 == 0 || first & 0x40 == 0 {
        return false;
    }
    let version = u32::from_be_bytes([payload[1], payload[2], payload[3], payload[4]]);
    version == 0 || version == 1
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sniffs_tls_client_hello() {
        let payload = [0x16, 0x03, 0x01, 0x00, 0x05, 0x01, 0x00];
        assert!(detect_tls(&payload));
        assert!(!detect_quic(&payload));
    }

    #[test]
    fn rejects_short_or_non_hello_tls() {
        // too short to carry a handshake type
        assert!(!detect_tls(&[0x16, 0x03, 0x01, 0x00, 0x05, 0x01]));
        // ServerHello instead of ClientHello
        assert!(!detect_tls(&[0x16, 0x03, 0x01, 0x00, 0x05, 0x02, 0x00]));
    }

    #[test]
    fn sniffs_quic_long_header() {
        // long header + fixed bit, version 1
        assert!(detect_quic(&[0xC3, 0x00, 0x00, 0x00, 0x01, 0x08]));
        // version negotiation
        assert!(detect_quic(&[0xC0, 0x00, 0x00, 0x00, 0x00]));
        // fixed bit missing
        assert!(!detect_quic(&[0x83, 0x00, 0x00, 0x00, 0x01]));
        // unknown version
        assert!(!detect_quic(&[0xC3, 0x6B, 0x33, 0x43, 0xCF]));
    }

    #[test]
    fn everything_else_is_plaintext() {
        assert!(!detect_tls(b"GET / HTTP/1.1\r\n"));
        assert!(!detect_quic(b"GET / HTTP/1.1\r\n"));
    }
}
