//! Application-layer connections.
//!
//! Classified once per connection from the first (decrypted) payload: DNS by
//! remote port, HTTP by a method/status keyword in the leading bytes, raw
//! passthrough otherwise. The application layer is a side channel: it
//! observes and persists payloads, while forwarding stays with the
//! encryption layer regardless of the reassembly outcome.

pub mod dns;
pub mod http;
pub mod raw;

use crate::components::context::EngineContext;
use crate::transport::ConnMeta;
use tracing::warn;

pub use dns::DnsConnection;
pub use http::HttpConnection;
pub use raw::RawConnection;

const HTTP_KEYWORDS: [&str; 10] = [
    "HTTP", "GET", "POST", "CONNECT", "PUT", "DELETE", "HEAD", "OPTIONS", "TRACE", "PATCH",
];

pub enum AppLayerConnection {
    Http(HttpConnection),
    Dns(DnsConnection),
    Raw(RawConnection),
}

impl AppLayerConnection {
    /// Classifies the first payload of a connection. Inbound-first creation
    /// falls back to raw passthrough.
    pub fn classify(meta: &ConnMeta, payload: &[u8], inbound: bool) -> Self {
        if inbound {
            AppLayerConnection::Raw(RawConnection::new(meta))
        } else if meta.remote_port == 53 {
            AppLayerConnection::Dns(DnsConnection::new(meta))
        } else if looks_like_http(payload) {
            AppLayerConnection::Http(HttpConnection::new(meta))
        } else {
            AppLayerConnection::Raw(RawConnection::new(meta))
        }
    }

    pub fn unwrap_outbound(&mut self, ctx: &EngineContext, meta: &ConnMeta, payload: &[u8]) {
        match self {
            AppLayerConnection::Http(c) => c.unwrap_outbound(ctx, meta, payload),
            AppLayerConnection::Dns(c) => c.unwrap_outbound(ctx, meta, payload),
            AppLayerConnection::Raw(c) => c.unwrap_outbound(ctx, meta, payload),
        }
    }

    pub fn unwrap_inbound(&mut self, ctx: &EngineContext, meta: &ConnMeta, payload: &[u8]) {
        match self {
            AppLayerConnection::Http(c) => c.unwrap_inbound(ctx, meta, payload),
            AppLayerConnection::Dns(c) => c.unwrap_inbound(ctx, meta, payload),
            AppLayerConnection::Raw(c) => c.unwrap_inbound(ctx, meta, payload),
        }
    }
}

/// HTTP if the leading ~11 bytes contain a recognized method or status
/// keyword.
pub fn looks_like_http(payload: &[u8]) -> bool {
    if payload.len() <= 7 {
        return false;
    }
    let head = String::from_utf8_lossy(&payload[..payload.len().min(11)]);
    HTTP_KEYWORDS.iter().any(|keyword| head.contains(keyword))
}

/// Hands an outbound payload to the app layer, creating it from this first
/// payload if necessary.
pub(crate) fn deliver_outbound(
    ctx: &EngineContext,
    slot: &mut Option<AppLayerConnection>,
    meta: &ConnMeta,
    payload: &[u8],
) {
    if slot.is_none() {
        *slot = Some(AppLayerConnection::classify(meta, payload, false));
    }
    if let Some(app) = slot.as_mut() {
        app.unwrap_outbound(ctx, meta, payload);
    }
}

/// Hands an inbound payload to the app layer. Inbound data without an app
/// layer instance falls back to a raw connection.
pub(crate) fn deliver_inbound(
    ctx: &EngineContext,
    slot: &mut Option<AppLayerConnection>,
    meta: &ConnMeta,
    payload: &[u8],
) {
    if slot.is_none() {
        warn!(
            "app{} Inbound data without an application layer instance, creating one...",
            meta.id
        );
        *slot = Some(AppLayerConnection::classify(meta, payload, true));
    }
    if let Some(app) = slot.as_mut() {
        app.unwrap_inbound(ctx, meta, payload);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_http_keywords() {
        assert!(looks_like_http(b"GET / HTTP/1.1\r\n"));
        assert!(looks_like_http(b"HTTP/1.1 200 OK\r\n"));
        assert!(looks_like_http(b"OPTIONS * HTTP/1.1\r\n"));
        assert!(!looks_like_http(b"\x16\x03\x01\x00\x05\x01\x00\x00"));
        assert!(!looks_like_http(b"GET"));
    }
}
