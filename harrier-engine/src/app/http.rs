//! HTTP message reassembly and persistence.
//!
//! Messages are assembled per direction: bytes accumulate until the header
//! terminator, then the framing is decided: chunked transfer encoding, a
//! Content-Length larger than what has arrived (overflow mode with a
//! remaining-byte countdown), or complete as-is. Reassembled requests and
//! responses are persisted through the database connector, correlated by
//! the request id. Body semantics beyond framing are not interpreted.

use crate::components::context::{now_millis, EngineContext};
use crate::components::database::{HttpRequestRecord, HttpResponseRecord};
use crate::transport::ConnMeta;
use std::sync::atomic::Ordering;
use tracing::{debug, warn};

#[derive(Debug, Default)]
struct MessageAssembly {
    pending_header: Vec<u8>,
    chunk_cache: Vec<Vec<u8>>,
    chunked: bool,
    overflowing: bool,
    stated_content_length: i64,
    remaining_content_length: i64,
}

impl MessageAssembly {
    fn reset(&mut self) {
        self.pending_header.clear();
        self.chunk_cache.clear();
        self.chunked = false;
        self.overflowing = false;
        self.stated_content_length = -1;
        self.remaining_content_length = -1;
    }

    fn combine_chunks(&mut self) -> Vec<u8> {
        let total: usize = self.chunk_cache.iter().map(|c| c.len()).sum();
        let mut combined = Vec::with_capacity(total);
        for chunk in self.chunk_cache.drain(..) {
            combined.extend_from_slice(&chunk);
        }
        combined
    }
}

pub struct HttpConnection {
    id: i32,
    outbound: MessageAssembly,
    inbound: MessageAssembly,
    last_request_id: i32,
}

impl HttpConnection {
    pub fn new(meta: &ConnMeta) -> Self {
        if meta.id > 0 {
            debug!(
                "http{} Creating HTTP connection to {}:{} ({:?})",
                meta.id, meta.remote_addr, meta.remote_port, meta.remote_host
            );
        }
        Self {
            id: meta.id,
            outbound: MessageAssembly::default(),
            inbound: MessageAssembly::default(),
            last_request_id: -1,
        }
    }

    pub fn unwrap_outbound(&mut self, ctx: &EngineContext, meta: &ConnMeta, payload: &[u8]) {
        self.handle_data(ctx, meta, payload, true);
    }

    pub fn unwrap_inbound(&mut self, ctx: &EngineContext, meta: &ConnMeta, payload: &[u8]) {
        self.handle_data(ctx, meta, payload, false);
    }

    fn handle_data(&mut self, ctx: &EngineContext, meta: &ConnMeta, payload: &[u8], outbound: bool) {
        debug!(
            "http{} Processing http {}: {} bytes",
            self.id,
            if outbound { "out" } else { "in" },
            payload.len()
        );

        let assembly = if outbound { &mut self.outbound } else { &mut self.inbound };

        if !assembly.chunked && !assembly.overflowing {
            // first bytes of a fresh message: accumulate until the header
            // terminator is in
            assembly.pending_header.extend_from_slice(payload);
            if !contains_terminator(&assembly.pending_header) {
                debug!("http{} Caching partial headers and awaiting the rest", self.id);
                return;
            }

            let buffered = std::mem::take(&mut assembly.pending_header);
            let message = String::from_utf8_lossy(&buffered).into_owned();

            assembly.chunked = message.contains("Transfer-Encoding: chunked");

            assembly.overflowing = if !assembly.chunked {
                assembly.stated_content_length = parse_content_length(&message);
                if assembly.stated_content_length > 0 {
                    let body_index = message.find("\r\n\r\n").map(|i| i + 4).unwrap_or(0);
                    let actual_content_length = (buffered.len() - body_index) as i64;
                    assembly.remaining_content_length =
                        assembly.stated_content_length - actual_content_length;
                    assembly.remaining_content_length > 0
                } else {
                    // without a Content-Length header the intended length is
                    // unknowable, assume the message is complete
                    false
                }
            } else {
                false
            };

            if assembly.chunked || assembly.overflowing {
                if assembly.overflowing {
                    debug!(
                        "http{} Overflowing with {} of {} body bytes remaining",
                        self.id, assembly.remaining_content_length, assembly.stated_content_length
                    );
                }
                assembly.chunk_cache.push(buffered);
            } else {
                self.persist_message(ctx, meta, &message, outbound);
            }
        } else {
            assembly.chunk_cache.push(payload.to_vec());

            // a message is assumed to be overflowing XOR chunked
            if assembly.overflowing {
                assembly.remaining_content_length -= payload.len() as i64;
                debug!(
                    "http{} Overflowing with {} of {} body bytes remaining",
                    self.id, assembly.remaining_content_length, assembly.stated_content_length
                );
                if assembly.remaining_content_length <= 0 {
                    let combined = assembly.combine_chunks();
                    let message = String::from_utf8_lossy(&combined).into_owned();
                    self.persist_message(ctx, meta, &message, outbound);
                }
            } else if is_terminal_chunk(payload) {
                let combined = assembly.combine_chunks();
                let message = dechunk_http_message(&combined);
                self.persist_message(ctx, meta, &message, outbound);
            }
        }
    }

    /// Parses the assembled message and persists it; persistence failures
    /// are logged and never block forwarding.
    fn persist_message(&mut self, ctx: &EngineContext, meta: &ConnMeta, message: &str, outbound: bool) {
        let status_line = parse_status_line(self.id, message, outbound);
        let headers = parse_headers(message);
        let body = parse_body(message);

        if outbound {
            self.outbound.reset();
        } else {
            self.inbound.reset();
        }
        ctx.stats.http_messages.fetch_add(1, Ordering::Relaxed);

        let persisted_id = if outbound {
            let record = HttpRequestRecord {
                connection_id: self.id,
                timestamp: now_millis(),
                headers,
                content: body.to_string(),
                content_length: body.len(),
                method: status_line.as_ref().map(|s| s[0].clone()).unwrap_or_default(),
                remote_host: meta.remote_host.clone().unwrap_or_default(),
                remote_path: status_line.as_ref().map(|s| s[1].clone()).unwrap_or_default(),
                remote_ip: meta.remote_addr.to_string(),
                remote_port: meta.remote_port,
                local_ip: meta.local_addr.to_string(),
                local_port: meta.local_port,
                initiator_id: meta.app_id.unwrap_or(0),
                initiator_pkg: meta.app_package.clone().unwrap_or_default(),
            };
            let id = ctx.database.persist_http_request(record);
            self.last_request_id = id;
            id
        } else {
            let record = HttpResponseRecord {
                connection_id: self.id,
                request_id: self.last_request_id,
                timestamp: now_millis(),
                headers,
                content: body.to_string(),
                content_length: body.len(),
                status_code: status_line
                    .as_ref()
                    .and_then(|s| s[1].parse().ok())
                    .unwrap_or(0),
                status_msg: status_line.as_ref().map(|s| s[2].clone()).unwrap_or_default(),
                remote_host: meta.remote_host.clone().unwrap_or_default(),
                remote_ip: meta.remote_addr.to_string(),
                remote_port: meta.remote_port,
                local_ip: meta.local_addr.to_string(),
                local_port: meta.local_port,
                initiator_id: meta.app_id.unwrap_or(0),
                initiator_pkg: meta.app_package.clone().unwrap_or_default(),
            };
            ctx.database.persist_http_response(record)
        };

        if persisted_id < 0 {
            debug!(
                "http{} HTTP {} persistence failed",
                self.id,
                if outbound { "request" } else { "response" }
            );
        } else {
            debug!(
                "http{} HTTP {} persisted with id {}",
                self.id,
                if outbound { "request" } else { "response" },
                persisted_id
            );
        }
    }
}

fn contains_terminator(buffer: &[u8]) -> bool {
    buffer.windows(4).any(|w| w == b"\r\n\r\n")
}

fn parse_content_length(message: &str) -> i64 {
    match message.find("Content-Length: ") {
        Some(index) if index > 0 => {
            let value_start = index + 16;
            match message[value_start..].find("\r\n") {
                Some(end) => message[value_start..value_start + end]
                    .trim()
                    .parse()
                    .unwrap_or(-1),
                None => -1,
            }
        }
        _ => -1,
    }
}

/// Splits the status line into its three components: method/path/version for
/// requests, version/code/reason for responses.
fn parse_status_line(id: i32, message: &str, outbound: bool) -> Option<[String; 3]> {
    let end = match message.find("\r\n") {
        Some(end) => end,
        None => {
            warn!("http{} Invalid status line, no newline found", id);
            return None;
        }
    };
    let status_line = &message[..end];
    let parts: Vec<&str> = status_line.splitn(3, ' ').collect();
    if parts.len() < 3 {
        warn!("http{} Invalid status line: {}", id, status_line);
        return None;
    }
    if !outbound && parts[1].parse::<i32>().is_err() {
        warn!("http{} Invalid status code in status line: {}", id, status_line);
        return None;
    }
    Some([parts[0].to_string(), parts[1].to_string(), parts[2].to_string()])
}

fn parse_headers(message: &str) -> Vec<(String, String)> {
    let headers_index = match message.find("\r\n") {
        Some(i) => i + 2,
        None => return Vec::new(),
    };
    let body_index = match message.find("\r\n\r\n") {
        Some(i) => i,
        None => return Vec::new(),
    };
    if headers_index >= body_index {
        return Vec::new();
    }
    message[headers_index..body_index]
        .split("\r\n")
        .filter_map(|line| {
            line.split_once(": ")
                .map(|(name, value)| (name.to_string(), value.to_string()))
        })
        .collect()
}

fn parse_body(message: &str) -> &str {
    match message.find("\r\n\r\n") {
        Some(i) => &message[i + 4..],
        None => "",
    }
}

/// True when the payload carries the terminal zero-length chunk line.
fn is_terminal_chunk(payload: &[u8]) -> bool {
    let text = String::from_utf8_lossy(payload);
    text.split("\r\n")
        .filter(|line| !line.trim().is_empty())
        .last()
        .and_then(|line| i64::from_str_radix(line.trim(), 16).ok())
        == Some(0)
}

/// Recombines a chunked message: status line and headers stay as-is, the
/// chunked body is concatenated with the chunk-size lines removed.
pub(crate) fn dechunk_http_message(chunked_message: &[u8]) -> String {
    let text = String::from_utf8_lossy(chunked_message);

    let body_index = match text.find("\r\n\r\n") {
        Some(i) => i + 4,
        None => {
            warn!("Invalid chunked HTTP message, no header terminator found");
            return String::new();
        }
    };

    let head = &text[..body_index];
    let chunked_body = &text[body_index..];

    let chunks: Vec<&str> = chunked_body.split("\r\n").collect();
    let mut dechunked = String::new();

    let mut i = 0;
    while i < chunks.len() {
        let chunk_size = match i64::from_str_radix(chunks[i].trim(), 16) {
            Ok(size) => size,
            Err(_) => break,
        };
        i += 1;
        if chunk_size == 0 {
            break;
        }
        if let Some(data) = chunks.get(i) {
            dechunked.push_str(data);
        }
        i += 1;
    }

    format!("{}{}", head, dechunked)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{test_context, test_meta, RecordingConnector};
    use std::sync::Arc;

    #[test]
    fn dechunks_wikipedia_sample() {
        let message = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n";
        let dechunked = dechunk_http_message(message);
        assert!(dechunked.ends_with("Wikipedia"));
        assert!(dechunked.starts_with("HTTP/1.1 200 OK\r\n"));
    }

    #[test]
    fn simple_message_persists_immediately() {
        let (harness, db) = recording_harness();
        let meta = test_meta(17);
        let mut conn = HttpConnection::new(&meta);
        conn.unwrap_outbound(
            &harness.ctx,
            &meta,
            b"GET /index.html HTTP/1.1\r\nHost: example.com\r\n\r\n",
        );
        let requests = db.requests.lock().unwrap();
        assert_eq!(requests.len(), 1);
        assert_eq!(requests[0].method, "GET");
        assert_eq!(requests[0].remote_path, "/index.html");
        assert_eq!(requests[0].content_length, 0);
    }

    #[test]
    fn content_length_overflow_waits_for_remaining_bytes() {
        let (harness, db) = recording_harness();
        let meta = test_meta(17);
        let mut conn = HttpConnection::new(&meta);

        conn.unwrap_inbound(
            &harness.ctx,
            &meta,
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nabcd",
        );
        assert!(db.responses.lock().unwrap().is_empty());

        conn.unwrap_inbound(&harness.ctx, &meta, b"efghij");
        let responses = db.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].content, "abcdefghij");
        assert_eq!(responses[0].content_length, 10);
        assert_eq!(responses[0].status_code, 200);
    }

    #[test]
    fn chunked_message_persists_after_terminal_chunk() {
        let (harness, db) = recording_harness();
        let meta = test_meta(17);
        let mut conn = HttpConnection::new(&meta);

        conn.unwrap_inbound(
            &harness.ctx,
            &meta,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n",
        );
        assert!(db.responses.lock().unwrap().is_empty());

        conn.unwrap_inbound(&harness.ctx, &meta, b"4\r\nWiki\r\n5\r\npedia\r\n0\r\n\r\n");
        let responses = db.responses.lock().unwrap();
        assert_eq!(responses.len(), 1);
        assert_eq!(responses[0].content, "Wikipedia");
    }

    #[test]
    fn response_is_correlated_to_request_id() {
        let (harness, db) = recording_harness();
        let meta = test_meta(17);
        let mut conn = HttpConnection::new(&meta);

        conn.unwrap_outbound(
            &harness.ctx,
            &meta,
            b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n",
        );
        conn.unwrap_inbound(&harness.ctx, &meta, b"HTTP/1.1 204 No Content\r\n\r\n");

        let requests = db.requests.lock().unwrap();
        let responses = db.responses.lock().unwrap();
        assert_eq!(responses[0].request_id, 1);
        assert_eq!(requests.len(), 1);
    }

    #[test]
    fn split_headers_accumulate_before_framing() {
        let (harness, db) = recording_harness();
        let meta = test_meta(17);
        let mut conn = HttpConnection::new(&meta);

        conn.unwrap_outbound(&harness.ctx, &meta, b"POST /submit HTTP/1.1\r\nHos");
        assert!(db.requests.lock().unwrap().is_empty());
        conn.unwrap_outbound(&harness.ctx, &meta, b"t: example.com\r\n\r\n");
        assert_eq!(db.requests.lock().unwrap().len(), 1);
    }

    fn recording_harness() -> (crate::tests::support::TestHarness, Arc<RecordingConnector>) {
        let db = Arc::new(RecordingConnector::default());
        let harness = test_context(db.clone());
        (harness, db)
    }
}
