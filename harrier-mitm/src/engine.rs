//! Non-blocking TLS session engine.
//!
//! [`TlsEngine`] wraps a [`rustls::Connection`] into the byte-in/byte-out
//! shape the encryption layer drives: `unwrap` feeds a complete TLS record
//! into the session and returns any plaintext it produced, `wrap` encrypts
//! plaintext (or flushes pending handshake flights) into wire bytes. The
//! engine never owns a socket; the caller decides where the bytes go.

use crate::error::{MitmError, Result};
use std::io::{self, Read, Write};

/// Handshake progress as observed after the most recent wrap/unwrap call.
///
/// `Finished` is reported exactly once per session, when the handshake
/// completes; afterwards the engine reports `NotHandshaking`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HandshakeStatus {
    /// The engine has wire bytes to produce; call `wrap` and send the result.
    NeedWrap,
    /// The engine needs more records from the peer; call `unwrap` with them.
    NeedUnwrap,
    /// The handshake just completed.
    Finished,
    /// The session is established (or closed) and not handshaking.
    NotHandshaking,
}

/// A single TLS session driven entirely through byte buffers.
pub struct TlsEngine {
    conn: rustls::Connection,
    hostname: String,
    port: u16,
    finished_reported: bool,
}

impl TlsEngine {
    pub(crate) fn from_client(
        conn: rustls::ClientConnection,
        hostname: String,
        port: u16,
    ) -> Self {
        Self {
            conn: rustls::Connection::Client(conn),
            hostname,
            port,
            finished_reported: false,
        }
    }

    pub(crate) fn from_server(
        conn: rustls::ServerConnection,
        hostname: String,
        port: u16,
    ) -> Self {
        Self {
            conn: rustls::Connection::Server(conn),
            hostname,
            port,
            finished_reported: false,
        }
    }

    /// The hostname this session was created for (SNI or literal IP).
    pub fn hostname(&self) -> &str {
        &self.hostname
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    /// Reports the current handshake status. `Finished` is latched: it is
    /// returned once when the handshake completes and `NotHandshaking` on
    /// every later call.
    pub fn handshake_status(&mut self) -> HandshakeStatus {
        if self.conn.is_handshaking() {
            if self.conn.wants_write() {
                HandshakeStatus::NeedWrap
            } else {
                HandshakeStatus::NeedUnwrap
            }
        } else if !self.finished_reported {
            self.finished_reported = true;
            HandshakeStatus::Finished
        } else {
            HandshakeStatus::NotHandshaking
        }
    }

    /// True while the handshake is still in flight.
    pub fn is_handshaking(&self) -> bool {
        self.conn.is_handshaking()
    }

    /// Encrypts `plaintext` (if any) and drains every pending wire byte the
    /// session wants to send, including handshake flights and alerts.
    ///
    /// The output buffer is owned and growable; sizing never fails.
    pub fn wrap(&mut self, plaintext: Option<&[u8]>) -> Result<Vec<u8>> {
        if let Some(data) = plaintext {
            self.conn
                .writer()
                .write_all(data)
                .map_err(MitmError::Io)?;
        }
        let mut wire = Vec::new();
        while self.conn.wants_write() {
            self.conn.write_tls(&mut wire).map_err(MitmError::Io)?;
        }
        Ok(wire)
    }

    /// Feeds one complete TLS record into the session and returns whatever
    /// plaintext became available. During a handshake the returned buffer is
    /// usually empty while the session state advances internally.
    pub fn unwrap(&mut self, record: &[u8]) -> Result<Vec<u8>> {
        let mut cursor = io::Cursor::new(record);
        while (cursor.position() as usize) < record.len() {
            if self.conn.read_tls(&mut cursor).map_err(MitmError::Io)? == 0 {
                break;
            }
        }
        self.conn.process_new_packets()?;

        let mut plaintext = Vec::new();
        let mut buf = [0u8; 4096];
        loop {
            match self.conn.reader().read(&mut buf) {
                Ok(0) => return Err(MitmError::SessionClosed),
                Ok(n) => plaintext.extend_from_slice(&buf[..n]),
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                    return Err(MitmError::SessionClosed)
                }
                Err(e) => return Err(MitmError::Io(e)),
            }
        }
        Ok(plaintext)
    }

    /// Queues a close_notify alert. Call `wrap(None)` afterwards to obtain
    /// the closing record for the peer.
    pub fn close_outbound(&mut self) {
        self.conn.send_close_notify();
    }

    /// True once the peer's close_notify has been processed.
    pub fn wants_read(&self) -> bool {
        self.conn.wants_read()
    }
}

impl std::fmt::Debug for TlsEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TlsEngine")
            .field("hostname", &self.hostname)
            .field("port", &self.port)
            .field("handshaking", &self.conn.is_handshaking())
            .finish()
    }
}
