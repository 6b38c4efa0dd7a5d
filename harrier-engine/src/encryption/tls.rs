//! TLS interception.
//!
//! An intercepted TLS connection carries two independent sessions: a
//! server-facing one (this device acts as TLS client towards the real remote
//! host) and a client-facing one (this device acts as TLS server towards the
//! intercepted app, presenting a forged leaf certificate). The connection
//! caches the app's original ClientHello, completes the server-facing
//! handshake first, then replays the ClientHello into the client-facing
//! engine. Once both sessions are established, application data is decrypted
//! on one side, surfaced to the application layer, and re-encrypted on the
//! other.

use crate::app::{self, AppLayerConnection};
use crate::components::context::EngineContext;
use crate::encryption::reassembly::RecordAssembler;
use crate::transport::TransportLayer;
use harrier_mitm::{HandshakeStatus, MitmError, TlsEngine};
use std::sync::atomic::Ordering;
use tracing::{debug, error, trace, warn};

/// State of a TLS MitM connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TlsState {
    /// Fresh connection, no engine initialised.
    New,
    /// Server-facing engine initialised, its handshake in progress.
    ServerHandshake,
    /// Server-facing session established.
    ServerEstablished,
    /// Client-facing engine initialised, its handshake in progress.
    ClientHandshake,
    /// Both sessions established, ready for application data.
    ClientEstablished,
    /// Closed by a peer's close notification or an internal error.
    Closed,
}

/// Type of a TLS record, classified from the content-type byte and, for
/// handshake records, the handshake-type byte at offset 5.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum RecordType {
    HandshakeClientHello,
    HandshakeServerHello,
    HandshakeServerCert,
    HandshakeServerKey,
    HandshakeClientKey,
    HandshakeServerDone,
    HandshakeIndeterminate,
    HandshakeInvalid,
    ChangeCipherSpec,
    Alert,
    AppData,
    Indeterminate,
    Invalid,
}

pub struct TlsConnection {
    id: i32,
    state: TlsState,
    hostname: String,
    sni: Option<String>,
    do_mitm: bool,
    original_client_hello: Vec<u8>,
    outbound_assembler: RecordAssembler,
    inbound_assembler: RecordAssembler,
    server_engine: Option<TlsEngine>,
    client_engine: Option<TlsEngine>,
    server_session_open: bool,
    client_session_open: bool,
}

impl TlsConnection {
    pub fn new(ctx: &EngineContext, transport: &TransportLayer) -> Self {
        let meta = transport.meta();
        if meta.id > 0 {
            debug!(
                "tls{} Creating TLS connection to {}:{} ({:?})",
                meta.id, meta.remote_addr, meta.remote_port, meta.remote_host
            );
        }
        ctx.stats.tls_connections.fetch_add(1, Ordering::Relaxed);
        Self {
            id: meta.id,
            state: TlsState::New,
            hostname: meta.hostname(),
            sni: None,
            do_mitm: ctx.config.do_mitm,
            original_client_hello: Vec::new(),
            outbound_assembler: RecordAssembler::new(),
            inbound_assembler: RecordAssembler::new(),
            server_engine: None,
            client_engine: None,
            server_session_open: false,
            client_session_open: false,
        }
    }

    pub fn unwrap_outbound(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        app: &mut Option<AppLayerConnection>,
        payload: &[u8],
    ) {
        trace!(
            "tls{} unwrapOutbound of {} bytes in state {:?}",
            self.id,
            payload.len(),
            self.state
        );
        self.prepare_records(ctx, transport, app, payload, true);
    }

    pub fn unwrap_inbound(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        app: &mut Option<AppLayerConnection>,
        payload: &[u8],
    ) {
        trace!(
            "tls{} unwrapInbound of {} bytes in state {:?}",
            self.id,
            payload.len(),
            self.state
        );
        self.prepare_records(ctx, transport, app, payload, false);
    }

    /// Reassembles complete records from an arbitrarily-fragmented transport
    /// payload and processes them in stream order.
    fn prepare_records(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        app: &mut Option<AppLayerConnection>,
        payload: &[u8],
        outbound: bool,
    ) {
        let assembler = if outbound {
            &mut self.outbound_assembler
        } else {
            &mut self.inbound_assembler
        };
        let outcome = assembler.push(payload);
        if let Some(byte) = outcome.rejected {
            warn!(
                "tls{} Invalid TLS record type {:#04x} ({}), dropping payload",
                self.id,
                byte,
                if outbound { "outbound" } else { "inbound" }
            );
        }
        for record in outcome.records {
            if record.is_empty() {
                continue;
            }
            let record_type = parse_record_type(&record);
            if outbound {
                self.handle_outbound_record(ctx, transport, app, &record, record_type);
            } else {
                self.handle_inbound_record(ctx, transport, app, &record, record_type);
            }
        }
    }

    /// Handles one outbound record based on the connection state, advancing
    /// the client-facing handshake or bridging application data.
    fn handle_outbound_record(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        app: &mut Option<AppLayerConnection>,
        record: &[u8],
        record_type: RecordType,
    ) {
        trace!(
            "tls{} handleOutboundRecord {:?} in state {:?}",
            self.id,
            record_type,
            self.state
        );

        // the ClientHello names the remote host and decides the MitM fate of
        // the whole connection
        if record_type == RecordType::HandshakeClientHello {
            self.sni = find_sni(record);
            if let Some(sni) = &self.sni {
                self.hostname = sni.clone();
            }
            let meta = transport.meta();
            let learned = meta
                .app_id
                .map(|app_id| ctx.tls_passthrough.contains(app_id, &self.hostname))
                .unwrap_or(false);
            if self.do_mitm && learned {
                debug!(
                    "tls{} Passing through {} after an earlier TLS failure",
                    self.id, self.hostname
                );
                ctx.stats.tls_passthroughs.fetch_add(1, Ordering::Relaxed);
            }
            let in_scope = ctx.config.app_in_mitm_scope(meta.app_package.as_deref());
            if self.do_mitm && !in_scope {
                debug!(
                    "tls{} App {:?} outside MitM scope, passing through",
                    self.id, meta.app_package
                );
            }
            self.do_mitm = self.do_mitm && !learned && in_scope;
        }

        if !self.do_mitm {
            let meta = transport.meta();
            app::deliver_outbound(ctx, app, &meta, record);
            transport.wrap_outbound(ctx, record);
            return;
        }

        if record_type == RecordType::Alert {
            warn!(
                "tls{} Outbound alert in state {:?} ({} bytes)",
                self.id,
                self.state,
                record.len()
            );
            let _ = self.engine_unwrap(ctx, transport, record, true);
            return;
        }

        match self.state {
            TlsState::New => {
                if record_type == RecordType::HandshakeClientHello {
                    self.initiate_server_handshake(ctx, transport, app, record);
                } else {
                    error!(
                        "tls{} Invalid outbound record ({:?} in state {:?})",
                        self.id, record_type, self.state
                    );
                    self.close_connection(ctx, transport);
                }
            }

            // the client must wait for its handshake to start, anything it
            // sends here is a protocol violation
            TlsState::ServerHandshake | TlsState::ServerEstablished => {
                warn!(
                    "tls{} Invalid outbound record ({:?} in state {:?}), dropping",
                    self.id, record_type, self.state
                );
            }

            TlsState::ClientHandshake => {
                self.continue_handshake(ctx, transport, Some(record), true);
            }

            TlsState::ClientEstablished => {
                if record_type == RecordType::ChangeCipherSpec {
                    return;
                }
                if let Some(plaintext) = self.engine_unwrap(ctx, transport, record, true) {
                    if !plaintext.is_empty() {
                        trace!(
                            "tls{} Unwrapped {} outbound bytes, passing to app layer",
                            self.id,
                            plaintext.len()
                        );
                        let meta = transport.meta();
                        app::deliver_outbound(ctx, app, &meta, &plaintext);
                        self.handle_payload(ctx, transport, &plaintext, true);
                    }
                }
            }

            TlsState::Closed => self.close_connection(ctx, transport),
        }
    }

    /// Handles one inbound record based on the connection state, advancing
    /// the server-facing handshake or bridging application data.
    fn handle_inbound_record(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        app: &mut Option<AppLayerConnection>,
        record: &[u8],
        record_type: RecordType,
    ) {
        trace!(
            "tls{} handleInboundRecord {:?} in state {:?}",
            self.id,
            record_type,
            self.state
        );

        if !self.do_mitm {
            let meta = transport.meta();
            app::deliver_inbound(ctx, app, &meta, record);
            transport.wrap_inbound(ctx, record);
            return;
        }

        if record_type == RecordType::Alert {
            warn!(
                "tls{} Inbound alert in state {:?} ({} bytes)",
                self.id,
                self.state,
                record.len()
            );
            let _ = self.engine_unwrap(ctx, transport, record, false);
            return;
        }

        match self.state {
            // a fresh connection cannot have inbound records, the remote
            // host doesn't even know about it yet
            TlsState::New => {
                error!(
                    "tls{} Invalid inbound record ({:?} in state {:?})",
                    self.id, record_type, self.state
                );
                self.close_connection(ctx, transport);
            }

            TlsState::ServerHandshake => {
                self.continue_handshake(ctx, transport, Some(record), false);
            }

            // the client-facing handshake hasn't finished: decrypt premature
            // server data and discard it rather than buffering it through
            // the handshake race
            TlsState::ServerEstablished | TlsState::ClientHandshake => {
                if record_type == RecordType::ChangeCipherSpec {
                    return;
                }
                debug!(
                    "tls{} Premature inbound {:?} ({} bytes) in state {:?}",
                    self.id,
                    record_type,
                    record.len(),
                    self.state
                );
                if let Some(plaintext) = self.engine_unwrap(ctx, transport, record, false) {
                    if !plaintext.is_empty() {
                        warn!(
                            "tls{} Dropping {} premature bytes from the server, client handshake not finished",
                            self.id,
                            plaintext.len()
                        );
                    }
                }
            }

            TlsState::ClientEstablished => {
                if record_type == RecordType::ChangeCipherSpec {
                    return;
                }
                if let Some(plaintext) = self.engine_unwrap(ctx, transport, record, false) {
                    if !plaintext.is_empty() {
                        trace!(
                            "tls{} Unwrapped {} inbound bytes, passing to app layer",
                            self.id,
                            plaintext.len()
                        );
                        let meta = transport.meta();
                        app::deliver_inbound(ctx, app, &meta, &plaintext);
                        self.handle_payload(ctx, transport, &plaintext, false);
                    }
                }
            }

            TlsState::Closed => self.close_connection(ctx, transport),
        }
    }

    /// Sets up the server-facing engine from the app's ClientHello and
    /// drives its handshake until it needs the remote host's reply.
    fn initiate_server_handshake(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        app: &mut Option<AppLayerConnection>,
        record: &[u8],
    ) {
        debug!("tls{} initiateServerHandshake hostname: {}", self.id, self.hostname);

        // keep the original ClientHello for the client-facing handshake
        self.original_client_hello = record.to_vec();

        let meta = transport.meta();
        match ctx
            .authority
            .create_server_engine(self.sni.as_deref(), &self.hostname, meta.remote_port)
        {
            Ok(engine) => {
                self.server_engine = Some(engine);
                self.server_session_open = true;
                self.state = TlsState::ServerHandshake;
                ctx.stats.tls_mitm_sessions.fetch_add(1, Ordering::Relaxed);
                self.continue_handshake(ctx, transport, None, false);
            }
            Err(e) => {
                // no session exists yet, fall back to passing this
                // connection (and future ones for the pair) through
                warn!(
                    "tls{} Cannot create server-facing engine for {}: {}",
                    self.id, self.hostname, e
                );
                self.learn_passthrough(ctx, transport);
                self.do_mitm = false;
                app::deliver_outbound(ctx, app, &meta, record);
                transport.wrap_outbound(ctx, record);
            }
        }
    }

    /// Sets up the client-facing engine (forged for the server session's
    /// hostname) and replays the cached ClientHello into it.
    fn initiate_client_handshake(&mut self, ctx: &EngineContext, transport: &mut TransportLayer) {
        debug!("tls{} initiateClientHandshake hostname: {}", self.id, self.hostname);

        let engine = match self.server_engine.as_ref() {
            Some(server_engine) => ctx.authority.create_client_engine_for(server_engine),
            None => {
                error!("tls{} Client handshake without a server session", self.id);
                self.close_connection(ctx, transport);
                return;
            }
        };

        match engine {
            Ok(engine) => {
                self.client_engine = Some(engine);
                self.client_session_open = true;
                self.state = TlsState::ClientHandshake;
                let hello = self.original_client_hello.clone();
                self.continue_handshake(ctx, transport, Some(&hello), true);
            }
            Err(e) => {
                warn!(
                    "tls{} Cannot create client-facing engine for {}: {}",
                    self.id, self.hostname, e
                );
                self.tls_failure(ctx, transport);
            }
        }
    }

    /// Drives a handshake forward on the engine's status: produce and send
    /// pending flights, consume the supplied record, and transition state
    /// when the engine reports completion.
    fn continue_handshake(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        mut record: Option<&[u8]>,
        client_facing: bool,
    ) {
        loop {
            let status = match self.engine_mut(client_facing) {
                Some(engine) => engine.handshake_status(),
                None => {
                    error!("tls{} continueHandshake without an engine", self.id);
                    self.close_connection(ctx, transport);
                    return;
                }
            };
            trace!(
                "tls{} continueHandshake ({}) status {:?}",
                self.id,
                if client_facing { "client" } else { "server" },
                status
            );

            match status {
                HandshakeStatus::NeedWrap => {
                    let result = match self.engine_mut(client_facing) {
                        Some(engine) => engine.wrap(None),
                        None => return,
                    };
                    match result {
                        Ok(wire) => {
                            if !wire.is_empty() {
                                if client_facing {
                                    transport.wrap_inbound(ctx, &wire);
                                } else {
                                    transport.wrap_outbound(ctx, &wire);
                                }
                            }
                        }
                        Err(e) => {
                            warn!(
                                "tls{} Handshake wrap failed in state {:?}: {}",
                                self.id, self.state, e
                            );
                            self.tls_failure(ctx, transport);
                            return;
                        }
                    }
                }

                HandshakeStatus::NeedUnwrap => match record.take() {
                    Some(bytes) => {
                        let result = match self.engine_mut(client_facing) {
                            Some(engine) => engine.unwrap(bytes),
                            None => return,
                        };
                        match result {
                            Ok(_) => {}
                            Err(MitmError::SessionClosed) => {
                                debug!(
                                    "tls{} Session closed during handshake, closing connection",
                                    self.id
                                );
                                self.close_connection(ctx, transport);
                                return;
                            }
                            Err(e) => {
                                warn!(
                                    "tls{} Handshake unwrap failed in state {:?}: {}",
                                    self.id, self.state, e
                                );
                                self.tls_failure(ctx, transport);
                                return;
                            }
                        }
                    }
                    // out of data, wait for the peer's next record
                    None => return,
                },

                HandshakeStatus::Finished => {
                    if client_facing {
                        debug!("tls{} Client-facing session established", self.id);
                        self.state = TlsState::ClientEstablished;
                    } else {
                        debug!("tls{} Server-facing session established", self.id);
                        self.state = TlsState::ServerEstablished;
                        self.initiate_client_handshake(ctx, transport);
                    }
                    return;
                }

                HandshakeStatus::NotHandshaking => {
                    error!(
                        "tls{} continueHandshake failure, engine is not handshaking",
                        self.id
                    );
                    self.close_connection(ctx, transport);
                    return;
                }
            }
        }
    }

    /// Encrypts an application payload through the direction's engine and
    /// hands the ciphertext to the transport layer.
    fn handle_payload(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        payload: &[u8],
        outbound: bool,
    ) {
        if self.state != TlsState::ClientEstablished {
            error!(
                "tls{} handlePayload in invalid state {:?}",
                self.id, self.state
            );
            self.close_connection(ctx, transport);
            return;
        }
        // outbound payloads are re-encrypted towards the remote host by the
        // server-facing engine, inbound ones towards the app by the
        // client-facing engine
        let client_facing = !outbound;
        let result = match self.engine_mut(client_facing) {
            Some(engine) => engine.wrap(Some(payload)),
            None => {
                self.close_connection(ctx, transport);
                return;
            }
        };
        match result {
            Ok(wire) => {
                if !wire.is_empty() {
                    if outbound {
                        transport.wrap_outbound(ctx, &wire);
                    } else {
                        transport.wrap_inbound(ctx, &wire);
                    }
                }
            }
            Err(e) => {
                warn!(
                    "tls{} Wrap failed in state {:?}: {}",
                    self.id, self.state, e
                );
                self.tls_failure(ctx, transport);
            }
        }
    }

    /// Decrypts a record through the direction's engine. Returns the
    /// plaintext, or None after an error (which closes the connection).
    fn engine_unwrap(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        record: &[u8],
        client_facing: bool,
    ) -> Option<Vec<u8>> {
        let result = match self.engine_mut(client_facing) {
            Some(engine) => engine.unwrap(record),
            None => {
                error!("tls{} Unwrap without an engine", self.id);
                self.close_connection(ctx, transport);
                return None;
            }
        };
        match result {
            Ok(plaintext) => Some(plaintext),
            Err(MitmError::SessionClosed) => {
                debug!("tls{} Unwrap resulted in closed session, closing connection", self.id);
                self.close_connection(ctx, transport);
                None
            }
            Err(e) => {
                warn!(
                    "tls{} Unwrap failed in state {:?}: {}",
                    self.id, self.state, e
                );
                self.tls_failure(ctx, transport);
                None
            }
        }
    }

    fn engine_mut(&mut self, client_facing: bool) -> Option<&mut TlsEngine> {
        if client_facing {
            self.client_engine.as_mut()
        } else {
            self.server_engine.as_mut()
        }
    }

    fn learn_passthrough(&self, ctx: &EngineContext, transport: &TransportLayer) {
        if let Some(app_id) = transport.meta().app_id {
            ctx.tls_passthrough.put(app_id, &self.hostname);
        }
    }

    /// A TLS-layer failure: future connections for this (app, hostname)
    /// pair skip MitM, and the current connection is torn down.
    fn tls_failure(&mut self, ctx: &EngineContext, transport: &mut TransportLayer) {
        ctx.stats.tls_failures.fetch_add(1, Ordering::Relaxed);
        self.learn_passthrough(ctx, transport);
        self.close_connection(ctx, transport);
    }

    /// Closes both TLS sessions (notifying each peer) and the transport
    /// connection beneath them.
    fn close_connection(&mut self, ctx: &EngineContext, transport: &mut TransportLayer) {
        debug!("tls{} closeConnection in state {:?}", self.id, self.state);
        self.state = TlsState::Closed;

        if self.server_session_open {
            self.server_session_open = false;
            if let Some(engine) = self.server_engine.as_mut() {
                engine.close_outbound();
                if let Ok(wire) = engine.wrap(None) {
                    if !wire.is_empty() {
                        transport.wrap_outbound(ctx, &wire);
                    }
                }
            }
        }

        if self.client_session_open {
            self.client_session_open = false;
            if let Some(engine) = self.client_engine.as_mut() {
                engine.close_outbound();
                if let Ok(wire) = engine.wrap(None) {
                    if !wire.is_empty() {
                        transport.wrap_inbound(ctx, &wire);
                    }
                }
            }
        }

        transport.close_hard(ctx);
    }
}

/// Extracts the Server Name Indication from a ClientHello record. Walks the
/// fixed-length fields (session id, cipher suites, compression methods) to
/// the extension block and scans for extension type 0.
pub fn find_sni(client_hello: &[u8]) -> Option<String> {
    let msg = client_hello;
    // record header (5) + handshake header (4) + version (2) + random (32)
    let mut i = 43usize;

    let session_len = *msg.get(i)? as usize;
    i += 1 + session_len;

    let cipher_len = ((*msg.get(i)? as usize) << 8) | (*msg.get(i + 1)? as usize);
    i += 2 + cipher_len;

    let compression_len = *msg.get(i)? as usize;
    i += 1 + compression_len;

    let total_extensions_len = ((*msg.get(i)? as usize) << 8) | (*msg.get(i + 1)? as usize);
    i += 2;

    let mut j = 0usize;
    while j < total_extensions_len {
        let extension_type = ((*msg.get(i + j)? as usize) << 8) | (*msg.get(i + j + 1)? as usize);
        j += 2;
        let extension_len = ((*msg.get(i + j)? as usize) << 8) | (*msg.get(i + j + 1)? as usize);
        j += 2;
        if extension_type == 0 {
            // server_name list: list length (2), name type (1), name length (2)
            let entry_len = ((*msg.get(i + j)? as usize) << 8) | (*msg.get(i + j + 1)? as usize);
            let name = msg.get(i + j + 5..i + j + 2 + entry_len)?;
            return String::from_utf8(name.to_vec()).ok();
        }
        j += extension_len;
    }

    None
}

fn parse_record_type(payload: &[u8]) -> RecordType {
    match payload[0] {
        0x14 => RecordType::ChangeCipherSpec,
        0x15 => RecordType::Alert,
        0x16 => {
            if payload.len() <= 5 {
                RecordType::HandshakeInvalid
            } else {
                match payload[5] {
                    0x01 => RecordType::HandshakeClientHello,
                    0x02 => RecordType::HandshakeServerHello,
                    0x0B => RecordType::HandshakeServerCert,
                    0x0C => RecordType::HandshakeServerKey,
                    0x0E => RecordType::HandshakeServerDone,
                    0x10 => RecordType::HandshakeClientKey,
                    _ => RecordType::HandshakeIndeterminate,
                }
            }
        }
        0x17 => RecordType::AppData,
        _ => {
            if payload.len() < 5 {
                RecordType::Invalid
            } else {
                RecordType::Indeterminate
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    /// Builds a minimal ClientHello record with an SNI extension.
    pub(crate) fn client_hello_with_sni(hostname: &str) -> Vec<u8> {
        let name = hostname.as_bytes();

        // server_name extension body: list length, type 0 (host_name), name
        let mut ext_body = Vec::new();
        ext_body.extend_from_slice(&((name.len() + 3) as u16).to_be_bytes());
        ext_body.push(0x00);
        ext_body.extend_from_slice(&(name.len() as u16).to_be_bytes());
        ext_body.extend_from_slice(name);

        let mut extensions = Vec::new();
        // a padding extension first, so the scan has to skip one
        extensions.extend_from_slice(&21u16.to_be_bytes());
        extensions.extend_from_slice(&4u16.to_be_bytes());
        extensions.extend_from_slice(&[0x00; 4]);
        // the server_name extension
        extensions.extend_from_slice(&0u16.to_be_bytes());
        extensions.extend_from_slice(&(ext_body.len() as u16).to_be_bytes());
        extensions.extend_from_slice(&ext_body);

        let mut body = Vec::new();
        body.extend_from_slice(&[0x03, 0x03]); // client version
        body.extend_from_slice(&[0xAA; 32]); // random
        body.push(0); // session id length
        body.extend_from_slice(&2u16.to_be_bytes()); // cipher suites length
        body.extend_from_slice(&[0x13, 0x01]);
        body.push(1); // compression methods length
        body.push(0);
        body.extend_from_slice(&(extensions.len() as u16).to_be_bytes());
        body.extend_from_slice(&extensions);

        let mut handshake = vec![0x01, 0x00];
        handshake.extend_from_slice(&(body.len() as u16).to_be_bytes());
        handshake.extend_from_slice(&body);

        let mut record = vec![0x16, 0x03, 0x01];
        record.extend_from_slice(&(handshake.len() as u16).to_be_bytes());
        record.extend_from_slice(&handshake);
        record
    }

    #[test]
    fn finds_sni_in_crafted_client_hello() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(find_sni(&record).as_deref(), Some("example.com"));
    }

    #[test]
    fn missing_sni_yields_none() {
        let mut record = client_hello_with_sni("example.com");
        // rewrite the server_name extension type to something else
        let len = record.len();
        let name_len = "example.com".len();
        let ext_start = len - name_len - 5 - 4;
        record[ext_start] = 0xFF;
        assert_eq!(find_sni(&record), None);
    }

    #[test]
    fn truncated_client_hello_yields_none() {
        let record = client_hello_with_sni("example.com");
        assert_eq!(find_sni(&record[..40]), None);
    }

    use crate::config::EngineConfig;
    use crate::packet::{build_ipv4_tcp, TcpFlags, TransportInfo};
    use crate::tests::support::{test_context_with, RecordingConnector, TestAppFinder, TestHarness};
    use crate::transport::{TcpConnection, TransportLayer};
    use std::net::{Ipv4Addr, TcpListener};
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn mitm_harness() -> TestHarness {
        let config = EngineConfig {
            do_mitm: true,
            ..Default::default()
        };
        test_context_with(
            config,
            Arc::new(RecordingConnector::default()),
            Arc::new(TestAppFinder),
        )
    }

    fn open_transport(harness: &TestHarness) -> (TransportLayer, TcpListener) {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let syn = build_ipv4_tcp(
            Ipv4Addr::new(127, 0, 0, 1),
            Ipv4Addr::new(127, 0, 0, 1),
            40022,
            port,
            1000,
            0,
            TcpFlags { syn: true, ..Default::default() },
            65535,
            &[],
            Some(1360),
            1,
        );
        let parsed = crate::packet::parse_packet(&syn).unwrap();
        let info = match &parsed.transport {
            TransportInfo::Tcp(info) => info.clone(),
            _ => unreachable!(),
        };
        let conn = TcpConnection::open(&harness.ctx, &parsed, &info, None).unwrap();
        (TransportLayer::Tcp(conn), listener)
    }

    #[test]
    fn client_hello_initiates_server_facing_handshake() {
        let harness = mitm_harness();
        let (mut transport, _listener) = open_transport(&harness);
        let mut tls = TlsConnection::new(&harness.ctx, &transport);

        let hello = client_hello_with_sni("mitm.example.com");
        tls.unwrap_outbound(&harness.ctx, &mut transport, &mut None, &hello);

        assert_eq!(tls.state, TlsState::ServerHandshake);
        assert_eq!(tls.hostname, "mitm.example.com");
        assert_eq!(harness.ctx.stats.tls_mitm_sessions.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn learned_pair_is_passed_through() {
        let harness = mitm_harness();
        harness.ctx.tls_passthrough.put(1001, "bad.example.com");
        let (mut transport, _listener) = open_transport(&harness);
        let mut tls = TlsConnection::new(&harness.ctx, &transport);

        let hello = client_hello_with_sni("bad.example.com");
        tls.unwrap_outbound(&harness.ctx, &mut transport, &mut None, &hello);

        assert_eq!(tls.state, TlsState::New);
        assert!(!tls.do_mitm);
        assert_eq!(harness.ctx.stats.tls_passthroughs.load(Ordering::Relaxed), 1);
        assert_eq!(harness.ctx.stats.tls_mitm_sessions.load(Ordering::Relaxed), 0);
    }

    #[test]
    fn tls_failure_learns_the_passthrough_pair() {
        let harness = mitm_harness();
        let (mut transport, _listener) = open_transport(&harness);
        let mut tls = TlsConnection::new(&harness.ctx, &transport);

        let hello = client_hello_with_sni("flaky.example.com");
        tls.unwrap_outbound(&harness.ctx, &mut transport, &mut None, &hello);
        assert_eq!(tls.state, TlsState::ServerHandshake);

        // application data before any ServerHello is a protocol violation
        // the server-facing engine rejects
        let garbage = [0x17, 0x03, 0x03, 0x00, 0x05, 0x01, 0x02, 0x03, 0x04, 0x05];
        tls.unwrap_inbound(&harness.ctx, &mut transport, &mut None, &garbage);

        assert_eq!(tls.state, TlsState::Closed);
        assert!(harness.ctx.tls_passthrough.contains(1001, "flaky.example.com"));
        assert_eq!(harness.ctx.stats.tls_failures.load(Ordering::Relaxed), 1);

        // a fresh connection for the same pair now skips MitM
        let (mut transport2, _listener2) = open_transport(&harness);
        let mut tls2 = TlsConnection::new(&harness.ctx, &transport2);
        tls2.unwrap_outbound(
            &harness.ctx,
            &mut transport2,
            &mut None,
            &client_hello_with_sni("flaky.example.com"),
        );
        assert!(!tls2.do_mitm);
        assert_eq!(harness.ctx.stats.tls_passthroughs.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn classifies_record_types() {
        assert_eq!(
            parse_record_type(&[0x16, 0x03, 0x03, 0x00, 0x02, 0x01]),
            RecordType::HandshakeClientHello
        );
        assert_eq!(
            parse_record_type(&[0x16, 0x03, 0x03, 0x00, 0x02, 0x02]),
            RecordType::HandshakeServerHello
        );
        assert_eq!(
            parse_record_type(&[0x16, 0x03, 0x03, 0x00, 0x00]),
            RecordType::HandshakeInvalid
        );
        assert_eq!(
            parse_record_type(&[0x14, 0x03, 0x03, 0x00, 0x01, 0x01]),
            RecordType::ChangeCipherSpec
        );
        assert_eq!(
            parse_record_type(&[0x15, 0x03, 0x03, 0x00, 0x02, 0x02, 0x28]),
            RecordType::Alert
        );
        assert_eq!(
            parse_record_type(&[0x17, 0x03, 0x03, 0x00, 0x01, 0xFF]),
            RecordType::AppData
        );
        assert_eq!(parse_record_type(&[0x42, 0x00]), RecordType::Invalid);
        assert_eq!(
            parse_record_type(&[0x42, 0x00, 0x00, 0x00, 0x00, 0x00]),
            RecordType::Indeterminate
        );
    }
}
