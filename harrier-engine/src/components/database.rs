//! Narrow persistence interface consumed by the engine.
//!
//! The engine never touches storage directly; everything goes through this
//! trait with scalar/string parameters. Implementations return the persisted
//! row id, or `-1` on failure. Failures are logged at the call site and
//! never block traffic forwarding.

/// Parameters of a transport-layer connection row.
#[derive(Debug, Clone)]
pub struct ConnectionRecord {
    pub session_id: i32,
    pub protocol: &'static str,
    pub ip_version: u8,
    pub initial_timestamp: i64,
    pub initiator_id: i32,
    pub initiator_pkg: String,
    pub local_port: u16,
    pub remote_host: String,
    pub remote_ip: String,
    pub remote_port: u16,
}

/// Parameters of a reassembled HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequestRecord {
    pub connection_id: i32,
    pub timestamp: i64,
    pub headers: Vec<(String, String)>,
    pub content: String,
    pub content_length: usize,
    pub method: String,
    pub remote_host: String,
    pub remote_path: String,
    pub remote_ip: String,
    pub remote_port: u16,
    pub local_ip: String,
    pub local_port: u16,
    pub initiator_id: i32,
    pub initiator_pkg: String,
}

/// Parameters of a reassembled HTTP response, correlated to its request via
/// `request_id`.
#[derive(Debug, Clone)]
pub struct HttpResponseRecord {
    pub connection_id: i32,
    pub request_id: i32,
    pub timestamp: i64,
    pub headers: Vec<(String, String)>,
    pub content: String,
    pub content_length: usize,
    pub status_code: i32,
    pub status_msg: String,
    pub remote_host: String,
    pub remote_ip: String,
    pub remote_port: u16,
    pub local_ip: String,
    pub local_port: u16,
    pub initiator_id: i32,
    pub initiator_pkg: String,
}

pub trait DatabaseConnector: Send + Sync {
    fn persist_session(&self, start_time: i64) -> i32;

    fn update_session(&self, id: i32, end_time: i64) -> i32;

    fn persist_transport_connection(&self, record: ConnectionRecord) -> i32;

    fn delete_transport_connection(&self, id: i32) -> i32;

    fn persist_http_request(&self, record: HttpRequestRecord) -> i32;

    fn persist_http_response(&self, record: HttpResponseRecord) -> i32;
}

/// Connector that persists nothing. Every call returns the failure sentinel.
pub struct NullDatabaseConnector;

impl DatabaseConnector for NullDatabaseConnector {
    fn persist_session(&self, _start_time: i64) -> i32 {
        -1
    }

    fn update_session(&self, _id: i32, _end_time: i64) -> i32 {
        -1
    }

    fn persist_transport_connection(&self, _record: ConnectionRecord) -> i32 {
        -1
    }

    fn delete_transport_connection(&self, _id: i32) -> i32 {
        -1
    }

    fn persist_http_request(&self, _record: HttpRequestRecord) -> i32 {
        -1
    }

    fn persist_http_response(&self, _record: HttpResponseRecord) -> i32 {
        -1
    }
}
