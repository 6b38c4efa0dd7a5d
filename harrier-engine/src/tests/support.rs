//! Shared test fixtures.

use crate::components::app_finder::AppFinder;
use crate::components::context::{EngineContext, WAKER_TOKEN};
use crate::components::database::{
    ConnectionRecord, DatabaseConnector, HttpRequestRecord, HttpResponseRecord,
};
use crate::config::EngineConfig;
use crate::transport::ConnMeta;
use bytes::BytesMut;
use crossbeam_channel::Receiver;
use harrier_mitm::Authority;
use mio::{Poll, Waker};
use std::net::IpAddr;
use std::sync::atomic::{AtomicI32, Ordering};
use std::sync::{Arc, Mutex};

pub(crate) struct TestHarness {
    pub ctx: Arc<EngineContext>,
    pub device_rx: Receiver<BytesMut>,
    // kept alive so registered sockets have a live registry
    #[allow(dead_code)]
    pub poll: Poll,
}

pub(crate) fn test_context(database: Arc<dyn DatabaseConnector>) -> TestHarness {
    test_context_with(EngineConfig::default(), database, Arc::new(TestAppFinder))
}

pub(crate) fn test_context_with(
    config: EngineConfig,
    database: Arc<dyn DatabaseConnector>,
    app_finder: Arc<dyn AppFinder>,
) -> TestHarness {
    let poll = Poll::new().unwrap();
    let waker = Arc::new(Waker::new(poll.registry(), WAKER_TOKEN).unwrap());
    let registry = poll.registry().try_clone().unwrap();
    let (device_tx, device_rx) = crossbeam_channel::unbounded();
    let ctx = Arc::new(EngineContext::new(
        config,
        1,
        database,
        app_finder,
        Authority::generate().unwrap(),
        registry,
        waker,
        device_tx,
    ));
    TestHarness {
        ctx,
        device_rx,
        poll,
    }
}

pub(crate) fn test_meta(id: i32) -> ConnMeta {
    ConnMeta {
        id,
        local_addr: "10.0.0.2".parse().unwrap(),
        remote_addr: "93.184.216.34".parse().unwrap(),
        local_port: 40022,
        remote_port: 443,
        remote_host: Some("example.com".to_string()),
        app_id: Some(1001),
        app_package: Some("com.example.app".to_string()),
    }
}

/// App finder resolving every tuple to a fixed test app.
pub(crate) struct TestAppFinder;

impl AppFinder for TestAppFinder {
    fn app_id(
        &self,
        _local_addr: IpAddr,
        _remote_addr: IpAddr,
        _local_port: u16,
        _remote_port: u16,
        _ip_protocol: u8,
    ) -> Option<i32> {
        Some(1001)
    }

    fn app_package(&self, _app_id: i32) -> Option<String> {
        Some("com.example.app".to_string())
    }
}

/// Database connector that records everything it is asked to persist and
/// hands out sequential ids.
#[derive(Default)]
pub(crate) struct RecordingConnector {
    pub connections: Mutex<Vec<ConnectionRecord>>,
    pub requests: Mutex<Vec<HttpRequestRecord>>,
    pub responses: Mutex<Vec<HttpResponseRecord>>,
    next_id: AtomicI32,
}

impl RecordingConnector {
    fn next(&self) -> i32 {
        self.next_id.fetch_add(1, Ordering::Relaxed) + 1
    }
}

impl DatabaseConnector for RecordingConnector {
    fn persist_session(&self, _start_time: i64) -> i32 {
        self.next()
    }

    fn update_session(&self, id: i32, _end_time: i64) -> i32 {
        id
    }

    fn persist_transport_connection(&self, record: ConnectionRecord) -> i32 {
        self.connections.lock().unwrap().push(record);
        self.next()
    }

    fn delete_transport_connection(&self, _id: i32) -> i32 {
        0
    }

    fn persist_http_request(&self, record: HttpRequestRecord) -> i32 {
        self.requests.lock().unwrap().push(record);
        self.next()
    }

    fn persist_http_response(&self, record: HttpResponseRecord) -> i32 {
        self.responses.lock().unwrap().push(record);
        self.next()
    }
}
