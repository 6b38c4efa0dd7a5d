//! Device interface threads.
//!
//! The write thread drains the queue of packets destined for the device
//! interface and performs the blocking write; the read loop feeds raw IP
//! packets from the device into connection lookup/creation. Both treat the
//! device as an opaque byte channel framed as individual IP datagrams.

use crate::components::context::EngineContext;
use crate::components::manager;
use bytes::BytesMut;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use std::io::{self, Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, warn};

pub(crate) fn run_device_writer(
    rx: Receiver<BytesMut>,
    mut output: Box<dyn Write + Send>,
    running: Arc<AtomicBool>,
) {
    debug!("Device writer started");
    loop {
        match rx.recv_timeout(Duration::from_millis(250)) {
            Ok(packet) => write_packet(&mut output, &packet),
            Err(RecvTimeoutError::Timeout) => {
                if !running.load(Ordering::Acquire) {
                    break;
                }
            }
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }
    // flush whatever is still queued before shutting down
    while let Ok(packet) = rx.try_recv() {
        write_packet(&mut output, &packet);
    }
    debug!("Device writer shut down");
}

fn write_packet(output: &mut Box<dyn Write + Send>, packet: &[u8]) {
    if let Err(e) = output.write_all(packet).and_then(|_| output.flush()) {
        warn!("Error writing packet of {} bytes to device: {}", packet.len(), e);
    }
}

/// Reads raw IP packets from the device interface (one packet per read) and
/// feeds them into the engine until end-of-stream or shutdown.
pub(crate) fn run_device_reader(
    ctx: Arc<EngineContext>,
    running: Arc<AtomicBool>,
    mut input: Box<dyn Read + Send>,
) {
    debug!("Device reader started");
    let mut buf = vec![0u8; u16::MAX as usize];
    while running.load(Ordering::Acquire) {
        match input.read(&mut buf) {
            Ok(0) => break,
            Ok(n) => manager::handle_outbound_packet(&ctx, &buf[..n]),
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Error reading from device interface: {}", e);
                break;
            }
        }
    }
    debug!("Device reader shut down");
}
