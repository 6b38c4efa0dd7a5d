//! Selector loop: one thread blocks on the shared multiplexer and
//! dispatches readiness events synchronously into the owning connection
//! stack. A connection's events are therefore processed one at a time; the
//! per-connection lock is uncontended by construction.

use crate::components::context::{EngineContext, WAKER_TOKEN};
use mio::{Events, Poll};
use std::io;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, error, trace};

pub(crate) fn run_selector_loop(
    mut poll: Poll,
    ctx: Arc<EngineContext>,
    running: Arc<AtomicBool>,
) {
    debug!("Selector loop started");
    let mut events = Events::with_capacity(1024);

    while running.load(Ordering::Acquire) {
        match poll.poll(&mut events, Some(Duration::from_millis(250))) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                error!("Error during selection: {}", e);
                break;
            }
        }

        for event in events.iter() {
            if event.token() == WAKER_TOKEN {
                continue;
            }
            let stack = match ctx.connections.find_by_token(event.token()) {
                Some(stack) => stack,
                None => {
                    // readiness for an already-evicted connection
                    trace!("Stale selector event for token {:?}", event.token());
                    continue;
                }
            };
            let readable = event.is_readable() || event.is_read_closed();
            let writable = event.is_writable();
            stack.write().unwrap_inbound(&ctx, readable, writable);
        }
    }
    debug!("Selector loop shut down");
}
