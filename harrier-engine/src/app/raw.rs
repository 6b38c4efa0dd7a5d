//! Raw passthrough for unrecognised application protocols.

use crate::components::context::EngineContext;
use crate::transport::ConnMeta;
use tracing::{debug, trace};

pub struct RawConnection {
    id: i32,
}

impl RawConnection {
    pub fn new(meta: &ConnMeta) -> Self {
        if meta.id > 0 {
            debug!(
                "raw{} Creating raw connection to {}:{} ({:?})",
                meta.id, meta.remote_addr, meta.remote_port, meta.remote_host
            );
        }
        Self { id: meta.id }
    }

    pub fn unwrap_outbound(&mut self, _ctx: &EngineContext, _meta: &ConnMeta, payload: &[u8]) {
        trace!("raw{} Processing raw out: {} bytes", self.id, payload.len());
    }

    pub fn unwrap_inbound(&mut self, _ctx: &EngineContext, _meta: &ConnMeta, payload: &[u8]) {
        trace!("raw{} Processing raw in: {} bytes", self.id, payload.len());
    }
}
