//! Unencrypted connections: payloads pass straight through in both
//! directions, with the application layer observing them on the way.

use crate::app::{self, AppLayerConnection};
use crate::components::context::EngineContext;
use crate::transport::TransportLayer;
use tracing::debug;

pub struct PlaintextConnection {
    id: i32,
}

impl PlaintextConnection {
    pub fn new(transport: &TransportLayer) -> Self {
        let meta = transport.meta();
        if meta.id > 0 {
            debug!(
                "plain{} Creating plaintext connection to {}:{} ({:?})",
                meta.id, meta.remote_addr, meta.remote_port, meta.remote_host
            );
        }
        Self { id: meta.id }
    }

    pub fn unwrap_outbound(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        app: &mut Option<AppLayerConnection>,
        payload: &[u8],
    ) {
        let meta = transport.meta();
        app::deliver_outbound(ctx, app, &meta, payload);
        transport.wrap_outbound(ctx, payload);
    }

    pub fn unwrap_inbound(
        &mut self,
        ctx: &EngineContext,
        transport: &mut TransportLayer,
        app: &mut Option<AppLayerConnection>,
        payload: &[u8],
    ) {
        let meta = transport.meta();
        app::deliver_inbound(ctx, app, &meta, payload);
        transport.wrap_inbound(ctx, payload);
    }

    pub fn id(&self) -> i32 {
        self.id
    }
}
