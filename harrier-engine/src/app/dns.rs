//! DNS connections: replies are decoded (via hickory-proto, the wire format
//! itself is not interpreted here) and their A/AAAA answers feed the DNS
//! cache, so later connections to the answered addresses carry the hostname
//! the app originally asked for. Payloads pass through unchanged.

use crate::components::context::EngineContext;
use crate::transport::ConnMeta;
use hickory_proto::op::Message;
use hickory_proto::rr::RData;
use hickory_proto::serialize::binary::BinDecodable;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tracing::{debug, trace};

pub struct DnsConnection {
    id: i32,
}

impl DnsConnection {
    pub fn new(meta: &ConnMeta) -> Self {
        if meta.id > 0 {
            debug!(
                "dns{} Creating DNS connection to {}:{}",
                meta.id, meta.remote_addr, meta.remote_port
            );
        }
        Self { id: meta.id }
    }

    pub fn unwrap_outbound(&mut self, _ctx: &EngineContext, _meta: &ConnMeta, payload: &[u8]) {
        trace!("dns{} Passing through DNS query ({} bytes)", self.id, payload.len());
    }

    pub fn unwrap_inbound(&mut self, ctx: &EngineContext, _meta: &ConnMeta, payload: &[u8]) {
        let message = match Message::from_bytes(payload) {
            Ok(message) => message,
            Err(e) => {
                debug!("dns{} Failed to decode DNS reply: {}", self.id, e);
                return;
            }
        };

        // map every answered address to the hostname the app asked for
        let query_name = message
            .queries()
            .first()
            .map(|q| trim_trailing_dot(q.name().to_utf8()));

        let mut answers = 0;
        for record in message.answers() {
            let address = match record.data() {
                Some(RData::A(a)) => a.0.to_string(),
                Some(RData::AAAA(aaaa)) => aaaa.0.to_string(),
                _ => continue,
            };
            let hostname = query_name
                .clone()
                .unwrap_or_else(|| trim_trailing_dot(record.name().to_utf8()));
            let ttl = Duration::from_secs(record.ttl() as u64);
            ctx.dns_cache.put(address, hostname, Some(ttl));
            answers += 1;
        }

        if answers > 0 {
            ctx.stats.dns_replies.fetch_add(1, Ordering::Relaxed);
            trace!("dns{} Cached {} answers from DNS reply", self.id, answers);
        }
    }
}

fn trim_trailing_dot(mut name: String) -> String {
    if name.ends_with('.') {
        name.pop();
    }
    name
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tests::support::{test_context, test_meta};
    use hickory_proto::op::{Message, MessageType, Query};
    use hickory_proto::rr::rdata::A;
    use hickory_proto::rr::{Name, Record, RecordType};
    use hickory_proto::serialize::binary::BinEncodable;
    use std::net::Ipv4Addr;
    use std::str::FromStr;
    use std::sync::Arc;

    #[test]
    fn caches_a_answers_from_replies() {
        let harness = test_context(Arc::new(
            crate::components::database::NullDatabaseConnector,
        ));
        let meta = test_meta(0);
        let mut conn = DnsConnection::new(&meta);

        let name = Name::from_str("example.com.").unwrap();
        let mut message = Message::new();
        message.set_message_type(MessageType::Response);
        message.add_query(Query::query(name.clone(), RecordType::A));
        message.add_answer(Record::from_rdata(
            name,
            300,
            RData::A(A(Ipv4Addr::new(93, 184, 216, 34))),
        ));
        let payload = message.to_bytes().unwrap();

        conn.unwrap_inbound(&harness.ctx, &meta, &payload);
        assert_eq!(
            harness.ctx.dns_cache.get("93.184.216.34").as_deref(),
            Some("example.com")
        );
    }
}
