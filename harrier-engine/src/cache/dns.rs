//! DNS reply cache mapping remote IPs to the hostnames apps asked for.

use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use std::time::{Duration, Instant};

const DEFAULT_MAX_SIZE: usize = 1000;
const DEFAULT_TTL_SECS: u64 = 60;

#[derive(Debug, Clone)]
struct DnsCacheRecord {
    hostname: String,
    expiry: Instant,
}

/// Bounded ip -> hostname map with TTL expiry, populated from intercepted
/// DNS replies and consulted when a new connection's remote hostname is
/// resolved.
pub struct DnsCache {
    inner: RwLock<DnsCacheInner>,
    max_size: usize,
    default_ttl: Duration,
}

struct DnsCacheInner {
    records: HashMap<String, DnsCacheRecord>,
    order: VecDeque<String>,
}

impl DnsCache {
    pub fn new() -> Self {
        Self::with_limits(DEFAULT_MAX_SIZE, Duration::from_secs(DEFAULT_TTL_SECS))
    }

    pub fn with_limits(max_size: usize, default_ttl: Duration) -> Self {
        Self {
            inner: RwLock::new(DnsCacheInner {
                records: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_size,
            default_ttl,
        }
    }

    pub fn put(&self, ip: String, hostname: String, ttl: Option<Duration>) {
        let ttl = ttl.unwrap_or(self.default_ttl);
        let mut inner = self.inner.write();
        if !inner.records.contains_key(&ip) {
            inner.order.push_back(ip.clone());
        }
        let record = DnsCacheRecord {
            hostname,
            expiry: Instant::now() + ttl,
        };
        inner.records.insert(ip, record);

        while inner.order.len() > self.max_size {
            if let Some(eldest) = inner.order.pop_front() {
                inner.records.remove(&eldest);
            }
        }
    }

    /// Looks up the hostname for an IP. An expired record is removed but its
    /// hostname is still returned once, so the connection that triggered the
    /// lookup keeps its label.
    pub fn get(&self, ip: &str) -> Option<String> {
        let mut inner = self.inner.write();
        let expired = match inner.records.get(ip) {
            Some(record) => record.expiry < Instant::now(),
            None => return None,
        };
        if expired {
            let record = inner.records.remove(ip);
            inner.order.retain(|k| k != ip);
            record.map(|r| r.hostname)
        } else {
            inner.records.get(ip).map(|r| r.hostname.clone())
        }
    }

    pub fn len(&self) -> usize {
        self.inner.read().records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.read().records.is_empty()
    }
}

impl Default for DnsCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn stores_and_returns_hostnames() {
        let cache = DnsCache::new();
        cache.put("1.2.3.4".into(), "example.com".into(), None);
        assert_eq!(cache.get("1.2.3.4").as_deref(), Some("example.com"));
        assert_eq!(cache.get("4.3.2.1"), None);
    }

    #[test]
    fn evicts_eldest_beyond_capacity() {
        let cache = DnsCache::with_limits(2, Duration::from_secs(60));
        cache.put("1.1.1.1".into(), "a".into(), None);
        cache.put("2.2.2.2".into(), "b".into(), None);
        cache.put("3.3.3.3".into(), "c".into(), None);
        assert_eq!(cache.get("1.1.1.1"), None);
        assert_eq!(cache.get("3.3.3.3").as_deref(), Some("c"));
    }

    #[test]
    fn expired_records_are_returned_once_then_dropped() {
        let cache = DnsCache::with_limits(10, Duration::from_secs(0));
        cache.put("1.2.3.4".into(), "example.com".into(), Some(Duration::from_secs(0)));
        std::thread::sleep(Duration::from_millis(5));
        assert_eq!(cache.get("1.2.3.4").as_deref(), Some("example.com"));
        assert_eq!(cache.get("1.2.3.4"), None);
    }
}
