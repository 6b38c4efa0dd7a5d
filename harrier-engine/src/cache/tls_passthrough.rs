//! Learned set of (app, hostname) pairs for which MitM is skipped.

use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::debug;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
struct PassthroughEntry {
    initiator: i32,
    hostname: String,
}

/// After a TLS negotiation failure on an intercepted connection, the (app,
/// hostname) pair is recorded here so future connections for the same pair
/// are passed through unmodified instead of being re-attempted.
#[derive(Default)]
pub struct TlsPassthroughCache {
    entries: RwLock<HashSet<PassthroughEntry>>,
}

impl TlsPassthroughCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn put(&self, initiator: i32, hostname: &str) {
        debug!("Learned TLS passthrough for app {} to {}", initiator, hostname);
        self.entries.write().insert(PassthroughEntry {
            initiator,
            hostname: hostname.to_string(),
        });
    }

    pub fn contains(&self, initiator: i32, hostname: &str) -> bool {
        self.entries.read().contains(&PassthroughEntry {
            initiator,
            hostname: hostname.to_string(),
        })
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remembers_failed_pairs() {
        let cache = TlsPassthroughCache::new();
        assert!(!cache.contains(1001, "bad.example.com"));
        cache.put(1001, "bad.example.com");
        assert!(cache.contains(1001, "bad.example.com"));
        assert!(!cache.contains(1002, "bad.example.com"));
        assert!(!cache.contains(1001, "good.example.com"));
    }
}
