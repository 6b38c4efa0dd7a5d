//! Registry of live transport-layer connections.

use crate::transport::{ConnectionKey, ConnectionStack};
use dashmap::DashMap;
use mio::Token;
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::trace;

/// Keyed registry of live connection stacks. Exactly one stack exists per
/// [`ConnectionKey`] at a time; a removed key requires a brand-new stack.
/// A secondary index maps poll tokens to keys for selector dispatch.
#[derive(Default)]
pub struct ConnectionCache {
    by_key: DashMap<ConnectionKey, Arc<RwLock<ConnectionStack>>>,
    by_token: DashMap<Token, ConnectionKey>,
}

impl ConnectionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn find(&self, key: &ConnectionKey) -> Option<Arc<RwLock<ConnectionStack>>> {
        self.by_key.get(key).map(|entry| entry.clone())
    }

    pub fn find_by_token(&self, token: Token) -> Option<Arc<RwLock<ConnectionStack>>> {
        let key = *self.by_token.get(&token)?;
        self.find(&key)
    }

    pub fn insert(&self, key: ConnectionKey, token: Token, stack: Arc<RwLock<ConnectionStack>>) {
        self.by_key.insert(key, stack);
        self.by_token.insert(token, key);
        trace!("Connection cached: {:?}", key);
    }

    /// Removes a connection, returning whether it was present.
    pub fn remove(&self, key: &ConnectionKey, token: Token) -> bool {
        let removed = self.by_key.remove(key).is_some();
        self.by_token.remove(&token);
        if removed {
            trace!("Connection evicted: {:?}", key);
        }
        removed
    }

    pub fn len(&self) -> usize {
        self.by_key.len()
    }

    pub fn is_empty(&self) -> bool {
        self.by_key.is_empty()
    }

    /// Removes every connection from the cache and returns the stacks so the
    /// caller can close them. Used on engine shutdown.
    pub fn drain(&self) -> Vec<Arc<RwLock<ConnectionStack>>> {
        let stacks: Vec<_> = self
            .by_key
            .iter()
            .map(|entry| entry.value().clone())
            .collect();
        self.by_key.clear();
        self.by_token.clear();
        stacks
    }
}
