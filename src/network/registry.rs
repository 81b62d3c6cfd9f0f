//! Shared bookkeeping for all peer sessions of one node

use lru::LruCache;
use parking_lot::Mutex;
use rand::Rng;
use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicU32, Ordering};

/// How many of our own `version` nonces are remembered
pub const SENT_NONCES_CAPACITY: usize = 50;

/// Hands out peer ids and remembers the nonces of our own `version`
/// messages so a connection back to ourselves can be detected.
pub struct PeerRegistry {
    next_id: AtomicU32,
    sent_nonces: Mutex<LruCache<u64, ()>>,
}

impl PeerRegistry {
    pub fn new() -> Self {
        let capacity = NonZeroUsize::new(SENT_NONCES_CAPACITY).unwrap_or(NonZeroUsize::MIN);
        Self {
            next_id: AtomicU32::new(0),
            sent_nonces: Mutex::new(LruCache::new(capacity)),
        }
    }

    /// Next peer id; ids start at 1
    pub fn next_peer_id(&self) -> u32 {
        self.next_id.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Generate a fresh nonce and remember it as ours
    pub fn new_nonce(&self) -> u64 {
        let nonce = rand::thread_rng().gen::<u64>();
        self.sent_nonces.lock().put(nonce, ());
        nonce
    }

    /// Whether `nonce` belongs to one of our own `version` messages
    pub fn is_own_nonce(&self, nonce: u64) -> bool {
        self.sent_nonces.lock().contains(&nonce)
    }
}

impl Default for PeerRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ids_are_unique_and_increasing() {
        let registry = PeerRegistry::new();
        let a = registry.next_peer_id();
        let b = registry.next_peer_id();
        assert_eq!(a, 1);
        assert!(b > a);
    }

    #[test]
    fn test_nonce_cache_is_bounded() {
        let registry = PeerRegistry::new();
        let first = registry.new_nonce();
        assert!(registry.is_own_nonce(first));

        for _ in 0..SENT_NONCES_CAPACITY {
            registry.new_nonce();
        }
        assert!(!registry.is_own_nonce(first));
    }
}
