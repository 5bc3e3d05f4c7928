//! Replay attack detection.
//!
//! Every datagram is fingerprinted by the authentication-tag prefix of its
//! encrypted metadata block, scoped to the peer address. Seeing the same
//! fingerprint twice within the TTL means an attacker (or a broken network)
//! re-injected the packet, and the underlay drops it.
//!
//! The cache is bounded two ways: entries expire after the TTL, and when the
//! capacity budget is reached the oldest entries are evicted first.

use std::collections::{HashMap, VecDeque};
use std::net::SocketAddr;
use std::time::{Duration, Instant};

use parking_lot::Mutex;

/// Default capacity budget for a process-wide cache: 16 MiB of fingerprints.
pub const DEFAULT_CAPACITY_BYTES: usize = 16 * 1024 * 1024;

/// Default entry lifetime.
pub const DEFAULT_TTL: Duration = Duration::from_secs(120);

/// Approximate bytes one entry occupies (fingerprint + timestamp + map slot).
const ENTRY_OVERHEAD: usize = 64;

/// A bounded, time-limited set of datagram fingerprints.
///
/// Thread-safe; `is_duplicate` is an atomic check-and-insert. Inject one
/// cache per listening endpoint (or share one across underlays) through the
/// underlay constructor.
pub struct ReplayCache {
    inner: Mutex<CacheInner>,
    max_entries: usize,
    ttl: Duration,
}

struct CacheInner {
    entries: HashMap<Vec<u8>, Instant>,
    /// Insertion order, oldest first. May hold keys already replaced in the
    /// map; eviction double-checks the timestamp.
    order: VecDeque<(Vec<u8>, Instant)>,
}

impl ReplayCache {
    /// Create a cache with a capacity budget in bytes and an entry TTL.
    pub fn new(capacity_bytes: usize, ttl: Duration) -> Self {
        Self {
            inner: Mutex::new(CacheInner {
                entries: HashMap::new(),
                order: VecDeque::new(),
            }),
            max_entries: (capacity_bytes / ENTRY_OVERHEAD).max(1),
            ttl,
        }
    }

    /// Atomically check whether this fingerprint was seen within the TTL,
    /// inserting it if not.
    ///
    /// `tag_prefix` is the leading bytes of the encrypted metadata block
    /// (the AEAD nonce + tag region); `peer` scopes the fingerprint so that
    /// identical ciphertext from different peers is tracked separately.
    pub fn is_duplicate(&self, tag_prefix: &[u8], peer: SocketAddr) -> bool {
        let peer = peer.to_string();
        let mut key = Vec::with_capacity(tag_prefix.len() + peer.len());
        key.extend_from_slice(tag_prefix);
        key.extend_from_slice(peer.as_bytes());

        let now = Instant::now();
        let mut inner = self.inner.lock();

        self.purge_expired(&mut inner, now);

        if let Some(&inserted) = inner.entries.get(&key) {
            if now.duration_since(inserted) < self.ttl {
                return true;
            }
        }

        while inner.entries.len() >= self.max_entries {
            self.evict_oldest(&mut inner);
        }

        inner.entries.insert(key.clone(), now);
        inner.order.push_back((key, now));
        false
    }

    /// Number of live entries.
    pub fn len(&self) -> usize {
        self.inner.lock().entries.len()
    }

    /// Whether the cache holds no entries.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Drop all entries.
    pub fn clear(&self) {
        let mut inner = self.inner.lock();
        inner.entries.clear();
        inner.order.clear();
    }

    fn purge_expired(&self, inner: &mut CacheInner, now: Instant) {
        while let Some((key, inserted)) = inner.order.front() {
            if now.duration_since(*inserted) < self.ttl {
                break;
            }
            // Only drop the map entry if it wasn't refreshed since
            if inner.entries.get(key) == Some(inserted) {
                let key = key.clone();
                inner.entries.remove(&key);
            }
            inner.order.pop_front();
        }
    }

    fn evict_oldest(&self, inner: &mut CacheInner) {
        while let Some((key, inserted)) = inner.order.pop_front() {
            if inner.entries.get(&key) == Some(&inserted) {
                inner.entries.remove(&key);
                return;
            }
        }
        // Order queue drained without finding a live entry; nothing to evict
    }
}

impl Default for ReplayCache {
    fn default() -> Self {
        Self::new(DEFAULT_CAPACITY_BYTES, DEFAULT_TTL)
    }
}
