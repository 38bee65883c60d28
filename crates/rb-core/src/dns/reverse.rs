//! Address-to-domain reverse mapping, fed by successful answers.

use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};

use lru::LruCache;
use parking_lot::Mutex;

const SHARD_COUNT: usize = 8;
const CAPACITY: usize = 1024;

struct ReverseEntry {
    domain: String,
    expires_at: Instant,
}

/// Sharded LRU from resolved address to the domain that produced it, with a
/// per-entry TTL taken from the answer record.
pub struct ReverseMapping {
    shards: Vec<Mutex<LruCache<IpAddr, ReverseEntry>>>,
}

impl Default for ReverseMapping {
    fn default() -> Self {
        Self::new()
    }
}

impl ReverseMapping {
    pub fn new() -> Self {
        let per_shard = NonZeroUsize::new(CAPACITY / SHARD_COUNT).unwrap_or(NonZeroUsize::MIN);
        Self {
            shards: (0..SHARD_COUNT)
                .map(|_| Mutex::new(LruCache::new(per_shard)))
                .collect(),
        }
    }

    fn shard(&self, addr: &IpAddr) -> &Mutex<LruCache<IpAddr, ReverseEntry>> {
        let mut hasher = DefaultHasher::new();
        addr.hash(&mut hasher);
        &self.shards[hasher.finish() as usize % SHARD_COUNT]
    }

    pub fn insert(&self, addr: IpAddr, domain: String, ttl: Duration) {
        self.shard(&addr).lock().put(
            addr,
            ReverseEntry {
                domain,
                expires_at: Instant::now() + ttl,
            },
        );
    }

    /// Expired entries are removed on lookup.
    pub fn lookup(&self, addr: IpAddr) -> Option<String> {
        let mut cache = self.shard(&addr).lock();
        let expired = match cache.get(&addr) {
            Some(entry) => {
                if entry.expires_at > Instant::now() {
                    return Some(entry.domain.clone());
                }
                true
            }
            None => false,
        };
        if expired {
            cache.pop(&addr);
        }
        None
    }
}
