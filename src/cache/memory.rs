use std::num::NonZeroUsize;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant};

use lru::LruCache;
use serde_json::{json, Value};

use super::stats::hit_rate;
use super::Descriptor;

pub const DEFAULT_CAPACITY: usize = 10_000;
const ENTRY_TTL: Duration = Duration::from_secs(24 * 60 * 60);

struct TimedDescriptor {
    descriptor: Descriptor,
    inserted_at: Instant,
}

/// Hot-path accelerator over the blob store: digest -> descriptor, LRU
/// bounded with a per-entry TTL. A descriptor hit still requires the blob
/// file to exist; callers evict on inconsistency and fall through to disk.
pub struct LruDescriptorCache {
    entries: Mutex<LruCache<String, TimedDescriptor>>,
    ttl: Duration,
    hits: AtomicI64,
    misses: AtomicI64,
}

impl LruDescriptorCache {
    pub fn new(capacity: usize) -> Self {
        Self::with_ttl(capacity, ENTRY_TTL)
    }

    pub fn with_ttl(capacity: usize, ttl: Duration) -> Self {
        let capacity = NonZeroUsize::new(capacity)
            .unwrap_or_else(|| NonZeroUsize::new(DEFAULT_CAPACITY).expect("non-zero capacity"));
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
            ttl,
            hits: AtomicI64::new(0),
            misses: AtomicI64::new(0),
        }
    }

    pub fn get(&self, key: &str) -> Option<Descriptor> {
        let mut entries = self.entries.lock().expect("descriptor cache lock");

        if let Some(timed) = entries.get(key) {
            if timed.inserted_at.elapsed() < self.ttl {
                self.hits.fetch_add(1, Ordering::Relaxed);
                return Some(timed.descriptor.clone());
            }
            entries.pop(key);
        }

        self.misses.fetch_add(1, Ordering::Relaxed);
        None
    }

    pub fn set(&self, key: &str, descriptor: Descriptor) {
        let mut entries = self.entries.lock().expect("descriptor cache lock");
        entries.put(
            key.to_string(),
            TimedDescriptor {
                descriptor,
                inserted_at: Instant::now(),
            },
        );
    }

    pub fn remove(&self, key: &str) {
        let mut entries = self.entries.lock().expect("descriptor cache lock");
        entries.pop(key);
    }

    pub fn stats(&self) -> Value {
        let size = self.entries.lock().expect("descriptor cache lock").len();
        let hits = self.hits.load(Ordering::Relaxed);
        let misses = self.misses.load(Ordering::Relaxed);

        json!({
            "size": size,
            "hits": hits,
            "misses": misses,
            "hitRate": hit_rate(hits, misses),
        })
    }
}
