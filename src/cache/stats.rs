use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Mutex;

use chrono::{DateTime, SecondsFormat, Utc};
use humansize::{format_size, BINARY};
use serde_json::{json, Value};

/// Counters sampled concurrently by the stats endpoints. Everything is
/// atomic; `last_cleanup` is the only field behind a lock.
#[derive(Default)]
pub struct CacheStatistics {
    pub blob_hits: AtomicI64,
    pub blob_misses: AtomicI64,
    pub manifest_hits: AtomicI64,
    pub manifest_misses: AtomicI64,
    pub blob_count: AtomicI64,
    pub manifest_count: AtomicI64,
    pub total_size: AtomicI64,
    last_cleanup: Mutex<Option<DateTime<Utc>>>,
}

impl CacheStatistics {
    pub fn record_cleanup(&self, at: DateTime<Utc>) {
        *self.last_cleanup.lock().expect("stats lock") = Some(at);
    }

    pub fn last_cleanup(&self) -> Option<DateTime<Utc>> {
        *self.last_cleanup.lock().expect("stats lock")
    }

    /// Wire-format snapshot. `deduplicated` lives in the inflight manager
    /// and is passed in by the caller.
    pub fn snapshot(&self, deduplicated: i64) -> Value {
        let blob_hits = self.blob_hits.load(Ordering::Relaxed);
        let blob_misses = self.blob_misses.load(Ordering::Relaxed);
        let manifest_hits = self.manifest_hits.load(Ordering::Relaxed);
        let manifest_misses = self.manifest_misses.load(Ordering::Relaxed);
        let total_size = self.total_size.load(Ordering::Relaxed);

        json!({
            "blob": {
                "count": self.blob_count.load(Ordering::Relaxed),
                "requests": blob_hits + blob_misses,
                "hits": blob_hits,
                "misses": blob_misses,
                "hitRate": hit_rate(blob_hits, blob_misses),
            },
            "manifest": {
                "count": self.manifest_count.load(Ordering::Relaxed),
                "requests": manifest_hits + manifest_misses,
                "hits": manifest_hits,
                "misses": manifest_misses,
                "hitRate": hit_rate(manifest_hits, manifest_misses),
            },
            "totalSize": total_size,
            "totalSizeHuman": format_size(total_size.max(0) as u64, BINARY),
            "deduplication": deduplicated,
            "lastCleanup": self
                .last_cleanup()
                .map(|at| at.to_rfc3339_opts(SecondsFormat::Secs, true)),
        })
    }
}

pub fn hit_rate(hits: i64, misses: i64) -> String {
    let total = hits + misses;
    if total == 0 {
        return "0.00%".to_string();
    }
    format!("{:.2}%", hits as f64 / total as f64 * 100.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn snapshot_reports_counts_and_rates() {
        let stats = CacheStatistics::default();
        stats.blob_hits.store(3, Ordering::Relaxed);
        stats.blob_misses.store(1, Ordering::Relaxed);
        stats.manifest_hits.store(1, Ordering::Relaxed);
        stats.manifest_misses.store(1, Ordering::Relaxed);
        stats.blob_count.store(2, Ordering::Relaxed);
        stats.total_size.store(2048, Ordering::Relaxed);

        let snapshot = stats.snapshot(7);
        assert_eq!(snapshot["blob"]["requests"], 4);
        assert_eq!(snapshot["blob"]["hitRate"], "75.00%");
        assert_eq!(snapshot["manifest"]["hitRate"], "50.00%");
        assert_eq!(snapshot["totalSize"], 2048);
        assert_eq!(snapshot["totalSizeHuman"], "2 KiB");
        assert_eq!(snapshot["deduplication"], 7);
        assert!(snapshot["lastCleanup"].is_null());
    }

    #[test]
    fn snapshot_records_last_cleanup() {
        let stats = CacheStatistics::default();
        stats.record_cleanup(Utc::now());
        let snapshot = stats.snapshot(0);
        assert!(snapshot["lastCleanup"].is_string());
    }

    #[test]
    fn hit_rate_handles_zero_traffic() {
        assert_eq!(hit_rate(0, 0), "0.00%");
        assert_eq!(hit_rate(1, 0), "100.00%");
    }
}
