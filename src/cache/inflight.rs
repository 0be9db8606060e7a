use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Instant;

use serde_json::{json, Value};
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

/// What the first caller established for everyone waiting on the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FlightOutcome {
    pub cached: bool,
}

struct InflightEntry {
    done: watch::Receiver<Option<FlightOutcome>>,
    watchers: AtomicI64,
    #[allow(dead_code)]
    started: Instant,
}

struct Inner {
    entries: Mutex<HashMap<String, Arc<InflightEntry>>>,
    total_requests: AtomicI64,
    deduplicated: AtomicI64,
}

/// Single-flight per cache key: the first caller for a key performs the
/// upstream fetch; later callers wait for its completion signal and then
/// re-consult the cache.
#[derive(Clone)]
pub struct InflightManager {
    inner: Arc<Inner>,
}

pub enum Flight {
    /// This caller owns the upstream fetch and must resolve the key via the
    /// completer (dropping it unresolved publishes a not-cached outcome).
    First(Completer),
    /// Another fetch for the key is already running; wait on it.
    Follower(Waiter),
}

pub struct Completer {
    inner: Arc<Inner>,
    key: String,
    sender: Option<watch::Sender<Option<FlightOutcome>>>,
}

pub struct Waiter {
    entry: Arc<InflightEntry>,
    key: String,
}

#[derive(Debug, PartialEq, Eq)]
pub struct WaitCancelled;

impl Default for InflightManager {
    fn default() -> Self {
        Self::new()
    }
}

impl InflightManager {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                entries: Mutex::new(HashMap::new()),
                total_requests: AtomicI64::new(0),
                deduplicated: AtomicI64::new(0),
            }),
        }
    }

    pub fn try_start(&self, key: &str) -> Flight {
        let mut entries = self.inner.entries.lock().expect("inflight lock");
        self.inner.total_requests.fetch_add(1, Ordering::Relaxed);

        if let Some(entry) = entries.get(key) {
            entry.watchers.fetch_add(1, Ordering::Relaxed);
            self.inner.deduplicated.fetch_add(1, Ordering::Relaxed);
            return Flight::Follower(Waiter {
                entry: entry.clone(),
                key: key.to_string(),
            });
        }

        let (sender, receiver) = watch::channel(None);
        entries.insert(
            key.to_string(),
            Arc::new(InflightEntry {
                done: receiver,
                watchers: AtomicI64::new(0),
                started: Instant::now(),
            }),
        );

        Flight::First(Completer {
            inner: self.inner.clone(),
            key: key.to_string(),
            sender: Some(sender),
        })
    }

    pub fn deduplicated(&self) -> i64 {
        self.inner.deduplicated.load(Ordering::Relaxed)
    }

    pub fn stats(&self) -> Value {
        let active_keys: Vec<String> = {
            let entries = self.inner.entries.lock().expect("inflight lock");
            entries.keys().cloned().collect()
        };

        let total = self.inner.total_requests.load(Ordering::Relaxed);
        let deduplicated = self.inner.deduplicated.load(Ordering::Relaxed);
        let savings_rate = if total > 0 {
            deduplicated as f64 / total as f64 * 100.0
        } else {
            0.0
        };

        json!({
            "totalRequests": total,
            "deduplicated": deduplicated,
            "savingsRate": savings_rate,
            "currentActive": active_keys.len(),
            "activeKeys": active_keys,
        })
    }
}

impl Inner {
    fn resolve(&self, key: &str, sender: &watch::Sender<Option<FlightOutcome>>, outcome: FlightOutcome) {
        let _ = sender.send(Some(outcome));
        self.entries.lock().expect("inflight lock").remove(key);
    }
}

impl Completer {
    pub fn done(mut self, outcome: FlightOutcome) {
        if let Some(sender) = self.sender.take() {
            self.inner.resolve(&self.key, &sender, outcome);
        }
    }
}

impl Drop for Completer {
    fn drop(&mut self) {
        // First caller bailed without resolving; wake the followers so they
        // fall back to direct fetches instead of hanging.
        if let Some(sender) = self.sender.take() {
            self.inner.resolve(&self.key, &sender, FlightOutcome { cached: false });
        }
    }
}

impl Waiter {
    /// Blocks until the first caller resolves the key or `cancel` fires.
    /// Either exit decrements the watcher count.
    pub async fn wait(self, cancel: &CancellationToken) -> Result<FlightOutcome, WaitCancelled> {
        let mut done = self.entry.done.clone();

        let result = tokio::select! {
            changed = done.wait_for(|outcome| outcome.is_some()) => match changed {
                Ok(outcome) => Ok(outcome.expect("outcome present")),
                // Sender dropped without resolving; treat as not cached.
                Err(_) => Ok(FlightOutcome { cached: false }),
            },
            _ = cancel.cancelled() => Err(WaitCancelled),
        };

        self.entry.watchers.fetch_sub(1, Ordering::Relaxed);
        log::debug!(
            "inflight wait finished for {}: cancelled={}",
            self.key,
            result.is_err()
        );
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn first_then_follower() {
        let manager = InflightManager::new();

        let first = match manager.try_start("k") {
            Flight::First(completer) => completer,
            Flight::Follower(_) => panic!("expected first"),
        };
        let follower = match manager.try_start("k") {
            Flight::Follower(waiter) => waiter,
            Flight::First(_) => panic!("expected follower"),
        };
        assert_eq!(manager.deduplicated(), 1);

        let cancel = CancellationToken::new();
        let waiting = tokio::spawn(async move { follower.wait(&cancel).await });

        tokio::time::sleep(Duration::from_millis(10)).await;
        first.done(FlightOutcome { cached: true });

        let outcome = waiting.await.unwrap().unwrap();
        assert!(outcome.cached);

        // key is reusable once resolved
        assert!(matches!(manager.try_start("k"), Flight::First(_)));
    }

    #[tokio::test]
    async fn many_followers_share_one_flight() {
        let manager = InflightManager::new();

        let first = match manager.try_start("k") {
            Flight::First(completer) => completer,
            Flight::Follower(_) => panic!("expected first"),
        };

        let mut waiting = Vec::new();
        for _ in 0..9 {
            let waiter = match manager.try_start("k") {
                Flight::Follower(waiter) => waiter,
                Flight::First(_) => panic!("expected follower"),
            };
            waiting.push(tokio::spawn(async move {
                let cancel = CancellationToken::new();
                waiter.wait(&cancel).await
            }));
        }
        assert_eq!(manager.deduplicated(), 9);
        assert_eq!(manager.stats()["currentActive"], 1);

        first.done(FlightOutcome { cached: true });
        for task in waiting {
            assert!(task.await.unwrap().unwrap().cached);
        }
        assert_eq!(manager.stats()["currentActive"], 0);
    }

    #[tokio::test]
    async fn cancelled_follower_leaves_first_untouched() {
        let manager = InflightManager::new();

        let first = match manager.try_start("k") {
            Flight::First(completer) => completer,
            Flight::Follower(_) => panic!("expected first"),
        };
        let follower = match manager.try_start("k") {
            Flight::Follower(waiter) => waiter,
            Flight::First(_) => panic!("expected follower"),
        };

        let cancel = CancellationToken::new();
        cancel.cancel();
        assert_eq!(follower.wait(&cancel).await, Err(WaitCancelled));

        // first caller can still resolve normally
        first.done(FlightOutcome { cached: false });
    }

    #[tokio::test]
    async fn dropped_completer_wakes_followers() {
        let manager = InflightManager::new();

        let first = match manager.try_start("k") {
            Flight::First(completer) => completer,
            Flight::Follower(_) => panic!("expected first"),
        };
        let follower = match manager.try_start("k") {
            Flight::Follower(waiter) => waiter,
            Flight::First(_) => panic!("expected follower"),
        };

        drop(first);

        let cancel = CancellationToken::new();
        let outcome = follower.wait(&cancel).await.unwrap();
        assert!(!outcome.cached);
    }

    #[tokio::test]
    async fn stats_reports_active_keys() {
        let manager = InflightManager::new();
        let _first = match manager.try_start("docker.test/v2/x/blobs/sha256:aa") {
            Flight::First(completer) => completer,
            Flight::Follower(_) => panic!("expected first"),
        };

        let stats = manager.stats();
        assert_eq!(stats["totalRequests"], 1);
        assert_eq!(stats["currentActive"], 1);
        assert_eq!(stats["activeKeys"][0], "docker.test/v2/x/blobs/sha256:aa");
    }
}
