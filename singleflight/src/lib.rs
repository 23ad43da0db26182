//! Per-key deduplication of concurrent async loads.
//!
//! The first caller for a key becomes the leader: it publishes an in-flight
//! call, runs the provided future, and broadcasts the outcome. Callers that
//! arrive while the call is in flight await the shared outcome instead of
//! running their own future. The in-flight entry is removed before the
//! leader returns, so the next caller after completion starts a fresh load
//! (no negative caching).
//!
//! # Example
//!
//! ```
//! use singleflight::SingleFlight;
//!
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! let flight: SingleFlight<String, String> = SingleFlight::new();
//! let value = flight
//!     .run("key", async { Ok("loaded".to_string()) })
//!     .await
//!     .unwrap();
//! assert_eq!(value, "loaded");
//! # }
//! ```

use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::watch;

type Outcome<T, E> = Option<Result<T, E>>;

struct Table<T, E> {
    calls: Mutex<HashMap<String, watch::Receiver<Outcome<T, E>>>>,
}

/// Removes the leader's table entry when the leader finishes or is
/// cancelled mid-flight. A cancelled leader leaves its waiters with a
/// closed channel; they retry and elect a new leader.
struct LeaderGuard<T, E> {
    table: Arc<Table<T, E>>,
    key: String,
    rx: watch::Receiver<Outcome<T, E>>,
}

impl<T, E> Drop for LeaderGuard<T, E> {
    fn drop(&mut self) {
        let mut calls = self.table.calls.lock();
        // Only remove our own entry: a retrying waiter may have published
        // a new call under the same key already.
        if let Some(current) = calls.get(&self.key)
            && current.same_channel(&self.rx)
        {
            calls.remove(&self.key);
        }
    }
}

/// Per-key request coalescer.
pub struct SingleFlight<T, E> {
    table: Arc<Table<T, E>>,
}

impl<T, E> Default for SingleFlight<T, E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> SingleFlight<T, E> {
    /// Create an empty coalescer.
    pub fn new() -> Self {
        Self {
            table: Arc::new(Table {
                calls: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Drop any in-flight entry for `key`. Callers already waiting keep
    /// their call; the next `run` starts fresh.
    pub fn forget(&self, key: &str) {
        self.table.calls.lock().remove(key);
    }

    /// Number of in-flight calls.
    pub fn len(&self) -> usize {
        self.table.calls.lock().len()
    }

    /// Whether no call is in flight.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T, E> SingleFlight<T, E>
where
    T: Clone + Send + Sync + 'static,
    E: Clone + Send + Sync + 'static,
{
    /// Run `fut` for `key`, or await an in-flight call for the same key.
    ///
    /// Exactly one future runs per key at a time; every concurrent caller
    /// observes the same outcome.
    pub async fn run<F>(&self, key: &str, fut: F) -> Result<T, E>
    where
        F: Future<Output = Result<T, E>>,
    {
        let (tx, _guard) = loop {
            let waiting = {
                let mut calls = self.table.calls.lock();
                match calls.get(key) {
                    Some(rx) => rx.clone(),
                    None => {
                        let (tx, rx) = watch::channel(None);
                        calls.insert(key.to_string(), rx.clone());
                        let guard = LeaderGuard {
                            table: self.table.clone(),
                            key: key.to_string(),
                            rx,
                        };
                        break (tx, guard);
                    }
                }
            };

            let mut rx = waiting;
            match rx.wait_for(|outcome| outcome.is_some()).await {
                Ok(outcome) => {
                    if let Some(outcome) = outcome.clone() {
                        return outcome;
                    }
                }
                // Leader dropped without publishing: retry, possibly
                // becoming the new leader.
                Err(_) => {}
            }
        };

        // Leader: run the load and broadcast the outcome. The guard
        // removes the table entry once we return.
        let outcome = fut.await;
        let _ = tx.send(Some(outcome.clone()));
        outcome
    }
}
