use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::Notify;

use crate::error::Result;

/// Shared state for one in-flight call: the leader completes `work`, stores its result
/// here (only on success — see `run`'s doc comment) and wakes every waiter through
/// `notify`. Waiters hold the same `Arc` the leader does, so they observe the result
/// even after the leader has removed the key from `inflight` to let the *next*,
/// non-overlapping call start a fresh flight.
struct Call<T> {
    notify: Notify,
    result: Mutex<Option<T>>,
}

/// Deduplicates concurrent calls sharing the same key so only one runs the underlying
/// work; every caller gets its result (spec.md §4.6 step 5: "run the lookup under a
/// singleflight group keyed by fileCacheKey"). Generalizes the teacher's `repair.rs`
/// in-flight-id `HashSet` guard into a value-returning primitive other callers reuse.
pub struct SingleFlight<K, T> {
    inflight: Mutex<HashMap<K, Arc<Call<T>>>>,
}

impl<K, T> SingleFlight<K, T>
where
    K: std::hash::Hash + Eq + Clone,
    T: Clone,
{
    pub fn new() -> Self {
        Self { inflight: Mutex::new(HashMap::new()) }
    }

    /// Runs `work` for `key` if no call for that key is already in flight; otherwise
    /// waits for the in-flight call (the "leader") to finish and shares its result.
    /// `work`'s error is not cached or shared: every waiter re-races independently on
    /// failure, so a transient upstream error on one key doesn't poison concurrent
    /// callers beyond the single failed attempt the leader observed.
    pub async fn run<F, Fut>(&self, key: K, work: F) -> Result<T>
    where
        F: FnOnce() -> Fut,
        Fut: std::future::Future<Output = Result<T>>,
    {
        loop {
            let (call, is_leader) = {
                let mut inflight = self.inflight.lock().unwrap();
                if let Some(existing) = inflight.get(&key) {
                    (existing.clone(), false)
                } else {
                    let call = Arc::new(Call { notify: Notify::new(), result: Mutex::new(None) });
                    inflight.insert(key.clone(), call.clone());
                    (call, true)
                }
            };

            if !is_leader {
                call.notify.notified().await;
                let shared = call.result.lock().unwrap().clone();
                match shared {
                    Some(v) => return Ok(v),
                    // Leader failed: nothing to share, race again for leadership.
                    None => continue,
                }
            }

            let result = work().await;
            {
                let mut inflight = self.inflight.lock().unwrap();
                inflight.remove(&key);
            }
            if let Ok(v) = &result {
                *call.result.lock().unwrap() = Some(v.clone());
            }
            call.notify.notify_waiters();
            return result;
        }
    }

    pub fn in_flight_count(&self) -> usize {
        self.inflight.lock().unwrap().len()
    }
}

impl<K, T> Default for SingleFlight<K, T>
where
    K: std::hash::Hash + Eq + Clone,
    T: Clone,
{
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[tokio::test]
    async fn concurrent_calls_share_one_execution() {
        let sf: Arc<SingleFlight<String, i32>> = Arc::new(SingleFlight::new());
        let calls = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..8 {
            let sf = sf.clone();
            let calls = calls.clone();
            handles.push(tokio::spawn(async move {
                sf.run("k".to_string(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    tokio::time::sleep(std::time::Duration::from_millis(20)).await;
                    Ok(42)
                })
                .await
            }));
        }

        for h in handles {
            assert_eq!(h.await.unwrap().unwrap(), 42);
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn sequential_calls_each_run_independently() {
        let sf: SingleFlight<String, i32> = SingleFlight::new();
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            sf.run("k".to_string(), || async {
                calls.fetch_add(1, Ordering::SeqCst);
                Ok(1)
            })
            .await
            .unwrap();
        }
        assert_eq!(calls.load(Ordering::SeqCst), 3);
    }
}
