//! Rate-limited dispatch of upstream requests
//!
//! The telemetry provider throttles per tenant, so outbound work is funneled
//! through [`RateLimitedDispatcher`]: one FIFO queue per dispatch key, with a
//! single drain loop per key that spaces dispatches by a minimum interval.
//! Different keys run independently and concurrently. Results travel back to
//! the submitter over a oneshot channel; each dispatched task is bounded by a
//! timeout so one stuck call cannot wedge the queue behind it.
//!
//! Queues are bounded: a submission against a full queue fails immediately
//! with [`HistoryError::QueueFull`] instead of growing without limit.

use crate::error::{HistoryError, Result};
use futures::future::BoxFuture;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{oneshot, Mutex};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Configuration for the rate-limited dispatcher
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DispatcherConfig {
    /// Upstream rate limit per dispatch key; spacing is `1 / requests_per_second`
    pub requests_per_second: f64,

    /// Deadline for one dispatched task (fetch + extract + persist for a span)
    #[serde(with = "humantime_serde")]
    pub task_timeout: Duration,

    /// Maximum submissions waiting per key before new ones are rejected
    pub max_pending_per_key: usize,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            requests_per_second: 1.0, // 1000ms between dispatches per key
            task_timeout: Duration::from_secs(10),
            max_pending_per_key: 64,
        }
    }
}

impl DispatcherConfig {
    /// Minimum spacing between dispatches under one key.
    /// Rates with no representable spacing (non-positive, NaN, or so small
    /// that `1 / rate` exceeds `Duration`'s range) fall back to one dispatch
    /// per second.
    pub fn min_interval(&self) -> Duration {
        if self.requests_per_second > 0.0 {
            if let Ok(interval) = Duration::try_from_secs_f64(1.0 / self.requests_per_second) {
                return interval;
            }
        }
        Duration::from_secs(1)
    }
}

/// Snapshot of dispatcher activity counters
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DispatcherStats {
    pub submitted: u64,
    pub dispatched: u64,
    pub timed_out: u64,
    pub rejected: u64,
    /// Keys with live queue state
    pub active_keys: usize,
}

#[derive(Debug, Default)]
struct DispatcherCounters {
    submitted: AtomicU64,
    dispatched: AtomicU64,
    timed_out: AtomicU64,
    rejected: AtomicU64,
}

/// A queued unit of work: produces the future that runs the task and delivers
/// its result over the submitter's channel.
type QueuedTask = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct KeyState {
    queue: VecDeque<QueuedTask>,
    /// Whether a drain loop for this key is currently running
    draining: bool,
    last_dispatch: Option<Instant>,
}

impl KeyState {
    fn new() -> Self {
        Self {
            queue: VecDeque::new(),
            draining: false,
            last_dispatch: None,
        }
    }
}

/// Per-key FIFO dispatcher with minimum spacing between dispatches.
///
/// Cloning is cheap; clones share the same queues and counters.
#[derive(Clone)]
pub struct RateLimitedDispatcher {
    config: DispatcherConfig,
    keys: Arc<Mutex<HashMap<String, KeyState>>>,
    counters: Arc<DispatcherCounters>,
    cancel_token: CancellationToken,
}

impl RateLimitedDispatcher {
    pub fn new(config: DispatcherConfig) -> Self {
        Self {
            config,
            keys: Arc::new(Mutex::new(HashMap::new())),
            counters: Arc::new(DispatcherCounters::default()),
            cancel_token: CancellationToken::new(),
        }
    }

    /// Submit a task under a dispatch key and wait for its result.
    ///
    /// Tasks under one key run strictly in submission order, spaced by at
    /// least [`DispatcherConfig::min_interval`]. Fails immediately with
    /// [`HistoryError::QueueFull`] when the key's queue is at capacity, and
    /// with a timeout error when the dispatched task exceeds its deadline.
    pub async fn submit<T, F, Fut>(&self, key: &str, task: F) -> Result<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<T>> + Send + 'static,
        T: Send + 'static,
    {
        if self.cancel_token.is_cancelled() {
            return Err(HistoryError::connection("dispatcher is shut down"));
        }

        let (tx, rx) = oneshot::channel::<Result<T>>();
        let timeout = self.config.task_timeout;
        let counters = self.counters.clone();
        let task_key = key.to_string();
        let wrapped: QueuedTask = Box::new(move || {
            Box::pin(async move {
                let result = match tokio::time::timeout(timeout, task()).await {
                    Ok(result) => result,
                    Err(_) => {
                        counters.timed_out.fetch_add(1, Ordering::Relaxed);
                        Err(HistoryError::timeout(format!(
                            "dispatch for key '{task_key}' exceeded {timeout:?}"
                        )))
                    }
                };
                let _ = tx.send(result);
            })
        });

        let start_drain = {
            let mut keys = self.keys.lock().await;
            let state = keys.entry(key.to_string()).or_insert_with(KeyState::new);
            if state.queue.len() >= self.config.max_pending_per_key {
                drop(keys);
                self.counters.rejected.fetch_add(1, Ordering::Relaxed);
                warn!(
                    "Rejecting dispatch for key '{}': queue at capacity {}",
                    key, self.config.max_pending_per_key
                );
                return Err(HistoryError::queue_full(key, self.config.max_pending_per_key));
            }
            state.queue.push_back(wrapped);
            self.counters.submitted.fetch_add(1, Ordering::Relaxed);
            if state.draining {
                false
            } else {
                state.draining = true;
                true
            }
        };

        if start_drain {
            let dispatcher = self.clone();
            let key = key.to_string();
            tokio::spawn(async move { dispatcher.drain_key(key).await });
        }

        rx.await.map_err(|_| {
            HistoryError::connection(format!(
                "dispatch for key '{key}' was dropped before completion"
            ))
        })?
    }

    /// Abort in-flight work and drop queued submissions. Pending submitters
    /// observe a connection error; later submissions are refused.
    pub fn shutdown(&self) {
        debug!("Dispatcher shutdown requested");
        self.cancel_token.cancel();
    }

    pub async fn stats(&self) -> DispatcherStats {
        let active_keys = self.keys.lock().await.len();
        DispatcherStats {
            submitted: self.counters.submitted.load(Ordering::Relaxed),
            dispatched: self.counters.dispatched.load(Ordering::Relaxed),
            timed_out: self.counters.timed_out.load(Ordering::Relaxed),
            rejected: self.counters.rejected.load(Ordering::Relaxed),
            active_keys,
        }
    }

    /// Single drain loop for one key: wait out the spacing interval, pop one
    /// task, run it, record the dispatch time, repeat until the queue empties.
    async fn drain_key(self, key: String) {
        let interval = self.config.min_interval();
        debug!("Drain loop started for dispatch key '{}'", key);

        loop {
            let wait = {
                let keys = self.keys.lock().await;
                keys.get(&key)
                    .and_then(|state| state.last_dispatch)
                    .map(|last| (last + interval).saturating_duration_since(Instant::now()))
            };
            if let Some(wait) = wait {
                if !wait.is_zero() {
                    tokio::select! {
                        _ = tokio::time::sleep(wait) => {}
                        _ = self.cancel_token.cancelled() => {
                            self.abandon_key(&key).await;
                            return;
                        }
                    }
                }
            }

            let task = {
                let mut keys = self.keys.lock().await;
                match keys.get_mut(&key) {
                    Some(state) => {
                        let task = state.queue.pop_front();
                        if task.is_none() {
                            state.draining = false;
                        }
                        task
                    }
                    None => None,
                }
            };
            let Some(task) = task else {
                debug!("Drain loop for dispatch key '{}' going idle", key);
                return;
            };

            tokio::select! {
                _ = task() => {}
                _ = self.cancel_token.cancelled() => {
                    warn!("Dispatch for key '{}' aborted by shutdown", key);
                    self.abandon_key(&key).await;
                    return;
                }
            }
            self.counters.dispatched.fetch_add(1, Ordering::Relaxed);

            let mut keys = self.keys.lock().await;
            if let Some(state) = keys.get_mut(&key) {
                state.last_dispatch = Some(Instant::now());
            }
        }
    }

    /// Drop a key's state on shutdown so queued submitters see their result
    /// channels close.
    async fn abandon_key(&self, key: &str) {
        let mut keys = self.keys.lock().await;
        if let Some(state) = keys.remove(key) {
            if !state.queue.is_empty() {
                warn!(
                    "Dropping {} queued dispatches for key '{}' on shutdown",
                    state.queue.len(),
                    key
                );
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn dispatcher(qps: f64, timeout_ms: u64, capacity: usize) -> RateLimitedDispatcher {
        RateLimitedDispatcher::new(DispatcherConfig {
            requests_per_second: qps,
            task_timeout: Duration::from_millis(timeout_ms),
            max_pending_per_key: capacity,
        })
    }

    #[test]
    fn test_min_interval() {
        let config = DispatcherConfig {
            requests_per_second: 20.0,
            ..DispatcherConfig::default()
        };
        assert_eq!(config.min_interval(), Duration::from_millis(50));

        let broken = DispatcherConfig {
            requests_per_second: 0.0,
            ..DispatcherConfig::default()
        };
        assert_eq!(broken.min_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_min_interval_degenerate_rates_fall_back() {
        // none of these may panic, whatever the config layer let through
        for qps in [f64::NAN, -3.0, 1e-300, f64::MIN_POSITIVE] {
            let config = DispatcherConfig {
                requests_per_second: qps,
                ..DispatcherConfig::default()
            };
            assert_eq!(
                config.min_interval(),
                Duration::from_secs(1),
                "rate {qps} should use the fallback interval"
            );
        }
    }

    #[tokio::test]
    async fn test_fifo_order_and_spacing_per_key() {
        let dispatcher = dispatcher(20.0, 5_000, 64);
        let interval = Duration::from_millis(50);
        let starts: Arc<Mutex<Vec<(usize, Instant)>>> = Arc::new(Mutex::new(Vec::new()));

        let run = |n: usize| {
            let dispatcher = dispatcher.clone();
            let starts = starts.clone();
            async move {
                dispatcher
                    .submit("site-1", move || async move {
                        starts.lock().await.push((n, Instant::now()));
                        Ok::<_, HistoryError>(n)
                    })
                    .await
            }
        };

        // join! polls in order, so submission order is 1, 2, 3
        let (r1, r2, r3) = tokio::join!(run(1), run(2), run(3));
        assert_eq!(r1.unwrap(), 1);
        assert_eq!(r2.unwrap(), 2);
        assert_eq!(r3.unwrap(), 3);

        let starts = starts.lock().await;
        let order: Vec<usize> = starts.iter().map(|(n, _)| *n).collect();
        assert_eq!(order, [1, 2, 3]);

        let gap_12 = starts[1].1.duration_since(starts[0].1);
        let gap_23 = starts[2].1.duration_since(starts[1].1);
        let tolerance = Duration::from_millis(5);
        assert!(gap_12 + tolerance >= interval, "gap 1→2 was {gap_12:?}");
        assert!(gap_23 + tolerance >= interval, "gap 2→3 was {gap_23:?}");
    }

    #[tokio::test]
    async fn test_independent_keys_run_concurrently() {
        let dispatcher = dispatcher(5.0, 5_000, 64);
        let t0 = Instant::now();

        let run = |key: &'static str, n: usize| {
            let dispatcher = dispatcher.clone();
            async move {
                dispatcher
                    .submit(key, move || async move { Ok::<_, HistoryError>(n) })
                    .await
            }
        };

        let (a1, b1, a2, b2) = tokio::join!(
            run("site-a", 1),
            run("site-b", 2),
            run("site-a", 3),
            run("site-b", 4)
        );
        for result in [a1, b1, a2, b2] {
            result.unwrap();
        }

        // two dispatches per key need one 200ms interval each; running all
        // four under a single key would need three
        let elapsed = t0.elapsed();
        assert!(elapsed < Duration::from_millis(500), "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_timeout_fails_submission_without_wedging_queue() {
        let dispatcher = dispatcher(100.0, 50, 64);

        let slow = dispatcher.submit("site-1", || async {
            tokio::time::sleep(Duration::from_millis(500)).await;
            Ok::<_, HistoryError>("slow")
        });
        let err = slow.await.unwrap_err();
        assert!(matches!(err, HistoryError::Timeout(_)));

        let quick = dispatcher
            .submit("site-1", || async { Ok::<_, HistoryError>("quick") })
            .await
            .unwrap();
        assert_eq!(quick, "quick");

        let stats = dispatcher.stats().await;
        assert_eq!(stats.timed_out, 1);
        assert_eq!(stats.dispatched, 2);
    }

    #[tokio::test]
    async fn test_full_queue_rejects_submission() {
        let dispatcher = dispatcher(1000.0, 5_000, 1);

        // occupies the drain loop
        let blocker = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .submit("site-1", || async {
                        tokio::time::sleep(Duration::from_millis(300)).await;
                        Ok::<_, HistoryError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        // fills the single queue slot
        let queued = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .submit("site-1", || async { Ok::<_, HistoryError>(()) })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        let rejected = dispatcher
            .submit("site-1", || async { Ok::<_, HistoryError>(()) })
            .await;
        match rejected.unwrap_err() {
            HistoryError::QueueFull { key, capacity } => {
                assert_eq!(key, "site-1");
                assert_eq!(capacity, 1);
            }
            other => panic!("expected queue-full, got {other:?}"),
        }

        blocker.await.unwrap().unwrap();
        queued.await.unwrap().unwrap();
        assert_eq!(dispatcher.stats().await.rejected, 1);
    }

    #[tokio::test]
    async fn test_shutdown_aborts_in_flight_and_refuses_new_work() {
        let dispatcher = dispatcher(1000.0, 60_000, 64);

        let in_flight = {
            let dispatcher = dispatcher.clone();
            tokio::spawn(async move {
                dispatcher
                    .submit("site-1", || async {
                        tokio::time::sleep(Duration::from_secs(30)).await;
                        Ok::<_, HistoryError>(())
                    })
                    .await
            })
        };
        tokio::time::sleep(Duration::from_millis(50)).await;

        dispatcher.shutdown();

        let err = in_flight.await.unwrap().unwrap_err();
        assert!(matches!(err, HistoryError::Connection(_)), "got {err:?}");

        let refused = dispatcher
            .submit("site-1", || async { Ok::<_, HistoryError>(()) })
            .await;
        assert!(matches!(refused.unwrap_err(), HistoryError::Connection(_)));
    }
}
