//! Bounded FIFO work queue.
//!
//! A [`ConversionQueue`] runs submitted futures on a fixed number of worker
//! slots, starting them strictly in submission order. One instance with a
//! single slot serializes transcoder invocations; a second instance with
//! three slots and a start-rate limit carries downloads.
//!
//! A job that fails or panics only rejects its own result. The queue never
//! retries.

use futures::future::BoxFuture;
use futures::FutureExt;
use governor::clock::DefaultClock;
use governor::state::{InMemoryState, NotKeyed};
use governor::{Quota, RateLimiter};
use std::future::Future;
use std::num::NonZeroU32;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, oneshot, Mutex};

/// Transcoder slots of the conversion queue
pub const CONVERSION_CONCURRENCY: usize = 1;
/// Parallel downloads
pub const DOWNLOAD_CONCURRENCY: usize = 3;
/// Download starts per second
pub const DOWNLOAD_STARTS_PER_SECOND: u32 = 10;

type Limiter = RateLimiter<NotKeyed, InMemoryState, DefaultClock>;
type Task = BoxFuture<'static, ()>;

/// Error type for queue operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum QueueError {
    /// The job panicked while running
    #[error("Job in queue '{0}' panicked")]
    Panicked(String),

    /// The queue shut down before the job produced a result
    #[error("Queue '{0}' closed before the job completed")]
    Closed(String),
}

#[derive(Debug, Default)]
struct Counters {
    pending: AtomicUsize,
    in_flight: AtomicUsize,
}

/// FIFO queue with bounded concurrency and an optional start-rate limit.
///
/// Must be created inside a Tokio runtime; the worker tasks are spawned on
/// construction and exit once the queue is dropped and drained.
pub struct ConversionQueue {
    name: String,
    concurrency: usize,
    sender: mpsc::UnboundedSender<Task>,
    counters: Arc<Counters>,
}

impl std::fmt::Debug for ConversionQueue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConversionQueue")
            .field("name", &self.name)
            .field("concurrency", &self.concurrency)
            .field("pending", &self.pending())
            .field("in_flight", &self.in_flight())
            .finish()
    }
}

impl ConversionQueue {
    /// Create a queue with `concurrency` worker slots (at least one).
    ///
    /// With `starts_per_second` set, job starts are additionally spaced by a
    /// token bucket of that rate.
    pub fn new(name: impl Into<String>, concurrency: usize, starts_per_second: Option<NonZeroU32>) -> Self {
        let name = name.into();
        let concurrency = concurrency.max(1);
        let (sender, receiver) = mpsc::unbounded_channel::<Task>();
        let receiver = Arc::new(Mutex::new(receiver));
        let limiter = starts_per_second.map(|rate| Arc::new(RateLimiter::direct(Quota::per_second(rate))));
        let counters = Arc::new(Counters::default());

        for _ in 0..concurrency {
            tokio::spawn(worker(receiver.clone(), limiter.clone(), counters.clone()));
        }

        Self {
            name,
            concurrency,
            sender,
            counters,
        }
    }

    /// Single-slot queue for transcoder invocations.
    pub fn conversions() -> Self {
        Self::new("conversions", CONVERSION_CONCURRENCY, None)
    }

    /// Three-slot, rate-limited queue for downloads.
    pub fn downloads() -> Self {
        Self::new(
            "downloads",
            DOWNLOAD_CONCURRENCY,
            NonZeroU32::new(DOWNLOAD_STARTS_PER_SECOND),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn concurrency(&self) -> usize {
        self.concurrency
    }

    /// Jobs waiting for a slot.
    pub fn pending(&self) -> usize {
        self.counters.pending.load(Ordering::SeqCst)
    }

    /// Jobs currently running.
    pub fn in_flight(&self) -> usize {
        self.counters.in_flight.load(Ordering::SeqCst)
    }

    /// Submit a job. Its place in line is taken when `enqueue` is called,
    /// not when the returned future is first polled.
    pub fn enqueue<F, T>(&self, job: F) -> impl Future<Output = Result<T, QueueError>> + Send + 'static
    where
        F: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (tx, rx) = oneshot::channel();
        let name = self.name.clone();
        let task_name = name.clone();

        // Spawned separately so a panic stays inside this job
        let task = async move {
            let outcome = tokio::spawn(job)
                .await
                .map_err(|e| {
                    if e.is_panic() {
                        QueueError::Panicked(task_name)
                    } else {
                        QueueError::Closed(task_name)
                    }
                });
            let _ = tx.send(outcome);
        }
        .boxed();

        self.counters.pending.fetch_add(1, Ordering::SeqCst);
        if self.sender.send(task).is_err() {
            self.counters.pending.fetch_sub(1, Ordering::SeqCst);
        }

        async move { rx.await.unwrap_or(Err(QueueError::Closed(name))) }
    }
}

async fn worker(
    receiver: Arc<Mutex<mpsc::UnboundedReceiver<Task>>>,
    limiter: Option<Arc<Limiter>>,
    counters: Arc<Counters>,
) {
    loop {
        // Holding the receiver through the rate wait keeps start order FIFO
        let task = {
            let mut receiver = receiver.lock().await;
            let Some(task) = receiver.recv().await else {
                return;
            };
            if let Some(limiter) = &limiter {
                limiter.until_ready().await;
            }
            counters.pending.fetch_sub(1, Ordering::SeqCst);
            counters.in_flight.fetch_add(1, Ordering::SeqCst);
            task
        };

        task.await;
        counters.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;
    use std::time::{Duration, Instant};

    #[tokio::test]
    async fn test_single_slot_runs_in_submission_order() {
        let queue = ConversionQueue::conversions();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let handles: Vec<_> = (0..8)
            .map(|i| {
                let log = log.clone();
                queue.enqueue(async move {
                    // Later jobs finish faster; order must still hold
                    tokio::time::sleep(Duration::from_millis(8 - i as u64)).await;
                    log.lock().unwrap().push(i);
                    i
                })
            })
            .collect();

        let results = futures::future::join_all(handles).await;
        assert_eq!(
            results.into_iter().map(Result::unwrap).collect::<Vec<_>>(),
            (0..8).collect::<Vec<_>>()
        );
        assert_eq!(*log.lock().unwrap(), (0..8).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn test_concurrency_is_bounded() {
        let queue = ConversionQueue::new("bounded", 3, None);
        let running = Arc::new(AtomicUsize::new(0));
        let peak = Arc::new(AtomicUsize::new(0));

        let handles: Vec<_> = (0..12)
            .map(|_| {
                let running = running.clone();
                let peak = peak.clone();
                queue.enqueue(async move {
                    let now = running.fetch_add(1, Ordering::SeqCst) + 1;
                    peak.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(10)).await;
                    running.fetch_sub(1, Ordering::SeqCst);
                })
            })
            .collect();

        for result in futures::future::join_all(handles).await {
            result.unwrap();
        }
        assert!(peak.load(Ordering::SeqCst) <= 3);
        assert_eq!(queue.pending(), 0);
        assert_eq!(queue.in_flight(), 0);
    }

    #[tokio::test]
    async fn test_failures_and_panics_stay_with_their_job() {
        let queue = ConversionQueue::conversions();

        let failing = queue.enqueue(async { Err::<u32, String>("encoder exploded".into()) });
        let panicking = queue.enqueue(async {
            if true {
                panic!("worker bug");
            }
            Ok::<u32, String>(0)
        });
        let fine = queue.enqueue(async { Ok::<u32, String>(7) });

        assert_eq!(failing.await.unwrap(), Err("encoder exploded".to_string()));
        assert_eq!(panicking.await, Err(QueueError::Panicked("conversions".into())));
        assert_eq!(fine.await.unwrap(), Ok(7));
    }

    #[tokio::test]
    async fn test_start_rate_is_limited() {
        let queue = ConversionQueue::new("limited", 3, NonZeroU32::new(10));
        let started = Instant::now();

        let handles: Vec<_> = (0..15).map(|_| queue.enqueue(async {})).collect();
        for result in futures::future::join_all(handles).await {
            result.unwrap();
        }

        // Burst of 10, then one start every 100ms
        assert!(started.elapsed() >= Duration::from_millis(400));
    }

    #[tokio::test]
    async fn test_order_is_fixed_at_enqueue_time() {
        let queue = ConversionQueue::conversions();
        let log = Arc::new(StdMutex::new(Vec::new()));

        let first = {
            let log = log.clone();
            queue.enqueue(async move { log.lock().unwrap().push("first") })
        };
        let second = {
            let log = log.clone();
            queue.enqueue(async move { log.lock().unwrap().push("second") })
        };

        // Awaited in reverse
        second.await.unwrap();
        first.await.unwrap();
        assert_eq!(*log.lock().unwrap(), vec!["first", "second"]);
    }
}
