use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex};
use std::task::{Context, Poll};

use futures_util::future::BoxFuture;
use http::Method;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Error;
use crate::metrics::ClientMetrics;
use crate::mode::ConcurrencyMode;
use crate::response::Response;
use crate::util::lock_unpoisoned;

type Outcome = crate::Result<Response>;

/// The bound in force for one mode. Bounded modes admit jobs strictly in
/// submission order: each job waits for the one before it to take a permit.
struct ModeLimiter {
    mode: ConcurrencyMode,
    semaphore: Option<Arc<Semaphore>>,
    tail: Option<oneshot::Receiver<()>>,
}

impl ModeLimiter {
    fn new(mode: ConcurrencyMode) -> Self {
        Self {
            mode,
            semaphore: mode
                .max_in_flight()
                .map(|limit| Arc::new(Semaphore::new(limit))),
            tail: None,
        }
    }

    fn gate(&mut self) -> Option<Gate> {
        let semaphore = Arc::clone(self.semaphore.as_ref()?);
        let (admitted, tail) = oneshot::channel();
        Some(Gate {
            semaphore,
            ahead: self.tail.replace(tail),
            admitted,
        })
    }
}

/// A job's place in its limiter's admission line.
struct Gate {
    semaphore: Arc<Semaphore>,
    ahead: Option<oneshot::Receiver<()>>,
    admitted: oneshot::Sender<()>,
}

impl Gate {
    async fn admit(self) -> Option<OwnedSemaphorePermit> {
        if let Some(ahead) = self.ahead {
            // A dropped sender means the job ahead settled without a permit.
            let _ = ahead.await;
        }
        let permit = self.semaphore.acquire_owned().await.ok();
        let _ = self.admitted.send(());
        permit
    }
}

struct Job {
    method: Method,
    uri: String,
    gate: Option<Gate>,
    cancellation: CancellationToken,
    work: BoxFuture<'static, Outcome>,
    reply: oneshot::Sender<Outcome>,
}

impl Job {
    async fn run(self, metrics: ClientMetrics) {
        let Job {
            method,
            uri,
            gate,
            cancellation,
            work,
            reply,
        } = self;

        let _permit = match gate {
            None => None,
            Some(gate) => {
                let admitted = tokio::select! {
                    biased;
                    () = cancellation.cancelled() => None,
                    permit = gate.admit() => permit,
                };
                if admitted.is_none() {
                    debug!(method = %method, uri = %uri, "operation cancelled before admission");
                    let outcome = Err(Error::Cancelled { method, uri });
                    metrics.record_completed(&outcome);
                    let _ = reply.send(outcome);
                    return;
                }
                admitted
            }
        };
        let _in_flight = metrics.enter_in_flight();

        let outcome = tokio::select! {
            biased;
            () = cancellation.cancelled() => Err(Error::Cancelled { method, uri }),
            outcome = work => outcome,
        };
        metrics.record_completed(&outcome);
        let _ = reply.send(outcome);
    }
}

/// Work queue whose concurrency bound follows the current
/// [`ConcurrencyMode`]. Each submission captures the bound in force when it
/// was submitted, so mode changes never affect queued or running work and
/// later work never waits behind an older mode's line.
pub(crate) struct OperationScheduler {
    limiter: Mutex<ModeLimiter>,
    cancellation: Mutex<CancellationToken>,
    metrics: ClientMetrics,
}

impl OperationScheduler {
    pub(crate) fn new(mode: ConcurrencyMode, metrics: ClientMetrics) -> Self {
        Self {
            limiter: Mutex::new(ModeLimiter::new(mode)),
            cancellation: Mutex::new(CancellationToken::new()),
            metrics,
        }
    }

    pub(crate) fn mode(&self) -> ConcurrencyMode {
        lock_unpoisoned(&self.limiter).mode
    }

    /// Switches the bound for subsequently submitted work; returns the
    /// previous mode.
    pub(crate) fn set_mode(&self, mode: ConcurrencyMode) -> ConcurrencyMode {
        let mut limiter = lock_unpoisoned(&self.limiter);
        let previous = limiter.mode;
        if previous != mode {
            *limiter = ModeLimiter::new(mode);
        }
        previous
    }

    /// Spawns `work` onto the current tokio runtime behind its admission
    /// gate. Must be called from within a runtime.
    pub(crate) fn submit(
        &self,
        method: Method,
        uri: String,
        work: BoxFuture<'static, Outcome>,
    ) -> Operation {
        let (reply, receiver) = oneshot::channel();
        let job = Job {
            method: method.clone(),
            uri: uri.clone(),
            gate: lock_unpoisoned(&self.limiter).gate(),
            cancellation: lock_unpoisoned(&self.cancellation).clone(),
            work,
            reply,
        };
        tokio::spawn(job.run(self.metrics.clone()));

        Operation {
            receiver,
            method,
            uri,
        }
    }

    /// Cancels every queued and running operation. Work submitted afterwards
    /// is unaffected.
    pub(crate) fn cancel_all(&self) {
        let previous = std::mem::replace(
            &mut *lock_unpoisoned(&self.cancellation),
            CancellationToken::new(),
        );
        previous.cancel();
    }
}

/// Handle to a scheduled operation. Resolves with the operation's outcome or
/// with [`Error::Cancelled`].
pub(crate) struct Operation {
    receiver: oneshot::Receiver<Outcome>,
    method: Method,
    uri: String,
}

impl Future for Operation {
    type Output = Outcome;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        match Pin::new(&mut self.receiver).poll(cx) {
            Poll::Ready(Ok(outcome)) => Poll::Ready(outcome),
            Poll::Ready(Err(_)) => Poll::Ready(Err(Error::Cancelled {
                method: self.method.clone(),
                uri: self.uri.clone(),
            })),
            Poll::Pending => Poll::Pending,
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    use bytes::Bytes;
    use futures_util::FutureExt;
    use http::{HeaderMap, StatusCode};

    use super::*;
    use crate::descriptor::RequestDescriptor;

    #[derive(Default)]
    struct Tracker {
        running: AtomicUsize,
        peak: AtomicUsize,
        finished: Mutex<Vec<usize>>,
    }

    fn tracked_work(tracker: &Arc<Tracker>, index: usize, hold: Duration) -> BoxFuture<'static, Outcome> {
        let tracker = Arc::clone(tracker);
        async move {
            let running = tracker.running.fetch_add(1, Ordering::SeqCst) + 1;
            tracker.peak.fetch_max(running, Ordering::SeqCst);
            tokio::time::sleep(hold).await;
            tracker.running.fetch_sub(1, Ordering::SeqCst);
            lock_unpoisoned(&tracker.finished).push(index);
            Ok(Response::new(
                StatusCode::OK,
                HeaderMap::new(),
                Bytes::new(),
                RequestDescriptor::new(format!("/items/{index}")),
                false,
            ))
        }
        .boxed()
    }

    fn submit(
        scheduler: &OperationScheduler,
        tracker: &Arc<Tracker>,
        index: usize,
        hold: Duration,
    ) -> Operation {
        scheduler.submit(
            Method::GET,
            format!("http://scheduler.test/items/{index}"),
            tracked_work(tracker, index, hold),
        )
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn synchronous_mode_runs_one_at_a_time_in_submission_order() {
        let scheduler = OperationScheduler::new(ConcurrencyMode::Synchronous, ClientMetrics::default());
        let tracker = Arc::new(Tracker::default());

        let operations: Vec<_> = (0..5)
            .map(|index| submit(&scheduler, &tracker, index, Duration::from_millis(10)))
            .collect();
        for operation in operations {
            operation.await.expect("operation should succeed");
        }

        assert_eq!(tracker.peak.load(Ordering::SeqCst), 1);
        assert_eq!(*lock_unpoisoned(&tracker.finished), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn bounded_mode_caps_concurrency() {
        let scheduler = OperationScheduler::new(ConcurrencyMode::bounded(2), ClientMetrics::default());
        let tracker = Arc::new(Tracker::default());

        let operations: Vec<_> = (0..6)
            .map(|index| submit(&scheduler, &tracker, index, Duration::from_millis(20)))
            .collect();
        for operation in operations {
            operation.await.expect("operation should succeed");
        }

        assert!(tracker.peak.load(Ordering::SeqCst) <= 2);
        assert_eq!(lock_unpoisoned(&tracker.finished).len(), 6);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn asynchronous_mode_runs_work_concurrently() {
        let scheduler = OperationScheduler::new(ConcurrencyMode::Asynchronous, ClientMetrics::default());
        let tracker = Arc::new(Tracker::default());

        let operations: Vec<_> = (0..4)
            .map(|index| submit(&scheduler, &tracker, index, Duration::from_millis(100)))
            .collect();
        for operation in operations {
            operation.await.expect("operation should succeed");
        }

        assert!(tracker.peak.load(Ordering::SeqCst) > 1);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancel_all_settles_running_and_queued_work() {
        let metrics = ClientMetrics::default();
        let scheduler = OperationScheduler::new(ConcurrencyMode::Synchronous, metrics.clone());
        let tracker = Arc::new(Tracker::default());

        let running = submit(&scheduler, &tracker, 0, Duration::from_secs(5));
        let queued = submit(&scheduler, &tracker, 1, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.cancel_all();

        for operation in [running, queued] {
            let error = operation.await.expect_err("operation should be cancelled");
            assert!(error.is_cancelled(), "unexpected error: {error}");
        }
        assert!(lock_unpoisoned(&tracker.finished).is_empty());
        assert_eq!(metrics.snapshot().operations_cancelled, 2);

        submit(&scheduler, &tracker, 2, Duration::ZERO)
            .await
            .expect("work submitted after cancel_all should run");
        assert_eq!(*lock_unpoisoned(&tracker.finished), vec![2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn work_after_a_mode_change_skips_the_old_line() {
        let scheduler = OperationScheduler::new(ConcurrencyMode::Synchronous, ClientMetrics::default());
        let tracker = Arc::new(Tracker::default());

        let first = submit(&scheduler, &tracker, 0, Duration::from_millis(300));
        let second = submit(&scheduler, &tracker, 1, Duration::from_millis(300));
        scheduler.set_mode(ConcurrencyMode::Asynchronous);

        let started = std::time::Instant::now();
        submit(&scheduler, &tracker, 2, Duration::from_millis(50))
            .await
            .expect("later operation should succeed");
        assert!(
            started.elapsed() < Duration::from_millis(250),
            "asynchronous work waited {:?}",
            started.elapsed()
        );
        assert_eq!(*lock_unpoisoned(&tracker.finished), vec![2]);

        first.await.expect("first operation should succeed");
        second.await.expect("second operation should succeed");
        assert_eq!(*lock_unpoisoned(&tracker.finished), vec![2, 0, 1]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn cancelled_head_of_line_releases_the_jobs_behind_it() {
        let scheduler = OperationScheduler::new(ConcurrencyMode::Synchronous, ClientMetrics::default());
        let tracker = Arc::new(Tracker::default());

        let running = submit(&scheduler, &tracker, 0, Duration::from_secs(5));
        let waiting = submit(&scheduler, &tracker, 1, Duration::from_secs(5));
        tokio::time::sleep(Duration::from_millis(50)).await;
        scheduler.cancel_all();
        let after = submit(&scheduler, &tracker, 2, Duration::from_millis(10));

        for operation in [running, waiting] {
            let error = operation.await.expect_err("operation should be cancelled");
            assert!(error.is_cancelled(), "unexpected error: {error}");
        }
        tokio::time::timeout(Duration::from_secs(2), after)
            .await
            .expect("work behind cancelled jobs should be admitted")
            .expect("later operation should succeed");
        assert_eq!(*lock_unpoisoned(&tracker.finished), vec![2]);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn mode_change_applies_to_later_submissions_only() {
        let scheduler = OperationScheduler::new(ConcurrencyMode::Synchronous, ClientMetrics::default());
        let tracker = Arc::new(Tracker::default());

        let first = submit(&scheduler, &tracker, 0, Duration::from_millis(50));
        let previous = scheduler.set_mode(ConcurrencyMode::Asynchronous);
        assert_eq!(previous, ConcurrencyMode::Synchronous);
        assert_eq!(scheduler.mode(), ConcurrencyMode::Asynchronous);

        let later: Vec<_> = (1..4)
            .map(|index| submit(&scheduler, &tracker, index, Duration::from_millis(100)))
            .collect();
        first.await.expect("first operation should succeed");
        for operation in later {
            operation.await.expect("later operation should succeed");
        }

        assert!(tracker.peak.load(Ordering::SeqCst) > 1);
    }
}
