use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::sync::{oneshot, Notify};
use tokio::time::Instant;

use crate::{
    JobError, JobEvent, JobFailure, JobId, JobObserver, JobOptions, JobRunner, QueueError,
    Retryable,
};

type Outcome<J, R> = Result<<R as JobRunner<J>>::Output, JobError<<R as JobRunner<J>>::Error>>;

struct Entry<J, R: JobRunner<J>> {
    id: JobId,
    job: J,
    options: JobOptions,
    attempts_made: u32,
    enqueued_at: Instant,
    reply: oneshot::Sender<Outcome<J, R>>,
}

struct State<J, R: JobRunner<J>> {
    waiting: Vec<Entry<J, R>>,
    processing: usize,
    delayed: usize,
    closed: bool,
    next_id: JobId,
    submitted: u64,
    completed: u64,
    failed: u64,
    retried: u64,
    dequeued: u64,
    total_wait: Duration,
}

impl<J, R: JobRunner<J>> State<J, R> {
    fn is_idle(&self) -> bool {
        self.waiting.is_empty() && self.processing == 0 && self.delayed == 0
    }

    /// Inserts after every entry of equal or higher weight.
    fn insert(&mut self, entry: Entry<J, R>) {
        let weight = entry.options.priority.weight();
        let position = self
            .waiting
            .iter()
            .position(|queued| queued.options.priority.weight() < weight)
            .unwrap_or(self.waiting.len());
        self.waiting.insert(position, entry);
    }
}

struct Shared<J, R: JobRunner<J>> {
    runner: R,
    observer: Option<Arc<dyn JobObserver<J>>>,
    max_concurrent: usize,
    state: Mutex<State<J, R>>,
    idle: Notify,
}

impl<J: 'static, R: JobRunner<J>> Shared<J, R> {
    fn emit(&self, job: &J, event: JobEvent) {
        if let Some(observer) = &self.observer {
            observer.on_event(job, &event);
        }
    }
}

/// Snapshot of the queue's current occupancy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueStatus {
    pub queued: usize,
    pub processing: usize,
    /// Jobs sleeping through a retry backoff.
    pub delayed: usize,
    pub avg_wait: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct QueueStats {
    pub submitted: u64,
    pub completed: u64,
    pub failed: u64,
    pub retried: u64,
    pub queued: usize,
    pub processing: usize,
    pub delayed: usize,
    pub max_concurrent: usize,
}

/// Priority queue that runs at most `max_concurrent` jobs through a
/// [`JobRunner`] at once.
pub struct CompileQueue<J, R: JobRunner<J>> {
    shared: Arc<Shared<J, R>>,
}

impl<J, R: JobRunner<J>> Clone for CompileQueue<J, R> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<J, R> CompileQueue<J, R>
where
    J: Send + Sync + 'static,
    R: JobRunner<J>,
{
    pub fn new(runner: R, max_concurrent: usize) -> Self {
        Self::build(runner, max_concurrent, None)
    }

    pub fn with_observer(
        runner: R,
        max_concurrent: usize,
        observer: Arc<dyn JobObserver<J>>,
    ) -> Self {
        Self::build(runner, max_concurrent, Some(observer))
    }

    fn build(runner: R, max_concurrent: usize, observer: Option<Arc<dyn JobObserver<J>>>) -> Self {
        Self {
            shared: Arc::new(Shared {
                runner,
                observer,
                max_concurrent: max_concurrent.max(1),
                state: Mutex::new(State {
                    waiting: Vec::new(),
                    processing: 0,
                    delayed: 0,
                    closed: false,
                    next_id: 1,
                    submitted: 0,
                    completed: 0,
                    failed: 0,
                    retried: 0,
                    dequeued: 0,
                    total_wait: Duration::ZERO,
                }),
                idle: Notify::new(),
            }),
        }
    }

    pub fn runner(&self) -> &R {
        &self.shared.runner
    }

    /// Enqueues a job and returns immediately.
    ///
    /// Advancement is scheduled on the current Tokio runtime, so jobs
    /// submitted back-to-back are ordered as one batch before the first one
    /// starts.
    ///
    /// # Panics
    ///
    /// Panics when called outside a Tokio runtime.
    pub fn submit(
        &self,
        job: J,
        options: JobOptions,
    ) -> Result<JobHandle<R::Output, R::Error>, QueueError> {
        if options.attempts == 0 {
            return Err(QueueError::NoAttempts);
        }
        let id = {
            let mut state = self.shared.state.lock();
            if state.closed {
                return Err(QueueError::Closed);
            }
            let id = state.next_id;
            state.next_id += 1;
            state.submitted += 1;
            id
        };

        self.shared.emit(
            &job,
            JobEvent::Queued {
                id,
                priority: options.priority,
            },
        );
        tracing::debug!(job = id, priority = %options.priority, "job queued");

        let (reply, rx) = oneshot::channel();
        self.shared.state.lock().insert(Entry {
            id,
            job,
            options,
            attempts_made: 0,
            enqueued_at: Instant::now(),
            reply,
        });

        let shared = Arc::clone(&self.shared);
        tokio::spawn(async move { advance(&shared) });

        Ok(JobHandle { id, rx })
    }

    pub fn status(&self) -> QueueStatus {
        let state = self.shared.state.lock();
        let avg_wait = if state.dequeued == 0 {
            Duration::ZERO
        } else {
            state.total_wait / state.dequeued.min(u64::from(u32::MAX)) as u32
        };
        QueueStatus {
            queued: state.waiting.len(),
            processing: state.processing,
            delayed: state.delayed,
            avg_wait,
        }
    }

    pub fn stats(&self) -> QueueStats {
        let state = self.shared.state.lock();
        QueueStats {
            submitted: state.submitted,
            completed: state.completed,
            failed: state.failed,
            retried: state.retried,
            queued: state.waiting.len(),
            processing: state.processing,
            delayed: state.delayed,
            max_concurrent: self.shared.max_concurrent,
        }
    }

    /// Stops accepting submissions. Jobs already accepted still run to completion.
    pub fn close(&self) {
        self.shared.state.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.shared.state.lock().closed
    }

    /// Resolves once every accepted job has reached a terminal state.
    pub async fn wait_idle(&self) {
        loop {
            let notified = self.shared.idle.notified();
            if self.shared.state.lock().is_idle() {
                return;
            }
            notified.await;
        }
    }
}

/// Holds one concurrency slot. Dropping it frees the slot and lets the
/// next waiting job start, including when a runner panics.
struct ActiveSlot<J, R>
where
    J: Send + Sync + 'static,
    R: JobRunner<J>,
{
    shared: Arc<Shared<J, R>>,
}

impl<J, R> Drop for ActiveSlot<J, R>
where
    J: Send + Sync + 'static,
    R: JobRunner<J>,
{
    fn drop(&mut self) {
        self.shared.state.lock().processing -= 1;
        advance(&self.shared);
        self.shared.idle.notify_waiters();
    }
}

fn advance<J, R>(shared: &Arc<Shared<J, R>>)
where
    J: Send + Sync + 'static,
    R: JobRunner<J>,
{
    loop {
        let (entry, waited) = {
            let mut state = shared.state.lock();
            if state.processing >= shared.max_concurrent || state.waiting.is_empty() {
                return;
            }
            let entry = state.waiting.remove(0);
            state.processing += 1;
            let waited = entry.enqueued_at.elapsed();
            state.dequeued += 1;
            state.total_wait += waited;
            (entry, waited)
        };
        let slot = ActiveSlot {
            shared: Arc::clone(shared),
        };
        tokio::spawn(run_entry(slot, entry, waited));
    }
}

async fn run_entry<J, R>(slot: ActiveSlot<J, R>, mut entry: Entry<J, R>, waited: Duration)
where
    J: Send + Sync + 'static,
    R: JobRunner<J>,
{
    let shared = Arc::clone(&slot.shared);
    entry.attempts_made += 1;
    let attempt = entry.attempts_made;
    shared.emit(
        &entry.job,
        JobEvent::Started {
            id: entry.id,
            attempt,
            waited,
        },
    );
    tracing::debug!(job = entry.id, attempt, waited = ?waited, "job started");

    let result = shared.runner.run(entry.id, &entry.job, attempt).await;
    match result {
        Ok(output) => {
            shared.state.lock().completed += 1;
            shared.emit(
                &entry.job,
                JobEvent::Completed {
                    id: entry.id,
                    attempts: attempt,
                },
            );
            let _ = entry.reply.send(Ok(output));
            drop(slot);
        }
        Err(error) if error.is_retryable() && attempt < entry.options.attempts => {
            let delay = entry.options.backoff.delay(attempt);
            let message = error.to_string();
            {
                let mut state = shared.state.lock();
                state.retried += 1;
                state.delayed += 1;
            }
            tracing::warn!(
                job = entry.id,
                attempt,
                delay = ?delay,
                error = %message,
                "job attempt failed; retrying after backoff"
            );
            shared.emit(
                &entry.job,
                JobEvent::RetryScheduled {
                    id: entry.id,
                    attempt,
                    delay,
                    error: message,
                },
            );
            drop(slot);

            tokio::time::sleep(delay).await;

            entry.enqueued_at = Instant::now();
            {
                let mut state = shared.state.lock();
                state.delayed -= 1;
                state.insert(entry);
            }
            advance(&shared);
        }
        Err(error) => {
            shared.state.lock().failed += 1;
            tracing::debug!(job = entry.id, attempts = attempt, error = %error, "job failed");
            shared.emit(
                &entry.job,
                JobEvent::Failed {
                    id: entry.id,
                    attempts: attempt,
                    error: error.to_string(),
                },
            );
            let _ = entry.reply.send(Err(JobError::Failed(JobFailure {
                job: entry.id,
                attempts: attempt,
                error,
            })));
            drop(slot);
        }
    }
}

/// Resolves to the job's terminal outcome.
pub struct JobHandle<O, E> {
    id: JobId,
    rx: oneshot::Receiver<Result<O, JobError<E>>>,
}

impl<O, E> JobHandle<O, E> {
    pub fn id(&self) -> JobId {
        self.id
    }
}

impl<O, E> std::fmt::Debug for JobHandle<O, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("JobHandle").field("id", &self.id).finish()
    }
}

impl<O, E> Future for JobHandle<O, E> {
    type Output = Result<O, JobError<E>>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let id = self.id;
        Pin::new(&mut self.rx)
            .poll(cx)
            .map(|received| received.unwrap_or(Err(JobError::Abandoned(id))))
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::{Backoff, Priority};

    #[derive(Debug, thiserror::Error)]
    #[error("{message}")]
    struct TestError {
        message: &'static str,
        retryable: bool,
    }

    impl Retryable for TestError {
        fn is_retryable(&self) -> bool {
            self.retryable
        }
    }

    #[derive(Debug, Clone)]
    struct TestJob {
        name: &'static str,
        failures: u32,
        retryable: bool,
        work: Duration,
    }

    impl TestJob {
        fn ok(name: &'static str) -> Self {
            Self {
                name,
                failures: 0,
                retryable: true,
                work: Duration::ZERO,
            }
        }

        fn failing(name: &'static str, failures: u32) -> Self {
            Self {
                failures,
                ..Self::ok(name)
            }
        }
    }

    #[derive(Default)]
    struct Recorder {
        started: Mutex<Vec<(&'static str, u32, Instant)>>,
        running: AtomicUsize,
        peak: AtomicUsize,
    }

    impl Recorder {
        fn names(&self) -> Vec<&'static str> {
            self.started.lock().iter().map(|(name, _, _)| *name).collect()
        }
    }

    impl JobRunner<TestJob> for Arc<Recorder> {
        type Output = &'static str;
        type Error = TestError;

        async fn run(&self, _id: JobId, job: &TestJob, attempt: u32) -> Result<&'static str, TestError> {
            self.started.lock().push((job.name, attempt, Instant::now()));
            let running = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(running, Ordering::SeqCst);
            if !job.work.is_zero() {
                tokio::time::sleep(job.work).await;
            }
            self.running.fetch_sub(1, Ordering::SeqCst);
            if attempt <= job.failures {
                Err(TestError {
                    message: "render failed",
                    retryable: job.retryable,
                })
            } else {
                Ok(job.name)
            }
        }
    }

    fn options(priority: Priority, attempts: u32, backoff: Backoff) -> JobOptions {
        JobOptions {
            priority,
            attempts,
            backoff,
        }
    }

    fn quick(priority: Priority) -> JobOptions {
        options(priority, 1, Backoff::Fixed(Duration::ZERO))
    }

    #[tokio::test]
    async fn dequeues_by_priority_then_arrival() {
        let recorder = Arc::new(Recorder::default());
        let queue = CompileQueue::new(Arc::clone(&recorder), 1);

        let low = queue.submit(TestJob::ok("low"), quick(Priority::Low)).unwrap();
        let high = queue.submit(TestJob::ok("high"), quick(Priority::High)).unwrap();
        let normal = queue
            .submit(TestJob::ok("normal"), quick(Priority::Normal))
            .unwrap();

        assert_eq!(low.await.unwrap(), "low");
        assert_eq!(high.await.unwrap(), "high");
        assert_eq!(normal.await.unwrap(), "normal");
        assert_eq!(recorder.names(), vec!["high", "normal", "low"]);
    }

    #[tokio::test]
    async fn equal_priority_keeps_arrival_order() {
        let recorder = Arc::new(Recorder::default());
        let queue = CompileQueue::new(Arc::clone(&recorder), 1);
        let handles: Vec<_> = ["a", "b", "c"]
            .into_iter()
            .map(|name| queue.submit(TestJob::ok(name), quick(Priority::Normal)).unwrap())
            .collect();
        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(recorder.names(), vec!["a", "b", "c"]);
    }

    #[tokio::test(start_paused = true)]
    async fn exponential_backoff_between_attempts() {
        let recorder = Arc::new(Recorder::default());
        let queue = CompileQueue::new(Arc::clone(&recorder), 2);
        let delay = Duration::from_secs(1);

        let handle = queue
            .submit(
                TestJob::failing("doomed", u32::MAX),
                options(Priority::Normal, 3, Backoff::Exponential(delay)),
            )
            .unwrap();
        let err = handle.await.unwrap_err();
        let failure = err.failure().expect("terminal failure");
        assert_eq!(failure.attempts, 3);
        assert_eq!(failure.error.message, "render failed");

        let started = recorder.started.lock().clone();
        let attempts: Vec<u32> = started.iter().map(|(_, attempt, _)| *attempt).collect();
        assert_eq!(attempts, vec![1, 2, 3]);
        assert_eq!(started[1].2 - started[0].2, delay);
        assert_eq!(started[2].2 - started[1].2, delay * 2);
    }

    #[tokio::test(start_paused = true)]
    async fn exhausts_attempts_then_rejects() {
        let recorder = Arc::new(Recorder::default());
        let queue = CompileQueue::new(Arc::clone(&recorder), 1);
        let handle = queue
            .submit(
                TestJob::failing("broken", u32::MAX),
                options(Priority::High, 2, Backoff::Fixed(Duration::from_secs(2))),
            )
            .unwrap();

        assert!(matches!(handle.await, Err(JobError::Failed(f)) if f.attempts == 2));
        assert_eq!(recorder.started.lock().len(), 2);
        let stats = queue.stats();
        assert_eq!(stats.failed, 1);
        assert_eq!(stats.retried, 1);
        assert_eq!(stats.completed, 0);
    }

    #[tokio::test]
    async fn non_retryable_errors_fail_immediately() {
        let recorder = Arc::new(Recorder::default());
        let queue = CompileQueue::new(Arc::clone(&recorder), 1);
        let job = TestJob {
            retryable: false,
            ..TestJob::failing("invalid", 1)
        };
        let handle = queue
            .submit(job, options(Priority::Normal, 3, Backoff::Fixed(Duration::ZERO)))
            .unwrap();
        assert!(handle.await.is_err());
        assert_eq!(recorder.started.lock().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_succeeds_on_later_attempt() {
        let recorder = Arc::new(Recorder::default());
        let queue = CompileQueue::new(Arc::clone(&recorder), 1);
        let handle = queue
            .submit(
                TestJob::failing("flaky", 1),
                options(Priority::Normal, 3, Backoff::Fixed(Duration::from_millis(100))),
            )
            .unwrap();
        assert_eq!(handle.await.unwrap(), "flaky");
        assert_eq!(queue.stats().completed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn other_jobs_run_during_backoff() {
        let recorder = Arc::new(Recorder::default());
        let queue = CompileQueue::new(Arc::clone(&recorder), 1);
        let flaky = queue
            .submit(
                TestJob::failing("flaky", 1),
                options(Priority::High, 2, Backoff::Fixed(Duration::from_secs(5))),
            )
            .unwrap();
        let steady = queue
            .submit(TestJob::ok("steady"), quick(Priority::Low))
            .unwrap();

        assert_eq!(steady.await.unwrap(), "steady");
        assert_eq!(flaky.await.unwrap(), "flaky");
        assert_eq!(recorder.names(), vec!["flaky", "steady", "flaky"]);
    }

    #[tokio::test(start_paused = true)]
    async fn never_exceeds_max_concurrent() {
        let recorder = Arc::new(Recorder::default());
        let queue = CompileQueue::new(Arc::clone(&recorder), 2);
        let handles: Vec<_> = ["a", "b", "c", "d", "e"]
            .into_iter()
            .map(|name| {
                let job = TestJob {
                    work: Duration::from_millis(50),
                    ..TestJob::ok(name)
                };
                queue.submit(job, quick(Priority::Normal)).unwrap()
            })
            .collect();

        for handle in handles {
            handle.await.unwrap();
        }
        assert_eq!(recorder.peak.load(Ordering::SeqCst), 2);
        queue.wait_idle().await;
        let status = queue.status();
        assert_eq!(status.processing, 0);
        assert_eq!(status.queued, 0);
    }

    #[tokio::test]
    async fn closed_queue_rejects_submissions() {
        let queue = CompileQueue::new(Arc::new(Recorder::default()), 1);
        queue.close();
        assert!(queue.is_closed());
        let result = queue.submit(TestJob::ok("late"), quick(Priority::High));
        assert_eq!(result.err(), Some(QueueError::Closed));
        assert_eq!(
            queue
                .submit(TestJob::ok("none"), options(Priority::Low, 0, Backoff::Fixed(Duration::ZERO)))
                .err(),
            Some(QueueError::NoAttempts)
        );
    }

    #[tokio::test(start_paused = true)]
    async fn wait_idle_covers_backoff() {
        let recorder = Arc::new(Recorder::default());
        let queue = CompileQueue::new(Arc::clone(&recorder), 1);
        let _handle = queue
            .submit(
                TestJob::failing("slow", 1),
                options(Priority::Normal, 2, Backoff::Fixed(Duration::from_secs(3))),
            )
            .unwrap();
        queue.close();
        queue.wait_idle().await;
        assert_eq!(recorder.started.lock().len(), 2);
        assert_eq!(queue.stats().completed, 1);
    }

    struct EventLog(Mutex<Vec<JobEvent>>);

    impl JobObserver<TestJob> for EventLog {
        fn on_event(&self, _job: &TestJob, event: &JobEvent) {
            self.0.lock().push(event.clone());
        }
    }

    #[tokio::test(start_paused = true)]
    async fn observer_sees_every_transition() {
        let log = Arc::new(EventLog(Mutex::new(Vec::new())));
        let queue = CompileQueue::with_observer(
            Arc::new(Recorder::default()),
            1,
            Arc::clone(&log) as Arc<dyn JobObserver<TestJob>>,
        );
        let handle = queue
            .submit(
                TestJob::failing("flaky", 1),
                options(Priority::Normal, 2, Backoff::Fixed(Duration::from_secs(1))),
            )
            .unwrap();
        let id = handle.id();
        handle.await.unwrap();

        let kinds: Vec<&str> = log
            .0
            .lock()
            .iter()
            .map(|event| {
                assert_eq!(event.id(), id);
                match event {
                    JobEvent::Queued { .. } => "queued",
                    JobEvent::Started { .. } => "started",
                    JobEvent::RetryScheduled { .. } => "retry",
                    JobEvent::Completed { .. } => "completed",
                    JobEvent::Failed { .. } => "failed",
                }
            })
            .collect();
        assert_eq!(kinds, vec!["queued", "started", "retry", "started", "completed"]);
    }
}
