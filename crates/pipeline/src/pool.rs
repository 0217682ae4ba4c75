//! Bounded pool of reusable rendering sessions.
//!
//! Capacity is a fair [`Semaphore`] with `max_instances` permits: a lease holds
//! one permit for as long as it lives, so the check-and-increment on acquire is
//! a single atomic step and blocked callers are served strictly FIFO. Idle
//! sessions are parked for reuse and re-checked for liveness on the way out.
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use renderer::{RenderEngine, RenderSession};
use serde::Serialize;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, warn};

use crate::error::PoolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct PoolStats {
    pub idle: usize,
    pub active: usize,
    pub max: usize,
    pub waiters: usize,
}

struct Parked<S> {
    session: S,
    created: Instant,
}

struct PoolInner<E: RenderEngine> {
    engine: Arc<E>,
    permits: Arc<Semaphore>,
    idle: Mutex<Vec<Parked<E::Session>>>,
    active: AtomicUsize,
    waiters: AtomicUsize,
    max: usize,
    closed: AtomicBool,
}

impl<E: RenderEngine> PoolInner<E> {
    fn release(&self, session: E::Session, created: Instant, reusable: bool) {
        if reusable && session.is_alive() && !self.closed.load(Ordering::Acquire) {
            let mut idle = self.idle.lock();
            if idle.len() < self.max {
                idle.push(Parked { session, created });
                return;
            }
        }
        teardown(session);
    }
}

/// Closes a session off the async runtime when one is available.
fn teardown<S: RenderSession>(mut session: S) {
    let mut close = move || {
        if let Err(err) = session.close() {
            warn!(error = %err, "rendering session teardown failed");
        }
    };
    match tokio::runtime::Handle::try_current() {
        Ok(handle) => {
            handle.spawn_blocking(close);
        }
        Err(_) => close(),
    }
}

pub struct SessionPool<E: RenderEngine> {
    inner: Arc<PoolInner<E>>,
}

impl<E: RenderEngine> Clone for SessionPool<E> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<E: RenderEngine> SessionPool<E> {
    pub fn new(engine: E, max_instances: usize) -> Self {
        Self::with_shared_engine(Arc::new(engine), max_instances)
    }

    pub fn with_shared_engine(engine: Arc<E>, max_instances: usize) -> Self {
        let max = max_instances.max(1);
        Self {
            inner: Arc::new(PoolInner {
                engine,
                permits: Arc::new(Semaphore::new(max)),
                idle: Mutex::new(Vec::with_capacity(max)),
                active: AtomicUsize::new(0),
                waiters: AtomicUsize::new(0),
                max,
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub fn engine(&self) -> &E {
        &self.inner.engine
    }

    /// Checks a session out, suspending while every slot is leased.
    ///
    /// Parked sessions are reused first; dead ones are closed and skipped. A
    /// fresh session is spawned on the blocking pool only when none is idle.
    /// If spawning fails the slot is returned before the error propagates, so
    /// the next waiter is woken.
    pub async fn acquire(&self) -> Result<PooledSession<E>, PoolError> {
        let permit = {
            let _waiting = WaiterGuard::enter(&self.inner.waiters);
            Arc::clone(&self.inner.permits)
                .acquire_owned()
                .await
                .map_err(|_| PoolError::Closed)?
        };
        self.inner.active.fetch_add(1, Ordering::AcqRel);
        let mut lease = PooledSession {
            pool: Arc::clone(&self.inner),
            session: None,
            created: Instant::now(),
            reusable: true,
            permit: Some(permit),
        };

        loop {
            let parked = self.inner.idle.lock().pop();
            match parked {
                Some(parked) if parked.session.is_alive() => {
                    debug!(
                        age_ms = parked.created.elapsed().as_millis() as u64,
                        "reusing idle rendering session"
                    );
                    lease.created = parked.created;
                    lease.session = Some(parked.session);
                    return Ok(lease);
                }
                Some(parked) => {
                    debug!("discarding dead idle rendering session");
                    teardown(parked.session);
                }
                None => break,
            }
        }

        let engine = Arc::clone(&self.inner.engine);
        let spawned = tokio::task::spawn_blocking(move || engine.spawn())
            .await
            .map_err(|err| {
                PoolError::Spawn(renderer::RenderError::Spawn(format!(
                    "session spawn task failed: {err}"
                )))
            })?;
        let session = spawned?;
        debug!(
            active = self.inner.active.load(Ordering::Acquire),
            "spawned rendering session"
        );
        lease.session = Some(session);
        lease.created = Instant::now();
        Ok(lease)
    }

    /// Returns a lease to the pool. Equivalent to dropping it.
    pub fn release(&self, lease: PooledSession<E>) {
        drop(lease);
    }

    /// Closes a session that is no longer attached to a lease.
    pub(crate) fn retire(&self, session: E::Session) {
        teardown(session);
    }

    /// Stops handing out sessions and closes every idle one. Leases still out
    /// are closed as they come back.
    pub async fn drain_and_close_all(&self) {
        self.inner.closed.store(true, Ordering::Release);
        self.inner.permits.close();
        let parked: Vec<_> = std::mem::take(&mut *self.inner.idle.lock());
        if parked.is_empty() {
            return;
        }
        debug!(count = parked.len(), "closing idle rendering sessions");
        let closing: Vec<_> = parked
            .into_iter()
            .map(|Parked { mut session, .. }| {
                tokio::task::spawn_blocking(move || session.close())
            })
            .collect();
        for task in closing {
            match task.await {
                Ok(Ok(())) => {}
                Ok(Err(err)) => warn!(error = %err, "rendering session teardown failed"),
                Err(err) => warn!(error = %err, "rendering session teardown task failed"),
            }
        }
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::Acquire)
    }

    pub fn stats(&self) -> PoolStats {
        PoolStats {
            idle: self.inner.idle.lock().len(),
            active: self.inner.active.load(Ordering::Acquire),
            max: self.inner.max,
            waiters: self.inner.waiters.load(Ordering::Acquire),
        }
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn enter(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::AcqRel);
        Self(counter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::AcqRel);
    }
}

/// Exclusive checkout of one session. Dropping it releases the slot on every
/// path: the session is parked when healthy and closed otherwise.
pub struct PooledSession<E: RenderEngine> {
    pool: Arc<PoolInner<E>>,
    session: Option<E::Session>,
    created: Instant,
    reusable: bool,
    permit: Option<OwnedSemaphorePermit>,
}

impl<E: RenderEngine> PooledSession<E> {
    pub fn session(&self) -> Option<&E::Session> {
        self.session.as_ref()
    }

    pub fn session_mut(&mut self) -> Option<&mut E::Session> {
        self.session.as_mut()
    }

    /// Marks the session as unfit for reuse; it is closed on release.
    pub fn discard(&mut self) {
        self.reusable = false;
    }

    pub(crate) fn take(&mut self) -> Option<E::Session> {
        self.session.take()
    }

    pub(crate) fn restore(&mut self, session: E::Session) {
        self.session = Some(session);
    }
}

impl<E: RenderEngine> Drop for PooledSession<E> {
    fn drop(&mut self) {
        self.pool.active.fetch_sub(1, Ordering::AcqRel);
        if let Some(session) = self.session.take() {
            self.pool.release(session, self.created, self.reusable);
        }
        // The permit goes last so a woken waiter finds the parked session.
        drop(self.permit.take());
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicU32;

    use renderer::{FrameSample, ProgramRequest, RenderError, RgbaImage};

    use super::*;

    #[derive(Default)]
    struct CountingEngine {
        spawned: AtomicU32,
        fail_next: AtomicBool,
    }

    struct CountingSession {
        id: u32,
        alive: Arc<AtomicBool>,
    }

    impl RenderEngine for CountingEngine {
        type Session = CountingSession;

        fn spawn(&self) -> Result<CountingSession, RenderError> {
            if self.fail_next.swap(false, Ordering::SeqCst) {
                return Err(RenderError::Spawn("adapter missing".into()));
            }
            Ok(CountingSession {
                id: self.spawned.fetch_add(1, Ordering::SeqCst),
                alive: Arc::new(AtomicBool::new(true)),
            })
        }
    }

    impl RenderSession for CountingSession {
        fn is_alive(&self) -> bool {
            self.alive.load(Ordering::SeqCst)
        }
        fn load_program(&mut self, _: &ProgramRequest) -> Result<(), RenderError> {
            Ok(())
        }
        fn render_frame(&mut self, _: FrameSample) -> Result<(), RenderError> {
            Ok(())
        }
        fn capture_frame(&mut self) -> Result<RgbaImage, RenderError> {
            Ok(RgbaImage::new(1, 1))
        }
        fn close(&mut self) -> Result<(), RenderError> {
            self.alive.store(false, Ordering::SeqCst);
            Ok(())
        }
    }

    fn session_id(lease: &PooledSession<CountingEngine>) -> u32 {
        lease.session().map(|session| session.id).unwrap()
    }

    #[tokio::test]
    async fn released_sessions_are_reused() {
        let pool = SessionPool::new(CountingEngine::default(), 2);

        let lease = pool.acquire().await.unwrap();
        let first = session_id(&lease);
        pool.release(lease);
        assert_eq!(pool.stats().idle, 1);

        let again = pool.acquire().await.unwrap();
        assert_eq!(session_id(&again), first);
        assert_eq!(pool.engine().spawned.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn dead_idle_sessions_are_replaced() {
        let pool = SessionPool::new(CountingEngine::default(), 1);

        let lease = pool.acquire().await.unwrap();
        let alive = Arc::clone(&lease.session().unwrap().alive);
        drop(lease);
        alive.store(false, Ordering::SeqCst);

        let replacement = pool.acquire().await.unwrap();
        assert_eq!(session_id(&replacement), 1);
        assert_eq!(pool.stats().active, 1);
    }

    #[tokio::test]
    async fn spawn_failure_returns_the_slot() {
        let engine = CountingEngine::default();
        engine.fail_next.store(true, Ordering::SeqCst);
        let pool = SessionPool::new(engine, 1);

        assert!(matches!(pool.acquire().await, Err(PoolError::Spawn(_))));
        assert_eq!(pool.stats().active, 0);

        let lease = pool.acquire().await.unwrap();
        assert_eq!(session_id(&lease), 0);
    }

    #[tokio::test]
    async fn discarded_sessions_are_closed_not_parked() {
        let pool = SessionPool::new(CountingEngine::default(), 2);

        let mut lease = pool.acquire().await.unwrap();
        lease.discard();
        drop(lease);

        let stats = pool.stats();
        assert_eq!(stats.idle, 0);
        assert_eq!(stats.active, 0);
    }

    #[tokio::test]
    async fn drain_closes_idle_and_rejects_new_leases() {
        let pool = SessionPool::new(CountingEngine::default(), 2);

        let lease = pool.acquire().await.unwrap();
        let alive = Arc::clone(&lease.session().unwrap().alive);
        drop(lease);

        pool.drain_and_close_all().await;
        assert!(!alive.load(Ordering::SeqCst));
        assert_eq!(pool.stats().idle, 0);
        assert!(matches!(pool.acquire().await, Err(PoolError::Closed)));
    }
}
