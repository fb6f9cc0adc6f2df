//! A bounded borrow/return resource pool.
//!
//! The pool is generic over a [`PoolLifecycle`] that knows how to make,
//! validate and destroy resources; the connectivity layer plugs its
//! connection factory in. Borrowing blocks (or fails, per policy) once
//! `max_active` resources are lent out, and a background evictor probes idle
//! resources and keeps `min_idle` of them warm.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use async_trait::async_trait;
use futures::FutureExt;
use futures::future::RemoteHandle;
use tokio::sync::{OwnedSemaphorePermit, Semaphore, TryAcquireError};
use tracing::{debug, trace, warn};

use crate::client::ExhaustionPolicy;
use crate::errors::ConnectionPoolError;

/// The lifecycle hooks the pool drives on its resources.
#[async_trait]
pub(crate) trait PoolLifecycle: Send + Sync + 'static {
    /// The pooled resource type.
    type Resource: Send + 'static;
    /// Failure to make a resource.
    type Error: Into<ConnectionPoolError> + Send;

    /// Creates a fresh resource, ready for use.
    async fn make(&self) -> Result<Self::Resource, Self::Error>;

    /// Disposes of a resource for good. Best effort.
    async fn destroy(&self, resource: Self::Resource);

    /// Decides whether a resource is still fit to lend out.
    async fn validate(&self, resource: &mut Self::Resource) -> bool;
}

#[derive(Debug, Clone)]
pub(crate) struct PoolPolicy {
    pub(crate) max_active: usize,
    pub(crate) min_idle: usize,
    pub(crate) test_on_borrow: bool,
    pub(crate) test_while_idle: bool,
    pub(crate) eviction_interval: Option<Duration>,
    pub(crate) borrow_timeout: Option<Duration>,
    pub(crate) exhaustion: ExhaustionPolicy,
}

pub(crate) struct Pool<L: PoolLifecycle> {
    shared: Arc<Shared<L>>,
    _evictor_handle: Option<RemoteHandle<()>>,
}

struct Shared<L: PoolLifecycle> {
    lifecycle: L,
    policy: PoolPolicy,
    // Bounds concurrently borrowed or in-creation resources; closed on
    // shutdown to wake blocked borrowers.
    permits: Arc<Semaphore>,
    state: Mutex<PoolState<L::Resource>>,
    closed: AtomicBool,
}

struct PoolState<R> {
    idle: VecDeque<R>,
    // Idle plus lent-out plus being-created.
    total: usize,
}

impl<L: PoolLifecycle> Pool<L> {
    pub(crate) fn new(lifecycle: L, policy: PoolPolicy) -> Self {
        let shared = Arc::new(Shared {
            permits: Arc::new(Semaphore::new(policy.max_active)),
            state: Mutex::new(PoolState {
                idle: VecDeque::with_capacity(policy.max_active),
                total: 0,
            }),
            closed: AtomicBool::new(false),
            lifecycle,
            policy,
        });

        let evictor_handle = shared.policy.eviction_interval.map(|interval| {
            let weak = Arc::downgrade(&shared);
            let (fut, handle) = evictor_loop(weak, interval).remote_handle();
            tokio::spawn(fut);
            handle
        });

        Self {
            shared,
            _evictor_handle: evictor_handle,
        }
    }

    /// Takes a resource out of the pool for exclusive use.
    ///
    /// Blocks at `max_active` until a resource is returned or invalidated,
    /// subject to the borrow timeout and exhaustion policy.
    pub(crate) async fn borrow(&self) -> Result<Borrowed<L>, ConnectionPoolError> {
        let shared = &self.shared;
        if shared.closed.load(Ordering::Acquire) {
            return Err(ConnectionPoolError::Closed);
        }
        let permit = shared.acquire_permit().await?;

        loop {
            let candidate = shared.lock_state().idle.pop_front();
            match candidate {
                Some(mut resource) => {
                    if shared.policy.test_on_borrow
                        && !shared.lifecycle.validate(&mut resource).await
                    {
                        trace!("idle resource failed borrow-time validation, discarding");
                        shared.destroy_resource(resource).await;
                        continue;
                    }
                    return Ok(Borrowed::new(Arc::clone(shared), resource, permit));
                }
                None => {
                    let resource = shared.make_resource().await?;
                    return Ok(Borrowed::new(Arc::clone(shared), resource, permit));
                }
            }
        }
    }

    /// Closes the pool: destroys every idle resource and fails all current
    /// and future borrows. Resources currently lent out are destroyed when
    /// their borrow ends.
    pub(crate) async fn close(&self) {
        if self.shared.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.shared.permits.close();
        let drained: Vec<L::Resource> = {
            let mut state = self.shared.lock_state();
            let drained: Vec<L::Resource> = state.idle.drain(..).collect();
            state.total -= drained.len();
            drained
        };
        debug!(count = drained.len(), "closing pool, destroying idle resources");
        futures::future::join_all(
            drained
                .into_iter()
                .map(|resource| self.shared.lifecycle.destroy(resource)),
        )
        .await;
    }

    #[cfg(test)]
    pub(crate) fn idle_count(&self) -> usize {
        self.shared.lock_state().idle.len()
    }

    #[cfg(test)]
    fn total_count(&self) -> usize {
        self.shared.lock_state().total
    }
}

impl<L: PoolLifecycle> Shared<L> {
    fn lock_state(&self) -> std::sync::MutexGuard<'_, PoolState<L::Resource>> {
        self.state.lock().expect("pool state lock poisoned")
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit, ConnectionPoolError> {
        let permits = Arc::clone(&self.permits);
        match self.policy.exhaustion {
            ExhaustionPolicy::Fail => permits.try_acquire_owned().map_err(|err| match err {
                TryAcquireError::Closed => ConnectionPoolError::Closed,
                TryAcquireError::NoPermits => ConnectionPoolError::Capacity {
                    max_active: self.policy.max_active,
                },
            }),
            ExhaustionPolicy::Block => match self.policy.borrow_timeout {
                Some(timeout) => tokio::time::timeout(timeout, permits.acquire_owned())
                    .await
                    .map_err(|_| ConnectionPoolError::BorrowTimeout { timeout })?
                    .map_err(|_| ConnectionPoolError::Closed),
                None => permits
                    .acquire_owned()
                    .await
                    .map_err(|_| ConnectionPoolError::Closed),
            },
        }
    }

    async fn make_resource(&self) -> Result<L::Resource, ConnectionPoolError> {
        self.lock_state().total += 1;
        match self.lifecycle.make().await {
            Ok(resource) => Ok(resource),
            Err(err) => {
                self.lock_state().total -= 1;
                Err(err.into())
            }
        }
    }

    async fn destroy_resource(&self, resource: L::Resource) {
        self.lifecycle.destroy(resource).await;
        self.lock_state().total -= 1;
    }

    /// One evictor pass: probe idle resources, discard broken ones, then top
    /// the idle set back up to `min_idle` without exceeding `max_active`.
    async fn evict_and_refill(&self) {
        if self.policy.test_while_idle {
            let idle_now = self.lock_state().idle.len();
            for _ in 0..idle_now {
                let Some(mut resource) = self.lock_state().idle.pop_front() else {
                    break;
                };
                if self.lifecycle.validate(&mut resource).await {
                    self.lock_state().idle.push_back(resource);
                } else {
                    debug!("evicting idle resource that failed validation");
                    self.destroy_resource(resource).await;
                }
            }
        }

        loop {
            if self.closed.load(Ordering::Acquire) {
                return;
            }
            {
                let state = self.lock_state();
                if state.idle.len() >= self.policy.min_idle
                    || state.total >= self.policy.max_active
                {
                    return;
                }
            }
            match self.make_resource().await {
                Ok(resource) => {
                    trace!("replenished one idle resource");
                    self.lock_state().idle.push_back(resource);
                }
                Err(err) => {
                    debug!(error = %err, "could not replenish idle resources");
                    return;
                }
            }
        }
    }
}

async fn evictor_loop<L: PoolLifecycle>(shared: Weak<Shared<L>>, interval: Duration) {
    loop {
        tokio::time::sleep(interval).await;
        let Some(shared) = shared.upgrade() else {
            return;
        };
        if shared.closed.load(Ordering::Acquire) {
            return;
        }
        shared.evict_and_refill().await;
    }
}

/// A resource lent out by the pool; exclusively owned until disposed.
///
/// Dispose explicitly with [`Borrowed::release`] or [`Borrowed::invalidate`].
/// Dropping the guard hands the resource back unvalidated (the
/// borrow-time check vets it on next use), which keeps cancelled callers from
/// leaking pool slots.
pub(crate) struct Borrowed<L: PoolLifecycle> {
    shared: Arc<Shared<L>>,
    resource: Option<L::Resource>,
    _permit: OwnedSemaphorePermit,
}

impl<L: PoolLifecycle> Borrowed<L> {
    fn new(shared: Arc<Shared<L>>, resource: L::Resource, permit: OwnedSemaphorePermit) -> Self {
        Self {
            shared,
            resource: Some(resource),
            _permit: permit,
        }
    }

    pub(crate) fn get(&self) -> &L::Resource {
        self.resource.as_ref().expect("resource already disposed")
    }

    pub(crate) fn get_mut(&mut self) -> &mut L::Resource {
        self.resource.as_mut().expect("resource already disposed")
    }

    /// Hands the resource back to the idle set.
    pub(crate) async fn release(mut self) {
        let resource = self.resource.take().expect("resource already disposed");
        if self.shared.closed.load(Ordering::Acquire) {
            self.shared.destroy_resource(resource).await;
            return;
        }
        self.shared.lock_state().idle.push_back(resource);
        // The permit drops with `self`, waking one blocked borrower.
    }

    /// Destroys the resource instead of returning it, freeing its slot.
    pub(crate) async fn invalidate(mut self) {
        let resource = self.resource.take().expect("resource already disposed");
        self.shared.destroy_resource(resource).await;
    }
}

impl<L: PoolLifecycle> std::fmt::Debug for Borrowed<L> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Borrowed")
            .field("disposed", &self.resource.is_none())
            .finish_non_exhaustive()
    }
}

impl<L: PoolLifecycle> Drop for Borrowed<L> {
    fn drop(&mut self) {
        if let Some(resource) = self.resource.take() {
            if self.shared.closed.load(Ordering::Acquire) {
                self.shared.lock_state().total -= 1;
                warn!("borrowed resource dropped after pool close, discarding without cleanup");
            } else {
                trace!("borrowed resource dropped without explicit disposal, returning to pool");
                self.shared.lock_state().idle.push_back(resource);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use assert_matches::assert_matches;
    use std::sync::atomic::AtomicUsize;

    struct TestLifecycle {
        made: AtomicUsize,
        destroyed: AtomicUsize,
        valid: AtomicBool,
        fail_make: AtomicBool,
    }

    impl TestLifecycle {
        fn new() -> Arc<Self> {
            Arc::new(Self {
                made: AtomicUsize::new(0),
                destroyed: AtomicUsize::new(0),
                valid: AtomicBool::new(true),
                fail_make: AtomicBool::new(false),
            })
        }
    }

    #[async_trait]
    impl PoolLifecycle for Arc<TestLifecycle> {
        type Resource = usize;
        type Error = crate::errors::ClusterUnavailableError;

        async fn make(&self) -> Result<usize, Self::Error> {
            if self.fail_make.load(Ordering::SeqCst) {
                return Err(crate::errors::ClusterUnavailableError::NoKnownHosts);
            }
            Ok(self.made.fetch_add(1, Ordering::SeqCst))
        }

        async fn destroy(&self, _resource: usize) {
            self.destroyed.fetch_add(1, Ordering::SeqCst);
        }

        async fn validate(&self, _resource: &mut usize) -> bool {
            self.valid.load(Ordering::SeqCst)
        }
    }

    fn policy(max_active: usize) -> PoolPolicy {
        PoolPolicy {
            max_active,
            min_idle: 0,
            test_on_borrow: true,
            test_while_idle: false,
            eviction_interval: None,
            borrow_timeout: None,
            exhaustion: ExhaustionPolicy::Block,
        }
    }

    #[tokio::test]
    async fn borrow_makes_then_reuses() {
        let lifecycle = TestLifecycle::new();
        let pool = Pool::new(Arc::clone(&lifecycle), policy(4));

        let first = pool.borrow().await.unwrap();
        assert_eq!(*first.get(), 0);
        first.release().await;

        let second = pool.borrow().await.unwrap();
        assert_eq!(*second.get(), 0);
        assert_eq!(lifecycle.made.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn invalidate_destroys_and_frees_the_slot() {
        let lifecycle = TestLifecycle::new();
        let pool = Pool::new(Arc::clone(&lifecycle), policy(1));

        let borrowed = pool.borrow().await.unwrap();
        borrowed.invalidate().await;
        assert_eq!(lifecycle.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.total_count(), 0);

        // The slot freed by invalidation admits a fresh borrow.
        let next = pool.borrow().await.unwrap();
        assert_eq!(*next.get(), 1);
    }

    #[tokio::test]
    async fn fail_policy_reports_capacity() {
        let lifecycle = TestLifecycle::new();
        let mut p = policy(1);
        p.exhaustion = ExhaustionPolicy::Fail;
        let pool = Pool::new(lifecycle, p);

        let _held = pool.borrow().await.unwrap();
        assert_matches!(
            pool.borrow().await,
            Err(ConnectionPoolError::Capacity { max_active: 1 })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_borrow_times_out() {
        let lifecycle = TestLifecycle::new();
        let mut p = policy(1);
        p.borrow_timeout = Some(Duration::from_millis(100));
        let pool = Pool::new(lifecycle, p);

        let _held = pool.borrow().await.unwrap();
        assert_matches!(
            pool.borrow().await,
            Err(ConnectionPoolError::BorrowTimeout { .. })
        );
    }

    #[tokio::test(start_paused = true)]
    async fn blocked_borrow_resumes_when_a_resource_is_released() {
        let lifecycle = TestLifecycle::new();
        let mut p = policy(2);
        p.borrow_timeout = Some(Duration::from_secs(10));
        let pool = Arc::new(Pool::new(lifecycle, p));

        let first = pool.borrow().await.unwrap();
        let _second = pool.borrow().await.unwrap();

        let contender = {
            let pool = Arc::clone(&pool);
            tokio::spawn(async move {
                let borrowed = pool.borrow().await.unwrap();
                *borrowed.get()
            })
        };

        tokio::time::sleep(Duration::from_millis(50)).await;
        first.release().await;

        // The third borrow proceeds once the first connection came back.
        assert_eq!(contender.await.unwrap(), 0);
    }

    #[tokio::test]
    async fn invalid_idle_resource_is_replaced_on_borrow() {
        let lifecycle = TestLifecycle::new();
        let pool = Pool::new(Arc::clone(&lifecycle), policy(2));

        let borrowed = pool.borrow().await.unwrap();
        borrowed.release().await;

        lifecycle.valid.store(false, Ordering::SeqCst);
        let replacement = pool.borrow().await.unwrap();
        // The stale idle resource was destroyed and a fresh one made.
        assert_eq!(lifecycle.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(*replacement.get(), 1);
    }

    #[tokio::test]
    async fn make_failure_releases_the_slot() {
        let lifecycle = TestLifecycle::new();
        let pool = Pool::new(Arc::clone(&lifecycle), policy(1));

        lifecycle.fail_make.store(true, Ordering::SeqCst);
        assert_matches!(
            pool.borrow().await,
            Err(ConnectionPoolError::ClusterUnavailable(_))
        );
        assert_eq!(pool.total_count(), 0);

        lifecycle.fail_make.store(false, Ordering::SeqCst);
        let recovered = pool.borrow().await.unwrap();
        assert_eq!(*recovered.get(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn evictor_discards_broken_idle_and_replenishes_min_idle() {
        let lifecycle = TestLifecycle::new();
        let mut p = policy(4);
        p.min_idle = 2;
        p.test_while_idle = true;
        p.eviction_interval = Some(Duration::from_secs(30));
        let pool = Pool::new(Arc::clone(&lifecycle), p);

        let borrowed = pool.borrow().await.unwrap();
        borrowed.release().await;
        lifecycle.valid.store(false, Ordering::SeqCst);

        tokio::time::sleep(Duration::from_secs(31)).await;
        // The broken idle resource is gone...
        assert_eq!(lifecycle.destroyed.load(Ordering::SeqCst), 1);

        lifecycle.valid.store(true, Ordering::SeqCst);
        tokio::time::sleep(Duration::from_secs(30)).await;
        // ...and the idle set is topped back up to min_idle.
        assert_eq!(pool.idle_count(), 2);
    }

    #[tokio::test]
    async fn close_destroys_idle_and_fails_borrows() {
        let lifecycle = TestLifecycle::new();
        let pool = Pool::new(Arc::clone(&lifecycle), policy(2));

        let borrowed = pool.borrow().await.unwrap();
        borrowed.release().await;
        pool.close().await;

        assert_eq!(lifecycle.destroyed.load(Ordering::SeqCst), 1);
        assert_matches!(pool.borrow().await, Err(ConnectionPoolError::Closed));
    }

    #[tokio::test]
    async fn resource_released_after_close_is_destroyed() {
        let lifecycle = TestLifecycle::new();
        let pool = Pool::new(Arc::clone(&lifecycle), policy(2));

        let borrowed = pool.borrow().await.unwrap();
        pool.close().await;
        borrowed.release().await;

        assert_eq!(lifecycle.destroyed.load(Ordering::SeqCst), 1);
        assert_eq!(pool.idle_count(), 0);
    }

    #[tokio::test]
    async fn dropped_guard_returns_the_resource() {
        let lifecycle = TestLifecycle::new();
        let pool = Pool::new(Arc::clone(&lifecycle), policy(1));

        {
            let _borrowed = pool.borrow().await.unwrap();
        }
        assert_eq!(pool.idle_count(), 1);

        let again = pool.borrow().await.unwrap();
        assert_eq!(*again.get(), 0);
    }
}
