//! The connection pool.

use crate::config::PoolOptions;
use crate::error::PoolError;
use crate::source::ConnectionSource;
use crate::strategy::{Candidate, SelectionStrategy};
use dataport_client::{CloneOptions, ServiceClient};
use dataport_throttle::{RateController, ThrottleTracker};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::ops::Deref;
use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, OnceCell, OwnedSemaphorePermit, Semaphore};
use uuid::Uuid;

struct IdleEntry {
    client: Arc<dyn ServiceClient>,
    created_at: Instant,
    last_used: Instant,
    handle_id: Uuid,
}

struct SourceSlot {
    source: Arc<dyn ConnectionSource>,
    seed: OnceCell<Arc<dyn ServiceClient>>,
    idle: Mutex<VecDeque<IdleEntry>>,
    active: AtomicUsize,
}

struct PoolInner {
    slots: Vec<SourceSlot>,
    options: PoolOptions,
    tracker: Arc<ThrottleTracker>,
    controller: Arc<RateController>,
    /// Bounds total outstanding handles to the sum of MaxPoolSize.
    capacity: Arc<Semaphore>,
    rotation: AtomicUsize,
    returned: Notify,
    requests_served: AtomicU64,
    closed: AtomicBool,
    reaper: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl Drop for PoolInner {
    fn drop(&mut self) {
        if let Some(reaper) = self.reaper.lock().take() {
            reaper.abort();
        }
        for slot in &self.slots {
            slot.source.dispose();
        }
    }
}

/// Point-in-time statistics for one source.
#[derive(Debug, Clone)]
pub struct SourceStats {
    pub name: String,
    pub active: usize,
    pub idle: usize,
    pub throttled: bool,
}

/// Point-in-time statistics for the whole pool.
#[derive(Debug, Clone)]
pub struct PoolStats {
    pub sources: Vec<SourceStats>,
    pub requests_served: u64,
    pub throttle_events: u64,
}

/// Pools cloned seed clients across connection sources.
///
/// Created once per run and disposed at the end; disposal also disposes
/// the sources, which own their seeds.
#[derive(Clone)]
pub struct ConnectionPool {
    inner: Arc<PoolInner>,
}

impl ConnectionPool {
    /// Builds a pool over `sources`.
    ///
    /// Fails with [`PoolError::Configuration`] when `sources` is empty
    /// or two sources share a name. Must be called inside a tokio
    /// runtime: the background validation task is spawned here.
    pub fn new(
        sources: Vec<Arc<dyn ConnectionSource>>,
        tracker: Arc<ThrottleTracker>,
        controller: Arc<RateController>,
        options: PoolOptions,
    ) -> Result<Self, PoolError> {
        options.validate()?;
        if sources.is_empty() {
            return Err(PoolError::Configuration(
                "at least one connection source is required".into(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for source in &sources {
            if !seen.insert(source.name().to_string()) {
                return Err(PoolError::Configuration(format!(
                    "duplicate source name '{}'",
                    source.name()
                )));
            }
        }

        let total_capacity: usize = sources.iter().map(|source| source.max_pool_size()).sum();
        let slots = sources
            .into_iter()
            .map(|source| SourceSlot {
                source,
                seed: OnceCell::new(),
                idle: Mutex::new(VecDeque::new()),
                active: AtomicUsize::new(0),
            })
            .collect();

        let inner = Arc::new(PoolInner {
            slots,
            options,
            tracker,
            controller,
            capacity: Arc::new(Semaphore::new(total_capacity)),
            rotation: AtomicUsize::new(0),
            returned: Notify::new(),
            requests_served: AtomicU64::new(0),
            closed: AtomicBool::new(false),
            reaper: Mutex::new(None),
        });

        let reaper = tokio::spawn(run_validation(Arc::downgrade(&inner)));
        *inner.reaper.lock() = Some(reaper);

        Ok(Self { inner })
    }

    /// Acquires a pooled handle, waiting at most the acquire timeout.
    pub async fn get(&self) -> Result<PooledHandle, PoolError> {
        let timeout = self.inner.options.acquire_timeout;
        match tokio::time::timeout(timeout, self.acquire()).await {
            Ok(result) => result,
            Err(_) => Err(PoolError::Exhausted { waited: timeout }),
        }
    }

    async fn acquire(&self) -> Result<PooledHandle, PoolError> {
        let inner = &self.inner;
        if inner.closed.load(Ordering::Acquire) {
            return Err(PoolError::Closed);
        }
        let permit = Arc::clone(&inner.capacity)
            .acquire_owned()
            .await
            .map_err(|_| PoolError::Closed)?;

        loop {
            if inner.closed.load(Ordering::Acquire) {
                return Err(PoolError::Closed);
            }

            // Sources with spare capacity.
            let with_capacity: Vec<Candidate> = inner
                .slots
                .iter()
                .enumerate()
                .filter_map(|(index, slot)| {
                    let active = slot.active.load(Ordering::Acquire);
                    (active < slot.source.max_pool_size()).then_some(Candidate { index, active })
                })
                .collect();

            if with_capacity.is_empty() {
                // Every source is saturated; wait for a return. Re-check
                // after registering so a return racing the scan above is
                // not missed.
                let notified = inner.returned.notified();
                let freed = inner.slots.iter().any(|slot| {
                    slot.active.load(Ordering::Acquire) < slot.source.max_pool_size()
                });
                if !freed {
                    notified.await;
                }
                continue;
            }

            let candidates: Vec<Candidate> =
                if inner.options.strategy == SelectionStrategy::ThrottleAware {
                    let open: Vec<Candidate> = with_capacity
                        .iter()
                        .copied()
                        .filter(|candidate| {
                            !inner
                                .tracker
                                .is_throttled(inner.slots[candidate.index].source.name())
                        })
                        .collect();
                    if open.is_empty() {
                        // All remaining sources are cooling off; sleep to the
                        // soonest expiry and re-evaluate.
                        let names = with_capacity
                            .iter()
                            .map(|candidate| inner.slots[candidate.index].source.name());
                        let wait = inner
                            .tracker
                            .soonest_expiry(names)
                            .map(|expiry| expiry.saturating_duration_since(Instant::now()))
                            .unwrap_or(std::time::Duration::from_millis(10));
                        tokio::time::sleep(wait).await;
                        continue;
                    }
                    open
                } else {
                    with_capacity
                };

            let Some(index) = inner
                .options
                .strategy
                .pick(&candidates, &inner.rotation)
            else {
                continue;
            };

            match self.checkout(index).await? {
                Some((client, created_at, handle_id)) => {
                    inner.requests_served.fetch_add(1, Ordering::Relaxed);
                    #[cfg(feature = "metrics")]
                    metrics::counter!("dataport_pool_handles_served_total").increment(1);
                    return Ok(PooledHandle {
                        client,
                        pool: Arc::clone(inner),
                        slot_index: index,
                        created_at,
                        acquired_at: Instant::now(),
                        handle_id,
                        _permit: permit,
                    });
                }
                // Lost a capacity race on the chosen source; re-select.
                None => continue,
            }
        }
    }

    /// Reserves capacity on the slot, then takes an idle handle or
    /// clones a fresh one from the seed. Idle entries past their
    /// lifetime are discarded here, so an aged handle is never handed
    /// out again. Returns `None` when the slot filled up concurrently.
    async fn checkout(
        &self,
        index: usize,
    ) -> Result<Option<(Arc<dyn ServiceClient>, Instant, Uuid)>, PoolError> {
        let slot = &self.inner.slots[index];
        let max_lifetime = self.inner.options.max_lifetime;

        let reserved = slot
            .active
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |active| {
                (active < slot.source.max_pool_size()).then_some(active + 1)
            })
            .is_ok();
        if !reserved {
            return Ok(None);
        }

        loop {
            let entry = slot.idle.lock().pop_front();
            match entry {
                Some(entry) if entry.created_at.elapsed() < max_lifetime => {
                    return Ok(Some((entry.client, entry.created_at, entry.handle_id)));
                }
                Some(entry) => {
                    tracing::debug!(
                        source = slot.source.name(),
                        handle = %entry.handle_id,
                        "discarding handle past max lifetime"
                    );
                    drop(entry);
                }
                None => break,
            }
        }

        let cloned = async {
            let seed = slot
                .seed
                .get_or_try_init(|| slot.source.seed())
                .await
                .map(Arc::clone)?;
            seed.clone_seed(&CloneOptions::default())
                .map_err(|fault| PoolError::ConnectionFailed {
                    source_name: slot.source.name().to_string(),
                    reason: fault.to_string(),
                })
        }
        .await;
        match cloned {
            Ok(client) => {
                tracing::debug!(source = slot.source.name(), "cloned new pooled client");
                Ok(Some((client, Instant::now(), Uuid::new_v4())))
            }
            Err(error) => {
                slot.active.fetch_sub(1, Ordering::AcqRel);
                Err(error)
            }
        }
    }

    /// Sum of the server-advertised recommended parallelism over all
    /// source seeds. Resolves lazy seeds.
    pub async fn total_recommended_parallelism(&self) -> Result<usize, PoolError> {
        let mut total = 0usize;
        for slot in &self.inner.slots {
            let seed = slot
                .seed
                .get_or_try_init(|| slot.source.seed())
                .await
                .map(Arc::clone)?;
            total += seed.recommended_parallelism();
        }
        Ok(total.max(1))
    }

    /// The shared throttle tracker.
    pub fn tracker(&self) -> &Arc<ThrottleTracker> {
        &self.inner.tracker
    }

    /// The shared rate controller fronting this pool.
    pub fn rate_controller(&self) -> &Arc<RateController> {
        &self.inner.controller
    }

    /// Names of all sources, in slot order.
    pub fn source_names(&self) -> Vec<&str> {
        self.inner
            .slots
            .iter()
            .map(|slot| slot.source.name())
            .collect()
    }

    /// Point-in-time statistics.
    pub fn stats(&self) -> PoolStats {
        let sources = self
            .inner
            .slots
            .iter()
            .map(|slot| SourceStats {
                name: slot.source.name().to_string(),
                active: slot.active.load(Ordering::Acquire),
                idle: slot.idle.lock().len(),
                throttled: self.inner.tracker.is_throttled(slot.source.name()),
            })
            .collect();
        PoolStats {
            sources,
            requests_served: self.inner.requests_served.load(Ordering::Relaxed),
            throttle_events: self.inner.tracker.throttle_events(),
        }
    }

    /// Disposes the pool: drains idle handles, stops background
    /// validation and disposes the sources. Idempotent.
    pub fn close(&self) {
        if self.inner.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        if let Some(reaper) = self.inner.reaper.lock().take() {
            reaper.abort();
        }
        for slot in &self.inner.slots {
            slot.idle.lock().clear();
            slot.source.dispose();
        }
        self.inner.capacity.close();
        self.inner.returned.notify_waiters();
        tracing::debug!("connection pool closed");
    }

}

impl PoolInner {
    fn release(
        &self,
        slot_index: usize,
        client: Arc<dyn ServiceClient>,
        created_at: Instant,
        handle_id: Uuid,
    ) {
        let slot = &self.slots[slot_index];
        slot.active.fetch_sub(1, Ordering::AcqRel);
        if !self.closed.load(Ordering::Acquire) {
            slot.idle.lock().push_back(IdleEntry {
                client,
                created_at,
                last_used: Instant::now(),
                handle_id,
            });
        }
        self.returned.notify_waiters();
    }
}

/// Background validation pass: evicts idle handles past their idle or
/// lifetime bounds and prunes expired throttle entries. Holds only a
/// weak reference so the pool can drop while the task sleeps.
async fn run_validation(inner: std::sync::Weak<PoolInner>) {
    let interval = match inner.upgrade() {
        Some(strong) => strong.options.validation_interval,
        None => return,
    };
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        ticker.tick().await;
        let Some(inner) = inner.upgrade() else {
            return;
        };
        if inner.closed.load(Ordering::Acquire) {
            return;
        }
        let max_idle = inner.options.max_idle_time;
        let max_lifetime = inner.options.max_lifetime;
        for slot in &inner.slots {
            let mut idle = slot.idle.lock();
            let before = idle.len();
            idle.retain(|entry| {
                entry.last_used.elapsed() < max_idle && entry.created_at.elapsed() < max_lifetime
            });
            let evicted = before - idle.len();
            if evicted > 0 {
                tracing::debug!(
                    source = slot.source.name(),
                    evicted,
                    "evicted idle handles"
                );
            }
        }
        inner.tracker.prune();
        #[cfg(feature = "metrics")]
        for slot in &inner.slots {
            metrics::gauge!(
                "dataport_pool_idle_handles",
                "source" => slot.source.name().to_string()
            )
            .set(slot.idle.lock().len() as f64);
        }
    }
}

/// A borrowed client bound to one source.
///
/// Dropping the handle returns the underlying client to its source's
/// idle queue; the handle is single-owner between acquire and return.
pub struct PooledHandle {
    client: Arc<dyn ServiceClient>,
    pool: Arc<PoolInner>,
    slot_index: usize,
    created_at: Instant,
    acquired_at: Instant,
    handle_id: Uuid,
    _permit: OwnedSemaphorePermit,
}

impl PooledHandle {
    /// The pooled client.
    pub fn client(&self) -> &Arc<dyn ServiceClient> {
        &self.client
    }

    /// The name of the source this handle is bound to.
    pub fn source_name(&self) -> &str {
        self.pool.slots[self.slot_index].source.name()
    }

    /// When the underlying client was created.
    pub fn created_at(&self) -> Instant {
        self.created_at
    }

    /// When this handle was acquired.
    pub fn acquired_at(&self) -> Instant {
        self.acquired_at
    }

    /// Unique id of the underlying pooled client.
    pub fn handle_id(&self) -> Uuid {
        self.handle_id
    }
}

impl Deref for PooledHandle {
    type Target = dyn ServiceClient;

    fn deref(&self) -> &Self::Target {
        &*self.client
    }
}

impl Drop for PooledHandle {
    fn drop(&mut self) {
        self.pool.release(
            self.slot_index,
            Arc::clone(&self.client),
            self.created_at,
            self.handle_id,
        );
    }
}

impl std::fmt::Debug for PooledHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PooledHandle")
            .field("source", &self.source_name())
            .field("handle_id", &self.handle_id)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::source::PreAuthenticatedSource;
    use dataport_client::memory::InMemoryService;
    use dataport_throttle::RateConfig;
    use std::time::Duration;

    fn tracker() -> Arc<ThrottleTracker> {
        Arc::new(ThrottleTracker::default())
    }

    fn controller() -> Arc<RateController> {
        Arc::new(RateController::new(RateConfig::default()))
    }

    fn source(name: &str, service: &InMemoryService, size: usize) -> Arc<dyn ConnectionSource> {
        Arc::new(PreAuthenticatedSource::new(
            name,
            Arc::new(service.clone()),
            size,
        ))
    }

    fn options(acquire_timeout: Duration) -> PoolOptions {
        PoolOptions::builder()
            .acquire_timeout(acquire_timeout)
            .build()
            .unwrap()
    }

    #[tokio::test]
    async fn handle_executes_calls_and_returns_on_drop() {
        let service = InMemoryService::builder().build();
        let pool = ConnectionPool::new(
            vec![source("primary", &service, 2)],
            tracker(),
            controller(),
            options(Duration::from_secs(5)),
        )
        .unwrap();

        let handle = pool.get().await.unwrap();
        assert_eq!(handle.source_name(), "primary");
        assert_eq!(pool.stats().sources[0].active, 1);
        drop(handle);
        assert_eq!(pool.stats().sources[0].active, 0);
        assert_eq!(pool.stats().sources[0].idle, 1);
        assert_eq!(pool.stats().requests_served, 1);
    }

    #[tokio::test]
    async fn returned_client_is_reused_not_recloned() {
        let service = InMemoryService::builder().build();
        let pool = ConnectionPool::new(
            vec![source("primary", &service, 2)],
            tracker(),
            controller(),
            options(Duration::from_secs(5)),
        )
        .unwrap();

        let first = pool.get().await.unwrap();
        let id = first.handle_id();
        drop(first);
        let second = pool.get().await.unwrap();
        assert_eq!(second.handle_id(), id);
        assert_eq!(service.clone_count(), 1);
    }

    #[tokio::test]
    async fn exhausted_pool_times_out() {
        let service = InMemoryService::builder().build();
        let pool = ConnectionPool::new(
            vec![source("primary", &service, 1)],
            tracker(),
            controller(),
            options(Duration::from_millis(50)),
        )
        .unwrap();

        let _held = pool.get().await.unwrap();
        let error = pool.get().await.unwrap_err();
        assert!(matches!(error, PoolError::Exhausted { .. }));
    }

    #[tokio::test]
    async fn waiter_gets_handle_when_one_returns() {
        let service = InMemoryService::builder().build();
        let pool = ConnectionPool::new(
            vec![source("primary", &service, 1)],
            tracker(),
            controller(),
            options(Duration::from_secs(5)),
        )
        .unwrap();

        let held = pool.get().await.unwrap();
        let waiter = {
            let pool = pool.clone();
            tokio::spawn(async move { pool.get().await.map(|handle| handle.handle_id()) })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        drop(held);
        let acquired = waiter.await.unwrap().unwrap();
        assert!(!acquired.is_nil());
    }

    #[tokio::test]
    async fn per_source_capacity_is_respected() {
        let fast = InMemoryService::builder().build();
        let slow = InMemoryService::builder().build();
        let pool = ConnectionPool::new(
            vec![source("a", &fast, 2), source("b", &slow, 3)],
            tracker(),
            controller(),
            options(Duration::from_secs(5)),
        )
        .unwrap();

        let mut handles = Vec::new();
        for _ in 0..5 {
            handles.push(pool.get().await.unwrap());
        }
        let stats = pool.stats();
        let a = stats.sources.iter().find(|s| s.name == "a").unwrap();
        let b = stats.sources.iter().find(|s| s.name == "b").unwrap();
        assert!(a.active <= 2);
        assert!(b.active <= 3);
        assert_eq!(a.active + b.active, 5);
    }

    #[tokio::test]
    async fn throttle_aware_avoids_throttled_source() {
        let first = InMemoryService::builder().build();
        let second = InMemoryService::builder().build();
        let tracker = tracker();
        let pool = ConnectionPool::new(
            vec![source("hot", &first, 4), source("cool", &second, 4)],
            Arc::clone(&tracker),
            controller(),
            options(Duration::from_secs(5)),
        )
        .unwrap();

        tracker.record("hot", Some(Duration::from_secs(60)));
        for _ in 0..6 {
            let handle = pool.get().await.unwrap();
            assert_eq!(handle.source_name(), "cool");
        }
    }

    #[tokio::test]
    async fn all_throttled_waits_for_soonest_expiry() {
        let service = InMemoryService::builder().build();
        let tracker = tracker();
        let pool = ConnectionPool::new(
            vec![source("only", &service, 2)],
            Arc::clone(&tracker),
            controller(),
            options(Duration::from_secs(5)),
        )
        .unwrap();

        tracker.record("only", Some(Duration::from_millis(80)));
        let start = Instant::now();
        let handle = pool.get().await.unwrap();
        assert!(start.elapsed() >= Duration::from_millis(80));
        assert_eq!(handle.source_name(), "only");
    }

    #[tokio::test]
    async fn clone_failure_surfaces_with_source_context() {
        let service = InMemoryService::builder().build();
        service.fail_next_clones(1);
        let pool = ConnectionPool::new(
            vec![source("flaky", &service, 2)],
            tracker(),
            controller(),
            options(Duration::from_secs(5)),
        )
        .unwrap();

        let error = pool.get().await.unwrap_err();
        match error {
            PoolError::ConnectionFailed { source_name, .. } => assert_eq!(source_name, "flaky"),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[tokio::test]
    async fn lifetime_expired_idle_handle_is_replaced() {
        let service = InMemoryService::builder().build();
        let options = PoolOptions::builder()
            .acquire_timeout(Duration::from_secs(5))
            .max_idle_time(Duration::from_millis(1))
            .max_lifetime(Duration::from_millis(1))
            // Long interval so the reaper stays out of this test.
            .validation_interval(Duration::from_secs(3600))
            .build()
            .unwrap();
        let pool = ConnectionPool::new(
            vec![source("primary", &service, 2)],
            tracker(),
            controller(),
            options,
        )
        .unwrap();

        let first = pool.get().await.unwrap();
        let first_id = first.handle_id();
        drop(first);
        tokio::time::sleep(Duration::from_millis(10)).await;
        let second = pool.get().await.unwrap();
        assert_ne!(second.handle_id(), first_id);
        assert_eq!(service.clone_count(), 2);
    }

    #[tokio::test]
    async fn total_recommended_parallelism_sums_sources() {
        let first = InMemoryService::builder().recommended_parallelism(3).build();
        let second = InMemoryService::builder().recommended_parallelism(5).build();
        let pool = ConnectionPool::new(
            vec![source("a", &first, 2), source("b", &second, 2)],
            tracker(),
            controller(),
            options(Duration::from_secs(5)),
        )
        .unwrap();
        assert_eq!(pool.total_recommended_parallelism().await.unwrap(), 8);
    }

    #[tokio::test]
    async fn closed_pool_rejects_acquires() {
        let service = InMemoryService::builder().build();
        let pool = ConnectionPool::new(
            vec![source("primary", &service, 2)],
            tracker(),
            controller(),
            options(Duration::from_secs(5)),
        )
        .unwrap();
        pool.close();
        pool.close(); // idempotent
        assert!(matches!(pool.get().await.unwrap_err(), PoolError::Closed));
    }

    #[tokio::test]
    async fn duplicate_source_names_rejected() {
        let service = InMemoryService::builder().build();
        let result = ConnectionPool::new(
            vec![source("same", &service, 1), source("same", &service, 1)],
            tracker(),
            controller(),
            options(Duration::from_secs(5)),
        );
        assert!(matches!(result, Err(PoolError::Configuration(_))));
    }

    #[tokio::test]
    async fn least_connections_balances_sources() {
        let first = InMemoryService::builder().build();
        let second = InMemoryService::builder().build();
        let options = PoolOptions::builder()
            .acquire_timeout(Duration::from_secs(5))
            .strategy(SelectionStrategy::LeastConnections)
            .build()
            .unwrap();
        let pool = ConnectionPool::new(
            vec![source("a", &first, 4), source("b", &second, 4)],
            tracker(),
            controller(),
            options,
        )
        .unwrap();

        let _one = pool.get().await.unwrap();
        let two = pool.get().await.unwrap();
        // With one active on the first source, the second acquire must
        // land on the other.
        assert_eq!(two.source_name(), "b");
    }
}
