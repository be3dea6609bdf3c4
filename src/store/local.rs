//! In-process protection store.
//!
//! A sharded map of entries plus one re-entrant lock per key. Every compound
//! operation runs under its key's lock, which gives the same at-most-one-winner
//! guarantee the distributed store gets from server-side scripts. State is
//! process-local: two instances using this store never see each other.

use std::sync::{Arc, Weak};
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::ReentrantMutex;
use tokio::task::JoinHandle;
use tracing::{debug, trace};

use super::{strip_pattern, ProtectionRecord, ProtectionStore, RecordUpdate, Updated};
use crate::clock::{deadline_after, Clock, SystemClock};
use crate::error::StoreResult;
use crate::key::ProtectionKey;
use crate::ratelimit::{RateLimitDecision, WindowRequest, WindowState};

#[derive(Debug, Clone)]
enum Slot {
    Record(ProtectionRecord),
    Window(WindowState),
}

#[derive(Debug, Clone)]
struct Entry {
    slot: Slot,
    expires_at: i64,
}

/// Concurrent in-memory store with a background sweeper.
#[derive(Debug)]
pub struct LocalStore {
    entries: DashMap<String, Entry>,
    locks: DashMap<String, Arc<ReentrantMutex<()>>>,
    clock: Arc<dyn Clock>,
}

impl Default for LocalStore {
    fn default() -> Self {
        Self::new()
    }
}

impl LocalStore {
    /// Create a store on the system clock.
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock::new()))
    }

    /// Create a store on a custom clock.
    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            entries: DashMap::new(),
            locks: DashMap::new(),
            clock,
        }
    }

    /// Number of entries, live or not yet swept.
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Number of per-key locks currently allocated.
    pub fn lock_count(&self) -> usize {
        self.locks.len()
    }

    /// Run `f` while holding the lock for `key`.
    fn with_key<R>(&self, key: &str, f: impl FnOnce() -> R) -> R {
        let lock = Arc::clone(
            self.locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(ReentrantMutex::new(())))
                .value(),
        );
        let _guard = lock.lock();
        f()
    }

    fn live_record(&self, key: &str, now_ms: i64) -> Option<ProtectionRecord> {
        self.entries.get(key).and_then(|entry| match &entry.slot {
            Slot::Record(record) if entry.expires_at > now_ms && record.is_live(now_ms) => {
                Some(record.clone())
            }
            _ => None,
        })
    }

    fn get_or_create_sync(
        &self,
        key: &ProtectionKey,
        candidate: ProtectionRecord,
    ) -> (ProtectionRecord, bool) {
        self.with_key(key.as_str(), || {
            let now = self.clock.now_millis();
            if let Some(mut existing) = self.live_record(key.as_str(), now) {
                existing.access_count += 1;
                self.entries.insert(
                    key.as_str().to_string(),
                    Entry {
                        expires_at: existing.expires_at,
                        slot: Slot::Record(existing.clone()),
                    },
                );
                return (existing, false);
            }

            self.entries.insert(
                key.as_str().to_string(),
                Entry {
                    expires_at: candidate.expires_at,
                    slot: Slot::Record(candidate.clone()),
                },
            );
            (candidate, true)
        })
    }

    fn compare_and_update_sync(&self, key: &ProtectionKey, update: &RecordUpdate) -> Option<Updated> {
        self.with_key(key.as_str(), || {
            let now = self.clock.now_millis();
            let mut record = self.live_record(key.as_str(), now)?;
            let applied = update.apply(&mut record, now);
            if applied {
                self.entries.insert(
                    key.as_str().to_string(),
                    Entry {
                        expires_at: record.expires_at,
                        slot: Slot::Record(record.clone()),
                    },
                );
            }
            Some(Updated { record, applied })
        })
    }

    fn evaluate_window_sync(&self, key: &ProtectionKey, request: &WindowRequest) -> RateLimitDecision {
        let strategy = request.algorithm.strategy();
        let state_key = strategy.state_key(key, request);

        self.with_key(&state_key, || {
            let current = self.entries.get(&state_key).and_then(|entry| match &entry.slot {
                Slot::Window(state) if entry.expires_at > request.now_ms => Some(state.clone()),
                _ => None,
            });

            let (next, decision) = strategy.apply(current, request);
            self.entries.insert(
                state_key.clone(),
                Entry {
                    slot: Slot::Window(next),
                    expires_at: deadline_after(request.now_ms, strategy.state_ttl_ms(request)),
                },
            );

            trace!(
                key = %state_key,
                algorithm = %request.algorithm,
                allowed = decision.allowed,
                remaining = decision.remaining,
                "Evaluated local window"
            );
            decision
        })
    }

    /// Evict expired entries and idle locks. Returns the number of entries removed.
    pub fn sweep(&self) -> usize {
        let now = self.clock.now_millis();
        let before = self.entries.len();
        self.entries.retain(|_, entry| entry.expires_at > now);
        let removed = before.saturating_sub(self.entries.len());

        // A lock still referenced outside the map is held or about to be.
        self.locks
            .retain(|key, lock| Arc::strong_count(lock) > 1 || self.entries.contains_key(key));

        if removed > 0 {
            debug!(removed = removed, remaining = self.entries.len(), "Swept expired entries");
        }
        removed
    }

    /// Start the periodic sweeper on the current tokio runtime.
    ///
    /// The task holds only a weak reference and exits once the store is
    /// dropped. Dropping the returned handle stops it early.
    pub fn spawn_sweeper(self: &Arc<Self>, interval: Duration) -> SweeperHandle {
        let store: Weak<LocalStore> = Arc::downgrade(self);
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            // The first tick completes immediately.
            ticker.tick().await;
            loop {
                ticker.tick().await;
                match store.upgrade() {
                    Some(store) => {
                        store.sweep();
                    }
                    None => break,
                }
            }
        });
        SweeperHandle { handle }
    }
}

/// Aborts the sweeper task when dropped.
#[derive(Debug)]
pub struct SweeperHandle {
    handle: JoinHandle<()>,
}

impl SweeperHandle {
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for SweeperHandle {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

#[async_trait]
impl ProtectionStore for LocalStore {
    fn backend(&self) -> &'static str {
        "memory"
    }

    async fn get_or_create(
        &self,
        key: &ProtectionKey,
        candidate: ProtectionRecord,
        _ttl: Duration,
    ) -> StoreResult<(ProtectionRecord, bool)> {
        Ok(self.get_or_create_sync(key, candidate))
    }

    async fn compare_and_update(
        &self,
        key: &ProtectionKey,
        update: &RecordUpdate,
    ) -> StoreResult<Option<Updated>> {
        Ok(self.compare_and_update_sync(key, update))
    }

    async fn get(&self, key: &ProtectionKey) -> StoreResult<Option<ProtectionRecord>> {
        Ok(self.live_record(key.as_str(), self.clock.now_millis()))
    }

    async fn delete(&self, key: &ProtectionKey) -> StoreResult<bool> {
        Ok(self.with_key(key.as_str(), || self.entries.remove(key.as_str()).is_some()))
    }

    async fn exists(&self, key: &ProtectionKey) -> StoreResult<bool> {
        let now = self.clock.now_millis();
        Ok(self
            .entries
            .get(key.as_str())
            .is_some_and(|entry| entry.expires_at > now))
    }

    async fn count_by_prefix(&self, prefix: &str) -> StoreResult<usize> {
        let prefix = strip_pattern(prefix);
        let now = self.clock.now_millis();
        Ok(self
            .entries
            .iter()
            .filter(|entry| entry.key().starts_with(prefix) && entry.value().expires_at > now)
            .count())
    }

    async fn evaluate_window(
        &self,
        key: &ProtectionKey,
        request: &WindowRequest,
    ) -> StoreResult<RateLimitDecision> {
        Ok(self.evaluate_window_sync(key, request))
    }

    async fn ping(&self) -> StoreResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::MockClock;
    use crate::ratelimit::{Algorithm, AlgorithmParams, WindowRequest};
    use crate::store::RecordStatus;

    fn store_at(start_ms: i64) -> (Arc<LocalStore>, MockClock) {
        let clock = MockClock::new(start_ms);
        (Arc::new(LocalStore::with_clock(Arc::new(clock.clone()))), clock)
    }

    fn executing(now_ms: i64, ttl_secs: u64) -> ProtectionRecord {
        ProtectionRecord::new(
            Some(RecordStatus::Executing),
            now_ms,
            Duration::from_secs(ttl_secs),
        )
    }

    fn fixed_request(now_ms: i64) -> WindowRequest {
        let params = AlgorithmParams::default();
        WindowRequest {
            algorithm: Algorithm::FixedWindow,
            permits: 2,
            window_ms: 1_000,
            capacity: params.capacity.unwrap_or(2.0),
            rate: params.refill_rate.unwrap_or(2.0),
            now_ms,
            member: "m".to_string(),
            separator: ":".to_string(),
        }
    }

    #[tokio::test]
    async fn test_get_or_create_first_wins() {
        let (store, _clock) = store_at(0);
        let key = ProtectionKey::from("k");

        let (record, created) = store
            .get_or_create(&key, executing(0, 10), Duration::from_secs(10))
            .await
            .unwrap();
        assert!(created);
        assert_eq!(record.access_count, 0);

        let (record, created) = store
            .get_or_create(&key, executing(0, 99), Duration::from_secs(99))
            .await
            .unwrap();
        assert!(!created);
        assert_eq!(record.expires_at, 10_000);
        assert_eq!(record.access_count, 1);
    }

    #[tokio::test]
    async fn test_expired_record_is_replaced() {
        let (store, clock) = store_at(0);
        let key = ProtectionKey::from("k");
        store
            .get_or_create(&key, executing(0, 5), Duration::from_secs(5))
            .await
            .unwrap();

        clock.advance(Duration::from_secs(5));
        assert!(store.get(&key).await.unwrap().is_none());
        assert!(!store.exists(&key).await.unwrap());

        let (_, created) = store
            .get_or_create(&key, executing(5_000, 5), Duration::from_secs(5))
            .await
            .unwrap();
        assert!(created);
    }

    #[tokio::test]
    async fn test_compare_and_update_missing_key() {
        let (store, _clock) = store_at(0);
        let update = RecordUpdate::Complete { payload: None };
        let result = store
            .compare_and_update(&ProtectionKey::from("absent"), &update)
            .await
            .unwrap();
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn test_compare_and_update_is_monotonic() {
        let (store, _clock) = store_at(0);
        let key = ProtectionKey::from("k");
        store
            .get_or_create(&key, executing(0, 10), Duration::from_secs(10))
            .await
            .unwrap();

        let done = store
            .compare_and_update(&key, &RecordUpdate::Complete { payload: Some("ok".into()) })
            .await
            .unwrap()
            .unwrap();
        assert!(done.applied);

        let late = store
            .compare_and_update(&key, &RecordUpdate::Fail { error: "x".into() })
            .await
            .unwrap()
            .unwrap();
        assert!(!late.applied);
        assert_eq!(late.record.status, Some(RecordStatus::Success));
        assert_eq!(late.record.payload.as_deref(), Some("ok"));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_creation_single_winner() {
        let (store, _clock) = store_at(0);
        let key = ProtectionKey::from("race");

        let mut handles = Vec::new();
        for _ in 0..32 {
            let store = Arc::clone(&store);
            let key = key.clone();
            handles.push(tokio::spawn(async move {
                store
                    .get_or_create(&key, executing(0, 30), Duration::from_secs(30))
                    .await
                    .unwrap()
                    .1
            }));
        }

        let mut winners = 0;
        for handle in handles {
            if handle.await.unwrap() {
                winners += 1;
            }
        }
        assert_eq!(winners, 1);
    }

    #[tokio::test]
    async fn test_unbounded_lifetimes_clamp_instead_of_wrapping() {
        let (store, clock) = store_at(1_000);

        // A bucket that effectively never refills must keep its state.
        let mut request = fixed_request(1_000);
        request.algorithm = Algorithm::TokenBucket;
        request.capacity = 1.0;
        request.rate = 1e-20;
        let key = ProtectionKey::from("slow");
        assert!(store.evaluate_window(&key, &request).await.unwrap().allowed);
        let decision = store.evaluate_window(&key, &request).await.unwrap();
        assert!(!decision.allowed);
        assert_eq!(decision.reset_at_ms, i64::MAX);

        let forever = ProtectionRecord::new(None, 1_000, Duration::from_secs(u64::MAX));
        assert_eq!(forever.expires_at, i64::MAX);
        let key = ProtectionKey::from("forever");
        store
            .get_or_create(&key, forever, Duration::from_secs(u64::MAX))
            .await
            .unwrap();
        clock.advance(Duration::from_secs(10 * 365 * 24 * 3600));
        assert!(store.exists(&key).await.unwrap());
    }

    #[tokio::test]
    async fn test_count_by_prefix_and_delete() {
        let (store, _clock) = store_at(0);
        for id in ["a:1", "a:2", "b:1"] {
            store
                .get_or_create(&ProtectionKey::from(id), executing(0, 10), Duration::from_secs(10))
                .await
                .unwrap();
        }
        assert_eq!(store.count_by_prefix("a:*").await.unwrap(), 2);
        assert_eq!(store.count_by_prefix("b:").await.unwrap(), 1);

        assert!(store.delete(&ProtectionKey::from("a:1")).await.unwrap());
        assert!(!store.delete(&ProtectionKey::from("a:1")).await.unwrap());
        assert_eq!(store.count_by_prefix("a:").await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_window_state_is_per_key() {
        let (store, _clock) = store_at(0);
        let a = ProtectionKey::from("a");
        let b = ProtectionKey::from("b");

        assert!(store.evaluate_window(&a, &fixed_request(0)).await.unwrap().allowed);
        assert!(store.evaluate_window(&a, &fixed_request(0)).await.unwrap().allowed);
        assert!(!store.evaluate_window(&a, &fixed_request(0)).await.unwrap().allowed);
        assert!(store.evaluate_window(&b, &fixed_request(0)).await.unwrap().allowed);
    }

    #[tokio::test]
    async fn test_sweep_evicts_expired_entries_and_locks() {
        let (store, clock) = store_at(0);
        store
            .get_or_create(&ProtectionKey::from("short"), executing(0, 1), Duration::from_secs(1))
            .await
            .unwrap();
        store
            .get_or_create(&ProtectionKey::from("long"), executing(0, 60), Duration::from_secs(60))
            .await
            .unwrap();
        store
            .evaluate_window(&ProtectionKey::from("w"), &fixed_request(0))
            .await
            .unwrap();
        assert_eq!(store.len(), 3);
        assert_eq!(store.lock_count(), 3);

        clock.advance(Duration::from_secs(2));
        assert_eq!(store.sweep(), 2);
        assert_eq!(store.len(), 1);
        assert_eq!(store.lock_count(), 1);
    }

    #[tokio::test]
    async fn test_sweeper_task_stops_with_store() {
        let (store, _clock) = store_at(0);
        let handle = store.spawn_sweeper(Duration::from_millis(10));
        drop(store);
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert!(handle.is_finished());
    }
}
