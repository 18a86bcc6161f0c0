use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::time::interval;
use tracing::{info, instrument, warn};

use crate::config::PoolConfig;
use crate::error::Result;
use crate::models::PoolEntry;
use crate::store::Store;

struct PoolState {
    fifo: VecDeque<PoolEntry>,
    fail_set: HashSet<i64>,
    usage_counters: HashMap<i64, u64>,
    pending_error_increments: HashMap<i64, u32>,
    pending_success_marks: HashSet<i64>,
    last_refresh: Option<Instant>,
    last_flush: Option<Instant>,
}

impl PoolState {
    fn new() -> Self {
        PoolState {
            fifo: VecDeque::new(),
            fail_set: HashSet::new(),
            usage_counters: HashMap::new(),
            pending_error_increments: HashMap::new(),
            pending_success_marks: HashSet::new(),
            last_refresh: None,
            last_flush: None,
        }
    }
}

/// Snapshot of the Pool's in-memory state for observability endpoints.
#[derive(Debug, Clone)]
pub struct PoolSnapshot {
    pub size: usize,
    pub fail_set_size: usize,
    pub pending_errors: usize,
    pub pending_successes: usize,
}

/// Bounded, self-refreshing cache of proxy endpoints drawn from the Store.
pub struct Pool {
    state: Mutex<PoolState>,
    store: Arc<Store>,
    config: PoolConfig,
}

impl Pool {
    pub fn new(store: Arc<Store>, config: PoolConfig) -> Self {
        Pool {
            state: Mutex::new(PoolState::new()),
            store,
            config,
        }
    }

    pub fn snapshot(&self) -> PoolSnapshot {
        let state = self.state.lock();
        PoolSnapshot {
            size: state.fifo.len(),
            fail_set_size: state.fail_set.len(),
            pending_errors: state.pending_error_increments.len(),
            pending_successes: state.pending_success_marks.len(),
        }
    }

    /// Rotate the FIFO looking for an entry excluded neither by the caller's
    /// per-request set nor by the pool-wide fail-set. Entries skipped for the
    /// fail-set reason are dropped, not rotated back.
    fn try_acquire(&self, exclude: &HashSet<i64>) -> Option<PoolEntry> {
        let mut state = self.state.lock();
        let max_attempts = state.fifo.len().saturating_add(10).min(50);

        for _ in 0..max_attempts {
            let entry = state.fifo.pop_front()?;

            if state.fail_set.contains(&entry.id) {
                continue;
            }
            if exclude.contains(&entry.id) {
                state.fifo.push_back(entry);
                continue;
            }

            *state.usage_counters.entry(entry.id).or_insert(0) += 1;
            return Some(entry);
        }
        None
    }

    #[instrument(skip(self, exclude))]
    pub async fn acquire(&self, exclude: &HashSet<i64>) -> Option<PoolEntry> {
        if let Some(entry) = self.try_acquire(exclude) {
            return Some(entry);
        }

        if let Err(e) = self.refresh().await {
            warn!(error = %e, "forced refresh during acquire failed");
            return None;
        }

        self.try_acquire(exclude)
    }

    pub fn release(&self, entry: PoolEntry, success: bool) {
        let mut state = self.state.lock();
        if success {
            state.pending_success_marks.insert(entry.id);
            state.fifo.push_back(entry);
        } else {
            state.fail_set.insert(entry.id);
            *state.pending_error_increments.entry(entry.id).or_insert(0) += 1;
        }
    }

    pub fn reset_fail_set(&self) -> usize {
        let mut state = self.state.lock();
        let n = state.fail_set.len();
        state.fail_set.clear();
        n
    }

    pub async fn force_refresh(&self) -> Result<()> {
        self.refresh().await
    }

    /// One refresh pass, with the single documented retry: if the repopulated
    /// pool is still below minimum and the fail-set is non-empty, clear it
    /// and refresh once more.
    #[instrument(skip(self))]
    async fn refresh(&self) -> Result<()> {
        for attempt in 0..2 {
            let fetched = self.store.fetch_active(self.config.proxy_pool_size as i64).await?;

            let (below_min, fail_set_nonempty) = {
                let mut state = self.state.lock();
                state.fifo.clear();
                for proxy in &fetched {
                    if !state.fail_set.contains(&proxy.id) {
                        state.fifo.push_back(proxy.to_pool_entry());
                    }
                }
                state.last_refresh = Some(Instant::now());
                (
                    state.fifo.len() < self.config.min_proxy_pool_size,
                    !state.fail_set.is_empty(),
                )
            };

            info!(pool_size = fetched.len(), attempt, "pool refreshed");

            if attempt == 0 && below_min && fail_set_nonempty {
                self.state.lock().fail_set.clear();
                continue;
            }
            break;
        }
        Ok(())
    }

    /// Flush pending error increments and success marks to the Store.
    #[instrument(skip(self))]
    async fn flush_writebacks(&self) {
        let (errors, successes) = {
            let mut state = self.state.lock();
            let errors = std::mem::take(&mut state.pending_error_increments);
            let successes = std::mem::take(&mut state.pending_success_marks);
            state.last_flush = Some(Instant::now());
            (errors, successes)
        };

        for (id, count) in errors {
            for _ in 0..count {
                if let Err(e) = self.store.increment_error(id).await {
                    warn!(proxy_id = id, error = %e, "writeback increment_error failed, dropping");
                }
            }
        }

        for id in successes {
            if let Err(e) = self.store.mark_last_used(id).await {
                warn!(proxy_id = id, error = %e, "writeback mark_last_used failed, dropping");
            }
        }
    }

    /// Background maintenance: periodic refresh, batched writeback, and a
    /// health-check tick that triggers an early refresh if the pool has
    /// fallen below minimum. Drains pending writebacks before returning.
    pub async fn run(self: Arc<Self>, mut shutdown: watch::Receiver<bool>) {
        let mut refresh_tick = interval(self.config.refresh_interval);
        let mut batch_tick = interval(self.config.batch_update_interval);
        let mut health_tick = interval(Duration::from_secs(30));

        loop {
            tokio::select! {
                _ = refresh_tick.tick() => {
                    if let Err(e) = self.refresh().await {
                        warn!(error = %e, "periodic pool refresh failed");
                    }
                }
                _ = batch_tick.tick() => {
                    self.flush_writebacks().await;
                }
                _ = health_tick.tick() => {
                    let below_min = self.state.lock().fifo.len() < self.config.min_proxy_pool_size;
                    if below_min {
                        if let Err(e) = self.refresh().await {
                            warn!(error = %e, "health-check refresh failed");
                        }
                    }
                }
                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        info!("pool shutting down, draining pending writebacks");
        self.flush_writebacks().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CircuitBreakerConfig;
    use crate::models::{Proxy, ProxyScheme};
    use crate::store::{ConnectionCheck, ProxyStoreBackend, StoreStats, TableProbe};
    use async_trait::async_trait;
    use parking_lot::Mutex as PMutex;

    fn proxy(id: i64) -> Proxy {
        Proxy {
            id,
            address: "10.0.0.1".to_string(),
            port: 8080,
            scheme: "http".to_string(),
            username: None,
            password: None,
            status: "active".to_string(),
            error_count: 0,
            success_count: 0,
            last_used: None,
            last_tested: None,
            response_time_ms: None,
            country: None,
            created_at: chrono::Utc::now(),
            updated_at: chrono::Utc::now(),
        }
    }

    struct FakeBackend {
        proxies: PMutex<Vec<Proxy>>,
        increment_calls: PMutex<HashMap<i64, u32>>,
        mark_used_calls: PMutex<HashSet<i64>>,
    }

    impl FakeBackend {
        fn new(proxies: Vec<Proxy>) -> Self {
            FakeBackend {
                proxies: PMutex::new(proxies),
                increment_calls: PMutex::new(HashMap::new()),
                mark_used_calls: PMutex::new(HashSet::new()),
            }
        }
    }

    #[async_trait]
    impl ProxyStoreBackend for FakeBackend {
        async fn test_connection(&self) -> Result<ConnectionCheck> {
            Ok(ConnectionCheck {
                ok: true,
                message: "ok".into(),
            })
        }
        async fn probe_proxies_table(&self) -> Result<TableProbe> {
            Ok(TableProbe {
                ok: true,
                message: "ok".into(),
                active_count: self.proxies.lock().len() as i64,
            })
        }
        async fn probe_schema_features(&self) -> Result<()> {
            Ok(())
        }
        async fn fetch_active(&self, limit: i64) -> Result<Vec<Proxy>> {
            Ok(self.proxies.lock().iter().take(limit as usize).cloned().collect())
        }
        async fn increment_error(&self, id: i64) -> Result<(i32, String)> {
            *self.increment_calls.lock().entry(id).or_insert(0) += 1;
            Ok((1, "active".to_string()))
        }
        async fn mark_last_used(&self, id: i64) -> Result<()> {
            self.mark_used_calls.lock().insert(id);
            Ok(())
        }
        async fn reset_errors(&self, _max_error_count: i32) -> Result<u64> {
            Ok(0)
        }
        async fn stats(&self) -> Result<StoreStats> {
            Ok(StoreStats::default())
        }
    }

    fn test_pool(proxies: Vec<Proxy>) -> (Pool, Arc<FakeBackend>) {
        let backend = Arc::new(FakeBackend::new(proxies));
        let store = Arc::new(Store::new(
            backend.clone(),
            CircuitBreakerConfig {
                failure_threshold: 5,
                recovery_timeout: Duration::from_secs(60),
            },
        ));
        let pool = Pool::new(
            store,
            PoolConfig {
                proxy_pool_size: 50,
                min_proxy_pool_size: 10,
                refresh_interval: Duration::from_secs(300),
                batch_update_interval: Duration::from_secs(60),
            },
        );
        (pool, backend)
    }

    #[tokio::test]
    async fn acquire_excludes_request_scoped_ids_and_reenqueues_them() {
        let (pool, _backend) = test_pool(vec![proxy(1), proxy(2), proxy(3)]);
        pool.force_refresh().await.unwrap();

        let mut exclude = HashSet::new();
        exclude.insert(1);

        let entry = pool.acquire(&exclude).await.unwrap();
        assert_ne!(entry.id, 1);
        assert!(pool.snapshot().size >= 1);
    }

    #[tokio::test]
    async fn acquire_never_returns_failset_member_and_drops_it() {
        let (pool, _backend) = test_pool(vec![proxy(1), proxy(2)]);
        pool.force_refresh().await.unwrap();

        pool.release(PoolEntry { id: 1, connect_url: "x".into(), scheme: ProxyScheme::Http }, false);

        let before = pool.snapshot().size;
        let entry = pool.acquire(&HashSet::new()).await.unwrap();
        assert_eq!(entry.id, 2);
        assert!(pool.snapshot().size <= before);

        // id 1 must never come back from acquire while in the fail-set.
        for _ in 0..5 {
            if let Some(e) = pool.acquire(&HashSet::new()).await {
                assert_ne!(e.id, 1);
                pool.release(e, true);
            }
        }
    }

    #[tokio::test]
    async fn release_failure_adds_to_failset_and_removes_from_fifo() {
        let (pool, _backend) = test_pool(vec![proxy(1)]);
        pool.force_refresh().await.unwrap();

        let entry = pool.acquire(&HashSet::new()).await.unwrap();
        pool.release(entry, false);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.fail_set_size, 1);
        assert_eq!(snapshot.size, 0);
    }

    #[tokio::test]
    async fn release_success_reenqueues_and_tracks_pending_mark() {
        let (pool, _backend) = test_pool(vec![proxy(1)]);
        pool.force_refresh().await.unwrap();

        let entry = pool.acquire(&HashSet::new()).await.unwrap();
        pool.release(entry, true);

        let snapshot = pool.snapshot();
        assert_eq!(snapshot.size, 1);
        assert_eq!(snapshot.pending_successes, 1);
    }

    #[tokio::test]
    async fn acquire_on_empty_pool_forces_refresh() {
        let (pool, _backend) = test_pool(vec![proxy(1), proxy(2)]);
        // No force_refresh() called yet -> pool starts empty.
        let entry = pool.acquire(&HashSet::new()).await;
        assert!(entry.is_some());
    }

    #[tokio::test]
    async fn reset_fail_set_returns_count_and_is_idempotent() {
        let (pool, _backend) = test_pool(vec![proxy(1), proxy(2)]);
        pool.force_refresh().await.unwrap();
        pool.release(PoolEntry { id: 1, connect_url: "x".into(), scheme: ProxyScheme::Http }, false);
        pool.release(PoolEntry { id: 2, connect_url: "y".into(), scheme: ProxyScheme::Http }, false);

        assert_eq!(pool.reset_fail_set(), 2);
        assert_eq!(pool.reset_fail_set(), 0);
    }

    #[tokio::test]
    async fn exclude_ids_covering_whole_pool_returns_none() {
        let (pool, _backend) = test_pool(vec![proxy(1), proxy(2)]);
        pool.force_refresh().await.unwrap();

        let mut exclude = HashSet::new();
        exclude.insert(1);
        exclude.insert(2);

        assert!(pool.acquire(&exclude).await.is_none());
    }
}
