use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use bytes::Bytes;

use crate::error::FetchError;
use crate::metrics;
use crate::storage::{Id, Store};
use crate::upstream::Origin;

pub mod singleflight;

use singleflight::Group;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CacheStatus {
    Hit,
    Miss,
}

impl CacheStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            CacheStatus::Hit => "HIT",
            CacheStatus::Miss => "MISS",
        }
    }
}

type FailureTable = Mutex<HashMap<Id, (Instant, FetchError)>>;

struct Inner {
    store: Arc<dyn Store>,
    origin: Arc<dyn Origin>,
    failure_cooldown: Duration,
    failures: FailureTable,
}

/// Fills the store from the origin, one fetch cycle per identifier at a time.
pub struct Coordinator {
    inner: Arc<Inner>,
    group: Group<Result<(), FetchError>>,
}

impl Coordinator {
    pub fn new(store: Arc<dyn Store>, origin: Arc<dyn Origin>, failure_cooldown: Duration) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                origin,
                failure_cooldown,
                failures: Mutex::new(HashMap::new()),
            }),
            group: Group::new(),
        }
    }

    pub fn store(&self) -> Arc<dyn Store> {
        Arc::clone(&self.inner.store)
    }

    /// Fetch cycles currently running.
    pub fn inflight(&self) -> usize {
        self.group.len()
    }

    /// Makes sure `id` is in the store, fetching `url` at most once across
    /// all concurrent callers for the same `id`.
    ///
    /// Every caller joined to one cycle gets that cycle's outcome. A cycle
    /// that fails leaves nothing behind unless a failure cooldown is
    /// configured, in which case the error is replayed until it expires.
    pub async fn ensure_cached(&self, id: &Id, url: &str) -> Result<CacheStatus, FetchError> {
        if self.inner.store.exists(id) {
            metrics::record_lookup(true);
            log::debug!("cache hit, id: {id}");
            return Ok(CacheStatus::Hit);
        }
        metrics::record_lookup(false);
        log::debug!("cache miss, id: {id}");

        if let Some(err) = self.inner.cooling_down(id) {
            log::debug!("cache fill cooling down, id: {id} error: {err}");
            return Err(err);
        }

        let inner = Arc::clone(&self.inner);
        let fill_id = id.clone();
        let fill_url = url.to_string();
        let outcome = self
            .group
            .do_call(id.as_str(), move || inner.fill(fill_id, fill_url))
            .await;
        if outcome.shared {
            log::debug!("joined in-flight fetch, id: {id}");
        }
        match outcome.result {
            Ok(result) => result.map(|()| CacheStatus::Miss),
            Err(panicked) => Err(FetchError::Internal(panicked.to_string())),
        }
    }

    /// `ensure_cached` followed by a read of the entry.
    pub async fn serve(&self, id: &Id, url: &str) -> Result<(Bytes, CacheStatus), FetchError> {
        let status = self.ensure_cached(id, url).await?;
        let store = self.store();
        let read_id = id.clone();
        let data = tokio::task::spawn_blocking(move || store.read(&read_id))
            .await
            .map_err(|err| FetchError::Internal(format!("cache read task: {err}")))??;
        Ok((data, status))
    }

    /// Warms every URL in the background; failures are only logged.
    pub fn prefetch(self: &Arc<Self>, urls: Vec<String>) -> usize {
        let count = urls.len();
        for url in urls {
            let coordinator = Arc::clone(self);
            tokio::spawn(async move {
                let id = Id::derive(&url);
                match coordinator.ensure_cached(&id, &url).await {
                    Ok(status) => log::debug!("prefetch done, id: {id} status: {}", status.as_str()),
                    Err(err) => log::warn!("prefetch failed, id: {id} url: {url} error: {err}"),
                }
            });
        }
        metrics::record_prefetch(count);
        count
    }
}

impl Inner {
    /// Body of one fetch cycle, run by the single-flight owner task.
    async fn fill(self: Arc<Self>, id: Id, url: String) -> Result<(), FetchError> {
        let _inflight = metrics::InflightGuard::new();
        // A cycle that finished between our miss and taking ownership has
        // already written the entry.
        if self.store.exists(&id) {
            log::info!("cache made by another request, id: {id}");
            return Ok(());
        }

        log::info!("making cache, id: {id} url: {url}");
        let result = self.fetch_and_store(&id, &url).await;
        match &result {
            Ok(()) => {
                metrics::record_fill("ok");
                log::info!("cache save succeed, id: {id}");
            }
            Err(err) => {
                metrics::record_fill(err.kind());
                log::warn!("make cache error, id: {id} error: {err}");
                self.remember_failure(&id, err);
            }
        }
        result
    }

    async fn fetch_and_store(&self, id: &Id, url: &str) -> Result<(), FetchError> {
        let data = self.origin.fetch(url).await?;
        if data.is_empty() {
            return Err(FetchError::EmptyBody);
        }
        let store = Arc::clone(&self.store);
        let write_id = id.clone();
        tokio::task::spawn_blocking(move || store.write(&write_id, &data))
            .await
            .map_err(|err| FetchError::Internal(format!("cache write task: {err}")))??;
        Ok(())
    }

    fn cooling_down(&self, id: &Id) -> Option<FetchError> {
        if self.failure_cooldown.is_zero() {
            return None;
        }
        let mut failures = lock(&self.failures);
        let (at, err) = failures.get(id)?;
        if at.elapsed() < self.failure_cooldown {
            return Some(err.clone());
        }
        failures.remove(id);
        None
    }

    fn remember_failure(&self, id: &Id, err: &FetchError) {
        if self.failure_cooldown.is_zero() {
            return;
        }
        let cooldown = self.failure_cooldown;
        let mut failures = lock(&self.failures);
        failures.retain(|_, (at, _)| at.elapsed() < cooldown);
        failures.insert(id.clone(), (Instant::now(), err.clone()));
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
