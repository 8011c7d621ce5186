//! Per-key call deduplication.
//!
//! The first caller for a key becomes the owner: its future is spawned as a
//! detached task, so it runs to completion even if every caller goes away.
//! Later callers for the same key join the running call and receive a clone
//! of its result. The entry is removed from the table before the result is
//! published, so a caller arriving afterwards always starts a new call.

use std::any::Any;
use std::collections::HashMap;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use futures::FutureExt;
use tokio::sync::Notify;

type Table<T> = Arc<Mutex<HashMap<String, Arc<Call<T>>>>>;

/// The owner's future panicked; its waiters get this instead of a value.
#[derive(Debug, Clone, thiserror::Error)]
#[error("call panicked: {0}")]
pub struct Panicked(pub String);

pub struct Outcome<T> {
    pub result: Result<T, Panicked>,
    /// False for the caller whose call created the entry.
    pub shared: bool,
}

pub struct Group<T> {
    inner: Table<T>,
}

impl<T: Clone + Send + Sync + 'static> Default for Group<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Clone + Send + Sync + 'static> Group<T> {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Number of calls currently in flight.
    pub fn len(&self) -> usize {
        lock(&self.inner).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub async fn do_call<F, Fut>(&self, key: &str, f: F) -> Outcome<T>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
    {
        let (call, shared) = {
            let mut map = lock(&self.inner);
            if let Some(call) = map.get(key) {
                (Arc::clone(call), true)
            } else {
                let call = Arc::new(Call::new());
                map.insert(key.to_string(), Arc::clone(&call));
                tokio::spawn(run_call(
                    Arc::clone(&self.inner),
                    key.to_string(),
                    Arc::clone(&call),
                    f,
                ));
                (call, false)
            }
        };

        Outcome {
            result: call.wait().await,
            shared,
        }
    }
}

struct Call<T> {
    notify: Notify,
    result: Mutex<Option<Result<T, Panicked>>>,
}

impl<T: Clone + Send + Sync + 'static> Call<T> {
    fn new() -> Self {
        Self {
            notify: Notify::new(),
            result: Mutex::new(None),
        }
    }

    async fn wait(&self) -> Result<T, Panicked> {
        loop {
            // Register before checking so a `set` in between still wakes us.
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let ready = lock(&self.result).clone();
            if let Some(val) = ready {
                return val;
            }
            notified.await;
        }
    }

    fn set(&self, val: Result<T, Panicked>) {
        *lock(&self.result) = Some(val);
        self.notify.notify_waiters();
    }
}

async fn run_call<T, F, Fut>(map: Table<T>, key: String, call: Arc<Call<T>>, f: F)
where
    T: Clone + Send + Sync + 'static,
    F: FnOnce() -> Fut,
    Fut: Future<Output = T>,
{
    let result = AssertUnwindSafe(async move { f().await })
        .catch_unwind()
        .await
        .map_err(|payload| Panicked(panic_message(payload.as_ref())));
    lock(&map).remove(&key);
    call.set(result);
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "unknown panic".to_string()
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
