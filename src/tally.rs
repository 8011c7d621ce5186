//! Per-session success/failure counts behind `/fail2refresh.js`.
//!
//! A page embeds the script with its session token; the script request
//! blocks until enough images failed (tell the page to reload) or enough
//! succeeded (nothing to do). Answering clears the session.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tokio::sync::Notify;

use crate::config;

/// Sessions untouched for this long are dropped on the next update.
const SESSION_IDLE: Duration = Duration::from_secs(10 * 60);
const PRUNE_INTERVAL: Duration = Duration::from_secs(60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verdict {
    Reload,
    Normal,
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Counts {
    pub failed: u64,
    pub succeeded: u64,
}

struct Session {
    counts: Mutex<Counts>,
    touched: Mutex<Instant>,
    notify: Notify,
}

impl Session {
    fn new() -> Self {
        Self {
            counts: Mutex::new(Counts::default()),
            touched: Mutex::new(Instant::now()),
            notify: Notify::new(),
        }
    }
}

pub struct SessionTally {
    threshold: u64,
    poll_timeout: Duration,
    sessions: Mutex<HashMap<String, Arc<Session>>>,
    last_prune: Mutex<Instant>,
}

impl SessionTally {
    pub fn new(cfg: &config::Tally) -> Self {
        Self {
            threshold: cfg.threshold,
            poll_timeout: cfg.poll_timeout,
            sessions: Mutex::new(HashMap::new()),
            last_prune: Mutex::new(Instant::now()),
        }
    }

    pub fn record(&self, sid: &str, ok: bool) {
        if sid.is_empty() {
            return;
        }
        self.prune_idle();
        let session = self.session(sid);
        {
            let mut counts = lock(&session.counts);
            if ok {
                counts.succeeded += 1;
            } else {
                counts.failed += 1;
            }
        }
        *lock(&session.touched) = Instant::now();
        session.notify.notify_waiters();
    }

    pub fn counts(&self, sid: &str) -> Option<Counts> {
        let sessions = lock(&self.sessions);
        sessions.get(sid).map(|session| *lock(&session.counts))
    }

    /// Waits until one counter passes the threshold or the poll timeout
    /// elapses, then forgets the session.
    pub async fn wait_verdict(&self, sid: &str) -> Verdict {
        let session = self.session(sid);
        *lock(&session.touched) = Instant::now();
        let deadline = tokio::time::Instant::now() + self.poll_timeout;
        let verdict = loop {
            let notified = session.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let counts = *lock(&session.counts);
            if let Some(verdict) = self.judge(counts) {
                break verdict;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                break Verdict::Normal;
            }
        };
        lock(&self.sessions).remove(sid);
        verdict
    }

    fn judge(&self, counts: Counts) -> Option<Verdict> {
        if counts.failed > self.threshold {
            Some(Verdict::Reload)
        } else if counts.succeeded > self.threshold {
            Some(Verdict::Normal)
        } else {
            None
        }
    }

    fn session(&self, sid: &str) -> Arc<Session> {
        let mut sessions = lock(&self.sessions);
        Arc::clone(
            sessions
                .entry(sid.to_string())
                .or_insert_with(|| Arc::new(Session::new())),
        )
    }

    fn prune_idle(&self) {
        {
            let mut last = lock(&self.last_prune);
            if last.elapsed() < PRUNE_INTERVAL {
                return;
            }
            *last = Instant::now();
        }
        lock(&self.sessions).retain(|_, session| lock(&session.touched).elapsed() < SESSION_IDLE);
    }
}

fn lock<V>(mutex: &Mutex<V>) -> MutexGuard<'_, V> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}
