//! De-duplicating work queue with per-key exclusion and exponential retry backoff.

use std::collections::VecDeque;
use std::hash::Hash;
use std::sync::Mutex;
use std::time::Duration;

use metrics::gauge;
use rand::Rng;
use rustc_hash::{FxHashMap, FxHashSet};
use tokio::sync::Notify;
use tokio::time::Instant;
use tracing::warn;

/// Retry delays: `base * 2^(n-1)` plus up to a quarter of jitter, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct Backoff {
    pub base: Duration,
    pub max: Duration,
}

impl Backoff {
    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(30);
        let raw = self.base.saturating_mul(1u32 << exp).min(self.max);
        let quarter = raw.as_millis() as u64 / 4;
        let jitter = if quarter == 0 { 0 } else { rand::thread_rng().gen_range(0..=quarter) };
        (raw + Duration::from_millis(jitter)).min(self.max)
    }
}

struct Inner<K> {
    ready: VecDeque<K>,
    queued: FxHashSet<K>,
    delayed: FxHashMap<K, Instant>,
    processing: FxHashSet<K>,
    dirty: FxHashSet<K>,
    failures: FxHashMap<K, u32>,
    warn_at: usize,
    over: bool,
    closed: bool,
}

impl<K: Clone + Eq + Hash> Inner<K> {
    fn enqueue(&mut self, key: K) {
        if self.processing.contains(&key) {
            self.dirty.insert(key);
            return;
        }
        if self.queued.contains(&key) {
            return;
        }
        self.delayed.remove(&key);
        self.queued.insert(key.clone());
        self.ready.push_back(key);
        if self.ready.len() > self.warn_at && !self.over {
            self.over = true;
            warn!(depth = self.ready.len(), threshold = self.warn_at, "work queue backlog above threshold");
        } else if self.ready.len() <= self.warn_at / 2 {
            self.over = false;
        }
    }

    fn promote(&mut self, now: Instant) -> Option<Instant> {
        let due: Vec<K> = self.delayed.iter().filter(|(_, at)| **at <= now).map(|(k, _)| k.clone()).collect();
        for k in due {
            self.delayed.remove(&k);
            self.enqueue(k);
        }
        self.delayed.values().min().copied()
    }

    fn depth(&self) -> usize {
        self.ready.len() + self.delayed.len()
    }
}

/// A key is handed to at most one worker at a time; keys added while being processed are
/// queued again once the worker calls [`WorkQueue::done`]. Deduplication keeps at most one
/// ready entry per key, so the queue never drops work; `warn_at` only controls when a
/// backlog is logged.
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
    backoff: Backoff,
}

impl<K: Clone + Eq + Hash + std::fmt::Debug> WorkQueue<K> {
    pub fn new(warn_at: usize, backoff: Backoff) -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                queued: FxHashSet::default(),
                delayed: FxHashMap::default(),
                processing: FxHashSet::default(),
                dirty: FxHashSet::default(),
                failures: FxHashMap::default(),
                warn_at: warn_at.max(1),
                over: false,
                closed: false,
            }),
            notify: Notify::new(),
            backoff,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Inner<K>> {
        self.inner.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn add(&self, key: K) {
        {
            let mut g = self.lock();
            if g.closed {
                return;
            }
            g.enqueue(key);
            gauge!("queue_depth", g.depth() as f64);
        }
        self.notify.notify_waiters();
    }

    /// Wait for the next ready key; `None` once the queue is shut down.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();
            let wake_at = {
                let mut g = self.lock();
                if g.closed {
                    return None;
                }
                let wake_at = g.promote(Instant::now());
                if let Some(key) = g.ready.pop_front() {
                    g.queued.remove(&key);
                    g.processing.insert(key.clone());
                    gauge!("queue_depth", g.depth() as f64);
                    return Some(key);
                }
                wake_at
            };
            match wake_at {
                Some(at) => {
                    tokio::select! {
                        _ = &mut notified => {}
                        _ = tokio::time::sleep_until(at) => {}
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Release `key` after a successful or terminal reconcile.
    pub fn done(&self, key: &K) {
        let requeue = {
            let mut g = self.lock();
            g.failures.remove(key);
            g.processing.remove(key);
            if g.dirty.remove(key) {
                g.enqueue(key.clone());
                true
            } else {
                false
            }
        };
        if requeue {
            self.notify.notify_waiters();
        }
    }

    /// Release `key` and schedule it again after the backoff for its failure count.
    pub fn retry(&self, key: &K) -> Duration {
        let delay = {
            let mut g = self.lock();
            let n = {
                let n = g.failures.entry(key.clone()).or_insert(0);
                *n += 1;
                *n
            };
            let delay = self.backoff.delay(n);
            g.processing.remove(key);
            g.dirty.remove(key);
            if !g.queued.contains(key) {
                g.delayed.insert(key.clone(), Instant::now() + delay);
            }
            gauge!("queue_depth", g.depth() as f64);
            delay
        };
        self.notify.notify_waiters();
        delay
    }

    pub fn failures(&self, key: &K) -> u32 {
        self.lock().failures.get(key).copied().unwrap_or(0)
    }

    pub fn len(&self) -> usize {
        self.lock().depth()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Keys waiting plus keys being processed.
    pub fn in_flight(&self) -> usize {
        let g = self.lock();
        g.depth() + g.processing.len()
    }

    pub fn shutdown(&self) {
        self.lock().closed = true;
        self.notify.notify_waiters();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue(cap: usize) -> WorkQueue<&'static str> {
        WorkQueue::new(cap, Backoff { base: Duration::from_millis(10), max: Duration::from_millis(80) })
    }

    #[test]
    fn backoff_doubles_and_caps() {
        let b = Backoff { base: Duration::from_millis(50), max: Duration::from_secs(300) };
        let first = b.delay(1);
        assert!(first >= Duration::from_millis(50) && first <= Duration::from_millis(62));
        let third = b.delay(3);
        assert!(third >= Duration::from_millis(200) && third <= Duration::from_millis(250));
        assert_eq!(b.delay(40), Duration::from_secs(300));
    }

    #[tokio::test]
    async fn duplicates_collapse() {
        let q = queue(8);
        q.add("a");
        q.add("b");
        q.add("a");
        assert_eq!(q.len(), 2);
        assert_eq!(q.next().await, Some("a"));
        assert_eq!(q.next().await, Some("b"));
        assert!(q.is_empty());
    }

    #[tokio::test]
    async fn key_added_while_processing_comes_back_after_done() {
        let q = queue(8);
        q.add("a");
        assert_eq!(q.next().await, Some("a"));
        q.add("a");
        assert!(q.is_empty());
        q.done(&"a");
        assert_eq!(q.len(), 1);
        assert_eq!(q.next().await, Some("a"));
    }

    #[tokio::test]
    async fn backlog_past_threshold_keeps_every_key() {
        let q = queue(2);
        for k in ["a", "b", "c", "d", "b"] {
            q.add(k);
        }
        assert_eq!(q.len(), 4);
        let mut got = Vec::new();
        while !q.is_empty() {
            let k = q.next().await.unwrap();
            q.done(&k);
            got.push(k);
        }
        assert_eq!(got, vec!["a", "b", "c", "d"]);
    }

    #[tokio::test(start_paused = true)]
    async fn retry_waits_for_backoff() {
        let q = queue(8);
        q.add("a");
        let k = q.next().await.unwrap();
        let delay = q.retry(&k);
        assert_eq!(q.failures(&"a"), 1);
        let t0 = Instant::now();
        assert_eq!(q.next().await, Some("a"));
        assert!(t0.elapsed() >= delay);
        q.done(&"a");
        assert_eq!(q.failures(&"a"), 0);
    }

    #[tokio::test]
    async fn shutdown_releases_waiters() {
        let q = std::sync::Arc::new(queue(8));
        let waiter = {
            let q = q.clone();
            tokio::spawn(async move { q.next().await })
        };
        tokio::task::yield_now().await;
        q.shutdown();
        assert_eq!(waiter.await.unwrap(), None);
    }
}
