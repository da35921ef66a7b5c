//! Deduplicating work queue.
//!
//! Each key is in one of these states:
//!
//! ```text
//! Idle --add--> Queued --next--> Running --done--> Idle
//!                                   |  ^
//!                                  add |
//!                                   v  |
//!                               RunningDirty --done--> Queued
//! ```
//!
//! Adding a key that is already queued is a no-op, and a key is never
//! handed out while a previous `next` for it has not been `done`. A burst of
//! notifications therefore collapses into at most one queued pass behind the
//! running one.

use std::collections::{HashMap, VecDeque};
use std::hash::Hash;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::Notify;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Queued,
    Running,
    /// Running, and added again since it was handed out
    RunningDirty,
}

#[derive(Debug)]
struct Inner<K> {
    ready: VecDeque<K>,
    states: HashMap<K, KeyState>,
    shutting_down: bool,
}

/// Work queue of reconcile keys
#[derive(Debug)]
pub struct WorkQueue<K> {
    inner: Mutex<Inner<K>>,
    notify: Notify,
}

impl<K> Default for WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Send + 'static,
{
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner {
                ready: VecDeque::new(),
                states: HashMap::new(),
                shutting_down: false,
            }),
            notify: Notify::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Inner<K>> {
        // Mutations never panic while holding the lock; recover from poisoning anyway
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Enqueue `key` unless it is already queued
    pub fn add(&self, key: K) {
        let mut inner = self.lock();
        if inner.shutting_down {
            return;
        }
        match inner.states.get(&key).copied() {
            None => {
                inner.states.insert(key.clone(), KeyState::Queued);
                inner.ready.push_back(key);
                drop(inner);
                self.notify.notify_one();
            }
            Some(KeyState::Running) => {
                inner.states.insert(key, KeyState::RunningDirty);
            }
            Some(KeyState::Queued) | Some(KeyState::RunningDirty) => {}
        }
    }

    /// Enqueue `key` once `delay` has elapsed
    pub fn add_after(self: &Arc<Self>, key: K, delay: Duration) {
        let queue = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            queue.add(key);
        });
    }

    /// Wait for the next key; `None` once the queue is shut down
    ///
    /// The key stays `Running` until `done` is called for it.
    pub async fn next(&self) -> Option<K> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent add cannot be missed
            notified.as_mut().enable();
            {
                let mut inner = self.lock();
                if inner.shutting_down {
                    return None;
                }
                if let Some(key) = inner.ready.pop_front() {
                    inner.states.insert(key.clone(), KeyState::Running);
                    let more = !inner.ready.is_empty();
                    drop(inner);
                    if more {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
            }
            notified.await;
        }
    }

    /// Mark a key handed out by `next` as finished
    ///
    /// A key added while running is queued again.
    pub fn done(&self, key: &K) {
        let mut inner = self.lock();
        match inner.states.get(key).copied() {
            Some(KeyState::RunningDirty) if !inner.shutting_down => {
                inner.states.insert(key.clone(), KeyState::Queued);
                inner.ready.push_back(key.clone());
                drop(inner);
                self.notify.notify_one();
            }
            Some(KeyState::Running) | Some(KeyState::RunningDirty) => {
                inner.states.remove(key);
            }
            Some(KeyState::Queued) | None => {}
        }
    }

    /// Stop handing out keys; pending and future adds are dropped
    pub fn shut_down(&self) {
        let mut inner = self.lock();
        inner.shutting_down = true;
        inner.ready.clear();
        inner.states.retain(|_, state| *state != KeyState::Queued);
        drop(inner);
        self.notify.notify_waiters();
    }

    /// Number of keys waiting to be handed out
    pub fn len(&self) -> usize {
        self.lock().ready.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use tokio::time::Instant;

    #[tokio::test]
    async fn test_add_deduplicates() {
        let queue = WorkQueue::new();
        queue.add("node-1");
        queue.add("node-1");
        queue.add("node-1");
        queue.add("node-2");

        assert_eq!(queue.len(), 2);
        assert_eq!(queue.next().await, Some("node-1"));
        assert_eq!(queue.next().await, Some("node-2"));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_add_while_running_requeues_once() {
        let queue = WorkQueue::new();
        queue.add("node-1");
        let key = queue.next().await.unwrap();

        // Running: not handed out again until done
        queue.add("node-1");
        queue.add("node-1");
        assert!(queue.is_empty());

        queue.done(&key);
        assert_eq!(queue.len(), 1);
        assert_eq!(queue.next().await, Some("node-1"));
        queue.done(&"node-1");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn test_done_without_add_goes_idle() {
        let queue = WorkQueue::new();
        queue.add("node-1");
        let key = queue.next().await.unwrap();
        queue.done(&key);

        assert!(queue.is_empty());
        queue.add("node-1");
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test]
    async fn test_shut_down_wakes_waiters() {
        let queue = Arc::new(WorkQueue::<&str>::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;

        queue.shut_down();
        assert_eq!(waiter.await.unwrap(), None);

        queue.add("node-1");
        assert!(queue.is_empty());
        assert_eq!(queue.next().await, None);
    }

    #[tokio::test]
    async fn test_next_waits_for_add() {
        let queue = Arc::new(WorkQueue::new());
        let waiter = {
            let queue = queue.clone();
            tokio::spawn(async move { queue.next().await })
        };
        tokio::task::yield_now().await;

        queue.add("node-1");
        assert_eq!(waiter.await.unwrap(), Some("node-1"));
    }

    #[tokio::test(start_paused = true)]
    async fn test_add_after_delays() {
        let queue = Arc::new(WorkQueue::new());
        let start = Instant::now();

        queue.add_after("node-1", Duration::from_secs(5));
        assert!(queue.is_empty());

        assert_eq!(queue.next().await, Some("node-1"));
        assert!(start.elapsed() >= Duration::from_secs(5));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_at_most_one_running_per_key() {
        let queue = Arc::new(WorkQueue::new());
        let active = Arc::new(AtomicUsize::new(0));
        let max_active = Arc::new(AtomicUsize::new(0));
        let passes = Arc::new(AtomicUsize::new(0));

        let mut workers = Vec::new();
        for _ in 0..4 {
            let queue = queue.clone();
            let active = active.clone();
            let max_active = max_active.clone();
            let passes = passes.clone();
            workers.push(tokio::spawn(async move {
                while let Some(key) = queue.next().await {
                    let now = active.fetch_add(1, Ordering::SeqCst) + 1;
                    max_active.fetch_max(now, Ordering::SeqCst);
                    tokio::time::sleep(Duration::from_millis(2)).await;
                    active.fetch_sub(1, Ordering::SeqCst);
                    passes.fetch_add(1, Ordering::SeqCst);
                    queue.done(&key);
                }
            }));
        }

        for _ in 0..50 {
            queue.add("node-1");
            tokio::time::sleep(Duration::from_micros(200)).await;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.shut_down();
        for worker in workers {
            worker.await.unwrap();
        }

        assert_eq!(max_active.load(Ordering::SeqCst), 1);
        // Notifications collapsed into fewer passes
        let passes = passes.load(Ordering::SeqCst);
        assert!(passes >= 1 && passes < 50, "passes = {}", passes);
    }
}
