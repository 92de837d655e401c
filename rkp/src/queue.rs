use log::debug;
use std::cmp::Ordering;
use std::collections::{BinaryHeap, HashMap, HashSet, VecDeque};
use std::fmt::Debug;
use std::hash::Hash;
use tokio::sync::{Mutex, Notify};
use tokio::time::{Duration, Instant, sleep_until};
use tokio_util::sync::CancellationToken;

/// Per-item retry delay: `base * 2^(failures - 1)`, capped at `max`.
#[derive(Debug, Clone, Copy)]
pub struct ExponentialBackoff {
    base: Duration,
    max: Duration,
}

impl ExponentialBackoff {
    pub fn new(base: Duration, max: Duration) -> Self {
        Self {
            base,
            max: max.max(base),
        }
    }

    pub fn delay(&self, failures: u32) -> Duration {
        let exp = failures.saturating_sub(1).min(31);
        self.base
            .checked_mul(1u32 << exp)
            .map_or(self.max, |d| d.min(self.max))
    }
}

impl Default for ExponentialBackoff {
    fn default() -> Self {
        Self::new(Duration::from_millis(500), Duration::from_secs(300))
    }
}

struct Delayed<K> {
    at: Instant,
    seq: u64,
    key: K,
}

impl<K> PartialEq for Delayed<K> {
    fn eq(&self, other: &Self) -> bool {
        self.at == other.at && self.seq == other.seq
    }
}

impl<K> Eq for Delayed<K> {}

impl<K> PartialOrd for Delayed<K> {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// min-heap on deadline
impl<K> Ord for Delayed<K> {
    fn cmp(&self, other: &Self) -> Ordering {
        other
            .at
            .cmp(&self.at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

struct QueueState<K> {
    queue: VecDeque<K>,
    /// Items waiting to be handed out, including re-triggers of in-flight ones.
    dirty: HashSet<K>,
    processing: HashSet<K>,
    waiting: BinaryHeap<Delayed<K>>,
    /// Earliest deadline per delayed item; heap entries not matching are stale.
    deadlines: HashMap<K, Instant>,
    failures: HashMap<K, u32>,
    seq: u64,
}

impl<K: Clone + Eq + Hash> QueueState<K> {
    /// Returns true if the item became ready for a worker.
    fn add(&mut self, key: K) -> bool {
        if self.dirty.contains(&key) {
            return false;
        }
        self.dirty.insert(key.clone());
        if self.processing.contains(&key) {
            // handed out again by done()
            return false;
        }
        self.queue.push_back(key);
        true
    }

    fn promote_due(&mut self, now: Instant) {
        while let Some(head) = self.waiting.peek() {
            if head.at > now {
                break;
            }
            let Some(Delayed { at, key, .. }) = self.waiting.pop() else {
                break;
            };
            if self.deadlines.get(&key) == Some(&at) {
                self.deadlines.remove(&key);
                self.add(key);
            }
        }
    }

    fn next_deadline(&self) -> Option<Instant> {
        self.waiting.peek().map(|d| d.at)
    }
}

/// Deduplicating work queue with delayed and rate limited re-adds.
///
/// An item is handed to at most one worker at a time. Adding an item that is
/// already queued is a no-op; adding one that is in flight marks it for a
/// single re-delivery once the worker calls [`WorkQueue::done`].
pub struct WorkQueue<K> {
    state: Mutex<QueueState<K>>,
    notify: Notify,
    shutdown: CancellationToken,
    backoff: ExponentialBackoff,
}

impl<K> WorkQueue<K>
where
    K: Clone + Eq + Hash + Debug + Send + Sync,
{
    pub fn new(backoff: ExponentialBackoff) -> Self {
        Self {
            state: Mutex::new(QueueState {
                queue: VecDeque::new(),
                dirty: HashSet::new(),
                processing: HashSet::new(),
                waiting: BinaryHeap::new(),
                deadlines: HashMap::new(),
                failures: HashMap::new(),
                seq: 0,
            }),
            notify: Notify::new(),
            shutdown: CancellationToken::new(),
            backoff,
        }
    }

    pub async fn enqueue(&self, key: K) {
        if self.shutdown.is_cancelled() {
            return;
        }
        let mut state = self.state.lock().await;
        if state.add(key.clone()) {
            self.notify.notify_one();
        } else {
            debug!("Coalesced enqueue of {key:?}");
        }
    }

    /// Adds `key` once `delay` has passed. If it is already waiting with an
    /// earlier deadline, that deadline wins.
    pub async fn enqueue_after(&self, key: K, delay: Duration) {
        if delay.is_zero() {
            return self.enqueue(key).await;
        }
        if self.shutdown.is_cancelled() {
            return;
        }
        let at = Instant::now() + delay;
        let mut state = self.state.lock().await;
        if state.deadlines.get(&key).is_some_and(|current| *current <= at) {
            return;
        }
        state.deadlines.insert(key.clone(), at);
        state.seq += 1;
        let seq = state.seq;
        state.waiting.push(Delayed { at, seq, key });
        // a sleeping worker may need to wake up earlier
        self.notify.notify_one();
    }

    /// Records a failure for `key` and returns the backoff delay it earned.
    pub async fn next_backoff(&self, key: &K) -> Duration {
        let mut state = self.state.lock().await;
        let failures = state.failures.entry(key.clone()).or_insert(0);
        *failures = failures.saturating_add(1);
        self.backoff.delay(*failures)
    }

    /// Re-adds `key` after its backoff delay.
    pub async fn enqueue_rate_limited(&self, key: K) -> Duration {
        let delay = self.next_backoff(&key).await;
        self.enqueue_after(key, delay).await;
        delay
    }

    /// Clears the failure history of `key`.
    pub async fn forget(&self, key: &K) {
        self.state.lock().await.failures.remove(key);
    }

    pub async fn num_requeues(&self, key: &K) -> u32 {
        self.state
            .lock()
            .await
            .failures
            .get(key)
            .copied()
            .unwrap_or(0)
    }

    /// Waits for the next item. Returns `None` once the queue is shut down.
    pub async fn get(&self) -> Option<K> {
        loop {
            let deadline = {
                let mut state = self.state.lock().await;
                if self.shutdown.is_cancelled() {
                    return None;
                }
                state.promote_due(Instant::now());
                if let Some(key) = state.queue.pop_front() {
                    state.dirty.remove(&key);
                    state.processing.insert(key.clone());
                    if !state.queue.is_empty() {
                        self.notify.notify_one();
                    }
                    return Some(key);
                }
                state.next_deadline()
            };

            match deadline {
                Some(at) => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return None,
                        _ = self.notify.notified() => {}
                        _ = sleep_until(at) => {}
                    }
                }
                None => {
                    tokio::select! {
                        _ = self.shutdown.cancelled() => return None,
                        _ = self.notify.notified() => {}
                    }
                }
            }
        }
    }

    /// Marks `key` as finished. A re-trigger that arrived meanwhile is queued.
    pub async fn done(&self, key: &K) {
        let mut state = self.state.lock().await;
        state.processing.remove(key);
        if state.dirty.contains(key) {
            state.queue.push_back(key.clone());
            self.notify.notify_one();
        }
    }

    /// Number of items ready to be handed out.
    pub async fn len(&self) -> usize {
        self.state.lock().await.queue.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }

    pub fn shutdown(&self) {
        self.shutdown.cancel();
        self.notify.notify_waiters();
    }

    pub fn is_shutdown(&self) -> bool {
        self.shutdown.is_cancelled()
    }
}
