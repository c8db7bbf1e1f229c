//! Pooled min-heap timer
//!
//! One heap per shard supervises handshake and heartbeat deadlines for many
//! connections, with a single background task sleeping until the soonest
//! deadline. Entries live in a free-listed arena so steady-state scheduling
//! does not allocate.

use log::{debug, trace};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tokio::time::Instant;

/// Reschedules that move a deadline by less than this are skipped
pub const LAZY_DELAY: Duration = Duration::from_millis(300);

pub type TimerCallback = Arc<dyn Fn() + Send + Sync>;

/// Handle to a scheduled entry. Stale handles are ignored by every operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerHandle {
    slot: usize,
    generation: u64,
}

struct Entry {
    deadline: Instant,
    callback: Option<TimerCallback>,
    /// Position in the heap, -1 when not scheduled
    index: isize,
    key: String,
    generation: u64,
    in_use: bool,
}

impl Entry {
    fn vacant(now: Instant) -> Self {
        Self {
            deadline: now,
            callback: None,
            index: -1,
            key: String::new(),
            generation: 0,
            in_use: false,
        }
    }
}

/// Binary min-heap of deadlines over a pooled entry arena
pub struct TimerHeap {
    entries: Vec<Entry>,
    free: Vec<usize>,
    heap: Vec<usize>,
}

impl TimerHeap {
    pub fn new(size: usize) -> Self {
        let now = Instant::now();
        Self {
            entries: (0..size).map(|_| Entry::vacant(now)).collect(),
            free: (0..size).rev().collect(),
            heap: Vec::with_capacity(size),
        }
    }

    /// Scheduled entries
    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    /// Entries checked out of the pool, scheduled or fired-but-not-deleted
    pub fn allocated(&self) -> usize {
        self.entries.len() - self.free.len()
    }

    pub fn peek_deadline(&self) -> Option<Instant> {
        self.heap.first().map(|&slot| self.entries[slot].deadline)
    }

    fn is_root(&self, handle: TimerHandle) -> bool {
        self.heap.first() == Some(&handle.slot)
    }

    fn live(&self, handle: TimerHandle) -> Option<&Entry> {
        self.entries
            .get(handle.slot)
            .filter(|e| e.in_use && e.generation == handle.generation)
    }

    pub fn add(&mut self, deadline: Instant, key: String, callback: TimerCallback) -> TimerHandle {
        let slot = match self.free.pop() {
            Some(slot) => slot,
            None => {
                // Pool exhausted: grow instead of failing the caller
                self.entries.push(Entry::vacant(deadline));
                self.entries.len() - 1
            }
        };
        let entry = &mut self.entries[slot];
        entry.deadline = deadline;
        entry.callback = Some(callback);
        entry.key = key;
        entry.in_use = true;
        let handle = TimerHandle {
            slot,
            generation: entry.generation,
        };
        self.push(slot);
        handle
    }

    /// Remove an entry and return it to the pool. No-op for stale handles.
    pub fn del(&mut self, handle: TimerHandle) -> bool {
        let index = match self.live(handle) {
            Some(entry) => entry.index,
            None => return false,
        };
        if index >= 0 {
            self.remove_at(index as usize);
        }
        let entry = &mut self.entries[handle.slot];
        entry.in_use = false;
        entry.callback = None;
        entry.key.clear();
        entry.generation += 1;
        self.free.push(handle.slot);
        true
    }

    /// Move an entry's deadline, re-arming it if it already fired.
    ///
    /// A scheduled entry whose deadline would move by less than
    /// `LAZY_DELAY` is left untouched.
    pub fn set(&mut self, handle: TimerHandle, deadline: Instant) -> bool {
        let (index, current) = match self.live(handle) {
            Some(entry) => (entry.index, entry.deadline),
            None => return false,
        };
        if index >= 0 {
            let drift = if deadline > current {
                deadline - current
            } else {
                current - deadline
            };
            if drift < LAZY_DELAY {
                return true;
            }
            self.remove_at(index as usize);
        }
        self.entries[handle.slot].deadline = deadline;
        self.push(handle.slot);
        true
    }

    pub fn set_key(&mut self, handle: TimerHandle, key: &str) {
        if self.live(handle).is_some() {
            let entry = &mut self.entries[handle.slot];
            entry.key.clear();
            entry.key.push_str(key);
        }
    }

    /// Unschedule every entry due at `now` and hand back their callbacks.
    /// Fired entries stay allocated until their owner deletes them.
    pub fn expire(&mut self, now: Instant) -> Vec<(String, TimerCallback)> {
        let mut fired = Vec::new();
        while let Some(&slot) = self.heap.first() {
            if self.entries[slot].deadline > now {
                break;
            }
            self.remove_at(0);
            let entry = &self.entries[slot];
            if let Some(callback) = &entry.callback {
                fired.push((entry.key.clone(), Arc::clone(callback)));
            }
        }
        fired
    }

    fn push(&mut self, slot: usize) {
        let index = self.heap.len();
        self.entries[slot].index = index as isize;
        self.heap.push(slot);
        self.up(index);
    }

    fn remove_at(&mut self, i: usize) {
        let last = self.heap.len() - 1;
        if i != last {
            self.swap(i, last);
        }
        if let Some(slot) = self.heap.pop() {
            self.entries[slot].index = -1;
        }
        if i < self.heap.len() {
            self.down(i);
            self.up(i);
        }
    }

    fn less(&self, i: usize, j: usize) -> bool {
        self.entries[self.heap[i]].deadline < self.entries[self.heap[j]].deadline
    }

    fn swap(&mut self, i: usize, j: usize) {
        self.heap.swap(i, j);
        self.entries[self.heap[i]].index = i as isize;
        self.entries[self.heap[j]].index = j as isize;
    }

    fn up(&mut self, mut j: usize) {
        while j > 0 {
            let parent = (j - 1) / 2;
            if !self.less(j, parent) {
                break;
            }
            self.swap(parent, j);
            j = parent;
        }
    }

    fn down(&mut self, mut i: usize) {
        let n = self.heap.len();
        loop {
            let left = 2 * i + 1;
            if left >= n {
                break;
            }
            let mut child = left;
            let right = left + 1;
            if right < n && self.less(right, left) {
                child = right;
            }
            if !self.less(child, i) {
                break;
            }
            self.swap(i, child);
            i = child;
        }
    }

    /// Panics if the heap order or any stored index is inconsistent
    pub fn assert_invariants(&self) {
        for (i, &slot) in self.heap.iter().enumerate() {
            assert_eq!(self.entries[slot].index, i as isize, "index mismatch at {}", i);
            if i > 0 {
                let parent = self.heap[(i - 1) / 2];
                assert!(
                    self.entries[parent].deadline <= self.entries[slot].deadline,
                    "heap order violated at {}",
                    i
                );
            }
        }
        for entry in &self.entries {
            if entry.index >= 0 {
                assert!(entry.in_use);
            }
        }
    }
}

struct TimerShared {
    heap: Mutex<TimerHeap>,
    notify: Notify,
}

/// A heap shard plus the task that fires its callbacks
pub struct Timer {
    shared: Arc<TimerShared>,
    task: JoinHandle<()>,
}

impl Timer {
    /// Create a shard and spawn its driver on the current runtime
    pub fn new(size: usize) -> Self {
        let shared = Arc::new(TimerShared {
            heap: Mutex::new(TimerHeap::new(size)),
            notify: Notify::new(),
        });
        let task = tokio::spawn(Self::run(Arc::clone(&shared)));
        Self { shared, task }
    }

    async fn run(shared: Arc<TimerShared>) {
        loop {
            let (fired, next) = {
                let mut heap = shared.heap.lock();
                let fired = heap.expire(Instant::now());
                (fired, heap.peek_deadline())
            };

            for (key, callback) in fired {
                debug!("timer expired key: {}", key);
                callback();
            }

            match next {
                Some(deadline) => {
                    tokio::select! {
                        _ = tokio::time::sleep_until(deadline) => {}
                        _ = shared.notify.notified() => {}
                    }
                }
                None => shared.notify.notified().await,
            }
        }
    }

    /// Schedule `callback` to run once `delay` has elapsed.
    /// The callback runs on the timer task and must not block.
    pub fn add<F>(&self, delay: Duration, key: &str, callback: F) -> TimerHandle
    where
        F: Fn() + Send + Sync + 'static,
    {
        let mut heap = self.shared.heap.lock();
        let handle = heap.add(Instant::now() + delay, key.to_string(), Arc::new(callback));
        let rearm = heap.is_root(handle);
        drop(heap);
        if rearm {
            self.shared.notify.notify_one();
        }
        trace!("timer add key: {} delay: {:?}", key, delay);
        handle
    }

    pub fn del(&self, handle: TimerHandle) -> bool {
        self.shared.heap.lock().del(handle)
    }

    /// Push the deadline of `handle` to `delay` from now
    pub fn set(&self, handle: TimerHandle, delay: Duration) -> bool {
        let mut heap = self.shared.heap.lock();
        let ok = heap.set(handle, Instant::now() + delay);
        let rearm = ok && heap.is_root(handle);
        drop(heap);
        if rearm {
            self.shared.notify.notify_one();
        }
        ok
    }

    pub fn set_key(&self, handle: TimerHandle, key: &str) {
        self.shared.heap.lock().set_key(handle, key);
    }

    pub fn len(&self) -> usize {
        self.shared.heap.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn noop() -> TimerCallback {
        Arc::new(|| {})
    }

    #[test]
    fn test_root_is_minimum() {
        let base = Instant::now();
        let mut heap = TimerHeap::new(4);
        let delays = [50u64, 10, 40, 30, 20, 60];
        let handles: Vec<_> = delays
            .iter()
            .map(|&d| heap.add(base + Duration::from_secs(d), format!("k{}", d), noop()))
            .collect();
        heap.assert_invariants();
        assert_eq!(heap.peek_deadline(), Some(base + Duration::from_secs(10)));

        assert!(heap.del(handles[1]));
        heap.assert_invariants();
        assert_eq!(heap.peek_deadline(), Some(base + Duration::from_secs(20)));
        assert_eq!(heap.len(), 5);
    }

    #[test]
    fn test_del_is_idempotent() {
        let base = Instant::now();
        let mut heap = TimerHeap::new(2);
        let h = heap.add(base, "a".to_string(), noop());
        assert!(heap.del(h));
        assert!(!heap.del(h));
        heap.assert_invariants();

        // Slot reuse must not revive the stale handle
        let h2 = heap.add(base, "b".to_string(), noop());
        assert!(!heap.del(h));
        assert_eq!(heap.len(), 1);
        assert!(heap.del(h2));
    }

    #[test]
    fn test_expire_then_del() {
        let base = Instant::now();
        let mut heap = TimerHeap::new(2);
        let h = heap.add(base, "a".to_string(), noop());
        heap.add(base + Duration::from_secs(5), "b".to_string(), noop());

        let fired = heap.expire(base);
        assert_eq!(fired.len(), 1);
        assert_eq!(fired[0].0, "a");
        assert_eq!(heap.len(), 1);
        assert_eq!(heap.allocated(), 2);

        assert!(heap.del(h));
        assert_eq!(heap.allocated(), 1);
        heap.assert_invariants();
    }

    #[test]
    fn test_lazy_set_skips_small_moves() {
        let base = Instant::now();
        let mut heap = TimerHeap::new(2);
        let h = heap.add(base + Duration::from_secs(10), "a".to_string(), noop());
        heap.set(h, base + Duration::from_secs(10) + Duration::from_millis(100));
        assert_eq!(heap.peek_deadline(), Some(base + Duration::from_secs(10)));

        heap.set(h, base + Duration::from_secs(20));
        assert_eq!(heap.peek_deadline(), Some(base + Duration::from_secs(20)));
    }

    #[test]
    fn test_set_rearms_fired_entry() {
        let base = Instant::now();
        let mut heap = TimerHeap::new(1);
        let h = heap.add(base, "a".to_string(), noop());
        assert_eq!(heap.expire(base).len(), 1);
        assert!(heap.is_empty());
        assert!(heap.set(h, base + Duration::from_millis(10)));
        assert_eq!(heap.len(), 1);
    }

    #[test]
    fn test_pool_grows_when_exhausted() {
        let base = Instant::now();
        let mut heap = TimerHeap::new(1);
        for i in 0..5 {
            heap.add(base + Duration::from_secs(i), i.to_string(), noop());
        }
        assert_eq!(heap.len(), 5);
        heap.assert_invariants();
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_fires_callback() {
        let timer = Timer::new(4);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let h = timer.add(Duration::from_secs(5), "k1", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(timer.is_empty());
        assert!(timer.del(h));
    }

    #[tokio::test(start_paused = true)]
    async fn test_timer_reschedule_postpones_fire() {
        let timer = Timer::new(4);
        let fired = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&fired);
        let h = timer.add(Duration::from_secs(2), "k1", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        tokio::time::sleep(Duration::from_secs(1)).await;
        timer.set(h, Duration::from_secs(10));
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 0);

        tokio::time::sleep(Duration::from_secs(6)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_earlier_entry_rearms_driver() {
        let timer = Timer::new(4);
        let fired = Arc::new(AtomicUsize::new(0));
        timer.add(Duration::from_secs(100), "late", || {});
        tokio::task::yield_now().await;

        let counter = Arc::clone(&fired);
        timer.add(Duration::from_secs(1), "early", move || {
            counter.fetch_add(1, Ordering::SeqCst);
        });
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert_eq!(timer.len(), 1);
    }
}
