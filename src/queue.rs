//! A bounded FIFO shared by the watcher's event stream and the client
//! session's in-flight window (§4.2). One abstraction, two element types.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Condvar, Mutex};

pub struct BoundedQueue<T> {
    capacity: usize,
    inner: Mutex<VecDeque<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            inner: Mutex::new(VecDeque::with_capacity(capacity)),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    /// Blocks while the queue is full.
    pub fn push(&self, value: T) {
        let mut guard = self.inner.lock().unwrap();
        while guard.len() >= self.capacity {
            guard = self.not_full.wait(guard).unwrap();
        }
        guard.push_back(value);
        self.not_empty.notify_one();
    }

    /// Non-blocking push; returns false (and does not enqueue) if full.
    pub fn try_push(&self, value: T) -> bool {
        let mut guard = self.inner.lock().unwrap();
        if guard.len() >= self.capacity {
            return false;
        }
        guard.push_back(value);
        self.not_empty.notify_one();
        true
    }

    /// Blocks while the queue is empty, then pops the front element.
    pub fn pop(&self) -> T {
        let mut guard = self.inner.lock().unwrap();
        while guard.is_empty() {
            guard = self.not_empty.wait(guard).unwrap();
        }
        let v = guard.pop_front().expect("non-empty");
        self.not_full.notify_one();
        v
    }

    /// Non-blocking pop; returns `None` immediately if the queue is empty.
    pub fn try_pop(&self) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        let v = guard.pop_front();
        if v.is_some() {
            self.not_full.notify_one();
        }
        v
    }

    /// Blocks until an element is available or `stop` is set, polling `stop`
    /// the same way `wait_ready` does. Returns `None` if cancelled before
    /// anything arrived, letting a blocked consumer (e.g. a server worker
    /// thread) unwind instead of parking on `pop()` forever.
    pub fn pop_cancellable(&self, stop: &AtomicBool) -> Option<T> {
        let mut guard = self.inner.lock().unwrap();
        loop {
            if let Some(v) = guard.pop_front() {
                self.not_full.notify_one();
                return Some(v);
            }
            if stop.load(Ordering::SeqCst) {
                return None;
            }
            let (g, _timeout) = self
                .not_empty
                .wait_timeout(guard, std::time::Duration::from_millis(200))
                .unwrap();
            guard = g;
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Removes and returns every element currently queued, in FIFO order.
    pub fn drain_all(&self) -> Vec<T> {
        let mut guard = self.inner.lock().unwrap();
        let drained: Vec<T> = guard.drain(..).collect();
        self.not_full.notify_all();
        drained
    }

    /// Blocks until the queue is non-empty or `stop` is set, polling `stop`
    /// on every wakeup. Returns false if cancelled before anything arrived.
    pub fn wait_ready(&self, stop: &AtomicBool) -> bool {
        let mut guard = self.inner.lock().unwrap();
        while guard.is_empty() {
            if stop.load(Ordering::SeqCst) {
                return false;
            }
            let (g, _timeout) = self
                .not_empty
                .wait_timeout(guard, std::time::Duration::from_millis(200))
                .unwrap();
            guard = g;
        }
        true
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;

    #[test]
    fn try_push_respects_capacity() {
        let q = BoundedQueue::new(2);
        assert!(q.try_push(1));
        assert!(q.try_push(2));
        assert!(!q.try_push(3));
        assert_eq!(q.pop(), 1);
        assert!(q.try_push(3));
    }

    #[test]
    fn push_blocks_until_space_then_unblocks() {
        let q = Arc::new(BoundedQueue::new(1));
        q.push(1);
        let q2 = q.clone();
        let handle = thread::spawn(move || q2.push(2));
        thread::sleep(std::time::Duration::from_millis(50));
        assert_eq!(q.pop(), 1);
        handle.join().unwrap();
        assert_eq!(q.pop(), 2);
    }

    #[test]
    fn drain_all_empties_in_order() {
        let q = BoundedQueue::new(4);
        q.try_push(1);
        q.try_push(2);
        q.try_push(3);
        assert_eq!(q.drain_all(), vec![1, 2, 3]);
        assert!(q.is_empty());
    }

    #[test]
    fn wait_ready_cancels() {
        let q: BoundedQueue<i32> = BoundedQueue::new(1);
        let stop = AtomicBool::new(true);
        assert!(!q.wait_ready(&stop));
    }

    #[test]
    fn try_pop_is_non_blocking() {
        let q: BoundedQueue<i32> = BoundedQueue::new(2);
        assert_eq!(q.try_pop(), None);
        q.try_push(7);
        assert_eq!(q.try_pop(), Some(7));
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn pop_cancellable_returns_none_once_stopped() {
        let q: BoundedQueue<i32> = BoundedQueue::new(1);
        let stop = AtomicBool::new(true);
        assert_eq!(q.pop_cancellable(&stop), None);
    }

    #[test]
    fn pop_cancellable_returns_item_before_checking_stop() {
        let q: BoundedQueue<i32> = BoundedQueue::new(1);
        q.try_push(5);
        let stop = AtomicBool::new(true);
        assert_eq!(q.pop_cancellable(&stop), Some(5));
    }
}
