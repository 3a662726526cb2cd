//! Fixed-capacity thread-safe FIFO.
//!
//! The hand-off primitive between sampler threads, transport callbacks, and
//! the serve handlers. Two condition variables, one per direction, so a push
//! wakes exactly one waiting popper and a pop wakes exactly one waiting
//! pusher. A queue can be closed: blocked poppers drain what is left and
//! then get `None`, blocked pushers wake up and drop their item.

use std::collections::VecDeque;

use parking_lot::{Condvar, Mutex};

struct Inner<T> {
    items: VecDeque<T>,
    closed: bool,
}

pub struct BoundedQueue<T> {
    limit: usize,
    inner: Mutex<Inner<T>>,
    not_empty: Condvar,
    not_full: Condvar,
}

impl<T> BoundedQueue<T> {
    pub fn new(limit: usize) -> Self {
        assert!(limit > 0, "bounded queue needs a nonzero capacity");
        Self {
            limit,
            inner: Mutex::new(Inner {
                items: VecDeque::with_capacity(limit),
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.limit
    }

    pub fn len(&self) -> usize {
        self.inner.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.lock().items.is_empty()
    }

    /// Enqueue, blocking while the queue is full. Dropped on a closed queue.
    pub fn push(&self, value: T) {
        let mut q = self.inner.lock();
        while q.items.len() >= self.limit && !q.closed {
            self.not_full.wait(&mut q);
        }
        if q.closed {
            return;
        }
        q.items.push_back(value);
        self.not_empty.notify_one();
    }

    /// Dequeue, blocking while the queue is empty. `None` only after the
    /// queue is closed and emptied.
    pub fn pop(&self) -> Option<T> {
        let mut q = self.inner.lock();
        while q.items.is_empty() && !q.closed {
            self.not_empty.wait(&mut q);
        }
        let value = q.items.pop_front();
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    /// Dequeue without blocking; `None` means "nothing available right now",
    /// not an error.
    pub fn try_pop(&self) -> Option<T> {
        let mut q = self.inner.lock();
        let value = q.items.pop_front();
        if value.is_some() {
            self.not_full.notify_one();
        }
        value
    }

    /// Remove and return everything currently queued, releasing every
    /// blocked pusher. Used on shutdown to drain stale minibatches.
    pub fn drain(&self) -> Vec<T> {
        let mut q = self.inner.lock();
        let drained: Vec<T> = q.items.drain(..).collect();
        if !drained.is_empty() {
            self.not_full.notify_all();
        }
        drained
    }

    /// Close the queue, waking every blocked pusher and popper.
    pub fn close(&self) {
        let mut q = self.inner.lock();
        q.closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn fifo_order_preserved() {
        let q = BoundedQueue::new(8);
        for i in 0..8 {
            q.push(i);
        }
        for i in 0..8 {
            assert_eq!(q.pop(), Some(i));
        }
    }

    #[test]
    fn try_pop_on_empty_returns_immediately() {
        let q: BoundedQueue<u32> = BoundedQueue::new(4);
        assert_eq!(q.try_pop(), None);
    }

    #[test]
    fn push_blocks_when_full_until_a_pop() {
        let q = Arc::new(BoundedQueue::new(2));
        q.push(1);
        q.push(2);

        let pushed = Arc::new(AtomicBool::new(false));
        let (q2, p2) = (q.clone(), pushed.clone());
        let t = std::thread::spawn(move || {
            q2.push(3);
            p2.store(true, Ordering::SeqCst);
        });

        std::thread::sleep(Duration::from_millis(50));
        assert!(!pushed.load(Ordering::SeqCst), "push returned while full");

        assert_eq!(q.pop(), Some(1));
        t.join().unwrap();
        assert!(pushed.load(Ordering::SeqCst));
        assert_eq!(q.pop(), Some(2));
        assert_eq!(q.pop(), Some(3));
    }

    #[test]
    fn drain_unblocks_pushers_and_empties() {
        let q = Arc::new(BoundedQueue::new(1));
        q.push(1);
        let q2 = q.clone();
        let t = std::thread::spawn(move || q2.push(2));
        std::thread::sleep(Duration::from_millis(20));
        let drained = q.drain();
        assert_eq!(drained, vec![1]);
        t.join().unwrap();
        assert_eq!(q.drain(), vec![2]);
        assert!(q.is_empty());
    }

    #[test]
    fn close_releases_blocked_popper() {
        let q: Arc<BoundedQueue<u32>> = Arc::new(BoundedQueue::new(2));
        let q2 = q.clone();
        let t = std::thread::spawn(move || q2.pop());
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        assert_eq!(t.join().unwrap(), None);
        // Closed and empty: pop no longer blocks.
        assert_eq!(q.pop(), None);
    }

    #[test]
    fn close_releases_blocked_pusher_and_drops_item() {
        let q = Arc::new(BoundedQueue::new(1));
        q.push(1);
        let q2 = q.clone();
        let t = std::thread::spawn(move || q2.push(2));
        std::thread::sleep(Duration::from_millis(20));
        q.close();
        t.join().unwrap();
        // The queued item survives, the dropped push does not.
        assert_eq!(q.pop(), Some(1));
        assert_eq!(q.pop(), None);
        q.push(3);
        assert_eq!(q.len(), 0);
    }

    #[test]
    fn concurrent_producers_consumers_lose_nothing() {
        let q = Arc::new(BoundedQueue::new(4));
        let mut handles = Vec::new();
        for p in 0..4 {
            let q = q.clone();
            handles.push(std::thread::spawn(move || {
                for i in 0..100 {
                    q.push(p * 100 + i);
                }
            }));
        }
        let mut seen = Vec::new();
        for _ in 0..400 {
            seen.push(q.pop().unwrap());
        }
        for h in handles {
            h.join().unwrap();
        }
        seen.sort_unstable();
        assert_eq!(seen, (0..400).collect::<Vec<_>>());
    }
}
