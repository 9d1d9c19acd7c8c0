//! Bounded blocking work queue with an in-flight barrier.
//!
//! Producers block while the queue is full; consumers block while it is
//! empty. Every popped item is tracked as in flight until its
//! [`InFlightGuard`] drops, which lets [`WorkQueue::drain`] wait for work a
//! consumer still holds, not only for the queue to look empty.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;

struct QueueState<T> {
    items: VecDeque<T>,
    in_flight: usize,
    closed: bool,
}

/// Bounded multi-producer, multi-consumer FIFO.
pub struct WorkQueue<T> {
    state: Mutex<QueueState<T>>,
    not_empty: Condvar,
    not_full: Condvar,
    idle: Condvar,
    capacity: usize,
}

impl<T> WorkQueue<T> {
    /// Create a queue holding at most `capacity` waiting items.
    pub fn new(capacity: usize) -> Self {
        WorkQueue {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                in_flight: 0,
                closed: false,
            }),
            not_empty: Condvar::new(),
            not_full: Condvar::new(),
            idle: Condvar::new(),
            capacity: capacity.max(1),
        }
    }

    /// Append an item, blocking while the queue is full.
    ///
    /// Returns the item back if the queue has been closed.
    pub fn push(&self, item: T) -> Result<(), T> {
        let mut state = self.state.lock();
        while state.items.len() >= self.capacity && !state.closed {
            self.not_full.wait(&mut state);
        }
        if state.closed {
            return Err(item);
        }
        state.items.push_back(item);
        drop(state);
        self.not_empty.notify_one();
        Ok(())
    }

    /// Take the oldest item, blocking while the queue is empty.
    ///
    /// Returns `None` once the queue is closed and empty. The item counts as
    /// in flight until the returned guard drops.
    pub fn pop(&self) -> Option<(T, InFlightGuard<'_, T>)> {
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                state.in_flight += 1;
                drop(state);
                self.not_full.notify_one();
                return Some((item, InFlightGuard { queue: self }));
            }
            if state.closed {
                return None;
            }
            self.not_empty.wait(&mut state);
        }
    }

    /// Block until the queue is empty and no popped item is in flight.
    ///
    /// Consumers keep running; this is a barrier, not a shutdown.
    pub fn drain(&self) {
        let mut state = self.state.lock();
        while !state.items.is_empty() || state.in_flight > 0 {
            self.idle.wait(&mut state);
        }
    }

    /// Refuse further pushes and wake every waiter.
    ///
    /// Items already queued are still handed out by `pop`.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.not_empty.notify_all();
        self.not_full.notify_all();
    }

    /// Whether `close` has been called.
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Items waiting to be popped.
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether no item is waiting.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Items popped but not yet finished.
    pub fn in_flight(&self) -> usize {
        self.state.lock().in_flight
    }
}

/// Marks a popped item as finished when dropped.
///
/// Dropping during a panic still counts the item as done, so a panicking
/// consumer cannot leave `drain` waiting forever.
pub struct InFlightGuard<'a, T> {
    queue: &'a WorkQueue<T>,
}

impl<T> Drop for InFlightGuard<'_, T> {
    fn drop(&mut self) {
        let mut state = self.queue.state.lock();
        state.in_flight -= 1;
        if state.in_flight == 0 && state.items.is_empty() {
            self.queue.idle.notify_all();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = WorkQueue::new(4);
        for i in 0..3 {
            queue.push(i).unwrap();
        }
        let order: Vec<i32> = (0..3).map(|_| queue.pop().unwrap().0).collect();
        assert_eq!(order, vec![0, 1, 2]);
    }

    #[test]
    fn test_closed_queue_rejects_push_and_ends_pop() {
        let queue = WorkQueue::new(4);
        queue.push(1).unwrap();
        queue.close();
        assert!(queue.is_closed());
        assert_eq!(queue.push(2), Err(2));

        // Queued items are still delivered after close
        assert_eq!(queue.pop().map(|(v, _)| v), Some(1));
        assert!(queue.pop().is_none());
    }

    #[test]
    fn test_push_blocks_when_full() {
        let queue = Arc::new(WorkQueue::new(1));
        queue.push(0).unwrap();

        let q = Arc::clone(&queue);
        let producer = std::thread::spawn(move || q.push(1));

        std::thread::sleep(Duration::from_millis(50));
        assert_eq!(queue.len(), 1);

        let (first, _guard) = queue.pop().unwrap();
        assert_eq!(first, 0);
        assert!(producer.join().unwrap().is_ok());
        assert_eq!(queue.pop().map(|(v, _)| v), Some(1));
    }

    #[test]
    fn test_in_flight_tracked_until_guard_drops() {
        let queue = WorkQueue::new(2);
        queue.push("a").unwrap();
        let (_item, guard) = queue.pop().unwrap();
        assert!(queue.is_empty());
        assert_eq!(queue.in_flight(), 1);
        drop(guard);
        assert_eq!(queue.in_flight(), 0);
    }

    #[test]
    fn test_drain_waits_for_in_flight_work() {
        let queue = Arc::new(WorkQueue::new(8));
        let processed = Arc::new(AtomicUsize::new(0));

        let consumers: Vec<_> = (0..2)
            .map(|_| {
                let q = Arc::clone(&queue);
                let p = Arc::clone(&processed);
                std::thread::spawn(move || {
                    while let Some((_item, _guard)) = q.pop() {
                        std::thread::sleep(Duration::from_millis(5));
                        p.fetch_add(1, Ordering::SeqCst);
                    }
                })
            })
            .collect();

        for i in 0..20 {
            queue.push(i).unwrap();
        }
        queue.drain();
        assert_eq!(processed.load(Ordering::SeqCst), 20);

        queue.close();
        for c in consumers {
            c.join().unwrap();
        }
    }

    #[test]
    fn test_drain_on_idle_queue_returns() {
        let queue: WorkQueue<u8> = WorkQueue::new(1);
        queue.drain();
    }

    #[test]
    fn test_guard_released_on_panic() {
        let queue = Arc::new(WorkQueue::new(2));
        queue.push(1).unwrap();

        let q = Arc::clone(&queue);
        let result = std::thread::spawn(move || {
            let (_item, _guard) = q.pop().unwrap();
            panic!("consumer failed");
        })
        .join();
        assert!(result.is_err());

        queue.drain();
        assert_eq!(queue.in_flight(), 0);
    }
}
