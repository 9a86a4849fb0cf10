//! Bounded drop-oldest frame queue
//!
//! Shared by the polling receiver and the mix track output. Producers never
//! block: when the queue is full the oldest unread item is evicted to make room.
//! Consumers can wait synchronously (from any thread) or asynchronously.

use parking_lot::{Condvar, Mutex};
use std::collections::VecDeque;
use std::time::{Duration, Instant};
use tokio::sync::Notify;

/// Why a blocking pop returned without an item
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PopError {
    /// Nothing arrived before the deadline
    Timeout,
    /// The queue was closed and is empty
    Closed,
}

#[derive(Debug)]
struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
    dropped: u64,
}

/// Bounded multi-producer queue that evicts the oldest item on overflow
#[derive(Debug)]
pub struct DropOldestQueue<T> {
    state: Mutex<QueueState<T>>,
    available: Condvar,
    notify: Notify,
    capacity: usize,
}

impl<T> DropOldestQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
                dropped: 0,
            }),
            available: Condvar::new(),
            notify: Notify::new(),
            capacity,
        }
    }

    /// Maximum number of queued items
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Push an item, returning the evicted item if the queue was full.
    /// Items pushed after `close` are discarded.
    pub fn push(&self, item: T) -> Option<T> {
        let evicted = {
            let mut state = self.state.lock();
            if state.closed {
                return None;
            }
            let evicted = if state.items.len() >= self.capacity {
                state.dropped += 1;
                state.items.pop_front()
            } else {
                None
            };
            state.items.push_back(item);
            evicted
        };
        self.available.notify_one();
        self.notify.notify_one();
        evicted
    }

    /// Pop the oldest item without waiting
    pub fn try_pop(&self) -> Option<T> {
        self.state.lock().items.pop_front()
    }

    /// Take every queued item, oldest first
    pub fn drain(&self) -> Vec<T> {
        self.state.lock().items.drain(..).collect()
    }

    /// Block the calling thread until an item is available.
    /// `None` waits without a deadline.
    pub fn pop_blocking(&self, timeout: Option<Duration>) -> Result<T, PopError> {
        let deadline = timeout.map(|t| Instant::now() + t);
        let mut state = self.state.lock();
        loop {
            if let Some(item) = state.items.pop_front() {
                return Ok(item);
            }
            if state.closed {
                return Err(PopError::Closed);
            }
            match deadline {
                Some(deadline) => {
                    if self.available.wait_until(&mut state, deadline).timed_out()
                        && state.items.is_empty()
                    {
                        return Err(if state.closed {
                            PopError::Closed
                        } else {
                            PopError::Timeout
                        });
                    }
                }
                None => self.available.wait(&mut state),
            }
        }
    }

    /// Block until at least one item is available, then drain everything queued
    pub fn drain_blocking(&self, timeout: Option<Duration>) -> Result<Vec<T>, PopError> {
        let first = self.pop_blocking(timeout)?;
        let mut items = vec![first];
        items.extend(self.drain());
        Ok(items)
    }

    /// Wait for the next item. Resolves to `None` once closed and empty.
    pub async fn pop(&self) -> Option<T> {
        loop {
            let notified = self.notify.notified();
            {
                let mut state = self.state.lock();
                if let Some(item) = state.items.pop_front() {
                    return Some(item);
                }
                if state.closed {
                    return None;
                }
            }
            notified.await;
        }
    }

    /// Close the queue and wake every waiter. Already queued items stay readable.
    pub fn close(&self) {
        self.state.lock().closed = true;
        self.available.notify_all();
        self.notify.notify_waiters();
        self.notify.notify_one();
    }

    /// Whether `close` has been called
    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    /// Number of queued items
    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    /// Whether nothing is queued
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Total number of items evicted by overflow
    pub fn dropped(&self) -> u64 {
        self.state.lock().dropped
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    #[test]
    fn test_overflow_keeps_newest_in_order() {
        let queue = DropOldestQueue::new(2);
        assert_eq!(queue.push(1), None);
        assert_eq!(queue.push(2), None);
        assert_eq!(queue.push(3), Some(1));
        assert_eq!(queue.push(4), Some(2));
        assert_eq!(queue.push(5), Some(3));
        assert_eq!(queue.dropped(), 3);
        assert_eq!(queue.drain(), vec![4, 5]);
    }

    #[test]
    fn test_pop_blocking_timeout_and_close() {
        let queue: DropOldestQueue<u32> = DropOldestQueue::new(1);
        assert_eq!(
            queue.pop_blocking(Some(Duration::from_millis(20))),
            Err(PopError::Timeout)
        );

        queue.push(7);
        queue.close();
        assert_eq!(queue.pop_blocking(Some(Duration::from_millis(20))), Ok(7));
        assert_eq!(queue.pop_blocking(None), Err(PopError::Closed));
        assert_eq!(queue.push(8), None);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_pop_blocking_wakes_on_push_from_other_thread() {
        let queue = Arc::new(DropOldestQueue::new(4));
        let producer = {
            let queue = Arc::clone(&queue);
            std::thread::spawn(move || {
                std::thread::sleep(Duration::from_millis(20));
                queue.push("frame");
            })
        };
        assert_eq!(
            queue.pop_blocking(Some(Duration::from_secs(5))),
            Ok("frame")
        );
        producer.join().unwrap();
    }

    #[test]
    fn test_drain_blocking_coalesces() {
        let queue = DropOldestQueue::new(4);
        queue.push(1);
        queue.push(2);
        queue.push(3);
        assert_eq!(
            queue.drain_blocking(Some(Duration::from_millis(10))),
            Ok(vec![1, 2, 3])
        );
    }

    #[tokio::test]
    async fn test_async_pop_sees_close() {
        let queue = Arc::new(DropOldestQueue::new(1));
        let waiter = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.pop().await })
        };
        tokio::task::yield_now().await;
        queue.push(42u32);
        assert_eq!(waiter.await.unwrap(), Some(42));

        queue.close();
        assert_eq!(queue.pop().await, None);
    }
}
