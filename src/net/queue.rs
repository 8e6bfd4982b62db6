use crate::net::shared::{lock, ErrorType, NetworkError, NetworkResult};
use std::collections::VecDeque;
use std::sync::{Condvar, Mutex};

/// A thread-safe FIFO bridging the reactor worker (producer) and the
/// application thread (consumer). Items can be pushed at either end; pops and
/// peeks fail with `Empty` rather than blocking, and `wait` blocks until the
/// queue becomes non-empty.
pub struct BlockingQueue<I> {
    items: Mutex<VecDeque<I>>,
    signal: Condvar,
}

impl<I> BlockingQueue<I> {
    #[inline]
    pub fn new() -> BlockingQueue<I> {
        BlockingQueue {
            items: Mutex::new(VecDeque::new()),
            signal: Condvar::new(),
        }
    }

    /// Appends an item at the back and wakes one waiting consumer.
    #[inline]
    pub fn push_back(&self, item: I) {
        let mut items = lock(&self.items);
        items.push_back(item);
        self.signal.notify_one();
    }

    /// Inserts an item at the front and wakes one waiting consumer.
    #[inline]
    pub fn push_front(&self, item: I) {
        let mut items = lock(&self.items);
        items.push_front(item);
        self.signal.notify_one();
    }

    /// Removes and returns the front item.
    #[inline]
    pub fn pop_front(&self) -> NetworkResult<I> {
        lock(&self.items)
            .pop_front()
            .ok_or(NetworkError::Fatal(ErrorType::Empty))
    }

    /// Copies the front item out under the lock.
    #[inline]
    pub fn front(&self) -> NetworkResult<I>
    where
        I: Clone,
    {
        lock(&self.items)
            .front()
            .cloned()
            .ok_or(NetworkError::Fatal(ErrorType::Empty))
    }

    /// Copies the back item out under the lock.
    #[inline]
    pub fn back(&self) -> NetworkResult<I>
    where
        I: Clone,
    {
        lock(&self.items)
            .back()
            .cloned()
            .ok_or(NetworkError::Fatal(ErrorType::Empty))
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        lock(&self.items).is_empty()
    }

    #[inline]
    pub fn len(&self) -> usize {
        lock(&self.items).len()
    }

    #[inline]
    pub fn clear(&self) {
        lock(&self.items).clear();
    }

    /// Blocks until the queue is non-empty. Emptiness is rechecked after
    /// every wake, so spurious wakes and raced-away items are tolerated.
    pub fn wait(&self) {
        let mut items = lock(&self.items);
        while items.is_empty() {
            items = match self.signal.wait(items) {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_fifo_order() {
        let queue = BlockingQueue::new();

        queue.push_back(1);
        queue.push_back(2);
        queue.push_back(3);

        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop_front().unwrap(), 1);
        assert_eq!(queue.pop_front().unwrap(), 2);
        assert_eq!(queue.pop_front().unwrap(), 3);
        assert!(queue.is_empty());
    }

    #[test]
    fn test_push_front_is_lifo() {
        let queue = BlockingQueue::new();

        queue.push_front(1);
        queue.push_front(2);
        queue.push_front(3);

        assert_eq!(queue.pop_front().unwrap(), 3);
        assert_eq!(queue.pop_front().unwrap(), 2);
        assert_eq!(queue.pop_front().unwrap(), 1);
    }

    #[test]
    fn test_pop_empty() {
        let queue = BlockingQueue::<u32>::new();

        assert_eq!(
            queue.pop_front().unwrap_err(),
            NetworkError::Fatal(ErrorType::Empty)
        );
    }

    #[test]
    fn test_peek_both_ends() {
        let queue = BlockingQueue::new();

        assert_eq!(
            queue.front().unwrap_err(),
            NetworkError::Fatal(ErrorType::Empty)
        );
        assert_eq!(
            queue.back().unwrap_err(),
            NetworkError::Fatal(ErrorType::Empty)
        );

        queue.push_back(10);
        queue.push_back(20);

        assert_eq!(queue.front().unwrap(), 10);
        assert_eq!(queue.back().unwrap(), 20);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_clear() {
        let queue = BlockingQueue::new();

        queue.push_back(1);
        queue.push_back(2);
        queue.clear();

        assert!(queue.is_empty());
        assert_eq!(queue.len(), 0);
    }

    #[test]
    fn test_wait_wakes_on_push() {
        let queue = Arc::new(BlockingQueue::new());
        let consumer_queue = Arc::clone(&queue);

        let consumer = thread::spawn(move || {
            consumer_queue.wait();
            consumer_queue.pop_front().unwrap()
        });

        // Give the consumer a chance to block before producing.
        thread::sleep(Duration::from_millis(50));
        queue.push_back(42);

        assert_eq!(consumer.join().unwrap(), 42);
    }
}
