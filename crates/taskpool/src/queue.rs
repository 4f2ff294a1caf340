//! Bounded FIFO task queue
//!
//! The queue is the only buffer between submitters and workers. It never
//! holds more than `capacity` items and never drops an item: a failed
//! enqueue hands the item back to the caller.
//!
//! Waiting is done with [`tokio::sync::Notify`], so blocked producers and
//! consumers park instead of polling.

use std::collections::VecDeque;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::Notify;

/// Why an item could not be enqueued; carries the item back
#[derive(Debug, PartialEq, Eq, thiserror::Error)]
pub enum EnqueueError<T> {
    /// No space became available in time
    #[error("queue is full")]
    Full(T),

    /// The queue was closed
    #[error("queue is closed")]
    Closed(T),
}

impl<T> EnqueueError<T> {
    /// Recover the rejected item
    pub fn into_inner(self) -> T {
        match self {
            Self::Full(item) | Self::Closed(item) => item,
        }
    }

    pub fn is_closed(&self) -> bool {
        matches!(self, Self::Closed(_))
    }
}

/// Returned by `dequeue` once the queue is closed and empty
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("queue is closed")]
pub struct QueueClosed;

struct QueueState<T> {
    items: VecDeque<T>,
    closed: bool,
}

/// Bounded multi-producer, multi-consumer FIFO queue
pub struct TaskQueue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    not_empty: Notify,
    not_full: Notify,
}

impl<T> TaskQueue<T> {
    /// Create a queue holding at most `capacity` items (minimum 1)
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            state: Mutex::new(QueueState {
                items: VecDeque::with_capacity(capacity),
                closed: false,
            }),
            capacity,
            not_empty: Notify::new(),
            not_full: Notify::new(),
        }
    }

    /// Insert an item if there is space right now
    pub fn try_enqueue(&self, item: T) -> Result<(), EnqueueError<T>> {
        let mut state = self.state.lock();
        if state.closed {
            return Err(EnqueueError::Closed(item));
        }
        if state.items.len() >= self.capacity {
            return Err(EnqueueError::Full(item));
        }
        state.items.push_back(item);
        let has_space = state.items.len() < self.capacity;
        drop(state);

        self.not_empty.notify_one();
        if has_space {
            // Pass the wakeup along in case a waiting producer was skipped.
            self.not_full.notify_one();
        }
        Ok(())
    }

    /// Insert an item, waiting for space
    ///
    /// `timeout` of `None` waits indefinitely. Fails with `Full` when the
    /// timeout elapses and with `Closed` as soon as the queue is closed.
    pub async fn enqueue(&self, item: T, timeout: Option<Duration>) -> Result<(), EnqueueError<T>> {
        let deadline = timeout.map(|t| tokio::time::Instant::now() + t);
        let mut item = item;

        loop {
            let notified = self.not_full.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            match self.try_enqueue(item) {
                Ok(()) => return Ok(()),
                Err(EnqueueError::Closed(rejected)) => return Err(EnqueueError::Closed(rejected)),
                Err(EnqueueError::Full(rejected)) => item = rejected,
            }

            match deadline {
                Some(deadline) => {
                    if tokio::time::timeout_at(deadline, notified).await.is_err() {
                        // One last look: space may have freed as the timer fired.
                        return self.try_enqueue(item);
                    }
                }
                None => notified.await,
            }
        }
    }

    /// Remove the oldest item, waiting until one is available
    ///
    /// Returns [`QueueClosed`] once the queue is closed and drained.
    pub async fn dequeue(&self) -> Result<T, QueueClosed> {
        loop {
            let notified = self.not_empty.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(result) = self.try_dequeue() {
                return result;
            }

            notified.await;
        }
    }

    /// Remove the oldest item without waiting
    ///
    /// `None` means the queue is open but empty.
    pub fn try_dequeue(&self) -> Option<Result<T, QueueClosed>> {
        let mut state = self.state.lock();
        match state.items.pop_front() {
            Some(item) => {
                let has_more = !state.items.is_empty();
                drop(state);

                self.not_full.notify_one();
                if has_more {
                    self.not_empty.notify_one();
                }
                Some(Ok(item))
            }
            None if state.closed => Some(Err(QueueClosed)),
            None => None,
        }
    }

    /// Remove the first queued item matching `pred`
    pub fn remove_first(&self, pred: impl Fn(&T) -> bool) -> Option<T> {
        let mut state = self.state.lock();
        let index = state.items.iter().position(pred)?;
        let item = state.items.remove(index);
        drop(state);

        self.not_full.notify_one();
        item
    }

    /// Remove every queued item, oldest first
    pub fn drain(&self) -> Vec<T> {
        let items: Vec<T> = self.state.lock().items.drain(..).collect();
        if !items.is_empty() {
            self.not_full.notify_waiters();
        }
        items
    }

    /// Close the queue
    ///
    /// Blocked enqueuers fail immediately; dequeuers keep receiving the
    /// remaining items and then get [`QueueClosed`].
    pub fn close(&self) {
        {
            let mut state = self.state.lock();
            if state.closed {
                return;
            }
            state.closed = true;
        }
        self.not_full.notify_waiters();
        self.not_empty.notify_waiters();
    }

    pub fn is_closed(&self) -> bool {
        self.state.lock().closed
    }

    pub fn len(&self) -> usize {
        self.state.lock().items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().items.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use tokio_test::{assert_pending, assert_ready, assert_ready_eq};

    use super::*;

    #[test]
    fn test_try_enqueue_respects_capacity() {
        let queue = TaskQueue::new(2);

        assert!(queue.try_enqueue(1).is_ok());
        assert!(queue.try_enqueue(2).is_ok());
        assert_eq!(queue.try_enqueue(3), Err(EnqueueError::Full(3)));
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_zero_capacity_is_raised_to_one() {
        let queue = TaskQueue::new(0);
        assert_eq!(queue.capacity(), 1);
        assert!(queue.try_enqueue("only").is_ok());
    }

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = TaskQueue::new(8);
        for i in 0..5 {
            queue.try_enqueue(i).unwrap();
        }

        for expected in 0..5 {
            assert_eq!(queue.dequeue().await, Ok(expected));
        }
        assert!(queue.is_empty());
    }

    #[test]
    fn test_dequeue_waits_for_item() {
        let queue = TaskQueue::new(4);
        let mut dequeue = tokio_test::task::spawn(queue.dequeue());

        assert_pending!(dequeue.poll());

        queue.try_enqueue(7).unwrap();
        assert!(dequeue.is_woken());
        assert_ready_eq!(dequeue.poll(), Ok(7));
    }

    #[test]
    fn test_close_wakes_blocked_dequeue() {
        let queue: TaskQueue<u32> = TaskQueue::new(4);
        let mut dequeue = tokio_test::task::spawn(queue.dequeue());

        assert_pending!(dequeue.poll());

        queue.close();
        assert!(dequeue.is_woken());
        assert_ready_eq!(dequeue.poll(), Err(QueueClosed));
    }

    #[tokio::test]
    async fn test_close_drains_remaining_items_first() {
        let queue = TaskQueue::new(4);
        queue.try_enqueue("a").unwrap();
        queue.try_enqueue("b").unwrap();
        queue.close();

        assert_eq!(queue.dequeue().await, Ok("a"));
        assert_eq!(queue.dequeue().await, Ok("b"));
        assert_eq!(queue.dequeue().await, Err(QueueClosed));
    }

    #[test]
    fn test_enqueue_after_close_fails() {
        let queue = TaskQueue::new(4);
        queue.close();
        assert_eq!(queue.try_enqueue(1), Err(EnqueueError::Closed(1)));
    }

    #[test]
    fn test_blocked_enqueue_fails_on_close() {
        let queue = TaskQueue::new(1);
        queue.try_enqueue(1).unwrap();

        let mut enqueue = tokio_test::task::spawn(queue.enqueue(2, None));
        assert_pending!(enqueue.poll());

        queue.close();
        assert!(enqueue.is_woken());
        let result = assert_ready!(enqueue.poll());
        assert_eq!(result, Err(EnqueueError::Closed(2)));
    }

    #[test]
    fn test_blocked_enqueue_resumes_when_space_frees() {
        let queue = TaskQueue::new(1);
        queue.try_enqueue(1).unwrap();

        let mut enqueue = tokio_test::task::spawn(queue.enqueue(2, None));
        assert_pending!(enqueue.poll());

        assert_eq!(queue.try_dequeue(), Some(Ok(1)));
        assert!(enqueue.is_woken());
        assert_ready_eq!(enqueue.poll(), Ok(()));
        assert_eq!(queue.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_enqueue_timeout_returns_item() {
        let queue = TaskQueue::new(1);
        queue.try_enqueue(1).unwrap();

        let result = queue.enqueue(2, Some(Duration::from_millis(50))).await;
        assert_eq!(result, Err(EnqueueError::Full(2)));
        assert_eq!(result.unwrap_err().into_inner(), 2);
        assert_eq!(queue.len(), 1);
    }

    #[test]
    fn test_remove_first() {
        let queue = TaskQueue::new(4);
        for i in [10, 11, 12] {
            queue.try_enqueue(i).unwrap();
        }

        assert_eq!(queue.remove_first(|v| *v == 11), Some(11));
        assert_eq!(queue.remove_first(|v| *v == 99), None);
        assert_eq!(queue.drain(), vec![10, 12]);
        assert!(queue.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_capacity_never_exceeded_under_contention() {
        let capacity = 3;
        let queue = Arc::new(TaskQueue::new(capacity));
        let max_seen = Arc::new(std::sync::atomic::AtomicUsize::new(0));

        let mut producers = Vec::new();
        for p in 0..4 {
            let queue = Arc::clone(&queue);
            let max_seen = Arc::clone(&max_seen);
            producers.push(tokio::spawn(async move {
                for i in 0..50 {
                    queue.enqueue(p * 100 + i, None).await.unwrap();
                    max_seen.fetch_max(queue.len(), std::sync::atomic::Ordering::Relaxed);
                }
            }));
        }

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move {
                let mut received = 0;
                while queue.dequeue().await.is_ok() {
                    received += 1;
                    if received == 200 {
                        break;
                    }
                }
                received
            })
        };

        for producer in producers {
            producer.await.unwrap();
        }
        assert_eq!(consumer.await.unwrap(), 200);
        assert!(max_seen.load(std::sync::atomic::Ordering::Relaxed) <= capacity);
    }
}
