use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;

struct Inner<E> {
    elements: VecDeque<E>,
    appending: bool,
}

/// Producer/consumer queue handing out bounded batches.
///
/// `poll` returns a full batch as soon as one is available. Once
/// `no_further_appending` is signalled it returns the remainder in batches
/// and then empty results, never blocking again.
pub struct BatchQueue<E> {
    max_batch: usize,
    inner: Mutex<Inner<E>>,
    notify: Notify,
}

impl<E: Send> BatchQueue<E> {
    pub fn new(max_batch: usize) -> Self {
        Self {
            max_batch: max_batch.max(1),
            inner: Mutex::new(Inner {
                elements: VecDeque::new(),
                appending: true,
            }),
            notify: Notify::new(),
        }
    }

    /// Enqueues without blocking. Elements offered after
    /// `no_further_appending` are still delivered.
    pub fn offer(&self, elements: Vec<E>) {
        if elements.is_empty() {
            return;
        }

        let ready = {
            let mut inner = self.inner.lock();
            inner.elements.extend(elements);
            inner.elements.len() >= self.max_batch || !inner.appending
        };
        if ready {
            self.notify.notify_waiters();
        }
    }

    /// Next batch of at most `max_batch` elements. Empty only when the queue
    /// is closed and drained.
    pub async fn poll(&self) -> Vec<E> {
        loop {
            let notified = self.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent offer cannot be missed.
            notified.as_mut().enable();

            {
                let mut inner = self.inner.lock();
                if inner.elements.len() >= self.max_batch || !inner.appending {
                    let take = inner.elements.len().min(self.max_batch);
                    return inner.elements.drain(..take).collect();
                }
            }

            notified.await;
        }
    }

    /// Marks the end of production; blocked and future polls drain what is
    /// left and then return empty.
    pub fn no_further_appending(&self) {
        self.inner.lock().appending = false;
        self.notify.notify_waiters();
    }

    pub fn len(&self) -> usize {
        self.inner.lock().elements.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn test_poll_returns_full_batches_then_remainder() {
        let queue = BatchQueue::new(4);
        queue.offer((0..10).collect());
        queue.no_further_appending();

        assert_eq!(queue.poll().await, vec![0, 1, 2, 3]);
        assert_eq!(queue.poll().await, vec![4, 5, 6, 7]);
        assert_eq!(queue.poll().await, vec![8, 9]);
        assert!(queue.poll().await.is_empty());
        assert!(queue.poll().await.is_empty());
    }

    #[tokio::test]
    async fn test_poll_waits_for_batch_or_close() {
        let queue = Arc::new(BatchQueue::new(3));
        queue.offer(vec![1, 2]);

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.poll().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!consumer.is_finished(), "partial batch while still open");

        queue.offer(vec![3]);
        assert_eq!(consumer.await.expect("poll"), vec![1, 2, 3]);

        let consumer = {
            let queue = Arc::clone(&queue);
            tokio::spawn(async move { queue.poll().await })
        };
        tokio::time::sleep(Duration::from_millis(20)).await;
        queue.no_further_appending();
        let batch = tokio::time::timeout(Duration::from_secs(1), consumer)
            .await
            .expect("poll returns after close")
            .expect("join");
        assert!(batch.is_empty());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_consumers_see_each_element_once() {
        let queue = Arc::new(BatchQueue::new(7));
        let total = 1_000;

        let mut consumers = Vec::new();
        for _ in 0..3 {
            let queue = Arc::clone(&queue);
            consumers.push(tokio::spawn(async move {
                let mut got = Vec::new();
                loop {
                    let batch = queue.poll().await;
                    if batch.is_empty() {
                        return got;
                    }
                    assert!(batch.len() <= 7);
                    got.extend(batch);
                }
            }));
        }

        for chunk in (0..total).collect::<Vec<u32>>().chunks(13) {
            queue.offer(chunk.to_vec());
            tokio::task::yield_now().await;
        }
        queue.no_further_appending();

        let mut seen = HashSet::new();
        let mut count = 0;
        for consumer in consumers {
            let got = tokio::time::timeout(Duration::from_secs(5), consumer)
                .await
                .expect("consumer terminates")
                .expect("join");
            count += got.len();
            seen.extend(got);
        }

        assert_eq!(count, total as usize);
        assert_eq!(seen.len(), total as usize);
        assert!(queue.is_empty());
    }
}
