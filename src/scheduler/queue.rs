use tokio::sync::{Mutex, mpsc, watch};

use crate::metadata::file::PieceWork;

/// Bounded multi-producer, multi-consumer queue of pieces still to fetch.
///
/// Capacity equals the piece count and every piece is either queued, held by
/// exactly one worker, or done, so `push` only waits if that invariant is
/// broken.
#[derive(Debug)]
pub struct WorkQueue {
    sender: mpsc::Sender<PieceWork>,
    receiver: Mutex<mpsc::Receiver<PieceWork>>,
    closed: watch::Sender<bool>,
}

impl WorkQueue {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        WorkQueue { sender, receiver: Mutex::new(receiver), closed: watch::Sender::new(false) }
    }

    pub fn is_closed(&self) -> bool {
        *self.closed.borrow()
    }

    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueues `work`, waiting for room if full. Returns `false` once the
    /// queue has been closed.
    pub async fn push(&self, work: PieceWork) -> bool {
        if self.is_closed() {
            return false;
        }
        self.sender.send(work).await.is_ok()
    }

    /// Waits for the next piece. Returns `None` once the queue is closed,
    /// even if items remain.
    pub async fn pop(&self) -> Option<PieceWork> {
        let mut closed = self.closed.subscribe();
        if *closed.borrow_and_update() {
            return None;
        }
        tokio::select! {
            biased;
            _ = closed.wait_for(|closed| *closed) => None,
            work = async { self.receiver.lock().await.recv().await } => work,
        }
    }

    /// Wakes every waiting consumer; later pops return `None`.
    pub fn close(&self) {
        self.closed.send_replace(true);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use std::sync::Arc;
    use std::time::Duration;

    fn work(index: u32) -> PieceWork {
        PieceWork { index, hash: [0; 20], length: 1 }
    }

    #[tokio::test]
    async fn pops_in_fifo_order() {
        let queue = WorkQueue::new(3);
        for i in 0..3 {
            assert!(queue.push(work(i)).await);
        }
        assert_eq!(queue.len(), 3);
        assert_eq!(queue.pop().await.map(|w| w.index), Some(0));
        assert_eq!(queue.pop().await.map(|w| w.index), Some(1));
        assert!(queue.push(work(0)).await);
        assert_eq!(queue.pop().await.map(|w| w.index), Some(2));
        assert_eq!(queue.pop().await.map(|w| w.index), Some(0));
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn close_wakes_idle_consumers() {
        let queue = Arc::new(WorkQueue::new(2));
        let waiters: Vec<_> = (0..3)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move { queue.pop().await })
            })
            .collect();

        tokio::time::sleep(Duration::from_millis(50)).await;
        queue.close();
        for waiter in waiters {
            let popped = tokio::time::timeout(Duration::from_secs(1), waiter).await.unwrap().unwrap();
            assert_eq!(popped, None);
        }
        assert!(!queue.push(work(0)).await);
    }

    #[tokio::test]
    async fn concurrent_consumers_never_share_an_item() {
        let queue = Arc::new(WorkQueue::new(64));
        for i in 0..64 {
            queue.push(work(i)).await;
        }
        let consumers: Vec<_> = (0..4)
            .map(|_| {
                let queue = queue.clone();
                tokio::spawn(async move {
                    let mut seen = Vec::new();
                    while !queue.is_empty() {
                        match tokio::time::timeout(Duration::from_millis(50), queue.pop()).await {
                            Ok(Some(w)) => seen.push(w.index),
                            _ => break,
                        }
                    }
                    seen
                })
            })
            .collect();

        let mut all = HashSet::new();
        let mut total = 0;
        for consumer in consumers {
            let seen = consumer.await.unwrap();
            total += seen.len();
            all.extend(seen);
        }
        assert_eq!(total, 64);
        assert_eq!(all.len(), 64);
    }
}
