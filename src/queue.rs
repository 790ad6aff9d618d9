//! A bounded FIFO queue with `asyncio.Queue`-style `join()`/`task_done()`
//! semantics, enqueueable from both synchronous and asynchronous producers.

use std::sync::Arc;

use tokio::sync::{mpsc, Mutex, Notify};

struct Inner {
    unfinished: Mutex<usize>,
    drained: Notify,
}

/// Producer half of a queue created by [`bounded`].
pub struct Sender<T> {
    tx: mpsc::Sender<T>,
    inner: Arc<Inner>,
}

impl<T> Clone for Sender<T> {
    fn clone(&self) -> Self {
        Self { tx: self.tx.clone(), inner: self.inner.clone() }
    }
}

impl<T> Sender<T> {
    /// Enqueues from an async worker, suspending if the queue is full.
    pub async fn send(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        {
            let mut unfinished = self.inner.unfinished.lock().await;
            *unfinished += 1;
        }
        self.tx.send(item).await
    }

    /// Enqueues from a synchronous context, such as a bus callback running
    /// off the connection's worker thread. Blocks if the queue is full.
    pub fn send_blocking(&self, item: T) -> Result<(), mpsc::error::SendError<T>> {
        {
            let mut unfinished = self.inner.unfinished.blocking_lock();
            *unfinished += 1;
        }
        self.tx.blocking_send(item)
    }

    /// Waits until every item enqueued so far (by any producer sharing this
    /// queue) has been marked done by the consumer. Usable from the
    /// producer side since the unfinished-count is shared with the
    /// [`Receiver`].
    pub async fn join(&self) {
        loop {
            let notified = self.inner.drained.notified();
            {
                let unfinished = self.inner.unfinished.lock().await;
                if *unfinished == 0 {
                    return;
                }
            }
            notified.await;
        }
    }
}

/// Consumer half of a queue created by [`bounded`].
pub struct Receiver<T> {
    rx: mpsc::Receiver<T>,
    inner: Arc<Inner>,
}

impl<T> Receiver<T> {
    /// Dequeues the next item, or `None` once the queue is closed and
    /// drained (end-of-stream, signalling shutdown to the consumer).
    pub async fn recv(&mut self) -> Option<T> {
        self.rx.recv().await
    }

    /// Marks the most recently received item as processed. Must be called
    /// exactly once per item that `recv()` returned, on every code path
    /// including error handling, so that `join()` can observe the queue as
    /// drained.
    pub async fn task_done(&self) {
        let mut unfinished = self.inner.unfinished.lock().await;
        if *unfinished > 0 {
            *unfinished -= 1;
        }
        if *unfinished == 0 {
            self.inner.drained.notify_waiters();
        }
    }

    /// Waits until every item enqueued so far has been marked done.
    pub async fn join(&self) {
        loop {
            let notified = self.inner.drained.notified();
            {
                let unfinished = self.inner.unfinished.lock().await;
                if *unfinished == 0 {
                    return;
                }
            }
            notified.await;
        }
    }
}

/// Creates a bounded queue with the given capacity.
pub fn bounded<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    let (tx, rx) = mpsc::channel(capacity);
    let inner = Arc::new(Inner { unfinished: Mutex::new(0), drained: Notify::new() });
    (Sender { tx, inner: inner.clone() }, Receiver { rx, inner })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recv_yields_items_in_order() {
        let (tx, mut rx) = bounded(4);
        tx.send(1).await.unwrap();
        tx.send(2).await.unwrap();
        assert_eq!(rx.recv().await, Some(1));
        assert_eq!(rx.recv().await, Some(2));
    }

    #[tokio::test]
    async fn join_waits_for_task_done() {
        let (tx, mut rx) = bounded(4);
        tx.send(1).await.unwrap();

        let joined = tokio::spawn({
            let inner = rx.inner.clone();
            async move {
                loop {
                    let notified = inner.drained.notified();
                    {
                        let unfinished = inner.unfinished.lock().await;
                        if *unfinished == 0 {
                            return;
                        }
                    }
                    notified.await;
                }
            }
        });

        tokio::task::yield_now().await;
        let item = rx.recv().await.unwrap();
        assert_eq!(item, 1);
        rx.task_done().await;
        joined.await.unwrap();
    }

    #[tokio::test]
    async fn closing_sender_ends_stream() {
        let (tx, mut rx) = bounded::<i32>(1);
        drop(tx);
        assert_eq!(rx.recv().await, None);
    }
}
