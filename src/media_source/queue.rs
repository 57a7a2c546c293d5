//! Per-track operation queue
//!
//! Every sink touching a track goes through its queue: strict FIFO, one
//! operation in flight at a time. A failed operation resolves its
//! awaiter with the failure but does not poison the queue; destroy
//! aborts everything, rejecting awaiters with `OperationAborted`.

use std::future::Future;
use std::pin::Pin;

use parking_lot::Mutex;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use crate::error::{Result, StreamingError};

/// What kind of work an operation performs. Used for logging and for
/// coalescing decisions by callers; the queue itself treats all kinds
/// alike.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OpKind {
    AppendInit,
    AppendMedia,
    Remove,
    SetDuration,
    SetAppendWindow,
    SetTimestampOffset,
    ResetCaptionParser,
    EndOfStream,
    ChangeType,
    Flush,
}

type OpFuture = Pin<Box<dyn Future<Output = Result<()>> + Send>>;

struct QueuedOp {
    kind: OpKind,
    work: OpFuture,
    done: oneshot::Sender<Result<()>>,
}

/// A serialized FIFO of asynchronous sink operations for one track.
pub struct OperationQueue {
    tx: mpsc::UnboundedSender<QueuedOp>,
    cancel: CancellationToken,
    worker: Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl OperationQueue {
    pub fn new(label: &'static str) -> Self {
        let (tx, mut rx) = mpsc::unbounded_channel::<QueuedOp>();
        let cancel = CancellationToken::new();
        let worker_cancel = cancel.clone();
        let worker = tokio::spawn(async move {
            loop {
                let op = tokio::select! {
                    _ = worker_cancel.cancelled() => break,
                    op = rx.recv() => match op {
                        Some(op) => op,
                        None => break,
                    },
                };
                tracing::trace!(queue = label, kind = ?op.kind, "executing queued op");
                let result = tokio::select! {
                    _ = worker_cancel.cancelled() => Err(StreamingError::aborted()),
                    r = op.work => r,
                };
                // The submitter may have stopped waiting; that is fine.
                let _ = op.done.send(result);
                if worker_cancel.is_cancelled() {
                    break;
                }
            }
            // Reject everything still queued.
            rx.close();
            while let Ok(op) = rx.try_recv() {
                let _ = op.done.send(Err(StreamingError::aborted()));
            }
        });
        Self {
            tx,
            cancel,
            worker: Mutex::new(Some(worker)),
        }
    }

    /// Enqueue an operation. The returned future resolves when the
    /// operation completes, in submission order.
    pub fn submit<F>(&self, kind: OpKind, work: F) -> impl Future<Output = Result<()>>
    where
        F: Future<Output = Result<()>> + Send + 'static,
    {
        let (done_tx, done_rx) = oneshot::channel();
        let queued = QueuedOp {
            kind,
            work: Box::pin(work),
            done: done_tx,
        };
        let send_failed = self.tx.send(queued).is_err();
        async move {
            if send_failed {
                return Err(StreamingError::aborted());
            }
            match done_rx.await {
                Ok(r) => r,
                // Queue destroyed while we waited.
                Err(_) => Err(StreamingError::aborted()),
            }
        }
    }

    /// Abort the in-progress operation and reject all pending ones.
    pub async fn destroy(&self) {
        self.cancel.cancel();
        let worker = self.worker.lock().take();
        if let Some(worker) = worker {
            let _ = worker.await;
        }
    }
}

impl Drop for OperationQueue {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn test_fifo_order() {
        let queue = OperationQueue::new("test");
        let log = Arc::new(Mutex::new(Vec::new()));
        let mut waiters = Vec::new();
        for i in 0..5 {
            let log = log.clone();
            waiters.push(queue.submit(OpKind::AppendMedia, async move {
                // Later ops sleep less; order must still hold.
                tokio::time::sleep(Duration::from_millis(5 * (5 - i))).await;
                log.lock().push(i);
                Ok(())
            }));
        }
        for w in waiters {
            w.await.unwrap();
        }
        assert_eq!(*log.lock(), vec![0, 1, 2, 3, 4]);
    }

    #[tokio::test]
    async fn test_failure_does_not_poison_queue() {
        let queue = OperationQueue::new("test");
        let first = queue.submit(OpKind::AppendMedia, async {
            Err(StreamingError::media(
                crate::error::Code::MediaSourceOperationFailed,
                "boom",
            ))
        });
        let second = queue.submit(OpKind::Remove, async { Ok(()) });
        assert!(first.await.is_err());
        assert!(second.await.is_ok());
    }

    #[tokio::test]
    async fn test_destroy_rejects_pending_with_aborted() {
        let queue = OperationQueue::new("test");
        let slow = queue.submit(OpKind::AppendMedia, async {
            tokio::time::sleep(Duration::from_secs(60)).await;
            Ok(())
        });
        let pending = queue.submit(OpKind::Remove, async { Ok(()) });
        // Let the first op start.
        tokio::task::yield_now().await;
        queue.destroy().await;
        assert!(slow.await.unwrap_err().is_aborted());
        assert!(pending.await.unwrap_err().is_aborted());
    }

    #[tokio::test]
    async fn test_submit_after_destroy_rejects() {
        let queue = OperationQueue::new("test");
        queue.destroy().await;
        let counter = Arc::new(AtomicUsize::new(0));
        let c = counter.clone();
        let op = queue.submit(OpKind::AppendMedia, async move {
            c.fetch_add(1, Ordering::SeqCst);
            Ok(())
        });
        assert!(op.await.unwrap_err().is_aborted());
        assert_eq!(counter.load(Ordering::SeqCst), 0);
    }
}
