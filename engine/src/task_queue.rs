//! FIFO task queue bound to one record identity.
//!
//! Each enqueued task starts only after every previously enqueued task has
//! settled, whether it succeeded, failed, or was dropped. The queue does not
//! drive futures itself; callers poll (or spawn) the returned future.

use futures::channel::oneshot;
use parking_lot::Mutex;
use std::future::Future;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

/// Serializes asynchronous work for one identity.
#[derive(Debug, Default)]
pub struct TaskQueue {
    tail: Mutex<Option<oneshot::Receiver<()>>>,
    queued: Arc<AtomicUsize>,
}

/// Marks a queue slot as settled when dropped.
struct Settle {
    queued: Arc<AtomicUsize>,
    done: Option<oneshot::Sender<()>>,
}

impl Drop for Settle {
    fn drop(&mut self) {
        self.queued.fetch_sub(1, Ordering::SeqCst);
        if let Some(done) = self.done.take() {
            let _ = done.send(());
        }
    }
}

impl TaskQueue {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of tasks enqueued and not yet settled.
    pub fn len(&self) -> usize {
        self.queued.load(Ordering::SeqCst)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Queue `task` behind everything enqueued before it.
    ///
    /// Ordering is fixed at call time: the slot is reserved synchronously, so
    /// tasks run in the order `enqueue` was called, regardless of when the
    /// returned futures are first polled. `task` itself is not invoked until
    /// the slot is admitted.
    pub fn enqueue<F, Fut, T>(&self, task: F) -> impl Future<Output = T> + Send + 'static
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let (done, finished) = oneshot::channel();
        let previous = self.tail.lock().replace(finished);
        self.queued.fetch_add(1, Ordering::SeqCst);
        let settle = Settle {
            queued: Arc::clone(&self.queued),
            done: Some(done),
        };

        async move {
            if let Some(previous) = previous {
                // A dropped sender means the previous task was abandoned,
                // which also counts as settled.
                let _ = previous.await;
            }
            let output = task().await;
            drop(settle);
            output
        }
    }
}
