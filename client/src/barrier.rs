//! Rendezvous for the members of one batch request.
//!
//! Every member of a batch waits in its own record's task queue. Once
//! admitted, a member deposits what it wants sent and waits. When the last
//! member has arrived the dispatcher collects the deposits, performs one
//! combined request and publishes the outcome, which every member receives.

use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use tokio::sync::{watch, Notify};

/// Counting barrier with a broadcast outcome.
#[derive(Debug)]
pub struct BatchBarrier<P, R> {
    expected: usize,
    arrived: AtomicUsize,
    deposits: Mutex<Vec<Option<P>>>,
    all_arrived: Notify,
    outcome: watch::Sender<Option<R>>,
}

impl<P, R: Clone> BatchBarrier<P, R> {
    /// A barrier for `expected` members.
    pub fn new(expected: usize) -> Self {
        let (outcome, _) = watch::channel(None);
        Self {
            expected,
            arrived: AtomicUsize::new(0),
            deposits: Mutex::new((0..expected).map(|_| None).collect()),
            all_arrived: Notify::new(),
            outcome,
        }
    }

    pub fn expected(&self) -> usize {
        self.expected
    }

    /// Register member `index` with an optional deposit. Returns a receiver
    /// for the shared outcome.
    pub fn arrive(&self, index: usize, deposit: Option<P>) -> watch::Receiver<Option<R>> {
        let receiver = self.outcome.subscribe();
        if let Some(slot) = self.deposits.lock().get_mut(index) {
            *slot = deposit;
        }
        if self.arrived.fetch_add(1, Ordering::SeqCst) + 1 == self.expected {
            self.all_arrived.notify_one();
        }
        receiver
    }

    /// Wait until every member has arrived and take their deposits, indexed
    /// by member.
    pub async fn gathered(&self) -> Vec<Option<P>> {
        if self.arrived.load(Ordering::SeqCst) < self.expected {
            self.all_arrived.notified().await;
        }
        std::mem::take(&mut *self.deposits.lock())
    }

    /// Publish the outcome to every member.
    pub fn complete(&self, outcome: R) {
        self.outcome.send_replace(Some(outcome));
    }
}

/// Wait for the outcome published on a barrier. `None` if the barrier was
/// dropped without completing.
pub async fn wait_outcome<R: Clone>(mut receiver: watch::Receiver<Option<R>>) -> Option<R> {
    let value = receiver.wait_for(Option::is_some).await.ok()?;
    value.clone()
}
