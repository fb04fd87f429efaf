// src/dispatch.rs

//! C3: an unbounded single-consumer queue draining ordered items to the
//! state provider. Generic over the item type so it can carry either plain
//! operations (copy/replication dispatch) or a replication stream's
//! epoch-barrier pseudo-operations (see `DispatchItem` in `replication_receiver`).
//! Has a genuine suspension point (`dequeue`), so it is guarded by
//! `tokio::sync::Mutex` rather than a sync mutex.

use crate::error::{ReplicatorError, Result};
use std::collections::VecDeque;
use tokio::sync::{Mutex, Notify};

struct State<T> {
    items: VecDeque<T>,
    closed: bool,
    aborted: bool,
    drained: bool,
}

pub struct DispatchQueue<T> {
    state: Mutex<State<T>>,
    item_notify: Notify,
    drain_notify: Notify,
}

impl<T: Send> Default for DispatchQueue<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T: Send> DispatchQueue<T> {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(State {
                items: VecDeque::new(),
                closed: false,
                aborted: false,
                drained: false,
            }),
            item_notify: Notify::new(),
            drain_notify: Notify::new(),
        }
    }

    /// Appends `item` without waking a waiting consumer.
    pub async fn enqueue_without_dispatch(&self, item: T) -> Result<()> {
        let mut state = self.state.lock().await;
        if state.closed || state.aborted {
            return Err(ReplicatorError::ObjectClosed);
        }
        state.items.push_back(item);
        Ok(())
    }

    /// Wakes the consumer. Idempotent — calling it with nothing new to see
    /// just makes the consumer re-check and go back to sleep.
    pub fn dispatch(&self) {
        self.item_notify.notify_one();
    }

    /// No further enqueues are accepted. Already-enqueued items still drain;
    /// the consumer observes `None` once they're exhausted.
    pub async fn close(&self) {
        let mut state = self.state.lock().await;
        if state.closed {
            return;
        }
        state.closed = true;
        drop(state);
        self.item_notify.notify_waiters();
    }

    /// Drops all pending items immediately; `dequeue` starts returning
    /// `Canceled` to any waiter, current or future.
    pub async fn abort(&self) {
        let mut state = self.state.lock().await;
        state.aborted = true;
        state.items.clear();
        drop(state);
        self.item_notify.notify_waiters();
        self.drain_notify.notify_waiters();
    }

    /// Pulls the next item, or `Ok(None)` once closed and exhausted, or
    /// `Err(Canceled)` if aborted.
    pub async fn dequeue(&self) -> Result<Option<T>> {
        loop {
            let notified = {
                let mut state = self.state.lock().await;
                if state.aborted {
                    return Err(ReplicatorError::Canceled);
                }
                if let Some(item) = state.items.pop_front() {
                    return Ok(Some(item));
                }
                if state.closed {
                    if !state.drained {
                        state.drained = true;
                        drop(state);
                        self.drain_notify.notify_waiters();
                    }
                    return Ok(None);
                }
                self.item_notify.notified()
            };
            notified.await;
        }
    }

    /// Completes once the consumer has observed the empty/closed marker.
    pub async fn wait_for_queue_to_drain(&self) {
        loop {
            let notified = {
                let state = self.state.lock().await;
                if state.drained || state.aborted {
                    return;
                }
                self.drain_notify.notified()
            };
            notified.await;
        }
    }

    pub async fn is_closed(&self) -> bool {
        self.state.lock().await.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::operation::Operation;
    use crate::types::{Epoch, Lsn};

    fn op(lsn: i64) -> Operation {
        Operation::new_normal(Lsn(lsn), Epoch::ZERO, None, vec![]).0
    }

    #[tokio::test]
    async fn dequeue_returns_items_in_order() {
        let q: DispatchQueue<Operation> = DispatchQueue::new();
        q.enqueue_without_dispatch(op(1)).await.unwrap();
        q.enqueue_without_dispatch(op(2)).await.unwrap();
        q.dispatch();
        assert_eq!(q.dequeue().await.unwrap().unwrap().lsn, Lsn(1));
        assert_eq!(q.dequeue().await.unwrap().unwrap().lsn, Lsn(2));
    }

    #[tokio::test]
    async fn close_drains_then_reports_empty() {
        let q: DispatchQueue<Operation> = DispatchQueue::new();
        q.enqueue_without_dispatch(op(1)).await.unwrap();
        q.close().await;
        assert_eq!(q.dequeue().await.unwrap().unwrap().lsn, Lsn(1));
        assert!(q.dequeue().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn abort_drops_pending_and_cancels_dequeue() {
        let q: DispatchQueue<Operation> = DispatchQueue::new();
        q.enqueue_without_dispatch(op(1)).await.unwrap();
        q.abort().await;
        assert_eq!(q.dequeue().await, Err(ReplicatorError::Canceled));
    }

    #[tokio::test]
    async fn wait_for_drain_completes_after_close_and_drain() {
        let q: DispatchQueue<Operation> = DispatchQueue::new();
        q.close().await;
        q.dequeue().await.unwrap();
        q.wait_for_queue_to_drain().await;
    }

    #[tokio::test]
    async fn enqueue_after_close_is_rejected() {
        let q: DispatchQueue<Operation> = DispatchQueue::new();
        q.close().await;
        assert_eq!(
            q.enqueue_without_dispatch(op(1)).await,
            Err(ReplicatorError::ObjectClosed)
        );
    }
}
