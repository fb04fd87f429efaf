// src/copy_receiver.rs

//! C5: secondary-side bounded copy queue and gating. Orders incoming copy
//! operations, discards duplicates, and exposes a dispatch queue the state
//! provider drains; tracks service-acks for persisted services.

use crate::dispatch::DispatchQueue;
use crate::error::Result;
use crate::operation::Operation;
use crate::queue::OperationQueue;
use crate::types::Lsn;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

pub struct CopyReceiver {
    queue: parking_lot::Mutex<OperationQueue>,
    dispatch: Arc<DispatchQueue<Operation>>,
    requires_service_ack: bool,
    dispatched: parking_lot::Mutex<Vec<Operation>>,
    saw_last: AtomicBool,
}

impl CopyReceiver {
    pub fn new(requires_service_ack: bool, max_count: usize, max_bytes: u64) -> Self {
        Self {
            queue: parking_lot::Mutex::new(OperationQueue::new(Lsn(1), max_count, max_bytes)),
            dispatch: Arc::new(DispatchQueue::new()),
            requires_service_ack,
            dispatched: parking_lot::Mutex::new(Vec::new()),
            saw_last: AtomicBool::new(false),
        }
    }

    pub fn dispatch_queue(&self) -> Arc<DispatchQueue<Operation>> {
        Arc::clone(&self.dispatch)
    }

    /// Enqueues `op` (a duplicate LSN is silently ignored) and hands it to
    /// the dispatch queue in order; closes the dispatch queue once the
    /// last copy operation has been handed off.
    pub async fn process_copy_operation(&self, op: Operation, is_last: bool) -> Result<()> {
        if self.saw_last.load(Ordering::Acquire) {
            return Ok(()); // stale retransmit after EOF
        }
        let already_received = {
            let q = self.queue.lock();
            op.lsn <= q.last_received_lsn()
        };
        if already_received {
            return Ok(());
        }
        self.queue.lock().try_enqueue(op.clone())?;
        self.dispatched.lock().push(op.clone());
        self.dispatch.enqueue_without_dispatch(op).await?;
        self.dispatch.dispatch();

        if is_last {
            self.saw_last.store(true, Ordering::Release);
            self.dispatch.close().await;
        }
        Ok(())
    }

    /// True iff every dispatched operation has had `Acknowledge` invoked, or
    /// the receiver does not require service acks at all (non-persisted).
    pub fn all_operations_acked(&self) -> bool {
        if !self.requires_service_ack {
            return self.saw_last.load(Ordering::Acquire);
        }
        self.saw_last.load(Ordering::Acquire)
            && self
                .dispatched
                .lock()
                .iter()
                .all(Operation::is_acknowledged)
    }

    pub fn last_received_lsn(&self) -> Lsn {
        self.queue.lock().last_received_lsn()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Epoch;

    fn op(lsn: i64) -> Operation {
        Operation::new_normal(Lsn(lsn), Epoch::ZERO, None, vec![]).0
    }

    #[tokio::test]
    async fn duplicate_copy_operation_is_ignored() {
        let r = CopyReceiver::new(false, 0, 0);
        r.process_copy_operation(op(1), false).await.unwrap();
        r.process_copy_operation(op(1), false).await.unwrap();
        assert_eq!(r.last_received_lsn(), Lsn(1));
    }

    #[tokio::test]
    async fn last_operation_closes_dispatch_queue() {
        let r = CopyReceiver::new(false, 0, 0);
        r.process_copy_operation(op(1), false).await.unwrap();
        r.process_copy_operation(op(2), true).await.unwrap();
        let dq = r.dispatch_queue();
        assert_eq!(dq.dequeue().await.unwrap().unwrap().lsn, Lsn(1));
        assert_eq!(dq.dequeue().await.unwrap().unwrap().lsn, Lsn(2));
        assert!(dq.dequeue().await.unwrap().is_none());
        assert!(r.all_operations_acked());
    }

    #[tokio::test]
    async fn persisted_service_requires_explicit_acks() {
        let r = CopyReceiver::new(true, 0, 0);
        let dispatched_op = op(1);
        r.process_copy_operation(dispatched_op.clone(), true)
            .await
            .unwrap();
        assert!(!r.all_operations_acked());
        dispatched_op.acknowledge().unwrap();
        // the tracked clone shares ack state via Operation's Arc slot
        assert!(r.all_operations_acked());
    }
}
