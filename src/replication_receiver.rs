// src/replication_receiver.rs

//! C6: secondary-side replication queue, dispatcher, and epoch-change
//! barrier. The queue is anchored the first time `StartCopy` is observed;
//! operations are dispatched in order, with an `UpdateEpoch` pseudo-operation
//! interposed whenever the epoch advances.

use crate::error::{ReplicatorError, Result};
use crate::dispatch::DispatchQueue;
use crate::operation::Operation;
use crate::queue::OperationQueue;
use crate::types::{Epoch, Lsn};
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::Notify;

/// What actually flows through the replication dispatch stream: either a
/// normal/end-of-stream operation or the barrier the state provider must
/// apply synchronously before seeing the first operation of a new epoch.
#[derive(Debug, Clone)]
pub enum DispatchItem {
    Op(Operation),
    UpdateEpoch {
        epoch: Epoch,
        prev_epoch_last_lsn: Lsn,
    },
}

/// A single pending barrier: the epoch has already been observed and queued
/// into the dispatch stream, but the state provider hasn't completed
/// `UpdateEpoch` for it yet — commit is suspended until it does, for
/// persisted services.
struct PendingBarrier {
    epoch: Epoch,
    unblock_committed_at: Lsn,
}

struct ReceiverState {
    queue: OperationQueue,
    /// Arrivals past the first gap in the contiguous run, keyed by LSN —
    /// spec.md §4.6: "gaps are allowed but commit stops at the first gap".
    /// Drained back into `queue` as soon as the gap that blocked them closes.
    out_of_order: BTreeMap<Lsn, Operation>,
    out_of_order_bytes: u64,
    known_epoch: Epoch,
    pending_barrier: Option<PendingBarrier>,
    requires_service_ack: bool,
    max_count: usize,
    max_bytes: u64,
}

impl ReceiverState {
    fn queue_byte_estimate(&self) -> u64 {
        self.queue.bytes() + self.out_of_order_bytes
    }
}

pub struct ReplicationReceiver {
    state: parking_lot::Mutex<ReceiverState>,
    dispatch: Arc<DispatchQueue<DispatchItem>>,
    dispatched: parking_lot::Mutex<Vec<Operation>>,
    started: AtomicBool,
    saw_eos: AtomicBool,
    barrier_notify: Notify,
}

impl ReplicationReceiver {
    /// `replication_start_lsn` is the LSN *after* the copy checkpoint;
    /// operations at or below it are ignored. `starting_epoch` is the
    /// state provider's epoch at the time `StartCopy` was observed.
    pub fn new(
        replication_start_lsn: Lsn,
        starting_epoch: Epoch,
        requires_service_ack: bool,
        max_count: usize,
        max_bytes: u64,
    ) -> Self {
        // The queue itself stays unbounded: admission of out-of-order
        // arrivals and the window bound are arbitrated here, across both the
        // contiguous queue and the out-of-order buffer together.
        let queue = OperationQueue::new(replication_start_lsn.next(), 0, 0)
            .with_clean_on_complete(true);
        Self {
            state: parking_lot::Mutex::new(ReceiverState {
                queue,
                out_of_order: BTreeMap::new(),
                out_of_order_bytes: 0,
                known_epoch: starting_epoch,
                pending_barrier: None,
                requires_service_ack,
                max_count,
                max_bytes,
            }),
            dispatch: Arc::new(DispatchQueue::new()),
            dispatched: parking_lot::Mutex::new(Vec::new()),
            started: AtomicBool::new(true),
            saw_eos: AtomicBool::new(false),
            barrier_notify: Notify::new(),
        }
    }

    pub fn dispatch_queue(&self) -> Arc<DispatchQueue<DispatchItem>> {
        Arc::clone(&self.dispatch)
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::Acquire)
    }

    /// Admits `op` in-order when possible, buffering it out of order when
    /// it arrives ahead of a gap (spec.md §4.6: "gaps are allowed but commit
    /// stops at the first gap"). Every contiguous run that becomes available
    /// — including buffered arrivals the gap's closing now unblocks — is
    /// moved to the dispatch queue in order, interposing an `UpdateEpoch`
    /// barrier the first time an op's epoch exceeds the previously known
    /// epoch. Returns `QueueFull` if `op` falls outside the receive window.
    pub async fn process_replication_operation(
        &self,
        op: Operation,
        completed_lsn: Lsn,
    ) -> Result<()> {
        let mut to_dispatch: Vec<DispatchItem> = Vec::new();
        let mut newly_admitted: Vec<Operation> = Vec::new();
        {
            let mut state = self.state.lock();
            if op.lsn <= state.queue.first_lsn() || op.lsn <= state.queue.last_received_lsn() {
                return Ok(()); // already past this point, or a duplicate
            }
            if state.out_of_order.contains_key(&op.lsn) {
                return Ok(()); // duplicate out-of-order arrival
            }

            let window_span = (op.lsn.0 - state.queue.last_completed_lsn().0).max(0) as usize;
            let op_bytes = op.byte_size();
            let over_count = state.max_count > 0 && window_span > state.max_count;
            let over_bytes = state.max_bytes > 0
                && state.queue_byte_estimate() + op_bytes > state.max_bytes;
            if over_count || over_bytes {
                return Err(ReplicatorError::QueueFull);
            }

            let expected = state.queue.last_received_lsn().next();
            if op.lsn != expected {
                state.out_of_order_bytes += op_bytes;
                state.out_of_order.insert(op.lsn, op);
                return Ok(());
            }

            let mut next = op;
            loop {
                if next.epoch > state.known_epoch {
                    let prev_epoch_last_lsn = state.queue.last_received_lsn();
                    to_dispatch.push(DispatchItem::UpdateEpoch {
                        epoch: next.epoch,
                        prev_epoch_last_lsn,
                    });
                    state.pending_barrier = Some(PendingBarrier {
                        epoch: next.epoch,
                        unblock_committed_at: prev_epoch_last_lsn,
                    });
                    state.known_epoch = next.epoch;
                }
                state.queue.try_enqueue(next.clone())?;
                newly_admitted.push(next.clone());
                to_dispatch.push(DispatchItem::Op(next));

                let expected = state.queue.last_received_lsn().next();
                match state.out_of_order.remove(&expected) {
                    Some(buffered) => {
                        state.out_of_order_bytes -= buffered.byte_size();
                        next = buffered;
                    }
                    None => break,
                }
            }
            state.queue.update_commit_head(state.queue.last_received_lsn());
            state.queue.complete(Some(completed_lsn));
        }

        self.dispatched.lock().extend(newly_admitted);
        for item in to_dispatch {
            self.dispatch.enqueue_without_dispatch(item).await?;
        }
        self.dispatch.dispatch();
        Ok(())
    }

    /// Enqueues the end-of-stream sentinel; closes the dispatch queue once
    /// the consumer drains it.
    pub async fn signal_end_of_stream(&self, epoch: Epoch) -> Result<()> {
        if self.saw_eos.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let lsn = self.state.lock().queue.last_received_lsn().next();
        let (eos, _rx) = Operation::end_of_stream(lsn, epoch);
        self.dispatched.lock().push(eos.clone());
        self.dispatch
            .enqueue_without_dispatch(DispatchItem::Op(eos))
            .await?;
        self.dispatch.dispatch();
        self.dispatch.close().await;
        Ok(())
    }

    /// Called when the state provider acks LSN `lsn`; advances `completed`
    /// and, if this crosses a pending barrier's watermark, clears it (the
    /// barrier's `UpdateEpoch` may now be considered unblocked).
    pub fn on_service_ack(&self, lsn: Lsn) -> bool {
        let mut state = self.state.lock();
        let progressed = state.queue.complete(Some(lsn));
        let mut unblocked = false;
        if let Some(barrier) = &state.pending_barrier {
            if lsn >= barrier.unblock_committed_at {
                state.pending_barrier = None;
                unblocked = true;
            }
        }
        drop(state);
        if unblocked {
            self.barrier_notify.notify_waiters();
        }
        progressed
    }

    pub fn barrier_is_unblocked(&self) -> bool {
        self.state.lock().pending_barrier.is_none()
    }

    /// Overrides queue retention after the fact (spec.md §3's
    /// `secondaryClearAcknowledgedOperations`): when `false`, completed
    /// operations are kept around (up to the usual count/byte bounds) so a
    /// subsequent secondary-to-primary promotion can re-serve recent LSNs.
    pub fn set_clean_on_complete(&self, clean: bool) {
        self.state.lock().queue.set_clean_on_complete(clean);
    }

    /// Blocks until the currently pending barrier (if any) clears, i.e.
    /// every operation before it has been service-acked. Returns
    /// immediately if there is no barrier pending.
    pub async fn wait_until_barrier_unblocked(&self) {
        loop {
            let notified = {
                if self.barrier_is_unblocked() {
                    return;
                }
                self.barrier_notify.notified()
            };
            notified.await;
        }
    }

    /// True iff every dispatched operation (including EOS) has been acked,
    /// or service acks aren't required for this service.
    pub fn all_operations_acked(&self) -> bool {
        let requires = self.state.lock().requires_service_ack;
        if !requires {
            return self.saw_eos.load(Ordering::Acquire);
        }
        self.saw_eos.load(Ordering::Acquire)
            && self
                .dispatched
                .lock()
                .iter()
                .all(Operation::is_acknowledged)
    }

    pub fn last_committed_lsn(&self) -> Lsn {
        self.state.lock().queue.last_committed_lsn()
    }

    pub fn last_received_lsn(&self) -> Lsn {
        self.state.lock().queue.last_received_lsn()
    }

    pub fn last_completed_lsn(&self) -> Lsn {
        self.state.lock().queue.last_completed_lsn()
    }

    /// Raw operations still retained from `from_lsn` on — used when this
    /// receiver's queue is handed wholesale to a newly promoted primary.
    pub fn get_operations(&self, from_lsn: Lsn) -> Option<Vec<Operation>> {
        self.state.lock().queue.get_operations(from_lsn)
    }

    /// Drops entries whose LSN exceeds `max_count` beyond `completed`,
    /// trimming off the head before a secondary-to-primary handover
    /// (spec.md §4.10: "excess entries beyond `maxPrimaryQueueSize` are
    /// `Complete`d off the head before handover").
    pub fn trim_to_primary_queue_size(&self, max_primary_queue_size: usize) {
        let mut state = self.state.lock();
        if max_primary_queue_size == 0 {
            return;
        }
        let received = state.queue.last_received_lsn();
        let committed = state.queue.last_committed_lsn();
        let excess = (committed.0 - received.0).unsigned_abs() as usize;
        if excess > max_primary_queue_size {
            let cutoff = Lsn(received.0 - max_primary_queue_size as i64);
            state.queue.complete(Some(cutoff.min(committed)));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn op(lsn: i64, epoch: Epoch) -> Operation {
        Operation::new_normal(Lsn(lsn), epoch, None, vec![]).0
    }

    #[tokio::test]
    async fn epoch_advance_interposes_update_epoch_before_first_new_epoch_op() {
        let r = ReplicationReceiver::new(Lsn(10), Epoch::new(1, 5), false, 0, 0);
        r.process_replication_operation(op(11, Epoch::new(1, 6)), Lsn(11))
            .await
            .unwrap();
        let dq = r.dispatch_queue();
        match dq.dequeue().await.unwrap().unwrap() {
            DispatchItem::UpdateEpoch {
                epoch,
                prev_epoch_last_lsn,
            } => {
                assert_eq!(epoch, Epoch::new(1, 6));
                assert_eq!(prev_epoch_last_lsn, Lsn(10));
            }
            other => panic!("expected barrier, got {other:?}"),
        }
        match dq.dequeue().await.unwrap().unwrap() {
            DispatchItem::Op(op) => assert_eq!(op.lsn, Lsn(11)),
            other => panic!("expected op, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn stale_operation_below_first_lsn_is_ignored() {
        let r = ReplicationReceiver::new(Lsn(10), Epoch::ZERO, false, 0, 0);
        // first_lsn starts at replication_start_lsn (10); anything <= that is stale.
        r.process_replication_operation(op(5, Epoch::ZERO), Lsn::INVALID)
            .await
            .unwrap();
        assert_eq!(r.last_received_lsn(), Lsn(10));
    }

    /// spec.md §4.6: "gaps are allowed but commit stops at the first gap".
    /// LSN 12 arrives before LSN 11; it's buffered out of order and doesn't
    /// advance `received`/`committed`. Once 11 arrives, both 11 and the
    /// buffered 12 are admitted and dispatched in order.
    #[tokio::test]
    async fn out_of_order_arrival_is_buffered_until_the_gap_closes() {
        let r = ReplicationReceiver::new(Lsn(10), Epoch::ZERO, false, 0, 0);
        r.process_replication_operation(op(12, Epoch::ZERO), Lsn::INVALID)
            .await
            .unwrap();
        assert_eq!(r.last_received_lsn(), Lsn(10));
        assert_eq!(r.last_committed_lsn(), Lsn(10));

        r.process_replication_operation(op(11, Epoch::ZERO), Lsn::INVALID)
            .await
            .unwrap();
        assert_eq!(r.last_received_lsn(), Lsn(12));
        assert_eq!(r.last_committed_lsn(), Lsn(12));

        let dq = r.dispatch_queue();
        match dq.dequeue().await.unwrap().unwrap() {
            DispatchItem::Op(op) => assert_eq!(op.lsn, Lsn(11)),
            other => panic!("expected op 11, got {other:?}"),
        }
        match dq.dequeue().await.unwrap().unwrap() {
            DispatchItem::Op(op) => assert_eq!(op.lsn, Lsn(12)),
            other => panic!("expected op 12, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn arrival_past_the_receive_window_is_rejected_as_queue_full() {
        let r = ReplicationReceiver::new(Lsn(10), Epoch::ZERO, false, 4, 0);
        let err = r
            .process_replication_operation(op(15, Epoch::ZERO), Lsn::INVALID)
            .await;
        assert!(matches!(err, Err(ReplicatorError::QueueFull)));
    }
}
