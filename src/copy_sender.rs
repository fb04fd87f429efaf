// src/copy_sender.rs

//! C4: drives a one-shot enumeration of the primary's copy state to one
//! idle secondary, reusing the same queue/sender machinery as the
//! replication stream but over its own LSN space (copy ops are numbered
//! 1..N independent of the replication sequence).

use crate::error::{ReplicatorError, Result};
use crate::operation::Operation;
use crate::queue::OperationQueue;
use crate::sender::{ReliableOperationSender, SendCallback};
use crate::types::{Epoch, Lsn};
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::time::{Duration, Instant};
use tokio::sync::{oneshot, Notify};

pub struct CopySenderConfig {
    pub max_count: usize,
    pub max_bytes: u64,
    pub retry_interval: Duration,
    pub decay_factor: f64,
    pub slow_secondary_age_threshold: Duration,
    pub initial_send_window_size: usize,
    pub max_send_window_size: usize,
}

pub struct CopySender {
    queue: parking_lot::Mutex<OperationQueue>,
    sender: parking_lot::Mutex<ReliableOperationSender>,
    room_notify: Notify,
    progress_notify: Notify,
    canceled: AtomicBool,
    last_replication_operation_during_copy: AtomicI64,
    epoch: Epoch,
}

impl CopySender {
    /// Builds the sender. Callers drive it to completion with [`CopySender::run`],
    /// passing their own oneshot pair so they can await the outcome.
    pub fn new(epoch: Epoch, cfg: CopySenderConfig, send_callback: SendCallback) -> Arc<Self> {
        // The copy queue's "committed" concept is the secondary's copy-quorum
        // ack, not anything this queue derives itself (see `process_on_ack`).
        let queue = OperationQueue::new(Lsn(1), cfg.max_count, cfg.max_bytes)
            .with_ignore_commit(true);
        let sender = ReliableOperationSender::new(
            cfg.initial_send_window_size,
            cfg.max_send_window_size,
            cfg.retry_interval,
            cfg.decay_factor,
            cfg.slow_secondary_age_threshold,
            send_callback,
        );
        Arc::new(Self {
            queue: parking_lot::Mutex::new(queue),
            sender: parking_lot::Mutex::new(sender),
            room_notify: Notify::new(),
            progress_notify: Notify::new(),
            canceled: AtomicBool::new(false),
            last_replication_operation_during_copy: AtomicI64::new(Lsn::INVALID.0),
            epoch,
        })
    }

    /// Lets a secondary's post-copy replication start LSN be observed so
    /// promotion-to-active can be gated on it.
    pub fn update_last_replication_operation_during_copy(&self, lsn: Lsn) {
        self.last_replication_operation_during_copy
            .store(lsn.0, Ordering::Release);
    }

    pub fn last_replication_operation_during_copy(&self) -> Lsn {
        Lsn(self.last_replication_operation_during_copy.load(Ordering::Acquire))
    }

    pub fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        self.room_notify.notify_waiters();
        self.progress_notify.notify_waiters();
    }

    /// Propagates a `(copy_received_lsn, copy_quorum_lsn)` ack pair from the
    /// secondary into the copy sender's window and completion tracking.
    pub fn process_on_ack(&self, received_lsn: Lsn, quorum_lsn: Lsn) -> Result<()> {
        if received_lsn.is_valid() {
            self.sender
                .lock()
                .process_on_ack(Instant::now(), received_lsn, quorum_lsn)?;
            self.queue.lock().complete(Some(quorum_lsn.max(Lsn::ZERO)));
            self.room_notify.notify_waiters();
            self.progress_notify.notify_waiters();
        }
        Ok(())
    }

    pub fn on_tick(&self) {
        self.sender.lock().on_tick(Instant::now());
    }

    /// Drives the enumeration to completion, reporting the result on `done`.
    /// Runs until the enumerator is exhausted and every op is apply-acked,
    /// or until `cancel()` is called.
    pub async fn run(
        self: Arc<Self>,
        mut copy_state: BoxStream<'static, Operation>,
        done: oneshot::Sender<Result<()>>,
    ) {
        let mut next_lsn = Lsn(1);
        let mut exhausted = false;

        loop {
            if self.canceled.load(Ordering::SeqCst) {
                let _ = done.send(Err(ReplicatorError::Canceled));
                return;
            }

            if !exhausted {
                if self.queue.lock().is_full() {
                    self.room_notify.notified().await;
                    continue;
                }
                match copy_state.next().await {
                    Some(raw) => {
                        let (tagged, _rx) =
                            Operation::new_normal(next_lsn, self.epoch, None, raw.segments.clone());
                        self.enqueue_and_send(tagged);
                        next_lsn = next_lsn.next();
                    }
                    None => {
                        let (eos, _rx) = Operation::end_of_stream(next_lsn, self.epoch);
                        self.enqueue_and_send(eos);
                        exhausted = true;
                    }
                }
            } else if self.queue.lock().last_completed_lsn() >= next_lsn.prev() {
                let _ = done.send(Ok(()));
                return;
            } else {
                self.progress_notify.notified().await;
            }
        }
    }

    fn enqueue_and_send(&self, op: Operation) {
        let now = Instant::now();
        if self.queue.lock().try_enqueue(op.clone()).is_ok() {
            self.sender.lock().add(now, vec![op]);
        }
    }
}
