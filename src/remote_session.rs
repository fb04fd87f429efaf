// src/remote_session.rs

//! C7: the primary's per-secondary session — the core state machine. Drives
//! build (copy), steady-state replication, catch-up, and graceful close for
//! a single secondary.

use crate::copy_sender::CopySender;
use crate::error::{ReplicatorError, Result};
use crate::operation::Operation;
use crate::sender::{ReliableOperationSender, SendCallback};
use crate::types::{Epoch, Lsn, ReplicaRole, ReplicaTarget};
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::oneshot;
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Initial,
    CopyStarting,
    Copying,
    Catchup,
    Active,
    Closing,
    Closed,
    Canceled,
    Faulted,
}

impl SessionState {
    pub fn is_idle_only(self) -> bool {
        matches!(
            self,
            SessionState::Initial | SessionState::CopyStarting | SessionState::Copying
        )
    }

    pub fn is_active_only(self) -> bool {
        matches!(self, SessionState::Catchup | SessionState::Active)
    }
}

/// Four watermarks carried by every ack: replication receive/quorum, copy
/// receive/quorum. Any axis may be `Lsn::INVALID` meaning "not reporting".
#[derive(Debug, Clone, Copy)]
pub struct AckNumbers {
    pub repl_received_lsn: Lsn,
    pub repl_quorum_lsn: Lsn,
    pub copy_received_lsn: Lsn,
    pub copy_quorum_lsn: Lsn,
}

pub struct RemoteSession {
    pub target: ReplicaTarget,
    state: parking_lot::Mutex<SessionState>,
    role: parking_lot::Mutex<ReplicaRole>,
    current_epoch: parking_lot::Mutex<Epoch>,
    replication_sender: parking_lot::Mutex<ReliableOperationSender>,
    start_copy_sender: parking_lot::Mutex<Option<ReliableOperationSender>>,
    copy_sender: parking_lot::Mutex<Option<Arc<CopySender>>>,
    replication_start_lsn: AtomicI64,
    repl_received_lsn: AtomicI64,
    repl_quorum_lsn: AtomicI64,
    copy_received_lsn: AtomicI64,
    copy_quorum_lsn: AtomicI64,
    ack_processing_in_progress: AtomicBool,
    pending_ack: parking_lot::Mutex<Option<AckNumbers>>,
    build_waiter: tokio::sync::Mutex<Option<oneshot::Sender<Result<()>>>>,
    progress_callback: parking_lot::Mutex<Option<Box<dyn Fn() + Send + Sync>>>,
}

impl RemoteSession {
    pub fn new(
        target: ReplicaTarget,
        epoch: Epoch,
        initial_send_window_size: usize,
        max_send_window_size: usize,
        retry_interval: Duration,
        decay_factor: f64,
        slow_secondary_age_threshold: Duration,
        replication_send_callback: SendCallback,
    ) -> Self {
        let sender = ReliableOperationSender::new(
            initial_send_window_size,
            max_send_window_size,
            retry_interval,
            decay_factor,
            slow_secondary_age_threshold,
            replication_send_callback,
        );
        Self {
            target,
            state: parking_lot::Mutex::new(SessionState::Initial),
            role: parking_lot::Mutex::new(ReplicaRole::Idle),
            current_epoch: parking_lot::Mutex::new(epoch),
            replication_sender: parking_lot::Mutex::new(sender),
            start_copy_sender: parking_lot::Mutex::new(None),
            copy_sender: parking_lot::Mutex::new(None),
            replication_start_lsn: AtomicI64::new(Lsn::INVALID.0),
            repl_received_lsn: AtomicI64::new(Lsn::ZERO.0),
            repl_quorum_lsn: AtomicI64::new(Lsn::ZERO.0),
            copy_received_lsn: AtomicI64::new(Lsn::ZERO.0),
            copy_quorum_lsn: AtomicI64::new(Lsn::ZERO.0),
            ack_processing_in_progress: AtomicBool::new(false),
            pending_ack: parking_lot::Mutex::new(None),
            build_waiter: tokio::sync::Mutex::new(None),
            progress_callback: parking_lot::Mutex::new(None),
        }
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock()
    }

    pub fn role(&self) -> ReplicaRole {
        *self.role.lock()
    }

    /// Promotes the session to `Active`, requiring copy to be fully done
    /// (spec.md §4.10: "Promotion to active secondary").
    pub fn promote_to_active(&self) {
        *self.role.lock() = ReplicaRole::Active;
        *self.state.lock() = SessionState::Active;
    }

    pub fn repl_quorum_lsn(&self) -> Lsn {
        Lsn(self.repl_quorum_lsn.load(Ordering::Acquire))
    }

    pub fn repl_received_lsn(&self) -> Lsn {
        Lsn(self.repl_received_lsn.load(Ordering::Acquire))
    }

    pub fn set_progress_callback(&self, cb: Box<dyn Fn() + Send + Sync>) {
        *self.progress_callback.lock() = Some(cb);
    }

    /// Begins build: creates a retransmitted `StartCopy` sender via
    /// `start_copy_send_callback` and registers a waiter that resolves on
    /// first ack (or `Canceled`/fault).
    pub async fn begin_establish_copy(
        &self,
        replication_start_lsn: Lsn,
        retry_interval: Duration,
        start_copy_send_callback: SendCallback,
    ) -> oneshot::Receiver<Result<()>> {
        self.replication_start_lsn
            .store(replication_start_lsn.0, Ordering::Release);
        *self.state.lock() = SessionState::CopyStarting;

        let mut sender = ReliableOperationSender::new(
            1,
            1,
            retry_interval,
            0.2,
            Duration::from_secs(30),
            start_copy_send_callback,
        );
        // The StartCopy message itself is a control message, not a queued
        // operation with a real LSN; LSN 1 is a placeholder in this
        // dedicated sender's own numbering.
        let (marker, _rx) = Operation::new_normal(Lsn(1), *self.current_epoch.lock(), None, vec![]);
        sender.add(Instant::now(), vec![marker]);
        *self.start_copy_sender.lock() = Some(sender);

        let (tx, rx) = oneshot::channel();
        *self.build_waiter.lock().await = Some(tx);
        rx
    }

    pub fn on_start_copy_tick(&self) {
        if let Some(sender) = self.start_copy_sender.lock().as_mut() {
            sender.on_tick(Instant::now());
        }
    }

    pub fn attach_copy_sender(&self, sender: Arc<CopySender>) {
        *self.copy_sender.lock() = Some(sender);
        *self.state.lock() = SessionState::Copying;
    }

    /// Single-flight ack handler: a non-owning caller only stashes its
    /// numbers as the latest pending ack and returns immediately; the owner
    /// (the caller that wins the `ack_processing_in_progress` flag) drains
    /// and applies the pending slot in a loop until it's empty, re-checking
    /// after clearing the flag so an ack that lands in the gap between "slot
    /// looked empty" and "flag cleared" still gets picked up by someone.
    pub async fn on_ack(&self, ack: AckNumbers) -> Result<()> {
        *self.pending_ack.lock() = Some(ack);
        if self.ack_processing_in_progress.swap(true, Ordering::AcqRel) {
            return Ok(());
        }
        let result = 'drain: loop {
            loop {
                let next = self.pending_ack.lock().take();
                match next {
                    Some(ack) => {
                        if let Err(e) = self.apply_ack_numbers(ack) {
                            break 'drain Err(e);
                        }
                    }
                    None => break,
                }
            }
            self.ack_processing_in_progress.store(false, Ordering::Release);
            if self.pending_ack.lock().is_none() {
                break Ok(());
            }
            // an ack landed after the drain loop emptied the slot but before
            // we cleared the flag; try to reclaim ownership and keep going.
            if self.ack_processing_in_progress.swap(true, Ordering::AcqRel) {
                break Ok(());
            }
        };
        self.ack_processing_in_progress.store(false, Ordering::Release);
        result
    }

    fn apply_ack_numbers(&self, ack: AckNumbers) -> Result<()> {
        let mut advanced = false;

        if ack.repl_received_lsn.is_valid() {
            if ack.repl_received_lsn < Lsn(self.repl_quorum_lsn.load(Ordering::Acquire)) {
                return Err(ReplicatorError::InvalidState(
                    "repl received ack regressed below quorum".into(),
                ));
            }
            advanced |= self.advance_atomic(&self.repl_received_lsn, ack.repl_received_lsn.0);
        }
        if ack.repl_quorum_lsn.is_valid() {
            advanced |= self.advance_atomic(&self.repl_quorum_lsn, ack.repl_quorum_lsn.0);
        }
        if ack.copy_received_lsn.is_valid() {
            advanced |= self.advance_atomic(&self.copy_received_lsn, ack.copy_received_lsn.0);
        }
        if ack.copy_quorum_lsn.is_valid() {
            advanced |= self.advance_atomic(&self.copy_quorum_lsn, ack.copy_quorum_lsn.0);
        }

        let replication_start_lsn = Lsn(self.replication_start_lsn.load(Ordering::Acquire));
        if replication_start_lsn.is_valid()
            && ack.repl_received_lsn.is_valid()
            && ack.repl_received_lsn >= replication_start_lsn.prev()
        {
            if let Some(sender) = self.start_copy_sender.lock().take() {
                drop(sender);
                self.complete_build(Ok(()));
            }
        }

        if ack.repl_received_lsn.is_valid() || ack.repl_quorum_lsn.is_valid() {
            self.replication_sender.lock().process_on_ack(
                Instant::now(),
                ack.repl_received_lsn.max(Lsn(self.repl_received_lsn.load(Ordering::Acquire))),
                ack.repl_quorum_lsn.max(Lsn(self.repl_quorum_lsn.load(Ordering::Acquire))),
            )?;
        }
        if ack.copy_received_lsn.is_valid() || ack.copy_quorum_lsn.is_valid() {
            if let Some(copy_sender) = self.copy_sender.lock().clone() {
                copy_sender.process_on_ack(
                    Lsn(self.copy_received_lsn.load(Ordering::Acquire)),
                    Lsn(self.copy_quorum_lsn.load(Ordering::Acquire)),
                )?;
            }
        }

        if advanced {
            if let Some(cb) = self.progress_callback.lock().as_ref() {
                cb();
            }
        }
        Ok(())
    }

    /// Advances `cell` to `candidate` iff it's larger, atomically — a plain
    /// load-then-store here would lose an update if two acks race past the
    /// load before either stores.
    fn advance_atomic(&self, cell: &AtomicI64, candidate: i64) -> bool {
        let previous = cell.fetch_max(candidate, Ordering::AcqRel);
        candidate > previous
    }

    fn complete_build(&self, result: Result<()>) {
        if let Ok(mut guard) = self.build_waiter.try_lock() {
            if let Some(tx) = guard.take() {
                let _ = tx.send(result);
            }
        }
    }

    /// Pushes a replication operation into this session's sender.
    /// `completed_lsn` rides along as a trim hint for the secondary.
    pub fn add_replicate(&self, op: Operation, _completed_lsn: Lsn) {
        self.replication_sender.lock().add(Instant::now(), vec![op]);
    }

    pub fn on_replication_tick(&self) {
        self.replication_sender.lock().on_tick(Instant::now());
    }

    /// Ticks the copy sender's retry timer, if one is currently attached.
    pub fn on_copy_tick(&self) {
        if let Some(copy_sender) = self.copy_sender.lock().clone() {
            copy_sender.on_tick();
        }
    }

    /// Cancels the pending build op with `Canceled` and aborts the copy
    /// sender; the replication sender is left running until `close`.
    pub fn cancel(&self) {
        *self.state.lock() = SessionState::Canceled;
        if let Some(copy_sender) = self.copy_sender.lock().clone() {
            copy_sender.cancel();
        }
        self.complete_build(Err(ReplicatorError::Canceled));
    }

    pub fn fault(&self, reason: &str) {
        warn!(remote = %self.target, %reason, "remote session faulted");
        *self.state.lock() = SessionState::Faulted;
        self.complete_build(Err(ReplicatorError::OperationFailed(reason.to_string())));
    }

    pub async fn close(&self) {
        *self.state.lock() = SessionState::Closing;
        self.replication_sender.lock().close();
        if let Some(sender) = self.start_copy_sender.lock().take() {
            drop(sender);
        }
        if let Some(copy_sender) = self.copy_sender.lock().take() {
            copy_sender.cancel();
        }
        *self.state.lock() = SessionState::Closed;
        debug!(remote = %self.target, "remote session closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::IncarnationId;

    fn target() -> ReplicaTarget {
        ReplicaTarget {
            address: "r1:9000".into(),
            replica_id: crate::types::ReplicaId(1),
            incarnation_id: IncarnationId(1),
        }
    }

    fn session() -> RemoteSession {
        RemoteSession::new(
            target(),
            Epoch::ZERO,
            4,
            16,
            Duration::from_millis(50),
            0.2,
            Duration::from_secs(30),
            Box::new(|_, _| true),
        )
    }

    #[tokio::test]
    async fn repl_received_never_regresses_below_quorum() {
        let s = session();
        s.on_ack(AckNumbers {
            repl_received_lsn: Lsn(5),
            repl_quorum_lsn: Lsn(5),
            copy_received_lsn: Lsn::INVALID,
            copy_quorum_lsn: Lsn::INVALID,
        })
        .await
        .unwrap();
        let err = s
            .on_ack(AckNumbers {
                repl_received_lsn: Lsn(3),
                repl_quorum_lsn: Lsn::INVALID,
                copy_received_lsn: Lsn::INVALID,
                copy_quorum_lsn: Lsn::INVALID,
            })
            .await;
        assert!(err.is_err());
    }

    #[tokio::test]
    async fn watermarks_monotonic_and_received_ge_quorum() {
        let s = session();
        s.on_ack(AckNumbers {
            repl_received_lsn: Lsn(3),
            repl_quorum_lsn: Lsn(2),
            copy_received_lsn: Lsn::INVALID,
            copy_quorum_lsn: Lsn::INVALID,
        })
        .await
        .unwrap();
        assert!(s.repl_received_lsn() >= s.repl_quorum_lsn());
    }

    /// Two acks racing past `on_ack` concurrently must not lose an update:
    /// the higher watermark wins regardless of which task's `apply` runs
    /// (or is deferred to the owner's drain loop).
    #[tokio::test]
    async fn concurrent_acks_converge_on_the_higher_watermark() {
        let s = Arc::new(session());
        let a = Arc::clone(&s);
        let b = Arc::clone(&s);
        let (r1, r2) = tokio::join!(
            a.on_ack(AckNumbers {
                repl_received_lsn: Lsn(5),
                repl_quorum_lsn: Lsn(5),
                copy_received_lsn: Lsn::INVALID,
                copy_quorum_lsn: Lsn::INVALID,
            }),
            b.on_ack(AckNumbers {
                repl_received_lsn: Lsn(8),
                repl_quorum_lsn: Lsn(8),
                copy_received_lsn: Lsn::INVALID,
                copy_quorum_lsn: Lsn::INVALID,
            }),
        );
        r1.unwrap();
        r2.unwrap();
        assert_eq!(s.repl_received_lsn(), Lsn(8));
        assert_eq!(s.repl_quorum_lsn(), Lsn(8));
    }
}
