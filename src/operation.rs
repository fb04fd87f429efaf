// src/operation.rs

//! The unit of replicated work: metadata, payload segments, and the
//! ack-callback contract the state provider fulfills exactly once.

use crate::error::{ReplicatorError, Result};
use crate::types::{Epoch, Lsn};
use bytes::Bytes;
use std::fmt;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::oneshot;

/// Opaque passthrough metadata. The engine never interprets this; it is
/// carried alongside an operation purely for the state provider's benefit
/// (e.g. grouping ops that must commit as one atomic unit).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct AtomicGroupId(pub u64);

/// The two flavors of value that travel through a dispatch stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationKind {
    Normal,
    /// Sentinel marking graceful stream termination. At most one may ever
    /// be enqueued per stream; its ack (if present) must fire exactly once.
    EndOfStream,
}

/// A single replicated or copied value, ordered by `lsn`.
///
/// Cloning an `Operation` is cheap (the payload is `Bytes`, ack state is
/// shared via `Arc`); every clone shares the same underlying ack callback,
/// so acknowledging any clone satisfies all of them.
#[derive(Clone)]
pub struct Operation {
    pub kind: OperationKind,
    pub lsn: Lsn,
    pub atomic_group_id: Option<AtomicGroupId>,
    pub epoch: Epoch,
    pub segments: Vec<Bytes>,
    ack: Arc<AckSlot>,
}

struct AckSlot {
    fired: AtomicBool,
    sender: parking_lot::Mutex<Option<oneshot::Sender<()>>>,
}

impl Operation {
    /// Builds a normal operation. The returned receiver resolves once
    /// [`Operation::acknowledge`] is called, for callers that need to await it.
    pub fn new_normal(
        lsn: Lsn,
        epoch: Epoch,
        atomic_group_id: Option<AtomicGroupId>,
        segments: Vec<Bytes>,
    ) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let op = Self {
            kind: OperationKind::Normal,
            lsn,
            atomic_group_id,
            epoch,
            segments,
            ack: Arc::new(AckSlot {
                fired: AtomicBool::new(false),
                sender: parking_lot::Mutex::new(Some(tx)),
            }),
        };
        (op, rx)
    }

    /// Builds the end-of-stream sentinel for the given epoch/lsn.
    pub fn end_of_stream(lsn: Lsn, epoch: Epoch) -> (Self, oneshot::Receiver<()>) {
        let (tx, rx) = oneshot::channel();
        let op = Self {
            kind: OperationKind::EndOfStream,
            lsn,
            atomic_group_id: None,
            epoch,
            segments: Vec::new(),
            ack: Arc::new(AckSlot {
                fired: AtomicBool::new(false),
                sender: parking_lot::Mutex::new(Some(tx)),
            }),
        };
        (op, rx)
    }

    /// Total logical payload bytes, used for queue byte accounting.
    pub fn byte_size(&self) -> u64 {
        self.segments.iter().map(|s| s.len() as u64).sum()
    }

    pub fn is_end_of_stream(&self) -> bool {
        matches!(self.kind, OperationKind::EndOfStream)
    }

    /// Fulfills the ack contract. Calling this more than once is an error
    /// per spec; the first call wins and later calls observe `InvalidState`.
    pub fn acknowledge(&self) -> Result<()> {
        if self.ack.fired.swap(true, Ordering::AcqRel) {
            return Err(ReplicatorError::InvalidState(format!(
                "operation at lsn {} acknowledged more than once",
                self.lsn
            )));
        }
        if let Some(tx) = self.ack.sender.lock().take() {
            // Receiver may have been dropped (e.g. ignored during close drain);
            // that's not an error for the acker.
            let _ = tx.send(());
        }
        Ok(())
    }

    /// Marks the ack as satisfied without notifying a waiter, used when a
    /// close drain discards operations per the documented timeout behavior.
    pub fn mark_ack_ignored(&self) {
        self.ack.fired.store(true, Ordering::Release);
        self.ack.sender.lock().take();
    }

    pub fn is_acknowledged(&self) -> bool {
        self.ack.fired.load(Ordering::Acquire)
    }
}

impl fmt::Debug for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Operation")
            .field("kind", &self.kind)
            .field("lsn", &self.lsn)
            .field("epoch", &self.epoch)
            .field("bytes", &self.byte_size())
            .field("acked", &self.is_acknowledged())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acknowledge_is_exactly_once() {
        let (op, _rx) = Operation::new_normal(Lsn(1), Epoch::ZERO, None, vec![]);
        assert!(op.acknowledge().is_ok());
        assert!(op.acknowledge().is_err());
    }

    #[test]
    fn clones_share_ack_state() {
        let (op, rx) = Operation::new_normal(Lsn(1), Epoch::ZERO, None, vec![Bytes::from("x")]);
        let clone = op.clone();
        clone.acknowledge().unwrap();
        assert!(op.is_acknowledged());
        assert!(rx.blocking_recv().is_ok());
    }

    #[test]
    fn byte_size_sums_segments() {
        let (op, _rx) = Operation::new_normal(
            Lsn(1),
            Epoch::ZERO,
            None,
            vec![Bytes::from("abc"), Bytes::from("de")],
        );
        assert_eq!(op.byte_size(), 5);
    }
}
