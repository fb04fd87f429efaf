// src/queue.rs

//! C1: an ordered, bounded FIFO of in-flight operations with three
//! watermarks (received, committed, completed) and count/byte backpressure.
//!
//! `OperationQueue` is a pure synchronous state machine — it never holds a
//! lock across an `.await`. Callers that need concurrent access wrap it in
//! `parking_lot::Mutex` (see `RemoteSession`, `ReplicationReceiver`).

use crate::error::{ReplicatorError, Result};
use crate::operation::Operation;
use crate::types::Lsn;
use std::collections::VecDeque;

/// Fired, in ascending LSN order, for every operation that newly crosses
/// the committed watermark.
pub type CommittedCallback = Box<dyn FnMut(&Operation) + Send>;

pub struct OperationQueue {
    first_lsn: Lsn,
    last_received_lsn: Lsn,
    last_committed_lsn: Lsn,
    last_completed_lsn: Lsn,
    max_count: usize,
    max_bytes: u64,
    bytes: u64,
    /// Retained operations, `entries[0].lsn == first_lsn + 1` when non-empty.
    entries: VecDeque<Operation>,
    /// If true, operations are dropped once `lsn <= completed`.
    clean_on_complete: bool,
    /// If true, `Commit()` is a no-op (initial primary queue: commit is
    /// implicit via the sender's quorum computation, not this queue).
    ignore_commit: bool,
    committed_callback: Option<CommittedCallback>,
}

impl OperationQueue {
    /// `next_lsn` is the LSN the first enqueued operation must carry.
    pub fn new(next_lsn: Lsn, max_count: usize, max_bytes: u64) -> Self {
        let base = next_lsn.prev();
        Self {
            first_lsn: base,
            last_received_lsn: base,
            last_committed_lsn: base,
            last_completed_lsn: base,
            max_count,
            max_bytes,
            bytes: 0,
            entries: VecDeque::new(),
            clean_on_complete: true,
            ignore_commit: false,
            committed_callback: None,
        }
    }

    pub fn with_clean_on_complete(mut self, clean: bool) -> Self {
        self.clean_on_complete = clean;
        self
    }

    pub fn with_ignore_commit(mut self, ignore: bool) -> Self {
        self.ignore_commit = ignore;
        self
    }

    /// Overrides `clean_on_complete` after construction — used when a
    /// former-primary queue is handed off to become a secondary's queue and
    /// the retention policy must follow the new role's configuration rather
    /// than the default.
    pub fn set_clean_on_complete(&mut self, clean: bool) {
        self.clean_on_complete = clean;
    }

    pub fn set_committed_callback(&mut self, cb: CommittedCallback) {
        self.committed_callback = Some(cb);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn bytes(&self) -> u64 {
        self.bytes
    }

    /// True if either the count or byte bound is currently saturated.
    pub fn is_full(&self) -> bool {
        (self.max_count > 0 && self.entries.len() >= self.max_count)
            || (self.max_bytes > 0 && self.bytes >= self.max_bytes)
    }

    pub fn first_lsn(&self) -> Lsn {
        self.first_lsn
    }
    pub fn last_received_lsn(&self) -> Lsn {
        self.last_received_lsn
    }
    pub fn last_committed_lsn(&self) -> Lsn {
        self.last_committed_lsn
    }
    pub fn last_completed_lsn(&self) -> Lsn {
        self.last_completed_lsn
    }

    /// Appends `op` at `last_received_lsn + 1`. Rejects with `QueueFull` if
    /// either bound would be exceeded, or `InvalidState` if `op.lsn` isn't
    /// the expected next value.
    pub fn try_enqueue(&mut self, op: Operation) -> Result<()> {
        let expected = self.last_received_lsn.next();
        if op.lsn != expected {
            return Err(ReplicatorError::InvalidState(format!(
                "expected lsn {expected} but got {}",
                op.lsn
            )));
        }
        let next_count = self.entries.len() + 1;
        if self.max_count > 0 && next_count > self.max_count {
            return Err(ReplicatorError::QueueFull);
        }
        let op_bytes = op.byte_size();
        if self.max_bytes > 0 && self.bytes + op_bytes > self.max_bytes {
            return Err(ReplicatorError::QueueFull);
        }
        self.bytes += op_bytes;
        self.last_received_lsn = op.lsn;
        self.entries.push_back(op);
        Ok(())
    }

    fn entry_index(&self, lsn: Lsn) -> Option<usize> {
        if self.entries.is_empty() {
            return None;
        }
        let front_lsn = self.entries[0].lsn;
        if lsn < front_lsn || lsn > self.last_received_lsn {
            return None;
        }
        Some((lsn.0 - front_lsn.0) as usize)
    }

    /// `committed <- max(committed, min(lsn, received))`; fires the
    /// committed callback in order for each newly crossed operation.
    pub fn update_commit_head(&mut self, lsn: Lsn) {
        if self.ignore_commit {
            return;
        }
        let target = std::cmp::min(lsn, self.last_received_lsn);
        if target <= self.last_committed_lsn {
            return;
        }
        let mut cursor = self.last_committed_lsn.next();
        while cursor <= target {
            if let Some(idx) = self.entry_index(cursor) {
                if let Some(cb) = self.committed_callback.as_mut() {
                    cb(&self.entries[idx]);
                }
            }
            cursor = cursor.next();
        }
        self.last_committed_lsn = target;
    }

    /// No-arg form: advances `committed` all the way to `received`.
    pub fn commit(&mut self) {
        let received = self.last_received_lsn;
        self.update_commit_head(received);
    }

    /// Advances `completed` to `min(up_to, committed)` when `up_to` is given,
    /// otherwise to `committed`. Returns whether progress was made. Drops
    /// completed entries when `clean_on_complete` is set.
    ///
    /// When `ignore_commit` is set, this queue's own `committed` watermark is
    /// never driven (see `update_commit_head`), so gating on it here would
    /// freeze `completed` forever; the ceiling becomes `received` instead and
    /// the caller is trusted to only pass an `up_to` it already knows is safe
    /// (e.g. a quorum LSN computed elsewhere).
    pub fn complete(&mut self, up_to: Option<Lsn>) -> bool {
        let ceiling = if self.ignore_commit {
            self.last_received_lsn
        } else {
            self.last_committed_lsn
        };
        let target = match up_to {
            Some(lsn) => std::cmp::min(lsn, ceiling),
            None => ceiling,
        };
        if target <= self.last_completed_lsn {
            return false;
        }
        self.last_completed_lsn = target;
        if self.clean_on_complete {
            while let Some(front) = self.entries.front() {
                if front.lsn <= self.last_completed_lsn {
                    let dropped = self.entries.pop_front().unwrap();
                    self.bytes -= dropped.byte_size();
                    self.first_lsn = dropped.lsn;
                } else {
                    break;
                }
            }
        }
        true
    }

    /// Raw references for `[from_lsn..last_received_lsn]`, or `None` if any
    /// of that range has already been dropped from retention.
    pub fn get_operations(&self, from_lsn: Lsn) -> Option<Vec<Operation>> {
        if from_lsn > self.last_received_lsn {
            return Some(Vec::new());
        }
        let start = self.entry_index(from_lsn)?;
        Some(self.entries.range(start..).cloned().collect())
    }

    /// Drops entries with `lsn > committed`; used on role transitions.
    pub fn discard_non_committed(&mut self) {
        while let Some(back) = self.entries.back() {
            if back.lsn > self.last_committed_lsn {
                let dropped = self.entries.pop_back().unwrap();
                self.bytes -= dropped.byte_size();
            } else {
                break;
            }
        }
        self.last_received_lsn = self.last_committed_lsn;
    }

    /// Drops entries with `lsn > completed`; used on role transitions.
    pub fn discard_non_completed(&mut self) {
        while let Some(back) = self.entries.back() {
            if back.lsn > self.last_completed_lsn {
                let dropped = self.entries.pop_back().unwrap();
                self.bytes -= dropped.byte_size();
            } else {
                break;
            }
        }
        self.last_received_lsn = self.last_completed_lsn;
        self.last_committed_lsn = self.last_completed_lsn;
    }

    /// Drops everything and rebases all watermarks to `new_base_lsn - 1`.
    pub fn reset(&mut self, new_base_lsn: Lsn) {
        self.entries.clear();
        self.bytes = 0;
        let base = new_base_lsn.prev();
        self.first_lsn = base;
        self.last_received_lsn = base;
        self.last_committed_lsn = base;
        self.last_completed_lsn = base;
    }

    pub fn invariants_hold(&self) -> bool {
        self.first_lsn <= self.last_completed_lsn
            && self.last_completed_lsn <= self.last_committed_lsn
            && self.last_committed_lsn <= self.last_received_lsn
    }
}
