// src/ack_batcher.rs

//! C12: coalesces a secondary's ack traffic. Retains only the latest
//! watermark set observed rather than a queue of distinct ack messages
//! (spec.md §4.12 / SPEC_FULL.md §4 supplement), and sends on a tick only
//! if something changed since the last send.

use crate::remote_session::AckNumbers;
use crate::types::Lsn;

/// Invoked with the latest watermark set whenever a send is due. Fire-and-
/// forget: building the wire message and handing it to the transport is the
/// caller's concern (typically bridging to an async send via a spawned task,
/// the same shape `wire::spawn_transport_sender` uses for replication sends).
pub type AckSendCallback = Box<dyn Fn(AckNumbers) + Send + Sync>;

struct BatcherState {
    last_sent: AckNumbers,
    last_observed: AckNumbers,
    dirty: bool,
    pending: usize,
}

const NONE: AckNumbers = AckNumbers {
    repl_received_lsn: Lsn::INVALID,
    repl_quorum_lsn: Lsn::INVALID,
    copy_received_lsn: Lsn::INVALID,
    copy_quorum_lsn: Lsn::INVALID,
};

pub struct AckBatcher {
    state: parking_lot::Mutex<BatcherState>,
    max_pending_acks: usize,
    send: AckSendCallback,
}

impl AckBatcher {
    pub fn new(max_pending_acks: usize, send: AckSendCallback) -> Self {
        Self {
            state: parking_lot::Mutex::new(BatcherState {
                last_sent: NONE,
                last_observed: NONE,
                dirty: false,
                pending: 0,
            }),
            max_pending_acks,
            send,
        }
    }

    /// Merges a fresh watermark set in (any axis at `Lsn::INVALID` means "not
    /// reporting" and is left alone). Forces a send immediately if the
    /// unsent-ack count now exceeds `max_pending_acks`.
    pub fn observe(&self, numbers: AckNumbers) {
        let exceeded = {
            let mut state = self.state.lock();
            merge(&mut state.last_observed, numbers, &mut state.dirty);
            if state.dirty {
                state.pending += 1;
            }
            self.max_pending_acks > 0 && state.pending > self.max_pending_acks
        };
        if exceeded {
            self.force_send();
        }
    }

    /// Sends only if a watermark has changed since the last send.
    pub fn on_tick(&self) {
        let dirty = self.state.lock().dirty;
        if dirty {
            self.force_send();
        }
    }

    /// Sends the latest observed watermarks unconditionally — used on
    /// StartCopy accept, an explicit `RequestAck`, and when `observe` trips
    /// the pending-count threshold.
    pub fn force_send(&self) {
        let numbers = {
            let mut state = self.state.lock();
            state.dirty = false;
            state.pending = 0;
            state.last_sent = state.last_observed;
            state.last_sent
        };
        (self.send)(numbers);
    }
}

fn merge(observed: &mut AckNumbers, fresh: AckNumbers, dirty: &mut bool) {
    macro_rules! merge_field {
        ($field:ident) => {
            if fresh.$field.is_valid() && fresh.$field != observed.$field {
                observed.$field = fresh.$field;
                *dirty = true;
            }
        };
    }
    merge_field!(repl_received_lsn);
    merge_field!(repl_quorum_lsn);
    merge_field!(copy_received_lsn);
    merge_field!(copy_quorum_lsn);
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    fn counting_batcher(max_pending: usize) -> (AckBatcher, Arc<AtomicUsize>) {
        let count = Arc::new(AtomicUsize::new(0));
        let count2 = Arc::clone(&count);
        let batcher = AckBatcher::new(
            max_pending,
            Box::new(move |_numbers| {
                count2.fetch_add(1, Ordering::SeqCst);
            }),
        );
        (batcher, count)
    }

    #[test]
    fn tick_with_no_change_does_not_send() {
        let (batcher, sends) = counting_batcher(0);
        batcher.on_tick();
        assert_eq!(sends.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn tick_after_observe_sends_once_then_goes_quiet() {
        let (batcher, sends) = counting_batcher(0);
        batcher.observe(AckNumbers {
            repl_received_lsn: Lsn(5),
            repl_quorum_lsn: Lsn(5),
            copy_received_lsn: Lsn::INVALID,
            copy_quorum_lsn: Lsn::INVALID,
        });
        batcher.on_tick();
        assert_eq!(sends.load(Ordering::SeqCst), 1);
        batcher.on_tick();
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn exceeding_max_pending_acks_forces_an_immediate_send() {
        let (batcher, sends) = counting_batcher(2);
        batcher.observe(AckNumbers {
            repl_received_lsn: Lsn(1),
            repl_quorum_lsn: Lsn::INVALID,
            copy_received_lsn: Lsn::INVALID,
            copy_quorum_lsn: Lsn::INVALID,
        });
        batcher.observe(AckNumbers {
            repl_received_lsn: Lsn(2),
            repl_quorum_lsn: Lsn::INVALID,
            copy_received_lsn: Lsn::INVALID,
            copy_quorum_lsn: Lsn::INVALID,
        });
        assert_eq!(sends.load(Ordering::SeqCst), 0);
        batcher.observe(AckNumbers {
            repl_received_lsn: Lsn(3),
            repl_quorum_lsn: Lsn::INVALID,
            copy_received_lsn: Lsn::INVALID,
            copy_quorum_lsn: Lsn::INVALID,
        });
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn force_send_works_even_without_a_pending_change() {
        let (batcher, sends) = counting_batcher(0);
        batcher.force_send();
        assert_eq!(sends.load(Ordering::SeqCst), 1);
    }
}
