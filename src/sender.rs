// src/sender.rs

//! C2: per-destination reliable delivery with an AIMD send window, a retry
//! clock, duplicate suppression, and receive/apply-ack latency estimation.

use crate::error::{ReplicatorError, Result};
use crate::operation::Operation;
use crate::types::Lsn;
use std::collections::{BTreeMap, VecDeque};
use std::time::{Duration, Instant};

/// `original_source`: `DEFAULT_MAX_SWS_WHEN_0`.
pub const DEFAULT_MAX_SWS_WHEN_0: usize = 1024;
/// `original_source`: `DEFAULT_MAX_SWS_FACTOR_WHEN_0`.
pub const DEFAULT_MAX_SWS_FACTOR_WHEN_0: usize = 4;

/// Invoked to actually hand an operation (or a bare ack request) to the
/// transport. Returns `false` on `TransportSendQueueFull` so the sender
/// pauses retransmission for this tick rather than treating it as a fault.
pub type SendCallback = Box<dyn FnMut(Option<&Operation>, bool) -> bool + Send>;

struct PendingEntry {
    op: Operation,
    last_send_time: Option<Instant>,
}

/// Decaying-average estimator for receive/apply ack latency (spec.md §4.2.1).
struct LatencyEstimator {
    alpha: f64,
    cap: Duration,
    average: Duration,
}

impl LatencyEstimator {
    fn new(alpha: f64, cap: Duration) -> Self {
        Self {
            alpha,
            cap,
            average: Duration::ZERO,
        }
    }

    fn observe(&mut self, sample: Duration) {
        let sample = sample.min(self.cap);
        let prev = self.average.as_secs_f64();
        let next = self.alpha * sample.as_secs_f64() + (1.0 - self.alpha) * prev;
        self.average = Duration::from_secs_f64(next.max(0.0));
    }
}

pub struct ReliableOperationSender {
    pending: VecDeque<PendingEntry>,
    send_window_size: usize,
    max_sws: usize,
    last_acked_received_lsn: Lsn,
    last_acked_apply_lsn: Lsn,
    highest_lsn: Lsn,
    no_ack_since_last_tick: bool,
    retry_interval: Duration,
    timer_active: bool,
    closed: bool,
    send_callback: SendCallback,
    receive_timers: BTreeMap<Lsn, Instant>,
    apply_timers: BTreeMap<Lsn, Instant>,
    receive_latency: LatencyEstimator,
    apply_latency: LatencyEstimator,
}

impl ReliableOperationSender {
    pub fn new(
        start_sws: usize,
        max_sws: usize,
        retry_interval: Duration,
        decay_factor: f64,
        slow_secondary_age_threshold: Duration,
        send_callback: SendCallback,
    ) -> Self {
        // §4.2.2: maxSws == 0 means "caller did not cap count".
        let max_sws = if max_sws == 0 {
            std::cmp::max(
                DEFAULT_MAX_SWS_WHEN_0,
                DEFAULT_MAX_SWS_FACTOR_WHEN_0 * start_sws.max(1),
            )
        } else {
            max_sws
        };
        Self {
            pending: VecDeque::new(),
            send_window_size: start_sws.clamp(1, max_sws),
            max_sws,
            last_acked_received_lsn: Lsn::ZERO,
            last_acked_apply_lsn: Lsn::ZERO,
            highest_lsn: Lsn::ZERO,
            no_ack_since_last_tick: false,
            retry_interval,
            timer_active: false,
            closed: false,
            send_callback,
            receive_timers: BTreeMap::new(),
            apply_timers: BTreeMap::new(),
            receive_latency: LatencyEstimator::new(decay_factor, slow_secondary_age_threshold),
            apply_latency: LatencyEstimator::new(decay_factor, slow_secondary_age_threshold),
        }
    }

    pub fn send_window_size(&self) -> usize {
        self.send_window_size
    }

    pub fn is_timer_active(&self) -> bool {
        self.timer_active
    }

    pub fn avg_receive_ack_duration(&self) -> Duration {
        self.receive_latency.average
    }

    pub fn avg_apply_ack_duration(&self) -> Duration {
        self.apply_latency.average
    }

    /// Inserts sorted, dispatching immediately up to the current window and
    /// queuing the remainder. Duplicate LSNs (already seen or pending) are
    /// no-ops.
    pub fn add(&mut self, now: Instant, ops: Vec<Operation>) {
        if self.closed {
            return;
        }
        for op in ops {
            if op.lsn <= self.highest_lsn {
                continue; // already observed; duplicate is a no-op
            }
            self.highest_lsn = op.lsn;
            self.receive_timers.insert(op.lsn, now);
            self.apply_timers.insert(op.lsn, now);
            self.pending.push_back(PendingEntry {
                op,
                last_send_time: None,
            });
        }

        let in_flight = self
            .pending
            .iter()
            .filter(|e| e.last_send_time.is_some())
            .count();
        let budget = self.send_window_size.saturating_sub(in_flight);
        let mut dispatched = 0;
        for entry in self.pending.iter_mut() {
            if dispatched >= budget {
                break;
            }
            if entry.last_send_time.is_some() {
                continue;
            }
            if (self.send_callback)(Some(&entry.op), false) {
                entry.last_send_time = Some(now);
                dispatched += 1;
            } else {
                break; // TransportSendQueueFull: stop trying this round
            }
        }
        if !self.pending.is_empty() {
            self.timer_active = true;
        }
    }

    /// Retry tick: halves the window on a miss, re-sends due entries up to
    /// the (possibly just halved) window, and solicits a fresh apply-ack if
    /// nothing is outstanding but apply lags receive.
    pub fn on_tick(&mut self, now: Instant) {
        if self.closed {
            return;
        }
        if self.no_ack_since_last_tick && self.send_window_size > 1 {
            self.send_window_size /= 2;
        }
        self.no_ack_since_last_tick = true;

        let mut resent = 0;
        for entry in self.pending.iter_mut() {
            if resent >= self.send_window_size {
                break;
            }
            let due = match entry.last_send_time {
                None => true,
                Some(t) => now.duration_since(t) >= self.retry_interval,
            };
            if !due {
                continue;
            }
            if (self.send_callback)(Some(&entry.op), false) {
                entry.last_send_time = Some(now);
                resent += 1;
            } else {
                break;
            }
        }

        if self.pending.is_empty() {
            if self.last_acked_apply_lsn < self.last_acked_received_lsn {
                (self.send_callback)(None, true);
            } else {
                self.timer_active = false;
            }
        }
        self.drain_latency_samples(now);
    }

    /// Rejects stale/backwards acks; drops acked pending entries; grows the
    /// window (AI) on any forward progress.
    pub fn process_on_ack(&mut self, now: Instant, received_lsn: Lsn, apply_lsn: Lsn) -> Result<()> {
        if received_lsn < apply_lsn {
            return Err(ReplicatorError::InvalidState(format!(
                "apply ack {apply_lsn} ahead of receive ack {received_lsn}"
            )));
        }
        if self.closed {
            return Ok(());
        }

        let received_advanced = received_lsn > self.last_acked_received_lsn;
        let apply_advanced = apply_lsn > self.last_acked_apply_lsn;

        if received_advanced {
            self.last_acked_received_lsn = received_lsn;
            while let Some(front) = self.pending.front() {
                if front.op.lsn <= received_lsn {
                    self.pending.pop_front();
                } else {
                    break;
                }
            }
            for (&lsn, &start) in self.receive_timers.range(..=received_lsn) {
                let _ = lsn;
                self.receive_latency.observe(now.duration_since(start));
            }
            self.receive_timers = self.receive_timers.split_off(&received_lsn.next());
        }
        if apply_advanced {
            self.last_acked_apply_lsn = apply_lsn;
            for (&lsn, &start) in self.apply_timers.range(..=apply_lsn) {
                let _ = lsn;
                self.apply_latency.observe(now.duration_since(start));
            }
            self.apply_timers = self.apply_timers.split_off(&apply_lsn.next());
        }

        if received_advanced || apply_advanced {
            self.no_ack_since_last_tick = false;
            if self.send_window_size < self.max_sws {
                self.send_window_size = (self.send_window_size * 2).min(self.max_sws);
            }
        }
        Ok(())
    }

    fn drain_latency_samples(&mut self, _now: Instant) {
        // Timers are folded into the estimator as soon as their watermark
        // advances (see process_on_ack); nothing time-based to drain here,
        // kept as an explicit method so a future batching change has a home.
    }

    pub fn close(&mut self) {
        self.pending.clear();
        self.receive_timers.clear();
        self.apply_timers.clear();
        self.timer_active = false;
        self.closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.closed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::Epoch;

    fn op(lsn: i64) -> Operation {
        Operation::new_normal(Lsn(lsn), Epoch::ZERO, None, vec![]).0
    }

    fn make_sender(start: usize, max: usize) -> ReliableOperationSender {
        ReliableOperationSender::new(
            start,
            max,
            Duration::from_millis(100),
            0.2,
            Duration::from_secs(30),
            Box::new(|_, _| true),
        )
    }

    #[test]
    fn initial_window_sizing_matches_original_source_constants() {
        let s = make_sender(4, 0);
        assert_eq!(s.max_sws, std::cmp::max(1024, 4 * 4));
    }

    #[test]
    fn duplicate_lsn_add_is_noop() {
        let mut s = make_sender(4, 16);
        let now = Instant::now();
        s.add(now, vec![op(1)]);
        s.add(now, vec![op(1)]);
        assert_eq!(s.pending.len(), 1);
    }

    #[test]
    fn tick_without_ack_halves_window_with_floor_of_one() {
        let mut s = make_sender(8, 16);
        let now = Instant::now();
        for _ in 0..10 {
            s.on_tick(now);
        }
        assert_eq!(s.send_window_size(), 1);
    }

    #[test]
    fn ack_progress_doubles_window_up_to_ceiling() {
        let mut s = make_sender(2, 8);
        let now = Instant::now();
        s.add(now, vec![op(1), op(2), op(3), op(4)]);
        s.process_on_ack(now, Lsn(1), Lsn(0)).unwrap();
        assert_eq!(s.send_window_size(), 4);
        s.process_on_ack(now, Lsn(2), Lsn(0)).unwrap();
        assert_eq!(s.send_window_size(), 8);
        s.process_on_ack(now, Lsn(3), Lsn(0)).unwrap();
        assert_eq!(s.send_window_size(), 8); // ceiling respected
    }

    #[test]
    fn apply_ahead_of_receive_is_rejected() {
        let mut s = make_sender(4, 16);
        let now = Instant::now();
        assert!(s.process_on_ack(now, Lsn(1), Lsn(2)).is_err());
    }

    #[test]
    fn close_is_idempotent() {
        let mut s = make_sender(4, 16);
        s.close();
        s.close();
        assert!(s.is_closed());
    }
}
