// src/replica_manager.rs

//! C8: the primary-side set of sessions, with quorum computation across
//! the current and (optionally pinned) previous configuration.

use crate::config::ReplicatorConfig;
use crate::copy_sender::{CopySender, CopySenderConfig};
use crate::error::{ReplicatorError, Result};
use crate::message::{CopyOperationEntry, FromHeader, Message};
use crate::remote_session::RemoteSession;
use crate::state_provider::StateProvider;
use crate::transport::Transport;
use crate::types::{Epoch, Lsn, ReplicaId, ReplicaRole, ReplicaTarget};
use crate::wire;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::info;

/// A frozen view of the replica set participating in quorum, captured by
/// `UpdateCatchupConfiguration`.
#[derive(Debug, Clone)]
pub struct Configuration {
    pub replica_ids: Vec<ReplicaId>,
    pub write_quorum: usize,
    /// The LSN the configuration was frozen at; the target for "Quorum" mode
    /// catch-up waits.
    pub catchup_lsn: Lsn,
}

struct SessionEntry {
    session: Arc<RemoteSession>,
    must_catchup: bool,
    in_previous_config: bool,
    in_current_config: bool,
}

pub struct ReplicaManager {
    sessions: DashMap<ReplicaId, SessionEntry>,
    previous_config: parking_lot::Mutex<Option<Configuration>>,
    current_config: parking_lot::Mutex<Option<Configuration>>,
}

impl Default for ReplicaManager {
    fn default() -> Self {
        Self::new()
    }
}

impl ReplicaManager {
    pub fn new() -> Self {
        Self {
            sessions: DashMap::new(),
            previous_config: parking_lot::Mutex::new(None),
            current_config: parking_lot::Mutex::new(None),
        }
    }

    pub fn add_session(&self, id: ReplicaId, session: Arc<RemoteSession>) {
        self.sessions.insert(
            id,
            SessionEntry {
                session,
                must_catchup: false,
                in_previous_config: false,
                in_current_config: true,
            },
        );
    }

    pub fn remove_session(&self, id: ReplicaId) {
        self.sessions.remove(&id);
    }

    pub fn session(&self, id: ReplicaId) -> Option<Arc<RemoteSession>> {
        self.sessions.get(&id).map(|e| Arc::clone(&e.session))
    }

    pub fn sessions(&self) -> Vec<Arc<RemoteSession>> {
        self.sessions.iter().map(|e| Arc::clone(&e.session)).collect()
    }

    /// Sets both configurations atomically (spec.md: "set together"), and
    /// flags the given replicas as must-catchup for this reconfiguration.
    pub fn update_catchup_configuration(
        &self,
        previous: Option<Configuration>,
        current: Configuration,
        must_catchup: &[ReplicaId],
    ) {
        for mut entry in self.sessions.iter_mut() {
            let id = *entry.key();
            entry.in_previous_config = previous
                .as_ref()
                .is_some_and(|c| c.replica_ids.contains(&id));
            entry.in_current_config = current.replica_ids.contains(&id);
            entry.must_catchup = must_catchup.contains(&id);
        }
        *self.previous_config.lock() = previous;
        *self.current_config.lock() = Some(current);
    }

    fn active_quorum_lsns(&self, replica_ids: &[ReplicaId]) -> Vec<Lsn> {
        replica_ids
            .iter()
            .filter_map(|id| self.sessions.get(id))
            .filter(|e| e.session.role() == ReplicaRole::Active)
            .map(|e| e.session.repl_quorum_lsn())
            .collect()
    }

    /// The `write_quorum`-th largest `repl_quorum_lsn` among `config`'s
    /// active replicas, including the primary's own `primary_last_lsn`.
    fn configuration_quorum_lsn(&self, config: &Configuration, primary_last_lsn: Lsn) -> Lsn {
        let mut lsns = self.active_quorum_lsns(&config.replica_ids);
        lsns.push(primary_last_lsn);
        lsns.sort_by(crate::types::descending);
        let k = config.write_quorum.clamp(1, lsns.len());
        lsns[k - 1]
    }

    /// The primary's authoritative commit watermark: the minimum of the
    /// current (and, if pinned, previous) configuration's quorum LSN.
    pub fn quorum_lsn(&self, primary_last_lsn: Lsn) -> Lsn {
        let current = self.current_config.lock().clone();
        let previous = self.previous_config.lock().clone();
        let Some(current) = current else {
            return primary_last_lsn;
        };
        let current_q = self.configuration_quorum_lsn(&current, primary_last_lsn);
        match previous {
            Some(prev) => {
                let prev_q = self.configuration_quorum_lsn(&prev, primary_last_lsn);
                current_q.min(prev_q)
            }
            None => current_q,
        }
    }

    /// The minimum `repl_quorum_lsn` across every active replica in either
    /// configuration; safe point to trim the primary's queue.
    pub fn completed_lsn(&self) -> Lsn {
        let current = self.current_config.lock().clone();
        let previous = self.previous_config.lock().clone();
        let mut all_ids: Vec<ReplicaId> = Vec::new();
        if let Some(c) = &current {
            all_ids.extend(c.replica_ids.iter().copied());
        }
        if let Some(p) = &previous {
            all_ids.extend(p.replica_ids.iter().copied());
        }
        all_ids.sort();
        all_ids.dedup();
        let lsns = self.active_quorum_lsns(&all_ids);
        lsns.into_iter().min().unwrap_or(Lsn::ZERO)
    }

    /// `Quorum`: current config's quorum LSN has reached the previous
    /// config's frozen catchup LSN.
    pub fn quorum_catchup_satisfied(&self, primary_last_lsn: Lsn) -> bool {
        match self.previous_config.lock().clone() {
            Some(prev) => {
                let current_q = self
                    .current_config
                    .lock()
                    .clone()
                    .map(|c| self.configuration_quorum_lsn(&c, primary_last_lsn))
                    .unwrap_or(primary_last_lsn);
                current_q >= prev.catchup_lsn
            }
            None => true,
        }
    }

    /// `All`: every active replica's `repl_quorum_lsn` has reached `target`.
    pub fn all_catchup_satisfied(&self, target: Lsn) -> bool {
        self.sessions
            .iter()
            .filter(|e| e.session.role() == ReplicaRole::Active)
            .all(|e| e.session.repl_quorum_lsn() >= target)
    }

    /// `QuorumWithMustCatchup`: `Quorum` holds AND every must-catchup
    /// replica has reached the commit watermark.
    pub fn quorum_with_must_catchup_satisfied(&self, primary_last_lsn: Lsn) -> bool {
        if !self.quorum_catchup_satisfied(primary_last_lsn) {
            return false;
        }
        let watermark = self.quorum_lsn(primary_last_lsn);
        self.sessions
            .iter()
            .filter(|e| e.must_catchup)
            .all(|e| e.session.repl_quorum_lsn() >= watermark)
    }

    /// Drives every session's retry timers. Called on a fixed interval by
    /// whatever owns the primary role (spec.md §4.2: "retry tick (every
    /// retryInterval)"); the primary engine itself holds no timer of its own.
    pub fn tick_all(&self) {
        for entry in self.sessions.iter() {
            entry.session.on_start_copy_tick();
            entry.session.on_replication_tick();
            entry.session.on_copy_tick();
        }
    }

    pub fn mark_active(&self, id: ReplicaId) -> Result<()> {
        let entry = self
            .sessions
            .get(&id)
            .ok_or_else(|| ReplicatorError::InvalidState(format!("unknown session {id}")))?;
        entry.session.promote_to_active();
        Ok(())
    }

    /// Builds a new idle replica from scratch (spec.md §4.8: `BuildReplica`):
    /// registers a session, drives the `StartCopy` handshake to a first ack,
    /// then hands the state provider's `GetCopyState` enumerator to a fresh
    /// `CopySender` bound to that session. Returns once the session is
    /// registered and copying has started; callers await the `CopySender`'s
    /// own completion separately if they need to know when copy finishes.
    #[allow(clippy::too_many_arguments)]
    pub async fn build_replica(
        self: &Arc<Self>,
        target: ReplicaTarget,
        epoch: Epoch,
        from: FromHeader,
        transport: Arc<dyn Transport>,
        state_provider: Arc<dyn StateProvider>,
        cfg: &ReplicatorConfig,
    ) -> Result<Arc<RemoteSession>> {
        let replica_id = target.replica_id;
        let replication_start_lsn = state_provider.get_last_committed_sequence_number().await?;

        // The replication sender is built before the session exists, so its
        // fault path can't simply close over `Arc<RemoteSession>` yet; a
        // `Weak` cell resolved right after construction breaks the chicken-
        // and-egg without holding the session itself alive indefinitely.
        let session_cell: Arc<std::sync::OnceLock<std::sync::Weak<RemoteSession>>> =
            Arc::new(std::sync::OnceLock::new());
        let fault_cell = Arc::clone(&session_cell);
        let replication_from = from.clone();
        let manager_for_completed = Arc::downgrade(self);
        let replication_send_callback = wire::spawn_transport_sender(
            Arc::clone(&transport),
            target.clone(),
            move |op, _request_ack| match op {
                Some(op) => Message::ReplicationOperation {
                    from: replication_from.clone(),
                    primary_epoch: op.epoch,
                    completed_lsn: manager_for_completed
                        .upgrade()
                        .map(|m| m.completed_lsn())
                        .unwrap_or(Lsn::INVALID),
                    batch: vec![crate::message::ReplicationOperationEntry {
                        lsn: op.lsn,
                        op_epoch: op.epoch,
                        last_lsn_in_batch: op.lsn,
                        segments: op.segments.clone(),
                    }],
                },
                None => Message::RequestAck {
                    from: replication_from.clone(),
                },
            },
            move |err| {
                if let Some(session) = fault_cell.get().and_then(std::sync::Weak::upgrade) {
                    session.fault(&err.to_string());
                }
            },
            cfg.initial_send_window_size.max(16),
        );

        let session = Arc::new(RemoteSession::new(
            target.clone(),
            epoch,
            cfg.initial_send_window_size,
            cfg.max_send_window_size,
            cfg.retransmit_timeout,
            0.2,
            cfg.keep_alive_interval,
            replication_send_callback,
        ));
        let _ = session_cell.set(Arc::downgrade(&session));
        self.add_session(replica_id, Arc::clone(&session));

        let start_copy_from = from.clone();
        let start_copy_session = Arc::clone(&session);
        let start_copy_callback = wire::spawn_transport_sender(
            Arc::clone(&transport),
            target.clone(),
            move |_op, _request_ack| Message::StartCopy {
                from: start_copy_from.clone(),
                epoch,
                replica_id,
                replication_start_lsn,
                has_persisted_state: false,
            },
            move |err| start_copy_session.fault(&err.to_string()),
            4,
        );

        let ack_rx = session
            .begin_establish_copy(replication_start_lsn, cfg.retransmit_timeout, start_copy_callback)
            .await;
        ack_rx
            .await
            .map_err(|_| ReplicatorError::Canceled)
            .and_then(std::convert::identity)?;

        info!(remote = %target, "start-copy ack received, beginning copy state enumeration");

        let copy_state = state_provider.get_copy_state(replication_start_lsn, None).await?;

        let copy_from = from;
        let copy_session = Arc::clone(&session);
        let copy_send_callback = wire::spawn_transport_sender(
            transport,
            target.clone(),
            move |op, _request_ack| match op {
                Some(op) => Message::CopyOperation {
                    from: copy_from.clone(),
                    replica_id,
                    epoch,
                    op: CopyOperationEntry {
                        lsn: op.lsn,
                        is_last: op.is_end_of_stream(),
                        segments: op.segments.clone(),
                    },
                },
                None => Message::RequestAck {
                    from: copy_from.clone(),
                },
            },
            move |err| copy_session.fault(&err.to_string()),
            cfg.initial_send_window_size.max(16),
        );

        let copy_sender = CopySender::new(
            epoch,
            CopySenderConfig {
                max_count: cfg.max_pending_operations,
                max_bytes: cfg.max_pending_bytes,
                retry_interval: cfg.retransmit_timeout,
                decay_factor: 0.2,
                slow_secondary_age_threshold: cfg.keep_alive_interval,
                initial_send_window_size: cfg.initial_send_window_size,
                max_send_window_size: cfg.max_send_window_size,
            },
            copy_send_callback,
        );
        session.attach_copy_sender(Arc::clone(&copy_sender));

        let (done_tx, _done_rx) = tokio::sync::oneshot::channel();
        tokio::spawn(copy_sender.run(copy_state, done_tx));

        Ok(session)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::remote_session::AckNumbers;
    use crate::types::IncarnationId;
    use std::time::Duration;

    fn target(id: u64) -> ReplicaTarget {
        ReplicaTarget {
            address: format!("r{id}:9000"),
            replica_id: ReplicaId(id),
            incarnation_id: IncarnationId(1),
        }
    }

    fn active_session(id: u64) -> Arc<RemoteSession> {
        let session = Arc::new(RemoteSession::new(
            target(id),
            Epoch::ZERO,
            4,
            16,
            Duration::from_millis(50),
            0.2,
            Duration::from_secs(30),
            Box::new(|_, _| true),
        ));
        session.promote_to_active();
        session
    }

    async fn ack(session: &RemoteSession, received: i64, quorum: i64) {
        session
            .on_ack(AckNumbers {
                repl_received_lsn: Lsn(received),
                repl_quorum_lsn: Lsn(quorum),
                copy_received_lsn: Lsn::INVALID,
                copy_quorum_lsn: Lsn::INVALID,
            })
            .await
            .unwrap();
    }

    /// spec.md §8 scenario 1: 3-replica set, quorum=2. Primary enqueues up to
    /// LSN 3; S1 fully acks, S2 acks only LSN 2, S3 is silent. The second-
    /// largest `repl_quorum_lsn` (2) is the commit watermark.
    #[tokio::test]
    async fn steady_state_quorum_is_second_largest_ack() {
        let manager = Arc::new(ReplicaManager::new());
        let s1 = active_session(1);
        let s2 = active_session(2);
        let s3 = active_session(3);
        manager.add_session(ReplicaId(1), Arc::clone(&s1));
        manager.add_session(ReplicaId(2), Arc::clone(&s2));
        manager.add_session(ReplicaId(3), Arc::clone(&s3));

        manager.update_catchup_configuration(
            None,
            Configuration {
                replica_ids: vec![ReplicaId(1), ReplicaId(2), ReplicaId(3)],
                write_quorum: 2,
                catchup_lsn: Lsn::ZERO,
            },
            &[],
        );

        ack(&s1, 3, 3).await;
        ack(&s2, 2, 2).await;
        // s3 silent — its repl_quorum_lsn stays at Lsn::ZERO.

        assert_eq!(manager.quorum_lsn(Lsn(3)), Lsn(2));
        assert_eq!(manager.completed_lsn(), Lsn::ZERO);
    }

    /// spec.md §8 scenario 3: reconfiguration with a must-catchup replica.
    /// `QuorumWithMustCatchup` must not be satisfied until the must-catchup
    /// replica reaches the commit watermark, even though the plain quorum
    /// predicate is already satisfied by the other two replicas.
    #[tokio::test]
    async fn must_catchup_gates_quorum_with_must_catchup() {
        let manager = Arc::new(ReplicaManager::new());
        let r1 = active_session(1);
        let r2 = active_session(2);
        let r3 = active_session(3);
        manager.add_session(ReplicaId(1), Arc::clone(&r1));
        manager.add_session(ReplicaId(2), Arc::clone(&r2));
        manager.add_session(ReplicaId(3), Arc::clone(&r3));

        manager.update_catchup_configuration(
            Some(Configuration {
                replica_ids: vec![ReplicaId(1), ReplicaId(2)],
                write_quorum: 2,
                catchup_lsn: Lsn(10),
            }),
            Configuration {
                replica_ids: vec![ReplicaId(1), ReplicaId(3)],
                write_quorum: 2,
                catchup_lsn: Lsn(10),
            },
            &[ReplicaId(2)],
        );

        ack(&r1, 10, 10).await;
        ack(&r3, 10, 10).await;
        ack(&r2, 7, 7).await;

        assert!(!manager.quorum_with_must_catchup_satisfied(Lsn(10)));

        ack(&r2, 10, 10).await;
        assert!(manager.quorum_with_must_catchup_satisfied(Lsn(10)));
    }

    #[tokio::test]
    async fn all_catchup_requires_every_active_replica() {
        let manager = Arc::new(ReplicaManager::new());
        let r1 = active_session(1);
        let r2 = active_session(2);
        manager.add_session(ReplicaId(1), Arc::clone(&r1));
        manager.add_session(ReplicaId(2), Arc::clone(&r2));

        ack(&r1, 10, 10).await;
        ack(&r2, 8, 8).await;
        assert!(!manager.all_catchup_satisfied(Lsn(10)));

        ack(&r2, 10, 10).await;
        assert!(manager.all_catchup_satisfied(Lsn(10)));
    }

    #[test]
    fn quorum_lsn_with_no_configuration_falls_back_to_primary_lsn() {
        let manager = ReplicaManager::new();
        assert_eq!(manager.quorum_lsn(Lsn(7)), Lsn(7));
    }
}
