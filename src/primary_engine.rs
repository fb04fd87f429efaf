// src/primary_engine.rs

//! C9: the primary role. Owns the primary's own operation queue (received
//! and completed watermarks only — `committed` is meaningless on this queue
//! since the authoritative commit watermark is `ReplicaManager::quorum_lsn`,
//! not anything this queue tracks itself), and drives `Replicate`,
//! `BuildIdle`, reconfiguration, catch-up waits, and `Close`.

use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::message::FromHeader;
use crate::metrics::ReplicatorMetrics;
use crate::operation::{AtomicGroupId, Operation};
use crate::queue::OperationQueue;
use crate::remote_session::RemoteSession;
use crate::replica_manager::{Configuration, ReplicaManager};
use crate::state_provider::StateProvider;
use crate::transport::Transport;
use crate::types::{Epoch, Lsn, ReplicaId, ReplicaTarget};
use bytes::Bytes;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Notify;
use tracing::{info, warn};

/// The predicate `WaitForCatchupQuorum` blocks on (spec.md §4.9).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CatchupMode {
    /// The current configuration's quorum LSN has reached the previous
    /// configuration's frozen catchup LSN.
    Quorum,
    /// Every active replica has reached `target` (the primary's latest LSN
    /// at the time of the call).
    All(Lsn),
    /// `Quorum` holds and every must-catchup replica has reached the commit
    /// watermark.
    QuorumWithMustCatchup,
}

pub struct PrimaryEngine {
    epoch: parking_lot::Mutex<Epoch>,
    queue: parking_lot::Mutex<OperationQueue>,
    replicas: Arc<ReplicaManager>,
    state_provider: Arc<dyn StateProvider>,
    transport: Arc<dyn Transport>,
    config: ReplicatorConfig,
    from: FromHeader,
    metrics: Arc<dyn ReplicatorMetrics>,
    catchup_notify: Arc<Notify>,
    catchup_pending: tokio::sync::Mutex<bool>,
    closed: AtomicBool,
}

impl PrimaryEngine {
    pub fn new(
        epoch: Epoch,
        starting_lsn: Lsn,
        replicas: Arc<ReplicaManager>,
        state_provider: Arc<dyn StateProvider>,
        transport: Arc<dyn Transport>,
        config: ReplicatorConfig,
        from: FromHeader,
        metrics: Arc<dyn ReplicatorMetrics>,
    ) -> Arc<Self> {
        let queue = OperationQueue::new(
            starting_lsn.next(),
            config.max_pending_operations,
            config.max_pending_bytes,
        )
        .with_ignore_commit(true);
        Arc::new(Self {
            epoch: parking_lot::Mutex::new(epoch),
            queue: parking_lot::Mutex::new(queue),
            replicas,
            state_provider,
            transport,
            config,
            from,
            metrics,
            catchup_notify: Arc::new(Notify::new()),
            catchup_pending: tokio::sync::Mutex::new(false),
            closed: AtomicBool::new(false),
        })
    }

    pub fn epoch(&self) -> Epoch {
        *self.epoch.lock()
    }

    pub fn last_received_lsn(&self) -> Lsn {
        self.queue.lock().last_received_lsn()
    }

    pub fn completed_lsn(&self) -> Lsn {
        self.queue.lock().last_completed_lsn()
    }

    pub fn quorum_lsn(&self) -> Lsn {
        self.replicas.quorum_lsn(self.last_received_lsn())
    }

    /// Assigns the next LSN to `segments`, pushes it to every session's
    /// replication sender, and returns `(lsn, committed_synchronously)` —
    /// the second element is only ever true when the primary is the sole
    /// replica (spec.md §4.8).
    pub fn replicate(&self, segments: Vec<Bytes>, atomic_group_id: AtomicGroupId) -> Result<(Lsn, bool)> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplicatorError::ObjectClosed);
        }
        let epoch = *self.epoch.lock();
        let (op, lsn) = {
            let mut queue = self.queue.lock();
            let lsn = queue.last_received_lsn().next();
            let (op, _ack_rx) = Operation::new_normal(lsn, epoch, Some(atomic_group_id), segments);
            queue.try_enqueue(op.clone())?;
            (op, lsn)
        };

        let sessions = self.replicas.sessions();
        let completed_lsn = self.replicas.completed_lsn();
        for session in &sessions {
            session.add_replicate(op.clone(), completed_lsn);
        }
        self.metrics.operation_enqueued("primary");

        let synchronous = sessions.is_empty();
        if synchronous {
            self.queue.lock().complete(Some(lsn));
            self.metrics.operation_completed("primary");
        }
        Ok((lsn, synchronous))
    }

    /// Builds a new idle replica: delegates to `ReplicaManager::build_replica`
    /// and wires the resulting session's progress callback back into this
    /// engine's completed-watermark tracking and catch-up wake-ups.
    pub async fn build_idle(self: &Arc<Self>, target: ReplicaTarget) -> Result<Arc<RemoteSession>> {
        if self.closed.load(Ordering::Acquire) {
            return Err(ReplicatorError::ObjectClosed);
        }
        let session = self
            .replicas
            .build_replica(
                target,
                *self.epoch.lock(),
                self.from.clone(),
                Arc::clone(&self.transport),
                Arc::clone(&self.state_provider),
                &self.config,
            )
            .await?;

        let engine_weak = Arc::downgrade(self);
        session.set_progress_callback(Box::new(move || {
            if let Some(engine) = engine_weak.upgrade() {
                engine.on_replica_progress();
            }
        }));
        Ok(session)
    }

    /// Re-evaluates the completed watermark and wakes any pending
    /// `wait_for_catchup_quorum` call; invoked whenever a session's ack
    /// numbers advance.
    fn on_replica_progress(&self) {
        let completed = self.replicas.completed_lsn();
        self.queue.lock().complete(Some(completed));
        self.catchup_notify.notify_waiters();
    }

    pub fn update_catchup_configuration(
        &self,
        previous: Option<Configuration>,
        current: Configuration,
        must_catchup: &[ReplicaId],
    ) {
        self.replicas
            .update_catchup_configuration(previous, current, must_catchup);
        self.catchup_notify.notify_waiters();
    }

    /// Blocks until `mode`'s predicate is satisfied (spec.md §4.9). Only one
    /// caller may have a pending wait at a time.
    pub async fn wait_for_catchup_quorum(&self, mode: CatchupMode) -> Result<()> {
        {
            let mut pending = self.catchup_pending.lock().await;
            if *pending {
                return Err(ReplicatorError::InvalidState(
                    "a catch-up wait is already pending".into(),
                ));
            }
            *pending = true;
        }

        let result = loop {
            if self.closed.load(Ordering::Acquire) {
                break Err(ReplicatorError::ObjectClosed);
            }
            let notified = self.catchup_notify.notified();
            let primary_last_lsn = self.last_received_lsn();
            let satisfied = match mode {
                CatchupMode::Quorum => self.replicas.quorum_catchup_satisfied(primary_last_lsn),
                CatchupMode::All(target) => self.replicas.all_catchup_satisfied(target),
                CatchupMode::QuorumWithMustCatchup => {
                    self.replicas.quorum_with_must_catchup_satisfied(primary_last_lsn)
                }
            };
            if satisfied {
                break Ok(());
            }
            notified.await;
        };

        *self.catchup_pending.lock().await = false;
        result
    }

    /// Invoked by the role controller after a quorum loss. If the state
    /// provider reports its state changed, resets the queue to its new base
    /// (spec.md §8 scenario 6).
    pub async fn on_data_loss(&self) -> Result<()> {
        if self.state_provider.on_data_loss().await? {
            let last_committed = self.state_provider.get_last_committed_sequence_number().await?;
            self.queue.lock().reset(last_committed.next());
            info!(lsn = %last_committed.next(), "state provider reported data loss; queue reset");
        }
        Ok(())
    }

    /// Waits up to `close_drain_timeout` for the completed watermark to
    /// catch up to the commit watermark, then closes every session
    /// regardless. Per spec.md §9(a): on timeout, proceed and discard
    /// non-committed operations rather than blocking indefinitely.
    pub async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::Release);
        let deadline = tokio::time::Instant::now() + self.config.close_drain_timeout;
        loop {
            let committed = self.replicas.quorum_lsn(self.last_received_lsn());
            if self.completed_lsn() >= committed {
                break;
            }
            if tokio::time::Instant::now() >= deadline {
                warn!(
                    completed = %self.completed_lsn(),
                    committed = %committed,
                    "close drain timeout elapsed; discarding non-committed operations"
                );
                self.queue.lock().discard_non_committed();
                break;
            }
            tokio::time::sleep(Duration::from_millis(20)).await;
        }
        for session in self.replicas.sessions() {
            session.close().await;
        }
        self.catchup_notify.notify_waiters();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::types::Epoch;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};

    struct NullTransport;
    #[async_trait]
    impl Transport for NullTransport {
        async fn send(
            &self,
            _target: &ReplicaTarget,
            _message: crate::message::Message,
        ) -> std::result::Result<(), crate::transport::TransportError> {
            Ok(())
        }
    }

    struct NullStateProvider;
    #[async_trait]
    impl StateProvider for NullStateProvider {
        async fn get_last_committed_sequence_number(&self) -> Result<Lsn> {
            Ok(Lsn::ZERO)
        }
        async fn update_epoch(&self, _epoch: Epoch, _prev_epoch_last_lsn: Lsn) -> Result<()> {
            Ok(())
        }
        async fn on_data_loss(&self) -> Result<bool> {
            Ok(false)
        }
        async fn get_copy_state(
            &self,
            _upto_lsn: Lsn,
            _copy_context: Option<BoxStream<'static, Operation>>,
        ) -> Result<BoxStream<'static, Operation>> {
            Ok(Box::pin(stream::empty()))
        }
        async fn get_copy_context(&self) -> Result<BoxStream<'static, Operation>> {
            Ok(Box::pin(stream::empty()))
        }
    }

    fn engine() -> Arc<PrimaryEngine> {
        PrimaryEngine::new(
            Epoch::ZERO,
            Lsn::ZERO,
            Arc::new(ReplicaManager::new()),
            Arc::new(NullStateProvider),
            Arc::new(NullTransport),
            ReplicatorConfig::default(),
            FromHeader {
                address: "primary:9000".into(),
                demuxer_actor: "primary".into(),
            },
            Arc::new(NoopMetrics),
        )
    }

    #[tokio::test]
    async fn replicate_with_no_replicas_commits_synchronously() {
        let engine = engine();
        let (lsn, synchronous) = engine.replicate(vec![], AtomicGroupId(0)).unwrap();
        assert_eq!(lsn, Lsn(1));
        assert!(synchronous);
        assert_eq!(engine.completed_lsn(), Lsn(1));
    }

    #[tokio::test]
    async fn replicate_after_close_is_rejected() {
        let engine = engine();
        engine.close().await.unwrap();
        assert!(matches!(
            engine.replicate(vec![], AtomicGroupId(0)),
            Err(ReplicatorError::ObjectClosed)
        ));
    }

    struct DataLossStateProvider {
        last_committed: Lsn,
    }
    #[async_trait]
    impl StateProvider for DataLossStateProvider {
        async fn get_last_committed_sequence_number(&self) -> Result<Lsn> {
            Ok(self.last_committed)
        }
        async fn update_epoch(&self, _epoch: Epoch, _prev_epoch_last_lsn: Lsn) -> Result<()> {
            Ok(())
        }
        async fn on_data_loss(&self) -> Result<bool> {
            Ok(true)
        }
        async fn get_copy_state(
            &self,
            _upto_lsn: Lsn,
            _copy_context: Option<BoxStream<'static, Operation>>,
        ) -> Result<BoxStream<'static, Operation>> {
            Ok(Box::pin(stream::empty()))
        }
        async fn get_copy_context(&self) -> Result<BoxStream<'static, Operation>> {
            Ok(Box::pin(stream::empty()))
        }
    }

    /// Primary at LSN 10; `OnDataLoss` reports a state change and a
    /// committed watermark of 4 — the queue resets so the next `Replicate`
    /// assigns LSN 5 (spec.md §8 scenario 6).
    #[tokio::test]
    async fn on_data_loss_with_state_change_resets_queue_to_reported_watermark() {
        let engine = PrimaryEngine::new(
            Epoch::ZERO,
            Lsn::ZERO,
            Arc::new(ReplicaManager::new()),
            Arc::new(DataLossStateProvider {
                last_committed: Lsn(4),
            }),
            Arc::new(NullTransport),
            ReplicatorConfig::default(),
            FromHeader {
                address: "primary:9000".into(),
                demuxer_actor: "primary".into(),
            },
            Arc::new(NoopMetrics),
        );
        for _ in 0..10 {
            engine.replicate(vec![], AtomicGroupId(0)).unwrap();
        }
        assert_eq!(engine.last_received_lsn(), Lsn(10));

        engine.on_data_loss().await.unwrap();
        assert_eq!(engine.last_received_lsn(), Lsn(4));

        let (lsn, _) = engine.replicate(vec![], AtomicGroupId(0)).unwrap();
        assert_eq!(lsn, Lsn(5));
    }

    #[tokio::test]
    async fn second_concurrent_catchup_wait_is_rejected() {
        let engine = engine();
        // An unreachable catchup target keeps the predicate false forever,
        // so the first wait is still pending when the second one arrives.
        engine.update_catchup_configuration(
            Some(Configuration {
                replica_ids: vec![],
                write_quorum: 1,
                catchup_lsn: Lsn(100),
            }),
            Configuration {
                replica_ids: vec![],
                write_quorum: 1,
                catchup_lsn: Lsn::ZERO,
            },
            &[],
        );
        let e2 = Arc::clone(&engine);
        let first = tokio::spawn(async move { e2.wait_for_catchup_quorum(CatchupMode::Quorum).await });
        tokio::task::yield_now().await;
        let second = engine.wait_for_catchup_quorum(CatchupMode::Quorum).await;
        assert!(second.is_err());
        engine.close().await.unwrap();
        let _ = first.await;
    }
}
