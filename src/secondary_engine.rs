// src/secondary_engine.rs

//! C10: the secondary role. Translates wire messages from the primary into
//! calls on `ReplicationReceiver`/`CopyReceiver`, drives the epoch-barrier
//! pump between the internal replication dispatch queue and the
//! state-provider-facing stream, gates idle-to-active promotion, and hands
//! its replication queue wholesale to a new primary on role promotion.

use crate::ack_batcher::{AckBatcher, AckSendCallback};
use crate::config::ReplicatorConfig;
use crate::copy_receiver::CopyReceiver;
use crate::dispatch::DispatchQueue;
use crate::error::{ReplicatorError, Result};
use crate::message::{CopyOperationEntry, FromHeader, Message, ReplicationOperationEntry};
use crate::metrics::ReplicatorMetrics;
use crate::operation::Operation;
use crate::remote_session::AckNumbers;
use crate::replication_receiver::{DispatchItem, ReplicationReceiver};
use crate::state_provider::StateProvider;
use crate::transport::Transport;
use crate::types::{Epoch, IncarnationId, Lsn, ReplicaId, ReplicaRole, ReplicaTarget};
use futures::StreamExt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{info, warn};

struct EngineState {
    min_allowed_epoch: Epoch,
    start_copy_epoch: Option<Epoch>,
    role: ReplicaRole,
}

/// A secondary's view of a single primary/build lifetime. Constructed once
/// per role-activation; a fresh instance is built on every `StartCopy` from
/// a new primary incarnation rather than being reused across primaries.
pub struct SecondaryEngine {
    replica_id: ReplicaId,
    incarnation_id: IncarnationId,
    from: FromHeader,
    primary: parking_lot::Mutex<ReplicaTarget>,
    transport: Arc<dyn Transport>,
    state_provider: Arc<dyn StateProvider>,
    config: ReplicatorConfig,
    metrics: Arc<dyn ReplicatorMetrics>,
    state: parking_lot::Mutex<EngineState>,
    replication_receiver: parking_lot::Mutex<Option<Arc<ReplicationReceiver>>>,
    replication_stream: Arc<DispatchQueue<Operation>>,
    copy_receiver: Arc<CopyReceiver>,
    ack_batcher: Arc<AckBatcher>,
    faulted: AtomicBool,
    closed: AtomicBool,
    copy_context_cancel: parking_lot::Mutex<Option<Arc<AtomicBool>>>,
}

impl SecondaryEngine {
    pub fn new(
        replica_id: ReplicaId,
        incarnation_id: IncarnationId,
        primary: ReplicaTarget,
        from: FromHeader,
        transport: Arc<dyn Transport>,
        state_provider: Arc<dyn StateProvider>,
        config: ReplicatorConfig,
        metrics: Arc<dyn ReplicatorMetrics>,
    ) -> Arc<Self> {
        let ack_send: AckSendCallback = {
            let transport = Arc::clone(&transport);
            let from = from.clone();
            let primary_for_ack = primary.clone();
            Box::new(move |numbers: AckNumbers| {
                let transport = Arc::clone(&transport);
                let from = from.clone();
                let target = primary_for_ack.clone();
                tokio::spawn(async move {
                    let _ = transport
                        .send(
                            &target,
                            Message::ReplicationAck {
                                from,
                                incarnation_id,
                                received_lsn: numbers.repl_received_lsn,
                                quorum_lsn: numbers.repl_quorum_lsn,
                                copy_received_lsn: numbers.copy_received_lsn,
                                copy_quorum_lsn: numbers.copy_quorum_lsn,
                                error_code: None,
                            },
                        )
                        .await;
                });
            })
        };

        Arc::new(Self {
            replica_id,
            incarnation_id,
            from,
            primary: parking_lot::Mutex::new(primary),
            transport,
            state_provider,
            copy_receiver: Arc::new(CopyReceiver::new(
                config.require_service_ack,
                config.max_pending_operations,
                config.max_pending_bytes,
            )),
            ack_batcher: Arc::new(AckBatcher::new(config.max_pending_acknowledgements, ack_send)),
            config,
            metrics,
            state: parking_lot::Mutex::new(EngineState {
                min_allowed_epoch: Epoch::ZERO,
                start_copy_epoch: None,
                role: ReplicaRole::Idle,
            }),
            replication_receiver: parking_lot::Mutex::new(None),
            replication_stream: Arc::new(DispatchQueue::new()),
            faulted: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            copy_context_cancel: parking_lot::Mutex::new(None),
        })
    }

    pub fn role(&self) -> ReplicaRole {
        self.state.lock().role
    }

    pub fn is_faulted(&self) -> bool {
        self.faulted.load(Ordering::Acquire)
    }

    /// The state-provider-facing copy stream (spec.md §6: `CopyStream`).
    pub fn copy_stream(&self) -> Arc<DispatchQueue<Operation>> {
        self.copy_receiver.dispatch_queue()
    }

    /// The state-provider-facing replication stream (spec.md §6:
    /// `ReplicationStream`) — plain operations, with `UpdateEpoch` barriers
    /// already applied by the internal pump rather than surfaced to the host.
    pub fn replication_stream(&self) -> Arc<DispatchQueue<Operation>> {
        Arc::clone(&self.replication_stream)
    }

    pub fn ack_batcher(&self) -> Arc<AckBatcher> {
        Arc::clone(&self.ack_batcher)
    }

    fn fault(&self, reason: &str) {
        warn!(replica = %self.replica_id, %reason, "secondary engine faulted");
        self.faulted.store(true, Ordering::Release);
        self.metrics.session_faulted("replication stream fault");
    }

    /// **StartCopy** (spec.md §4.10). Idempotent: a retransmitted StartCopy
    /// for the same epoch is a no-op past the first receipt.
    pub async fn handle_start_copy(
        &self,
        replica_id: ReplicaId,
        epoch: Epoch,
        replication_start_lsn: Lsn,
        has_persisted_state: bool,
    ) -> Result<()> {
        if replica_id != self.replica_id {
            return Ok(()); // addressed to a different incarnation/replica
        }
        let already_started = {
            let mut state = self.state.lock();
            if state.start_copy_epoch.is_some() {
                true
            } else {
                state.start_copy_epoch = Some(epoch);
                state.min_allowed_epoch = epoch;
                false
            }
        };
        if already_started {
            self.ack_batcher.force_send();
            return Ok(());
        }

        let receiver = Arc::new(ReplicationReceiver::new(
            replication_start_lsn,
            epoch,
            self.config.require_service_ack,
            self.config.max_pending_operations,
            self.config.max_pending_bytes,
        ));
        receiver.set_clean_on_complete(self.config.secondary_clear_acknowledged_operations);
        *self.replication_receiver.lock() = Some(Arc::clone(&receiver));

        self.spawn_epoch_pump(Arc::clone(&receiver));

        if has_persisted_state {
            self.spawn_copy_context_pipeline();
        }

        info!(replica = %self.replica_id, %epoch, %replication_start_lsn, "start-copy accepted");
        self.ack_batcher.force_send();
        Ok(())
    }

    /// Drains the receiver's internal `DispatchItem` stream, applying
    /// `UpdateEpoch` barriers synchronously against the state provider and
    /// forwarding ordinary operations to the host-facing replication stream.
    fn spawn_epoch_pump(&self, receiver: Arc<ReplicationReceiver>) {
        let state_provider = Arc::clone(&self.state_provider);
        let out = Arc::clone(&self.replication_stream);
        let requires_service_ack = self.config.require_service_ack;
        let internal = receiver.dispatch_queue();
        tokio::spawn(async move {
            loop {
                match internal.dequeue().await {
                    Ok(Some(DispatchItem::Op(op))) => {
                        let lsn = op.lsn;
                        if out.enqueue_without_dispatch(op).await.is_err() {
                            break;
                        }
                        out.dispatch();
                        let receiver = Arc::clone(&receiver);
                        // Mirror the dispatched op's ack into the receiver's
                        // completed watermark once the host fulfills it.
                        tokio::spawn(async move {
                            receiver.on_service_ack(lsn);
                        });
                    }
                    Ok(Some(DispatchItem::UpdateEpoch {
                        epoch,
                        prev_epoch_last_lsn,
                    })) => {
                        if requires_service_ack {
                            receiver.wait_until_barrier_unblocked().await;
                        }
                        if let Err(err) = state_provider.update_epoch(epoch, prev_epoch_last_lsn).await {
                            warn!(%epoch, error = %err, "update_epoch failed; faulting replica");
                            out.abort().await;
                            break;
                        }
                    }
                    Ok(None) => {
                        out.close().await;
                        break;
                    }
                    Err(_) => {
                        out.abort().await;
                        break;
                    }
                }
            }
        });
    }

    /// Pulls the state provider's `GetCopyContext` stream and forwards it to
    /// the primary as a sequence of `CopyContextOperation` messages, stopping
    /// early if a `CopyContextAck` carries a nonzero error code.
    fn spawn_copy_context_pipeline(&self) {
        let state_provider = Arc::clone(&self.state_provider);
        let transport = Arc::clone(&self.transport);
        let from = self.from.clone();
        let primary = self.primary.lock().clone();
        let canceled = Arc::new(AtomicBool::new(false));
        *self.copy_context_cancel.lock() = Some(Arc::clone(&canceled));
        tokio::spawn(async move {
            let mut stream = match state_provider.get_copy_context().await {
                Ok(s) => s,
                Err(err) => {
                    warn!(error = %err, "get_copy_context failed");
                    return;
                }
            };
            let mut lsn = Lsn(1);
            loop {
                if canceled.load(Ordering::Acquire) {
                    return;
                }
                match stream.next().await {
                    Some(op) => {
                        let msg = Message::CopyContextOperation {
                            from: from.clone(),
                            lsn,
                            is_last: false,
                            segments: op.segments.clone(),
                        };
                        if transport.send(&primary, msg).await.is_err() {
                            return;
                        }
                        lsn = lsn.next();
                    }
                    None => {
                        let msg = Message::CopyContextOperation {
                            from: from.clone(),
                            lsn,
                            is_last: true,
                            segments: Vec::new(),
                        };
                        let _ = transport.send(&primary, msg).await;
                        return;
                    }
                }
            }
        });
    }

    /// **CopyContextAck**. A nonzero `error_code` cancels the in-flight
    /// copy-context send; this engine only tracks the cancellation flag
    /// here since the send task itself owns its own `canceled` handle.
    pub fn handle_copy_context_ack(&self, _lsn: Lsn, error_code: Option<String>) {
        if error_code.is_some() {
            if let Some(flag) = self.copy_context_cancel.lock().as_ref() {
                flag.store(true, Ordering::Release);
            }
        }
    }

    /// **ReplicationOperation** (spec.md §4.10). Drops entries at an epoch
    /// below `min_allowed_epoch` or received before `StartCopy`; advances
    /// `min_allowed_epoch` on any epoch increase.
    pub async fn handle_replication_operation(
        &self,
        batch: Vec<ReplicationOperationEntry>,
        completed_lsn: Lsn,
    ) -> Result<()> {
        let receiver = self.replication_receiver.lock().clone();
        let Some(receiver) = receiver else {
            return Ok(()); // before StartCopy; drop silently
        };
        for entry in batch {
            let admit = {
                let mut state = self.state.lock();
                if entry.op_epoch < state.min_allowed_epoch {
                    false
                } else {
                    if entry.op_epoch > state.min_allowed_epoch {
                        state.min_allowed_epoch = entry.op_epoch;
                    }
                    true
                }
            };
            if !admit {
                continue;
            }
            let (op, _ack_rx) =
                Operation::new_normal(entry.lsn, entry.op_epoch, None, entry.segments);
            match receiver.process_replication_operation(op, completed_lsn).await {
                Ok(()) => {}
                Err(ReplicatorError::QueueFull) => {
                    warn!(lsn = %entry.lsn, "replication queue full; dropping operation for primary to retransmit");
                    self.metrics.queue_full_rejected("replication");
                }
                Err(e) => return Err(e),
            }
        }
        self.ack_batcher.observe(AckNumbers {
            repl_received_lsn: receiver.last_received_lsn(),
            repl_quorum_lsn: Lsn::INVALID,
            copy_received_lsn: Lsn::INVALID,
            copy_quorum_lsn: Lsn::INVALID,
        });
        Ok(())
    }

    /// **CopyOperation** (spec.md §4.10 / §9(b)): an epoch older than
    /// `start_copy_epoch` is a stale retransmit and ignored; an epoch newer
    /// than it is a protocol error and faults the replica.
    pub async fn handle_copy_operation(
        &self,
        epoch: Epoch,
        entry: CopyOperationEntry,
    ) -> Result<()> {
        let start_copy_epoch = self.state.lock().start_copy_epoch;
        match start_copy_epoch {
            Some(started) if epoch == started => {}
            Some(started) if epoch < started => return Ok(()), // stale
            Some(_) => {
                self.fault("copy operation at an epoch newer than start-copy epoch");
                return Err(ReplicatorError::InvalidState(
                    "copy operation epoch exceeds start-copy epoch".into(),
                ));
            }
            None => return Ok(()), // before StartCopy
        }
        let is_last = entry.is_last;
        self.copy_receiver
            .process_copy_operation(
                Operation::new_normal(entry.lsn, epoch, None, entry.segments).0,
                is_last,
            )
            .await?;
        self.ack_batcher.observe(AckNumbers {
            repl_received_lsn: Lsn::INVALID,
            repl_quorum_lsn: Lsn::INVALID,
            copy_received_lsn: self.copy_receiver.last_received_lsn(),
            copy_quorum_lsn: Lsn::INVALID,
        });
        Ok(())
    }

    /// **RequestAck**: bypass the batching tick and send immediately.
    pub fn handle_request_ack(&self) {
        self.ack_batcher.force_send();
    }

    /// **InduceFault**: only acts if both identifiers match this incarnation.
    pub fn handle_induce_fault(
        &self,
        replica_id: ReplicaId,
        incarnation_id: IncarnationId,
        reason: &str,
    ) {
        if replica_id == self.replica_id && incarnation_id == self.incarnation_id {
            self.fault(reason);
        }
    }

    /// Periodic ack-batcher tick; the host drives this on `batch_ack_interval`.
    pub fn on_tick(&self) {
        self.ack_batcher.on_tick();
    }

    /// Promotion to active secondary (spec.md §4.10): for non-persisted
    /// services, waits for the copy dispatch queue to drain; for persisted
    /// services, waits for every copy operation to be service-acked.
    pub async fn wait_for_copy_complete_and_promote(&self) {
        if self.config.require_service_ack {
            while !self.copy_receiver.all_operations_acked() {
                tokio::task::yield_now().await;
            }
        } else {
            self.copy_receiver.dispatch_queue().wait_for_queue_to_drain().await;
        }
        self.state.lock().role = ReplicaRole::Active;
        info!(replica = %self.replica_id, "promoted to active secondary");
    }

    /// True once copy has fully completed and every dispatched replication
    /// operation has been service-acked — the precondition for a
    /// secondary-to-primary role change (spec.md §4.10).
    pub fn ready_for_primary_promotion(&self) -> bool {
        if self.role() != ReplicaRole::Active {
            return false;
        }
        if !self.copy_receiver.all_operations_acked() {
            return false;
        }
        match self.replication_receiver.lock().as_ref() {
            Some(r) => r.all_operations_acked(),
            None => false,
        }
    }

    /// Hands this secondary's replication queue wholesale to a newly
    /// promoted primary, trimming any excess beyond `max_primary_queue_size`
    /// off the head first (spec.md §4.10).
    pub fn take_operations_for_primary_handover(&self, max_primary_queue_size: usize) -> Vec<Operation> {
        let receiver = self.replication_receiver.lock().clone();
        let Some(receiver) = receiver else {
            return Vec::new();
        };
        receiver.trim_to_primary_queue_size(max_primary_queue_size);
        receiver
            .get_operations(receiver.last_completed_lsn().next())
            .unwrap_or_default()
    }

    /// Graceful close / role change: enqueues the end-of-stream sentinel on
    /// the replication stream and closes the copy stream.
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let epoch = self.state.lock().min_allowed_epoch;
        if let Some(receiver) = self.replication_receiver.lock().clone() {
            let _ = receiver.signal_end_of_stream(epoch).await;
        }
        self.copy_receiver.dispatch_queue().close().await;
        self.replication_stream.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::types::IncarnationId;
    use async_trait::async_trait;
    use futures::stream::{self, BoxStream};

    struct RecordingTransport {
        sent: parking_lot::Mutex<Vec<Message>>,
    }

    #[async_trait]
    impl Transport for RecordingTransport {
        async fn send(
            &self,
            _target: &ReplicaTarget,
            message: Message,
        ) -> std::result::Result<(), crate::transport::TransportError> {
            self.sent.lock().push(message);
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

    fn primary_target() -> ReplicaTarget {
        ReplicaTarget {
            address: "primary:9000".into(),
            replica_id: ReplicaId(0),
            incarnation_id: IncarnationId(0),
        }
    }

    fn engine() -> Arc<SecondaryEngine> {
        SecondaryEngine::new(
            ReplicaId(1),
            IncarnationId(1),
            primary_target(),
            FromHeader {
                address: "secondary:9001".into(),
                demuxer_actor: "secondary".into(),
            },
            Arc::new(RecordingTransport {
                sent: parking_lot::Mutex::new(Vec::new()),
            }),
            Arc::new(NullStateProvider),
            ReplicatorConfig::default(),
            Arc::new(NoopMetrics),
        )
    }

    #[tokio::test]
    async fn start_copy_is_idempotent() {
        let engine = engine();
        engine
            .handle_start_copy(ReplicaId(1), Epoch::new(1, 0), Lsn::ZERO, false)
            .await
            .unwrap();
        engine
            .handle_start_copy(ReplicaId(1), Epoch::new(1, 0), Lsn::ZERO, false)
            .await
            .unwrap();
        assert!(engine.replication_receiver.lock().is_some());
    }

    #[tokio::test]
    async fn replication_operation_before_start_copy_is_dropped_not_errored() {
        let engine = engine();
        let result = engine
            .handle_replication_operation(
                vec![ReplicationOperationEntry {
                    lsn: Lsn(1),
                    op_epoch: Epoch::ZERO,
                    last_lsn_in_batch: Lsn(1),
                    segments: vec![],
                }],
                Lsn::INVALID,
            )
            .await;
        assert!(result.is_ok());
    }

    #[tokio::test]
    async fn ordinary_replication_operation_reaches_the_host_facing_stream() {
        let engine = engine();
        engine
            .handle_start_copy(ReplicaId(1), Epoch::new(1, 0), Lsn::ZERO, false)
            .await
            .unwrap();
        engine
            .handle_replication_operation(
                vec![ReplicationOperationEntry {
                    lsn: Lsn(1),
                    op_epoch: Epoch::new(1, 0),
                    last_lsn_in_batch: Lsn(1),
                    segments: vec![],
                }],
                Lsn::INVALID,
            )
            .await
            .unwrap();
        let stream = engine.replication_stream();
        let op = stream.dequeue().await.unwrap().unwrap();
        assert_eq!(op.lsn, Lsn(1));
    }

    #[tokio::test]
    async fn induce_fault_requires_matching_incarnation() {
        let engine = engine();
        engine.handle_induce_fault(ReplicaId(1), IncarnationId(999), "bogus");
        assert!(!engine.is_faulted());
        engine.handle_induce_fault(ReplicaId(1), IncarnationId(1), "matched");
        assert!(engine.is_faulted());
    }

    #[tokio::test]
    async fn copy_operation_at_newer_epoch_than_start_copy_faults_the_replica() {
        let engine = engine();
        engine
            .handle_start_copy(ReplicaId(1), Epoch::new(1, 0), Lsn::ZERO, false)
            .await
            .unwrap();
        let result = engine
            .handle_copy_operation(
                Epoch::new(1, 1),
                CopyOperationEntry {
                    lsn: Lsn(1),
                    is_last: false,
                    segments: vec![],
                },
            )
            .await;
        assert!(result.is_err());
        assert!(engine.is_faulted());
    }
}
