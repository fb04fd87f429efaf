// src/role_controller.rs

//! C11: the role state machine — `Created -> Opened -> {Primary, Secondary}`
//! with transitions to `Closing/Closed/Faulted`, plus the
//! `Primary -> CheckingDataLoss -> Primary` cycle. Owns whichever of
//! `PrimaryEngine`/`SecondaryEngine` is currently active and the background
//! ticker task that drives its retry/ack-batching clock — neither engine
//! runs its own timer internally (spec.md §4.2/§4.12's ticks are driven
//! externally; this is the external driver).

use crate::config::ReplicatorConfig;
use crate::error::{ReplicatorError, Result};
use crate::message::FromHeader;
use crate::metrics::ReplicatorMetrics;
use crate::primary_engine::PrimaryEngine;
use crate::replica_manager::ReplicaManager;
use crate::secondary_engine::SecondaryEngine;
use crate::state_provider::StateProvider;
use crate::transport::Transport;
use crate::types::{Epoch, IncarnationId, Lsn, ReplicaId, ReplicaTarget};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleState {
    Created,
    Opened,
    Primary,
    CheckingDataLoss,
    Secondary,
    Closing,
    Closed,
    Faulted,
}

enum ActiveRole {
    None,
    Primary(Arc<PrimaryEngine>, Arc<ReplicaManager>, JoinHandle<()>),
    Secondary(Arc<SecondaryEngine>, JoinHandle<()>),
}

impl ActiveRole {
    async fn close(self) {
        match self {
            ActiveRole::Primary(engine, _replicas, handle) => {
                let _ = engine.close().await;
                handle.abort();
            }
            ActiveRole::Secondary(engine, handle) => {
                engine.close().await;
                handle.abort();
            }
            ActiveRole::None => {}
        }
    }
}

/// Top-level handle a host builds once per partition replica and drives
/// through `open`/`change_role_to_*`/`close` as the reconfiguration
/// authority directs (spec.md §1: cluster membership and role assignment
/// are supplied externally; this component only enacts them).
pub struct RoleController {
    state: tokio::sync::Mutex<RoleState>,
    role: tokio::sync::Mutex<ActiveRole>,
    transport: Arc<dyn Transport>,
    state_provider: Arc<dyn StateProvider>,
    config: ReplicatorConfig,
    metrics: Arc<dyn ReplicatorMetrics>,
    from: FromHeader,
}

impl RoleController {
    pub fn new(
        transport: Arc<dyn Transport>,
        state_provider: Arc<dyn StateProvider>,
        config: ReplicatorConfig,
        metrics: Arc<dyn ReplicatorMetrics>,
        from: FromHeader,
    ) -> Arc<Self> {
        Arc::new(Self {
            state: tokio::sync::Mutex::new(RoleState::Created),
            role: tokio::sync::Mutex::new(ActiveRole::None),
            transport,
            state_provider,
            config,
            metrics,
            from,
        })
    }

    pub async fn state(&self) -> RoleState {
        *self.state.lock().await
    }

    pub async fn open(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state != RoleState::Created {
            return Err(ReplicatorError::InvalidState(
                "open is only legal from Created".into(),
            ));
        }
        *state = RoleState::Opened;
        Ok(())
    }

    fn reject_if_faulted(state: RoleState) -> Result<()> {
        if state == RoleState::Faulted {
            return Err(ReplicatorError::InvalidState(
                "role controller is faulted; only Close is permitted".into(),
            ));
        }
        Ok(())
    }

    /// `Opened|Secondary -> Primary`. If a secondary role is currently
    /// active, it is closed (not destroyed — `self` survives) before the
    /// primary role starts.
    pub async fn change_role_to_primary(
        self: &Arc<Self>,
        epoch: Epoch,
        starting_lsn: Lsn,
    ) -> Result<Arc<PrimaryEngine>> {
        let mut state = self.state.lock().await;
        Self::reject_if_faulted(*state)?;
        if !matches!(*state, RoleState::Opened | RoleState::Secondary) {
            return Err(ReplicatorError::InvalidState(format!(
                "change_role_to_primary is illegal from {:?}",
                *state
            )));
        }

        let mut role = self.role.lock().await;
        let previous = std::mem::replace(&mut *role, ActiveRole::None);
        previous.close().await;

        let replicas = Arc::new(ReplicaManager::new());
        let engine = PrimaryEngine::new(
            epoch,
            starting_lsn,
            Arc::clone(&replicas),
            Arc::clone(&self.state_provider),
            Arc::clone(&self.transport),
            self.config.clone(),
            self.from.clone(),
            Arc::clone(&self.metrics),
        );

        let tick_replicas = Arc::clone(&replicas);
        let tick_interval = self.config.retransmit_timeout;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                ticker.tick().await;
                tick_replicas.tick_all();
            }
        });

        *role = ActiveRole::Primary(Arc::clone(&engine), replicas, handle);
        *state = RoleState::Primary;
        info!(%epoch, %starting_lsn, "role controller: became primary");
        Ok(engine)
    }

    /// `Opened|Primary -> Secondary`.
    pub async fn change_role_to_secondary(
        self: &Arc<Self>,
        replica_id: ReplicaId,
        incarnation_id: IncarnationId,
        primary: ReplicaTarget,
    ) -> Result<Arc<SecondaryEngine>> {
        let mut state = self.state.lock().await;
        Self::reject_if_faulted(*state)?;
        if !matches!(*state, RoleState::Opened | RoleState::Primary) {
            return Err(ReplicatorError::InvalidState(format!(
                "change_role_to_secondary is illegal from {:?}",
                *state
            )));
        }

        let mut role = self.role.lock().await;
        let previous = std::mem::replace(&mut *role, ActiveRole::None);
        previous.close().await;

        let engine = SecondaryEngine::new(
            replica_id,
            incarnation_id,
            primary,
            self.from.clone(),
            Arc::clone(&self.transport),
            Arc::clone(&self.state_provider),
            self.config.clone(),
            Arc::clone(&self.metrics),
        );

        let tick_engine = Arc::clone(&engine);
        let tick_interval = self.config.ack_batching_period;
        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(tick_interval);
            loop {
                ticker.tick().await;
                tick_engine.on_tick();
            }
        });

        *role = ActiveRole::Secondary(Arc::clone(&engine), handle);
        *state = RoleState::Secondary;
        info!(%replica_id, "role controller: became secondary");
        Ok(engine)
    }

    /// `Primary -> CheckingDataLoss -> Primary`: runs `OnDataLoss` against
    /// the currently active primary engine.
    pub async fn on_data_loss(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        Self::reject_if_faulted(*state)?;
        if *state != RoleState::Primary {
            return Err(ReplicatorError::InvalidState(
                "on_data_loss is only legal while Primary".into(),
            ));
        }
        *state = RoleState::CheckingDataLoss;
        drop(state);

        let result = {
            let role = self.role.lock().await;
            match &*role {
                ActiveRole::Primary(engine, ..) => engine.on_data_loss().await,
                _ => Err(ReplicatorError::Internal(
                    "role state said Primary but no primary engine is active".into(),
                )),
            }
        };

        let mut state = self.state.lock().await;
        *state = match result {
            Ok(()) => RoleState::Primary,
            Err(_) => RoleState::Faulted,
        };
        result
    }

    /// Returns the active primary engine, if the current role is `Primary`.
    pub async fn primary(&self) -> Option<Arc<PrimaryEngine>> {
        match &*self.role.lock().await {
            ActiveRole::Primary(engine, ..) => Some(Arc::clone(engine)),
            _ => None,
        }
    }

    /// Returns the active secondary engine, if the current role is `Secondary`.
    pub async fn secondary(&self) -> Option<Arc<SecondaryEngine>> {
        match &*self.role.lock().await {
            ActiveRole::Secondary(engine, _) => Some(Arc::clone(engine)),
            _ => None,
        }
    }

    /// Any state -> `Closing -> Closed`. Not cancelable; idempotent.
    pub async fn close(&self) -> Result<()> {
        let mut state = self.state.lock().await;
        if *state == RoleState::Closed {
            return Ok(());
        }
        *state = RoleState::Closing;
        drop(state);

        let mut role = self.role.lock().await;
        let previous = std::mem::replace(&mut *role, ActiveRole::None);
        previous.close().await;
        drop(role);

        *self.state.lock().await = RoleState::Closed;
        Ok(())
    }

    /// Any state -> `Faulted`. Close remains legal afterward; everything
    /// else is rejected (spec.md §7: "Close is not blocked by a prior fault").
    pub async fn fault(&self, reason: &str) {
        warn!(%reason, "role controller faulted");
        *self.state.lock().await = RoleState::Faulted;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::NoopMetrics;
    use crate::operation::Operation;
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

    fn controller() -> Arc<RoleController> {
        RoleController::new(
            Arc::new(NullTransport),
            Arc::new(NullStateProvider),
            ReplicatorConfig::default(),
            Arc::new(NoopMetrics),
            FromHeader {
                address: "node:9000".into(),
                demuxer_actor: "node".into(),
            },
        )
    }

    #[tokio::test]
    async fn created_to_opened_to_primary() {
        let c = controller();
        assert_eq!(c.state().await, RoleState::Created);
        c.open().await.unwrap();
        c.change_role_to_primary(Epoch::ZERO, Lsn::ZERO).await.unwrap();
        assert_eq!(c.state().await, RoleState::Primary);
        assert!(c.primary().await.is_some());
        c.close().await.unwrap();
        assert_eq!(c.state().await, RoleState::Closed);
    }

    #[tokio::test]
    async fn change_role_to_primary_before_open_is_rejected() {
        let c = controller();
        assert!(c
            .change_role_to_primary(Epoch::ZERO, Lsn::ZERO)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn primary_to_secondary_closes_previous_role_first() {
        let c = controller();
        c.open().await.unwrap();
        c.change_role_to_primary(Epoch::ZERO, Lsn::ZERO).await.unwrap();
        c.change_role_to_secondary(
            ReplicaId(1),
            IncarnationId(1),
            ReplicaTarget {
                address: "primary:9000".into(),
                replica_id: ReplicaId(0),
                incarnation_id: IncarnationId(0),
            },
        )
        .await
        .unwrap();
        assert_eq!(c.state().await, RoleState::Secondary);
        assert!(c.primary().await.is_none());
        c.close().await.unwrap();
    }

    #[tokio::test]
    async fn faulted_rejects_role_changes_but_allows_close() {
        let c = controller();
        c.open().await.unwrap();
        c.fault("test induced").await;
        assert_eq!(c.state().await, RoleState::Faulted);
        assert!(c
            .change_role_to_primary(Epoch::ZERO, Lsn::ZERO)
            .await
            .is_err());
        c.close().await.unwrap();
        assert_eq!(c.state().await, RoleState::Closed);
    }

    #[tokio::test]
    async fn on_data_loss_cycles_through_checking_data_loss_back_to_primary() {
        let c = controller();
        c.open().await.unwrap();
        c.change_role_to_primary(Epoch::ZERO, Lsn::ZERO).await.unwrap();
        c.on_data_loss().await.unwrap();
        assert_eq!(c.state().await, RoleState::Primary);
        c.close().await.unwrap();
    }
}
