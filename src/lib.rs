// src/lib.rs

//! `replicator-core`: the primary/secondary replication engine for a
//! stateful service. Sits above a host-supplied [`transport::Transport`]
//! and beneath a host-supplied [`state_provider::StateProvider`]; drives
//! write ordering, quorum-acknowledged commit, copy/catch-up, and
//! reconfiguration. See `SPEC_FULL.md` for the full component breakdown.
//!
//! Entry points: construct a [`role_controller::RoleController`], `open`
//! it, then call `change_role_to_primary`/`change_role_to_secondary` as the
//! reconfiguration authority directs. Wire messages arriving from the
//! transport are routed to the active [`primary_engine::PrimaryEngine`] or
//! [`secondary_engine::SecondaryEngine`] by the host's demuxing layer (out
//! of scope here, per spec.md §1).

pub mod ack_batcher;
pub mod config;
pub mod copy_receiver;
pub mod copy_sender;
pub mod dispatch;
pub mod error;
pub mod message;
pub mod metrics;
pub mod operation;
pub mod primary_engine;
pub mod queue;
pub mod remote_session;
pub mod replica_manager;
pub mod replication_receiver;
pub mod role_controller;
pub mod secondary_engine;
pub mod sender;
pub mod state_provider;
pub mod transport;
pub mod types;
pub mod wire;

pub use config::ReplicatorConfig;
pub use error::{FaultType, ReplicatorError, Result};
pub use message::{FromHeader, Message};
pub use metrics::{NoopMetrics, ReplicatorMetrics};
pub use operation::{AtomicGroupId, Operation, OperationKind};
pub use primary_engine::{CatchupMode, PrimaryEngine};
pub use replica_manager::{Configuration, ReplicaManager};
pub use role_controller::{RoleController, RoleState};
pub use secondary_engine::SecondaryEngine;
pub use state_provider::StateProvider;
pub use transport::{Transport, TransportError};
pub use types::{Epoch, IncarnationId, Lsn, ReplicaId, ReplicaRole, ReplicaTarget};
