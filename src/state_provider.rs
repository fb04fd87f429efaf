// src/state_provider.rs

//! The durable service consumed by this engine, specified only at its
//! interface (spec.md §1/§6). Capability set: `GetLastCommittedSequenceNumber`,
//! `UpdateEpoch`, `OnDataLoss`, `GetCopyState`, `GetCopyContext`.

use crate::error::Result;
use crate::operation::Operation;
use crate::types::{Epoch, Lsn};
use async_trait::async_trait;
use futures::stream::BoxStream;

/// The host's durable state machine. All calls are async and may themselves
/// re-enter the engine (e.g. to read queue state); the engine never invokes
/// these while holding one of its own locks (spec.md §5).
#[async_trait]
pub trait StateProvider: Send + Sync {
    /// Highest durably-applied LSN, used to seed/reset the replication queue.
    async fn get_last_committed_sequence_number(&self) -> Result<Lsn>;

    /// Synchronous barrier: must be fully applied before the engine delivers
    /// any operation at `epoch`. Called exactly once per epoch increase.
    async fn update_epoch(&self, epoch: Epoch, prev_epoch_last_lsn: Lsn) -> Result<()>;

    /// Invoked on the primary after a quorum loss. `true` means the engine
    /// must reset its queue to `get_last_committed_sequence_number() + 1`.
    async fn on_data_loss(&self) -> Result<bool>;

    /// Primary pulls this to send bulk state to an idle replica, bounded by
    /// `upto_lsn` and parameterized by the secondary's `copy_context`.
    async fn get_copy_state(
        &self,
        upto_lsn: Lsn,
        copy_context: Option<BoxStream<'static, Operation>>,
    ) -> Result<BoxStream<'static, Operation>>;

    /// Secondary pulls this to send its copy-context to the primary
    /// (persisted-state services only).
    async fn get_copy_context(&self) -> Result<BoxStream<'static, Operation>>;
}
