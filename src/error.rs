// src/error.rs

//! Defines the primary error type for the replication engine.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum for the engine. Variants map directly onto the error
/// kinds enumerated in the design: queue-bounded failures the caller can
/// retry, graceful cancellation/timeout, caller protocol violations, and
/// faults that must propagate to the partition's fault-reporting path.
#[derive(Error, Debug)]
pub enum ReplicatorError {
    /// The operation queue is at its count or byte bound; caller should retry.
    #[error("queue is full")]
    QueueFull,

    /// A pending async operation (BuildIdle, WaitForCatchupQuorum, Close
    /// drain) was canceled before completion.
    #[error("operation canceled")]
    Canceled,

    /// A wait exceeded its configured timeout.
    #[error("operation timed out")]
    Timeout,

    /// The caller violated the component's protocol (e.g. enqueuing an LSN
    /// out of order, double-acknowledging an operation).
    #[error("invalid state: {0}")]
    InvalidState(String),

    /// A message exceeded the transport's maximum size; fatal to the session.
    #[error("message too large: {0} bytes exceeds limit of {1} bytes")]
    MessageTooLarge(usize, usize),

    /// The transport's send queue is momentarily full; the sender should
    /// pause retransmission for this tick rather than treat it as a fault.
    #[error("transport send queue full")]
    TransportSendQueueFull,

    /// The state provider reported a failure; this faults the replica.
    #[error("state provider operation failed: {0}")]
    OperationFailed(String),

    /// The component has already been closed.
    #[error("object closed")]
    ObjectClosed,

    /// The secondary's operation stream reported a fault to the state
    /// provider (only when `use_stream_faults_and_eos_ack` is enabled).
    #[error("operation stream faulted: {0}")]
    OperationStreamFaulted(String),

    /// An invariant was violated; indicates a bug or a race during close.
    #[error("internal replicator error: {0}")]
    Internal(String),

    /// Transport delivery failure, wrapped from the host's `Transport` impl.
    #[error("transport error: {0}")]
    Transport(String),

    /// I/O error surfaced from configuration loading.
    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),
}

impl Clone for ReplicatorError {
    fn clone(&self) -> Self {
        match self {
            Self::QueueFull => Self::QueueFull,
            Self::Canceled => Self::Canceled,
            Self::Timeout => Self::Timeout,
            Self::InvalidState(s) => Self::InvalidState(s.clone()),
            Self::MessageTooLarge(a, b) => Self::MessageTooLarge(*a, *b),
            Self::TransportSendQueueFull => Self::TransportSendQueueFull,
            Self::OperationFailed(s) => Self::OperationFailed(s.clone()),
            Self::ObjectClosed => Self::ObjectClosed,
            Self::OperationStreamFaulted(s) => Self::OperationStreamFaulted(s.clone()),
            Self::Internal(s) => Self::Internal(s.clone()),
            Self::Transport(s) => Self::Transport(s.clone()),
            Self::Io(e) => Self::Io(Arc::clone(e)),
        }
    }
}

impl PartialEq for ReplicatorError {
    fn eq(&self, other: &Self) -> bool {
        match (self, other) {
            (Self::InvalidState(a), Self::InvalidState(b)) => a == b,
            (Self::MessageTooLarge(a1, a2), Self::MessageTooLarge(b1, b2)) => a1 == b1 && a2 == b2,
            (Self::OperationFailed(a), Self::OperationFailed(b)) => a == b,
            (Self::OperationStreamFaulted(a), Self::OperationStreamFaulted(b)) => a == b,
            (Self::Internal(a), Self::Internal(b)) => a == b,
            (Self::Transport(a), Self::Transport(b)) => a == b,
            (Self::Io(a), Self::Io(b)) => a.to_string() == b.to_string(),
            _ => std::mem::discriminant(self) == std::mem::discriminant(other),
        }
    }
}

impl From<std::io::Error> for ReplicatorError {
    fn from(e: std::io::Error) -> Self {
        ReplicatorError::Io(Arc::new(e))
    }
}

/// A fault reported to the host's partition-level fault path (spec.md §7:
/// "Faulting invokes the partition's `ReportFault(faultType)`"). The engine
/// never acts on this itself — it is the host's responsibility to abort.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FaultType {
    /// A transient condition; the partition may choose to retry.
    Transient,
    /// A permanent condition; the partition should not be retried in place.
    Permanent,
}

pub type Result<T> = std::result::Result<T, ReplicatorError>;
