// src/transport.rs

//! The reliable message transport, consumed only at its interface (spec.md
//! §1 places the actual framed-messaging implementation out of scope).

use crate::message::Message;
use crate::types::ReplicaTarget;
use async_trait::async_trait;
use std::fmt;

/// Failure modes the engine must distinguish when a send fails.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TransportError {
    /// The message exceeds what the transport can frame; fatal to the session.
    MessageTooLarge { size: usize, limit: usize },
    /// The transport's outbound queue is momentarily full; retry later.
    SendQueueFull,
    /// The target is unknown or unreachable; treated like a transient failure.
    Unreachable(String),
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransportError::MessageTooLarge { size, limit } => {
                write!(f, "message of {size} bytes exceeds limit of {limit} bytes")
            }
            TransportError::SendQueueFull => write!(f, "transport send queue full"),
            TransportError::Unreachable(reason) => write!(f, "unreachable: {reason}"),
        }
    }
}

impl std::error::Error for TransportError {}

/// Reliable framed messaging to a resolved target. Delivery need not be
/// ordered or deduplicated by the transport itself — `ReliableOperationSender`
/// and the receiver-side epoch/LSN checks already tolerate duplicates and
/// reordering; the transport only needs to attempt best-effort delivery and
/// report the two failure modes above.
#[async_trait]
pub trait Transport: Send + Sync {
    async fn send(&self, target: &ReplicaTarget, message: Message) -> Result<(), TransportError>;
}
