// src/message.rs

//! Wire messages exchanged between a primary's `RemoteSession` and a
//! secondary's `SecondaryEngine`, as named in spec.md §6. Framing and
//! transport-level codecs are a host concern; this module only defines the
//! payload shapes carried over a [`crate::transport::Transport`].

use crate::types::{Epoch, IncarnationId, Lsn, ReplicaId};
use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Addressing header carried by every message so a receiver can reply
/// without a separate discovery round-trip.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FromHeader {
    pub address: String,
    pub demuxer_actor: String,
}

/// A single operation plus its position within a batch, as carried inside
/// a `ReplicationOperation` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationOperationEntry {
    pub lsn: Lsn,
    pub op_epoch: Epoch,
    pub last_lsn_in_batch: Lsn,
    pub segments: Vec<Bytes>,
}

/// A single copy operation, as carried inside a `CopyOperation` message.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CopyOperationEntry {
    pub lsn: Lsn,
    pub is_last: bool,
    pub segments: Vec<Bytes>,
}

/// Every message shape exchanged between a primary and secondary session,
/// per the wire-messages table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    StartCopy {
        from: FromHeader,
        epoch: Epoch,
        replica_id: ReplicaId,
        replication_start_lsn: Lsn,
        has_persisted_state: bool,
    },
    CopyOperation {
        from: FromHeader,
        replica_id: ReplicaId,
        epoch: Epoch,
        op: CopyOperationEntry,
    },
    CopyContextOperation {
        from: FromHeader,
        lsn: Lsn,
        is_last: bool,
        segments: Vec<Bytes>,
    },
    CopyContextAck {
        from: FromHeader,
        lsn: Lsn,
        error_code: Option<String>,
    },
    ReplicationOperation {
        from: FromHeader,
        primary_epoch: Epoch,
        completed_lsn: Lsn,
        batch: Vec<ReplicationOperationEntry>,
    },
    ReplicationAck {
        from: FromHeader,
        incarnation_id: IncarnationId,
        received_lsn: Lsn,
        quorum_lsn: Lsn,
        copy_received_lsn: Lsn,
        copy_quorum_lsn: Lsn,
        error_code: Option<String>,
    },
    RequestAck {
        from: FromHeader,
    },
    InduceFault {
        from: FromHeader,
        replica_id: ReplicaId,
        incarnation_id: IncarnationId,
        reason: String,
    },
}

impl Message {
    pub fn from_header(&self) -> &FromHeader {
        match self {
            Message::StartCopy { from, .. }
            | Message::CopyOperation { from, .. }
            | Message::CopyContextOperation { from, .. }
            | Message::CopyContextAck { from, .. }
            | Message::ReplicationOperation { from, .. }
            | Message::ReplicationAck { from, .. }
            | Message::RequestAck { from }
            | Message::InduceFault { from, .. } => from,
        }
    }

    /// The approximate on-wire size used to enforce `max_replication_message_size`.
    pub fn approx_size(&self) -> usize {
        match self {
            Message::ReplicationOperation { batch, .. } => batch
                .iter()
                .map(|e| e.segments.iter().map(Bytes::len).sum::<usize>())
                .sum(),
            Message::CopyOperation { op, .. } => op.segments.iter().map(Bytes::len).sum(),
            Message::CopyContextOperation { segments, .. } => {
                segments.iter().map(Bytes::len).sum()
            }
            _ => 0,
        }
    }
}
