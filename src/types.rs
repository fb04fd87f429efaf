// src/types.rs

//! Primitive identifiers shared across the replication engine: sequence
//! numbers, epochs, and replica addressing.

use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;

/// A monotonically increasing sequence number assigned by the primary to
/// every operation it enqueues. Distinct replicas never assign their own
/// LSNs; they only ever observe LSNs the primary handed them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct Lsn(pub i64);

impl Lsn {
    /// Sentinel meaning "no value" / "not initialized". Distinct from `MAX`.
    pub const INVALID: Lsn = Lsn(-1);

    /// The pre-history anchor. The first real operation is `Lsn(1)`.
    pub const ZERO: Lsn = Lsn(0);

    pub fn is_valid(self) -> bool {
        self.0 >= 0
    }

    pub fn next(self) -> Lsn {
        Lsn(self.0 + 1)
    }

    pub fn prev(self) -> Lsn {
        Lsn(self.0 - 1)
    }
}

impl fmt::Display for Lsn {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if *self == Lsn::INVALID {
            write!(f, "<invalid>")
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl Default for Lsn {
    fn default() -> Self {
        Lsn::INVALID
    }
}

/// `(DataLossNumber, ConfigurationNumber)`, totally ordered lexicographically.
/// Assigned by the external reconfiguration authority; a replica only ever
/// accepts monotonically non-decreasing epochs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, Default)]
pub struct Epoch {
    pub data_loss_number: i64,
    pub configuration_number: i64,
}

impl Epoch {
    pub const ZERO: Epoch = Epoch {
        data_loss_number: 0,
        configuration_number: 0,
    };

    pub fn new(data_loss_number: i64, configuration_number: i64) -> Self {
        Self {
            data_loss_number,
            configuration_number,
        }
    }

    /// True if `other` represents a potential data loss relative to `self`
    /// (i.e. the state provider may have rewound and must be treated with
    /// suspicion rather than assumed merely "newer").
    pub fn implies_data_loss_from(&self, previous: &Epoch) -> bool {
        self.data_loss_number != previous.data_loss_number
    }
}

impl fmt::Display for Epoch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "({}, {})", self.data_loss_number, self.configuration_number)
    }
}

/// Identifies a replica within a partition.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ReplicaId(pub u64);

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "R{}", self.0)
    }
}

/// Disambiguates distinct incarnations of the same `ReplicaId` (e.g. a
/// process restart). Used so a stale message from a prior incarnation can
/// be told apart from the current one.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct IncarnationId(pub u64);

/// The resolved address a transport sends to: a logical endpoint plus the
/// replica/incarnation it is expected to belong to.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ReplicaTarget {
    pub address: String,
    pub replica_id: ReplicaId,
    pub incarnation_id: IncarnationId,
}

impl fmt::Display for ReplicaTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.replica_id, self.address)
    }
}

/// Whether a session is still receiving copy state or has joined the active
/// write quorum. Promoted to a named type (spec.md §3 only implies a
/// boolean) because several quorum computations must branch on it by name.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ReplicaRole {
    /// Receiving copy state; not yet eligible to participate in quorum.
    Idle,
    /// Participating in the write quorum.
    Active,
}

impl ReplicaRole {
    pub fn is_idle(self) -> bool {
        matches!(self, ReplicaRole::Idle)
    }

    pub fn is_active(self) -> bool {
        matches!(self, ReplicaRole::Active)
    }
}

/// Ordering helper used by quorum computations: largest-first so the
/// `k`-th element of a sorted vector is the `k`-th largest.
pub fn descending(a: &Lsn, b: &Lsn) -> Ordering {
    b.cmp(a)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lsn_invalid_is_not_valid() {
        assert!(!Lsn::INVALID.is_valid());
        assert!(Lsn::ZERO.is_valid());
        assert!(Lsn(1).is_valid());
    }

    #[test]
    fn epoch_ordering_is_lexicographic() {
        assert!(Epoch::new(1, 0) < Epoch::new(1, 1));
        assert!(Epoch::new(1, 5) < Epoch::new(2, 0));
        assert!(Epoch::new(2, 0) > Epoch::new(1, 999));
    }

    #[test]
    fn data_loss_detection_is_keyed_on_data_loss_number_only() {
        let a = Epoch::new(1, 4);
        let b = Epoch::new(1, 5);
        let c = Epoch::new(2, 0);
        assert!(!b.implies_data_loss_from(&a));
        assert!(c.implies_data_loss_from(&b));
    }
}
