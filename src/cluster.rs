//! Cluster membership as consumed by the coordination core.
//!
//! Failure detection lives outside this crate: a [`Membership`] reports the
//! local member and the live member set, and callers tell the
//! [`IndexManager`](crate::manager::IndexManager) when members join or leave.

pub mod federator;
pub mod ownership;
pub mod transport;

use std::collections::BTreeSet;
use std::fmt;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

pub use federator::RequestFederator;
pub use ownership::{BalancePolicy, EvenBalancePolicy, ShardOwnershipMap, segment_for_unique_id};
pub use transport::{InProcessClient, InProcessCluster, InternalClient};

/// Identity of one cluster member.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct MemberId(pub String);

impl MemberId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn random() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for MemberId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for MemberId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

pub trait Membership: Send + Sync + fmt::Debug {
    fn local_member(&self) -> &MemberId;

    /// Live members, the local member included.
    fn members(&self) -> BTreeSet<MemberId>;

    /// The master recomputes segment ownership on membership change.
    fn is_master(&self) -> bool {
        self.members().first() == Some(self.local_member())
    }
}

/// A membership list maintained by the embedding application.
#[derive(Debug)]
pub struct StaticMembership {
    local: MemberId,
    members: RwLock<BTreeSet<MemberId>>,
}

impl StaticMembership {
    pub fn new(local: MemberId) -> Self {
        let members = BTreeSet::from([local.clone()]);
        Self {
            local,
            members: RwLock::new(members),
        }
    }

    pub fn with_members(local: MemberId, others: impl IntoIterator<Item = MemberId>) -> Self {
        let membership = Self::new(local);
        membership.members.write().extend(others);
        membership
    }

    /// Returns false when the member was already present.
    pub fn join(&self, member: MemberId) -> bool {
        self.members.write().insert(member)
    }

    pub fn leave(&self, member: &MemberId) -> bool {
        if member == &self.local {
            return false;
        }
        self.members.write().remove(member)
    }
}

impl Membership for StaticMembership {
    fn local_member(&self) -> &MemberId {
        &self.local
    }

    fn members(&self) -> BTreeSet<MemberId> {
        self.members.read().clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_master_is_lowest_member() {
        let b = StaticMembership::with_members("node-b".into(), ["node-c".into()]);
        assert!(b.is_master());

        assert!(b.join("node-a".into()));
        assert!(!b.join("node-a".into()));
        assert!(!b.is_master());

        assert!(b.leave(&"node-a".into()));
        assert!(b.is_master());
        assert!(!b.leave(&"node-b".into()));
        assert_eq!(b.members().len(), 2);
    }

    #[test]
    fn test_random_ids_are_unique() {
        assert_ne!(MemberId::random(), MemberId::random());
        assert_eq!(MemberId::new("x").to_string(), "x");
    }
}
