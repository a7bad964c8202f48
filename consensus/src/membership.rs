//! Cluster configuration.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::types::NodeId;

/// A node known to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub struct Member {
    /// Node identifier.
    pub id: NodeId,
    /// Address peers use to reach the node.
    pub address: String,
    /// Whether the node counts towards quorums and may become leader.
    pub voter: bool,
}

impl Member {
    /// A voting member.
    pub fn voter(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            voter: true,
        }
    }

    /// A non-voting member which only receives replication.
    pub fn learner(id: NodeId, address: impl Into<String>) -> Self {
        Self {
            id,
            address: address.into(),
            voter: false,
        }
    }
}

/// A requested change to the cluster configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "kebab-case")]
pub enum MembershipChange {
    /// Add a voting member, or promote an existing learner.
    AddVoter {
        /// Node to add.
        id: NodeId,
        /// Address of the node.
        address: String,
    },

    /// Add a non-voting member.
    AddLearner {
        /// Node to add.
        id: NodeId,
        /// Address of the node.
        address: String,
    },

    /// Remove a member entirely.
    Remove {
        /// Node to remove.
        id: NodeId,
    },
}

impl MembershipChange {
    /// The node this change concerns.
    pub fn node(&self) -> NodeId {
        match self {
            MembershipChange::AddVoter { id, .. }
            | MembershipChange::AddLearner { id, .. }
            | MembershipChange::Remove { id } => *id,
        }
    }
}

/// Reasons a membership change cannot be proposed.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MembershipError {
    /// The node is already a voter.
    #[error("node {0} is already a voter")]
    AlreadyVoter(NodeId),

    /// The node is already a learner.
    #[error("node {0} is already a member")]
    AlreadyMember(NodeId),

    /// The node is not part of the configuration.
    #[error("node {0} is not a member")]
    NotMember(NodeId),

    /// Removing the node would leave the cluster without voters.
    #[error("cannot remove the last voter {0}")]
    LastVoter(NodeId),

    /// An earlier change has not committed yet.
    #[error("membership change at index {0} is still pending")]
    ChangePending(u64),
}

/// The set of members, keyed by id.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Membership {
    members: BTreeMap<NodeId, Member>,
}

impl Membership {
    /// Build a configuration from members.
    pub fn new(members: impl IntoIterator<Item = Member>) -> Self {
        Self {
            members: members.into_iter().map(|m| (m.id, m)).collect(),
        }
    }

    /// Whether there are no members at all.
    pub fn is_empty(&self) -> bool {
        self.members.is_empty()
    }

    /// Whether `id` is part of the configuration.
    pub fn contains(&self, id: NodeId) -> bool {
        self.members.contains_key(&id)
    }

    /// Look up a member.
    pub fn member(&self, id: NodeId) -> Option<&Member> {
        self.members.get(&id)
    }

    /// All members, ordered by id.
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.members.values()
    }

    /// Whether `id` is a voting member.
    pub fn is_voter(&self, id: NodeId) -> bool {
        self.members.get(&id).is_some_and(|m| m.voter)
    }

    /// Ids of the voting members.
    pub fn voters(&self) -> impl Iterator<Item = NodeId> + '_ {
        self.members.values().filter(|m| m.voter).map(|m| m.id)
    }

    /// Number of votes needed for a majority.
    pub fn quorum(&self) -> usize {
        self.voters().count() / 2 + 1
    }

    /// Whether the voters among `ids` form a majority.
    pub fn has_quorum<'a>(&self, ids: impl IntoIterator<Item = &'a NodeId>) -> bool {
        let count = ids.into_iter().filter(|id| self.is_voter(**id)).count();
        count >= self.quorum()
    }

    /// Check that `change` makes sense against this configuration.
    pub fn validate(&self, change: &MembershipChange) -> Result<(), MembershipError> {
        match change {
            MembershipChange::AddVoter { id, .. } => {
                if self.is_voter(*id) {
                    return Err(MembershipError::AlreadyVoter(*id));
                }
            }
            MembershipChange::AddLearner { id, .. } => {
                if self.contains(*id) {
                    return Err(MembershipError::AlreadyMember(*id));
                }
            }
            MembershipChange::Remove { id } => {
                if !self.contains(*id) {
                    return Err(MembershipError::NotMember(*id));
                }
                if self.is_voter(*id) && self.voters().count() == 1 {
                    return Err(MembershipError::LastVoter(*id));
                }
            }
        }
        Ok(())
    }

    /// The configuration that results from applying `change`.
    pub fn with_change(&self, change: &MembershipChange) -> Membership {
        let mut next = self.clone();
        match change {
            MembershipChange::AddVoter { id, address } => {
                next.members.insert(*id, Member::voter(*id, address.clone()));
            }
            MembershipChange::AddLearner { id, address } => {
                next.members
                    .insert(*id, Member::learner(*id, address.clone()));
            }
            MembershipChange::Remove { id } => {
                next.members.remove(id);
            }
        }
        next
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn three() -> Membership {
        Membership::new([
            Member::voter(1, "a"),
            Member::voter(2, "b"),
            Member::voter(3, "c"),
        ])
    }

    #[test]
    fn quorum_counts_only_voters() {
        let membership = three().with_change(&MembershipChange::AddLearner {
            id: 4,
            address: "d".into(),
        });
        assert_eq!(membership.quorum(), 2);
        assert!(!membership.has_quorum(&[1, 4]));
        assert!(membership.has_quorum(&[1, 2]));
    }

    #[test]
    fn promote_learner() {
        let membership = three().with_change(&MembershipChange::AddLearner {
            id: 4,
            address: "d".into(),
        });
        let change = MembershipChange::AddVoter {
            id: 4,
            address: "d".into(),
        };
        membership.validate(&change).unwrap();
        let promoted = membership.with_change(&change);
        assert!(promoted.is_voter(4));
        assert_eq!(promoted.quorum(), 3);
    }

    #[test]
    fn rejects_removing_last_voter() {
        let membership = Membership::new([Member::voter(1, "a")]);
        assert_eq!(
            membership.validate(&MembershipChange::Remove { id: 1 }),
            Err(MembershipError::LastVoter(1))
        );
        assert_eq!(
            membership.validate(&MembershipChange::Remove { id: 7 }),
            Err(MembershipError::NotMember(7))
        );
    }
}
