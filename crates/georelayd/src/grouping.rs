//! Proximity grouping of driver-candidates into pooling groups.
//!
//! A group represents one physical vehicle: driver-candidates reporting
//! positions within a metre or so of the group's anchor are assumed to be
//! sitting in the same car. Groups are created lazily and deleted the
//! moment their last member leaves.
//!
//! The grouper is plain state owned by the registry actor; it never sees
//! connections, only client ids and positions.

use georelay_core::{ClientId, GroupId, Position};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::config::{AnchorPolicy, RelayConfig};

/// Grouping thresholds, extracted from [`RelayConfig`].
#[derive(Debug, Clone, Copy)]
pub struct GrouperSettings {
    pub proximity_threshold_m: f64,
    pub group_capacity: usize,
    pub max_groups: usize,
    pub anchor_policy: AnchorPolicy,
}

impl From<&RelayConfig> for GrouperSettings {
    fn from(config: &RelayConfig) -> Self {
        Self {
            proximity_threshold_m: config.proximity_threshold_m,
            group_capacity: config.group_capacity,
            max_groups: config.max_groups,
            anchor_policy: config.anchor_policy,
        }
    }
}

/// Result of asking the grouper to place a client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupOutcome {
    /// Added to an existing group.
    Joined(GroupId),
    /// Became the first member and anchor of a new group.
    Created(GroupId),
    /// No group had room nearby and no new group may be created.
    Rejected(GroupRejection),
}

/// Why a client could not be grouped.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GroupRejection {
    CapacityExceeded { max_groups: usize },
}

/// Result of removing a client from its group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Release {
    /// Removed; the group lives on with `remaining` members.
    Left { group_id: GroupId, remaining: usize },
    /// Removed the last member; the group no longer exists.
    Dissolved { group_id: GroupId },
    /// The client was not a member of that group.
    NotMember,
}

/// A group member and its last known position.
#[derive(Debug, Clone, PartialEq)]
struct Member {
    client_id: ClientId,
    position: Position,
}

#[derive(Debug, Clone)]
struct Group {
    id: GroupId,
    /// Position of the founding member when the group was created.
    founding_anchor: Position,
    /// Insertion order; the first entry is the current leader.
    members: Vec<Member>,
}

impl Group {
    fn anchor(&self, policy: AnchorPolicy) -> Position {
        match policy {
            AnchorPolicy::Fixed => self.founding_anchor,
            AnchorPolicy::Leader => self
                .members
                .first()
                .map(|m| m.position)
                .unwrap_or(self.founding_anchor),
        }
    }

    fn view(&self, policy: AnchorPolicy) -> GroupView {
        GroupView {
            id: self.id.clone(),
            anchor: self.anchor(policy),
            members: self.members.iter().map(|m| m.client_id.clone()).collect(),
        }
    }
}

/// Read-only snapshot of a group.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GroupView {
    pub id: GroupId,
    pub anchor: Position,
    /// Members in insertion order.
    pub members: Vec<ClientId>,
}

/// Clusters driver-candidates into bounded-size groups by proximity.
#[derive(Debug)]
pub struct ProximityGrouper {
    settings: GrouperSettings,
    /// Live groups in creation order.
    groups: Vec<Group>,
    /// Sequence number for the next group id.
    next_sequence: u64,
}

impl ProximityGrouper {
    pub fn new(settings: GrouperSettings) -> Self {
        Self {
            settings,
            groups: Vec::new(),
            next_sequence: 1,
        }
    }

    /// Places a client into a group.
    ///
    /// Groups are scanned in creation order; the first one with room whose
    /// anchor is within the proximity threshold wins. There is no attempt
    /// to pick the closest of several candidates.
    pub fn assign(&mut self, client_id: &ClientId, position: Position) -> GroupOutcome {
        let threshold = self.settings.proximity_threshold_m;
        let capacity = self.settings.group_capacity;
        let policy = self.settings.anchor_policy;

        let candidate = self.groups.iter_mut().find(|group| {
            group.members.len() < capacity && group.anchor(policy).distance_to(&position) <= threshold
        });

        if let Some(group) = candidate {
            group.members.push(Member {
                client_id: client_id.clone(),
                position,
            });
            info!(
                client_id = %client_id,
                group_id = %group.id,
                members = group.members.len(),
                capacity,
                "Client joined group"
            );
            return GroupOutcome::Joined(group.id.clone());
        }

        if self.groups.len() >= self.settings.max_groups {
            warn!(
                client_id = %client_id,
                max_groups = self.settings.max_groups,
                "No available groups, rejecting client"
            );
            return GroupOutcome::Rejected(GroupRejection::CapacityExceeded {
                max_groups: self.settings.max_groups,
            });
        }

        let group_id = GroupId::from_sequence(self.next_sequence);
        self.next_sequence += 1;
        self.groups.push(Group {
            id: group_id.clone(),
            founding_anchor: position,
            members: vec![Member {
                client_id: client_id.clone(),
                position,
            }],
        });

        info!(
            client_id = %client_id,
            group_id = %group_id,
            anchor = %position,
            live_groups = self.groups.len(),
            "Client created group"
        );
        GroupOutcome::Created(group_id)
    }

    /// Removes a client from a group, deleting the group if it empties.
    ///
    /// Remaining members keep their order. Under the fixed-anchor policy
    /// the group's anchor stays at the founding position even when the
    /// founder is the one leaving.
    pub fn release(&mut self, client_id: &ClientId, group_id: &GroupId) -> Release {
        let Some(index) = self.groups.iter().position(|g| &g.id == group_id) else {
            return Release::NotMember;
        };
        let Some(group) = self.groups.get_mut(index) else {
            return Release::NotMember;
        };

        let before = group.members.len();
        group.members.retain(|m| &m.client_id != client_id);
        if group.members.len() == before {
            return Release::NotMember;
        }

        let remaining = group.members.len();
        if remaining == 0 {
            self.groups.remove(index);
            info!(group_id = %group_id, client_id = %client_id, "Deleted empty group");
            return Release::Dissolved {
                group_id: group_id.clone(),
            };
        }

        info!(
            group_id = %group_id,
            client_id = %client_id,
            remaining,
            "Client left group"
        );
        Release::Left {
            group_id: group_id.clone(),
            remaining,
        }
    }

    /// Records a member's new position.
    ///
    /// Only affects admission decisions under [`AnchorPolicy::Leader`];
    /// returns false if the client is not in that group.
    pub fn track(&mut self, client_id: &ClientId, group_id: &GroupId, position: Position) -> bool {
        let member = self
            .groups
            .iter_mut()
            .find(|g| &g.id == group_id)
            .and_then(|g| g.members.iter_mut().find(|m| &m.client_id == client_id));

        match member {
            Some(member) => {
                member.position = position;
                true
            }
            None => {
                debug!(client_id = %client_id, group_id = %group_id, "Tracked client not in group");
                false
            }
        }
    }

    /// Snapshot of one group.
    pub fn group(&self, group_id: &GroupId) -> Option<GroupView> {
        self.groups
            .iter()
            .find(|g| &g.id == group_id)
            .map(|g| g.view(self.settings.anchor_policy))
    }

    /// Snapshots of all live groups in creation order.
    pub fn groups(&self) -> Vec<GroupView> {
        self.groups
            .iter()
            .map(|g| g.view(self.settings.anchor_policy))
            .collect()
    }

    pub fn group_count(&self) -> usize {
        self.groups.len()
    }
}
