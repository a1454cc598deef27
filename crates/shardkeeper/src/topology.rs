//! Topology model
//!
//! Value types describing the observed shape of a replicated cache resource:
//! node groups (shards), their members, and which member of each group is the
//! primary. A topology is read fresh from the remote system at the start of
//! every reconciliation and never cached across calls.
//!
//! Identifier scheme used by the remote system (and reproduced by the
//! in-memory model below):
//!
//! - node groups: `0001`, `0002`, ... (1-indexed, zero-padded)
//! - flat members: `<resource>-001`, `<resource>-002`, ...
//! - clustered members: `<resource>-<group>-001`, ...

use crate::error::{ReconcileError, Result};
use crate::shape::{DesiredShape, Layout};
use crate::status::Status;
use chrono::{DateTime, Utc};
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::sync::LazyLock;
use thiserror::Error;

/// Member identifier assigned by the remote system
pub type MemberId = String;

/// Node group identifier assigned by the remote system
pub type NodeGroupId = String;

/// Node group ID used by non-clustered resources
pub const FLAT_NODE_GROUP_ID: &str = "0001";

/// Regex for the character set and shape of a resource identifier
static RESOURCE_ID_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"^[A-Za-z][0-9A-Za-z-]*$").expect("static regex"));

/// Maximum resource identifier length
const MAX_RESOURCE_ID_LEN: usize = 40;

/// Validate a resource identifier before it is sent to the remote system
///
/// 1-40 characters, alphanumerics and hyphens, starts with a letter, no
/// consecutive hyphens, no trailing hyphen.
pub fn validate_resource_id(id: &str) -> Result<()> {
    let reason = if id.is_empty() || id.len() > MAX_RESOURCE_ID_LEN {
        Some("must be between 1 and 40 characters")
    } else if !RESOURCE_ID_REGEX.is_match(id) {
        Some("must begin with a letter and contain only alphanumeric characters and hyphens")
    } else if id.contains("--") {
        Some("cannot contain two consecutive hyphens")
    } else if id.ends_with('-') {
        Some("cannot end with a hyphen")
    } else {
        None
    };

    match reason {
        Some(reason) => Err(ReconcileError::InvalidConfig(format!(
            "resource id '{}' {}",
            id, reason
        ))),
        None => Ok(()),
    }
}

/// Whether a resource is partitioned into multiple node groups
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum ClusterMode {
    /// Single node group, replicas only
    #[default]
    Disabled,
    /// One or more node groups (shards)
    Enabled,
}

impl ClusterMode {
    /// Human-readable topology class
    pub fn label(&self) -> &'static str {
        match self {
            ClusterMode::Disabled => "flat",
            ClusterMode::Enabled => "clustered",
        }
    }
}

/// A single cache node
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Member {
    /// Member identifier
    pub id: MemberId,
    /// Owning node group
    pub node_group_id: NodeGroupId,
    /// Whether this member is the primary of its node group
    #[serde(default)]
    pub is_primary: bool,
    /// Availability zone, if known
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub availability_zone: Option<String>,
    /// Creation time; absent while the member is still being created
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<DateTime<Utc>>,
    /// Member lifecycle status
    #[serde(default)]
    pub status: Status,
}

impl Member {
    /// Create an available member
    pub fn new(id: impl Into<String>, node_group_id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            node_group_id: node_group_id.into(),
            is_primary: false,
            availability_zone: None,
            created_at: None,
            status: Status::Available,
        }
    }

    /// Mark as primary
    pub fn primary(mut self) -> Self {
        self.is_primary = true;
        self
    }

    /// Set availability zone
    pub fn with_availability_zone(mut self, az: impl Into<String>) -> Self {
        self.availability_zone = Some(az.into());
        self
    }

    /// Set creation time
    pub fn with_created_at(mut self, created_at: DateTime<Utc>) -> Self {
        self.created_at = Some(created_at);
        self
    }

    /// Set status
    pub fn with_status(mut self, status: Status) -> Self {
        self.status = status;
        self
    }
}

/// A shard: one primary plus zero or more replicas
///
/// A node group either exists fully or not at all.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeGroup {
    /// Node group identifier
    pub id: NodeGroupId,
    /// All members, primary included
    pub members: Vec<Member>,
}

impl NodeGroup {
    /// Create an empty node group
    pub fn new(id: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            members: Vec::new(),
        }
    }

    /// Add a member (builder style)
    pub fn with_member(mut self, member: Member) -> Self {
        self.members.push(member);
        self
    }

    /// Number of replicas (members excluding the primary)
    pub fn replica_count(&self) -> usize {
        self.members.len().saturating_sub(1)
    }

    /// The primary member, if exactly one is marked
    pub fn primary(&self) -> Option<&Member> {
        let mut primaries = self.members.iter().filter(|m| m.is_primary);
        match (primaries.next(), primaries.next()) {
            (Some(p), None) => Some(p),
            _ => None,
        }
    }

    /// Find a member by ID
    pub fn member(&self, id: &str) -> Option<&Member> {
        self.members.iter().find(|m| m.id == id)
    }

    /// Numeric ordinal of the ID (`0003` -> 3), if it has one
    pub fn ordinal(&self) -> Option<u32> {
        self.id.parse().ok()
    }

    /// Sort key placing numbered groups first in numeric order
    pub(crate) fn sort_key(&self) -> (bool, Option<u32>, &str) {
        let ordinal = self.ordinal();
        (ordinal.is_none(), ordinal, self.id.as_str())
    }
}

/// Observed topology of one resource
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    /// Resource identifier
    pub resource_id: String,
    /// Resource-level status
    #[serde(default)]
    pub status: Status,
    /// Clustered or flat
    #[serde(default)]
    pub cluster_mode: ClusterMode,
    /// Whether the remote system promotes a replica automatically on failure
    #[serde(default)]
    pub automatic_failover: bool,
    /// Node groups
    pub node_groups: Vec<NodeGroup>,
}

impl Topology {
    /// Create an empty topology
    pub fn new(resource_id: impl Into<String>, cluster_mode: ClusterMode) -> Self {
        Self {
            resource_id: resource_id.into(),
            status: Status::Available,
            cluster_mode,
            automatic_failover: false,
            node_groups: Vec::new(),
        }
    }

    /// Flat topology with `members` members, the first being primary
    pub fn flat(resource_id: impl Into<String>, members: usize) -> Self {
        let mut topology = Self::new(resource_id, ClusterMode::Disabled);
        let ids = topology.next_member_ids(FLAT_NODE_GROUP_ID, members);
        let group = ids.into_iter().enumerate().fold(
            NodeGroup::new(FLAT_NODE_GROUP_ID),
            |group, (i, id)| {
                let member = Member::new(id, FLAT_NODE_GROUP_ID);
                group.with_member(if i == 0 { member.primary() } else { member })
            },
        );
        topology.node_groups.push(group);
        topology
    }

    /// Clustered topology with `node_groups` groups of `replicas` replicas each
    pub fn clustered(resource_id: impl Into<String>, node_groups: usize, replicas: usize) -> Self {
        let mut topology = Self::new(resource_id, ClusterMode::Enabled);
        topology.add_node_groups(node_groups, &[], Status::Available, None);
        let replica_ids: Vec<Vec<MemberId>> = topology
            .node_groups
            .iter()
            .map(|g| topology.next_member_ids(&g.id, replicas))
            .collect();
        for (group, ids) in topology.node_groups.iter_mut().zip(replica_ids) {
            let group_id = group.id.clone();
            group
                .members
                .extend(ids.into_iter().map(|id| Member::new(id, group_id.as_str())));
        }
        topology
    }

    /// Set automatic failover (builder style)
    pub fn with_automatic_failover(mut self, enabled: bool) -> Self {
        self.automatic_failover = enabled;
        self
    }

    /// Check if the resource is clustered
    pub fn is_clustered(&self) -> bool {
        matches!(self.cluster_mode, ClusterMode::Enabled)
    }

    /// Total number of members across all node groups
    pub fn member_count(&self) -> usize {
        self.node_groups.iter().map(|g| g.members.len()).sum()
    }

    /// Iterate all members
    pub fn members(&self) -> impl Iterator<Item = &Member> {
        self.node_groups.iter().flat_map(|g| g.members.iter())
    }

    /// Find a node group by ID
    pub fn node_group(&self, id: &str) -> Option<&NodeGroup> {
        self.node_groups.iter().find(|g| g.id == id)
    }

    /// Find a member and its node group
    pub fn find_member(&self, id: &str) -> Option<(&NodeGroup, &Member)> {
        self.node_groups
            .iter()
            .find_map(|g| g.member(id).map(|m| (g, m)))
    }

    /// Node groups ordered by ID (numbered groups first, numerically)
    pub fn sorted_node_groups(&self) -> Vec<&NodeGroup> {
        let mut groups: Vec<_> = self.node_groups.iter().collect();
        groups.sort_by(|a, b| a.sort_key().cmp(&b.sort_key()));
        groups
    }

    /// Check the structural invariants
    ///
    /// - at least one node group, and exactly one when flat
    /// - automatic failover on a flat resource needs a replica
    /// - every node group has exactly one primary
    /// - members point back at their node group
    /// - node group and member IDs are unique
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: String| Err(ReconcileError::InvalidTopology(msg));

        if self.node_groups.is_empty() {
            return invalid(format!("'{}' has no node groups", self.resource_id));
        }
        if !self.is_clustered() && self.node_groups.len() != 1 {
            return invalid(format!(
                "flat resource '{}' has {} node groups",
                self.resource_id,
                self.node_groups.len()
            ));
        }
        if !self.is_clustered() && self.automatic_failover && self.member_count() < 2 {
            return invalid(format!(
                "'{}' has automatic failover enabled with fewer than 2 members",
                self.resource_id
            ));
        }

        let mut group_ids = HashSet::new();
        let mut member_ids = HashSet::new();
        for group in &self.node_groups {
            if !group_ids.insert(group.id.as_str()) {
                return invalid(format!("duplicate node group '{}'", group.id));
            }
            let primaries = group.members.iter().filter(|m| m.is_primary).count();
            if primaries != 1 {
                return invalid(format!(
                    "node group '{}' has {} primaries, expected exactly one",
                    group.id, primaries
                ));
            }
            for member in &group.members {
                if member.node_group_id != group.id {
                    return invalid(format!(
                        "member '{}' is listed in node group '{}' but claims '{}'",
                        member.id, group.id, member.node_group_id
                    ));
                }
                if !member_ids.insert(member.id.as_str()) {
                    return invalid(format!("duplicate member '{}'", member.id));
                }
            }
        }
        Ok(())
    }

    /// The shape this topology currently has
    ///
    /// `None` for clustered topologies whose node groups carry different
    /// replica counts, which no single desired shape describes.
    pub fn shape(&self) -> Option<DesiredShape> {
        if self.is_clustered() {
            let replicas = self.node_groups.first().map(NodeGroup::replica_count)?;
            if self.node_groups.iter().any(|g| g.replica_count() != replicas) {
                return None;
            }
            Some(DesiredShape::clustered(self.node_groups.len(), replicas))
        } else {
            Some(DesiredShape::flat(self.member_count()))
        }
    }

    /// Check whether the topology matches a layout and (optional) primary exactly
    pub fn satisfies(&self, layout: &Layout, primary: Option<&str>) -> bool {
        let shape_matches = match *layout {
            Layout::Flat { total_members } => {
                !self.is_clustered()
                    && self.node_groups.len() == 1
                    && self.member_count() == total_members
            }
            Layout::Clustered {
                num_node_groups,
                replicas_per_node_group,
            } => {
                self.is_clustered()
                    && self.node_groups.len() == num_node_groups
                    && self
                        .node_groups
                        .iter()
                        .all(|g| g.replica_count() == replicas_per_node_group)
            }
        };
        let primary_matches = match primary {
            Some(id) => self.find_member(id).is_some_and(|(_, m)| m.is_primary),
            None => true,
        };
        shape_matches && primary_matches
    }

    /// One-line description of the shape, for diagnostics
    pub fn summary(&self) -> String {
        if self.is_clustered() {
            let replicas: Vec<String> = self
                .sorted_node_groups()
                .iter()
                .map(|g| g.replica_count().to_string())
                .collect();
            format!(
                "clustered({} node groups, replicas [{}])",
                self.node_groups.len(),
                replicas.join(", ")
            )
        } else {
            format!("flat({} members)", self.member_count())
        }
    }

    /// Aggregate status used to decide whether the resource is stable
    ///
    /// The resource status if it is not available, otherwise the first
    /// member status that is not available, otherwise available.
    pub fn stability_status(&self) -> Status {
        if !self.status.is_available() {
            return self.status.clone();
        }
        self.members()
            .map(|m| &m.status)
            .find(|s| !s.is_available())
            .cloned()
            .unwrap_or(Status::Available)
    }

    // ---- Identifier allocation ----

    /// IDs the remote system assigns to the next `count` node groups
    pub fn next_node_group_ids(&self, count: usize) -> Vec<NodeGroupId> {
        let highest = self
            .node_groups
            .iter()
            .filter_map(NodeGroup::ordinal)
            .max()
            .unwrap_or(0)
            .max(self.node_groups.len() as u32);
        (1..=count as u32)
            .map(|i| format_node_group_id(highest + i))
            .collect()
    }

    /// IDs for the next `count` members of a node group
    pub fn next_member_ids(&self, node_group_id: &str, count: usize) -> Vec<MemberId> {
        let prefix = if self.is_clustered() {
            format!("{}-{}", self.resource_id, node_group_id)
        } else {
            self.resource_id.clone()
        };
        let highest = self
            .node_group(node_group_id)
            .into_iter()
            .flat_map(|g| g.members.iter())
            .filter_map(|m| member_ordinal(&m.id))
            .max()
            .unwrap_or(0);
        (1..=count as u32)
            .map(|i| format!("{}-{:03}", prefix, highest + i))
            .collect()
    }

    // ---- In-memory mutation model ----
    //
    // Shared by `Plan::project` and `MemoryControlPlane` so both agree on
    // what each step does to a topology.

    /// Append `count` node groups, each with a primary only
    pub(crate) fn add_node_groups(
        &mut self,
        count: usize,
        preferred_azs: &[Vec<String>],
        status: Status,
        created_at: Option<DateTime<Utc>>,
    ) -> Vec<NodeGroupId> {
        let ids = self.next_node_group_ids(count);
        for (i, id) in ids.iter().enumerate() {
            let member_id = format!("{}-{}-{:03}", self.resource_id, id, 1);
            let mut primary = Member::new(member_id, id.clone())
                .primary()
                .with_status(status.clone());
            primary.created_at = created_at;
            primary.availability_zone = preferred_azs.get(i).and_then(|azs| azs.first()).cloned();
            self.node_groups
                .push(NodeGroup::new(id.clone()).with_member(primary));
        }
        ids
    }

    /// Remove whole node groups; all must exist
    pub(crate) fn remove_node_groups(
        &mut self,
        ids: &[NodeGroupId],
    ) -> std::result::Result<(), ModelError> {
        if let Some(missing) = ids.iter().find(|id| self.node_group(id).is_none()) {
            return Err(ModelError::NodeGroupNotFound(missing.clone()));
        }
        if ids.len() >= self.node_groups.len() {
            return Err(ModelError::Rejected(
                "cannot remove every node group".to_string(),
            ));
        }
        self.node_groups.retain(|g| !ids.contains(&g.id));
        Ok(())
    }

    /// Append `count` replicas to a node group
    pub(crate) fn add_replicas(
        &mut self,
        node_group_id: &str,
        count: usize,
        preferred_azs: &[String],
        status: Status,
        created_at: Option<DateTime<Utc>>,
    ) -> std::result::Result<Vec<MemberId>, ModelError> {
        let ids = self.next_member_ids(node_group_id, count);
        let group = self
            .node_groups
            .iter_mut()
            .find(|g| g.id == node_group_id)
            .ok_or_else(|| ModelError::NodeGroupNotFound(node_group_id.to_string()))?;
        for (i, id) in ids.iter().enumerate() {
            let mut member = Member::new(id.clone(), node_group_id).with_status(status.clone());
            member.created_at = created_at;
            member.availability_zone = preferred_azs.get(i).cloned();
            group.members.push(member);
        }
        Ok(ids)
    }

    /// Remove specific replicas from a node group; all must exist, none may be primary
    pub(crate) fn remove_replicas(
        &mut self,
        node_group_id: &str,
        member_ids: &[MemberId],
    ) -> std::result::Result<(), ModelError> {
        let group = self
            .node_groups
            .iter_mut()
            .find(|g| g.id == node_group_id)
            .ok_or_else(|| ModelError::NodeGroupNotFound(node_group_id.to_string()))?;
        for id in member_ids {
            match group.member(id) {
                None => return Err(ModelError::MemberNotFound(id.clone())),
                Some(m) if m.is_primary => {
                    return Err(ModelError::Rejected(format!(
                        "cannot remove primary member '{}'",
                        id
                    )))
                }
                Some(_) => {}
            }
        }
        group.members.retain(|m| !member_ids.contains(&m.id));
        Ok(())
    }

    /// Promote a member to primary of its node group
    pub(crate) fn set_primary(&mut self, member_id: &str) -> std::result::Result<(), ModelError> {
        let group = self
            .node_groups
            .iter_mut()
            .find(|g| g.member(member_id).is_some())
            .ok_or_else(|| ModelError::MemberNotFound(member_id.to_string()))?;
        for member in &mut group.members {
            member.is_primary = member.id == member_id;
        }
        Ok(())
    }
}

/// Why a change could not be applied to the in-memory model
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub(crate) enum ModelError {
    #[error("node group not found: {0}")]
    NodeGroupNotFound(String),

    #[error("member not found: {0}")]
    MemberNotFound(String),

    #[error("{0}")]
    Rejected(String),
}

/// Format a node group ordinal as the remote system does
pub fn format_node_group_id(ordinal: u32) -> NodeGroupId {
    format!("{:04}", ordinal)
}

/// Trailing numeric suffix of a member ID (`rg-0002-003` -> 3)
fn member_ordinal(id: &str) -> Option<u32> {
    id.rsplit('-').next().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resource_id_validation() {
        assert!(validate_resource_id("redis-cache-1").is_ok());
        assert!(validate_resource_id("").is_err());
        assert!(validate_resource_id("1cache").is_err());
        assert!(validate_resource_id("cache--one").is_err());
        assert!(validate_resource_id("cache-").is_err());
        assert!(validate_resource_id("cache_one").is_err());
        assert!(validate_resource_id(&"a".repeat(41)).is_err());
    }

    #[test]
    fn test_flat_constructor() {
        let t = Topology::flat("rg", 3);
        assert!(t.validate().is_ok());
        assert_eq!(t.member_count(), 3);
        assert_eq!(t.node_groups[0].id, FLAT_NODE_GROUP_ID);
        assert_eq!(t.node_groups[0].replica_count(), 2);
        assert_eq!(t.node_groups[0].primary().unwrap().id, "rg-001");
        assert_eq!(t.node_groups[0].members[2].id, "rg-003");
    }

    #[test]
    fn test_clustered_constructor() {
        let t = Topology::clustered("rg", 3, 2);
        assert!(t.validate().is_ok());
        assert_eq!(t.member_count(), 9);
        let ids: Vec<_> = t.node_groups.iter().map(|g| g.id.as_str()).collect();
        assert_eq!(ids, vec!["0001", "0002", "0003"]);
        assert_eq!(t.node_groups[1].members[0].id, "rg-0002-001");
        assert!(t.node_groups[1].members[0].is_primary);
        assert_eq!(t.node_groups[1].members[2].id, "rg-0002-003");
        assert_eq!(t.node_groups[1].members[2].node_group_id, "0002");
        assert!(!t.node_groups[1].members[2].is_primary);
    }

    #[test]
    fn test_validate_rejects_missing_primary() {
        let mut t = Topology::flat("rg", 2);
        t.node_groups[0].members[0].is_primary = false;
        let err = t.validate().unwrap_err();
        assert!(matches!(err, ReconcileError::InvalidTopology(_)));
    }

    #[test]
    fn test_validate_rejects_flat_with_two_groups() {
        let mut t = Topology::flat("rg", 2);
        t.node_groups
            .push(NodeGroup::new("0002").with_member(Member::new("rg-x", "0002").primary()));
        assert!(t.validate().is_err());
    }

    #[test]
    fn test_shape_roundtrip() {
        assert_eq!(Topology::flat("rg", 4).shape(), Some(DesiredShape::flat(4)));
        assert_eq!(
            Topology::clustered("rg", 2, 1).shape(),
            Some(DesiredShape::clustered(2, 1))
        );

        let mut uneven = Topology::clustered("rg", 2, 1);
        uneven.node_groups[0].members.pop();
        assert_eq!(uneven.shape(), None);
    }

    #[test]
    fn test_satisfies_checks_primary() {
        let t = Topology::flat("rg", 3);
        let layout = Layout::Flat { total_members: 3 };
        assert!(t.satisfies(&layout, None));
        assert!(t.satisfies(&layout, Some("rg-001")));
        assert!(!t.satisfies(&layout, Some("rg-002")));
        assert!(!t.satisfies(&Layout::Flat { total_members: 2 }, None));
    }

    #[test]
    fn test_stability_status_aggregates_members() {
        let mut t = Topology::flat("rg", 2);
        assert_eq!(t.stability_status(), Status::Available);
        t.node_groups[0].members[1].status = Status::Creating;
        assert_eq!(t.stability_status(), Status::Creating);
        t.status = Status::Modifying;
        assert_eq!(t.stability_status(), Status::Modifying);
    }

    #[test]
    fn test_next_ids_follow_highest_ordinal() {
        let mut t = Topology::clustered("rg", 3, 0);
        t.node_groups.remove(1);
        assert_eq!(t.next_node_group_ids(2), vec!["0004", "0005"]);
        assert_eq!(t.next_member_ids("0003", 1), vec!["rg-0003-002"]);
        assert_eq!(
            Topology::flat("rg", 2).next_member_ids(FLAT_NODE_GROUP_ID, 1),
            vec!["rg-003"]
        );
    }

    #[test]
    fn test_model_rejects_primary_removal() {
        let mut t = Topology::flat("rg", 2);
        let err = t
            .remove_replicas(FLAT_NODE_GROUP_ID, &["rg-001".to_string()])
            .unwrap_err();
        assert!(matches!(err, ModelError::Rejected(_)));
        assert_eq!(t.member_count(), 2);
    }

    #[test]
    fn test_model_set_primary() {
        let mut t = Topology::flat("rg", 3);
        t.set_primary("rg-003").unwrap();
        assert_eq!(t.node_groups[0].primary().unwrap().id, "rg-003");
        assert!(t.set_primary("rg-999").is_err());
    }

    #[test]
    fn test_sorted_node_groups_numeric() {
        let mut t = Topology::clustered("rg", 2, 0);
        t.node_groups.reverse();
        t.node_groups
            .push(NodeGroup::new("0010").with_member(Member::new("rg-0010-001", "0010").primary()));
        let ids: Vec<_> = t.sorted_node_groups().iter().map(|g| g.id.clone()).collect();
        assert_eq!(ids, vec!["0001", "0002", "0010"]);
    }
}
