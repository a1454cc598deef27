//! Desired shape
//!
//! [`DesiredShape`] is the caller-supplied target. It is loosely typed so it
//! can be deserialized straight from declarative input; [`DesiredShape::layout`]
//! validates it into a [`Layout`], which is what the planner works from.

use crate::error::{ReconcileError, Result};
use crate::topology::MemberId;
use serde::{Deserialize, Serialize};
use std::fmt;
use validator::Validate;

/// Declarative target topology
///
/// Exactly one of `total_members` (flat) or `num_node_groups` (clustered)
/// must be set. Zero counts as unset.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize, Validate)]
#[serde(default)]
pub struct DesiredShape {
    /// Flat: total members including the primary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_members: Option<usize>,

    /// Clustered: number of node groups
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(range(max = 500, message = "at most 500 node groups are supported"))]
    pub num_node_groups: Option<usize>,

    /// Clustered: replicas in every node group
    #[serde(skip_serializing_if = "Option::is_none")]
    #[validate(range(max = 5, message = "replicas_per_node_group must be between 0 and 5"))]
    pub replicas_per_node_group: Option<usize>,

    /// Member that should end up as primary
    #[serde(skip_serializing_if = "Option::is_none")]
    pub primary_member: Option<MemberId>,

    /// Flat: availability zone per member position (primary first)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub preferred_azs: Vec<String>,

    /// Clustered: availability zones per node group (primary first)
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub node_group_azs: Vec<Vec<String>>,
}

impl DesiredShape {
    /// Flat shape with `total_members` members
    pub fn flat(total_members: usize) -> Self {
        Self {
            total_members: Some(total_members),
            ..Default::default()
        }
    }

    /// Clustered shape
    pub fn clustered(num_node_groups: usize, replicas_per_node_group: usize) -> Self {
        Self {
            num_node_groups: Some(num_node_groups),
            replicas_per_node_group: Some(replicas_per_node_group),
            ..Default::default()
        }
    }

    /// Request a specific primary
    pub fn with_primary(mut self, member_id: impl Into<String>) -> Self {
        self.primary_member = Some(member_id.into());
        self
    }

    /// Set per-member availability zones (flat)
    pub fn with_preferred_azs(mut self, azs: Vec<String>) -> Self {
        self.preferred_azs = azs;
        self
    }

    /// Set per-node-group availability zones (clustered)
    pub fn with_node_group_azs(mut self, azs: Vec<Vec<String>>) -> Self {
        self.node_group_azs = azs;
        self
    }

    /// Validate and resolve into a [`Layout`]
    pub fn layout(&self) -> Result<Layout> {
        self.validate()
            .map_err(|e| ReconcileError::InvalidShape(e.to_string()))?;

        let total = self.total_members.filter(|n| *n > 0);
        let groups = self.num_node_groups.filter(|n| *n > 0);
        let replicas = self.replicas_per_node_group.unwrap_or(0);

        let layout = match (total, groups) {
            (Some(_), Some(_)) => {
                return Err(ReconcileError::InvalidShape(
                    "total_members and num_node_groups are mutually exclusive".to_string(),
                ))
            }
            (None, None) if replicas > 0 => {
                return Err(ReconcileError::InvalidShape(
                    "replicas_per_node_group requires num_node_groups".to_string(),
                ))
            }
            (None, None) => {
                return Err(ReconcileError::InvalidShape(
                    "one of total_members or num_node_groups must be set".to_string(),
                ))
            }
            (Some(_), None) if replicas > 0 => {
                return Err(ReconcileError::InvalidShape(
                    "replicas_per_node_group is only valid for clustered shapes".to_string(),
                ))
            }
            (Some(total_members), None) => Layout::Flat { total_members },
            (None, Some(num_node_groups)) => Layout::Clustered {
                num_node_groups,
                replicas_per_node_group: replicas,
            },
        };

        self.check_azs(&layout)?;
        Ok(layout)
    }

    fn check_azs(&self, layout: &Layout) -> Result<()> {
        match *layout {
            Layout::Flat { total_members } => {
                if !self.node_group_azs.is_empty() {
                    return Err(ReconcileError::InvalidShape(
                        "node_group_azs is only valid for clustered shapes".to_string(),
                    ));
                }
                if !self.preferred_azs.is_empty() && self.preferred_azs.len() != total_members {
                    return Err(ReconcileError::InvalidShape(format!(
                        "preferred_azs must list one zone per member (expected {}, got {})",
                        total_members,
                        self.preferred_azs.len()
                    )));
                }
            }
            Layout::Clustered {
                num_node_groups,
                replicas_per_node_group,
            } => {
                if !self.preferred_azs.is_empty() {
                    return Err(ReconcileError::InvalidShape(
                        "preferred_azs is only valid for flat shapes".to_string(),
                    ));
                }
                if !self.node_group_azs.is_empty() && self.node_group_azs.len() != num_node_groups {
                    return Err(ReconcileError::InvalidShape(format!(
                        "node_group_azs must list one entry per node group (expected {}, got {})",
                        num_node_groups,
                        self.node_group_azs.len()
                    )));
                }
                if let Some(azs) = self
                    .node_group_azs
                    .iter()
                    .find(|azs| azs.len() > replicas_per_node_group + 1)
                {
                    return Err(ReconcileError::InvalidShape(format!(
                        "node group zone list {:?} is longer than its {} members",
                        azs,
                        replicas_per_node_group + 1
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Validated target layout
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Layout {
    /// One node group with this many members
    Flat { total_members: usize },
    /// Uniform node groups
    Clustered {
        num_node_groups: usize,
        replicas_per_node_group: usize,
    },
}

impl Layout {
    /// Check if this is a clustered layout
    pub fn is_clustered(&self) -> bool {
        matches!(self, Layout::Clustered { .. })
    }

    /// Topology class label
    pub fn label(&self) -> &'static str {
        if self.is_clustered() {
            "clustered"
        } else {
            "flat"
        }
    }

    /// Total members this layout describes
    pub fn member_count(&self) -> usize {
        match *self {
            Layout::Flat { total_members } => total_members,
            Layout::Clustered {
                num_node_groups,
                replicas_per_node_group,
            } => num_node_groups * (replicas_per_node_group + 1),
        }
    }
}

impl fmt::Display for Layout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Layout::Flat { total_members } => write!(f, "flat({} members)", total_members),
            Layout::Clustered {
                num_node_groups,
                replicas_per_node_group,
            } => write!(
                f,
                "clustered({} node groups x {} replicas)",
                num_node_groups, replicas_per_node_group
            ),
        }
    }
}
