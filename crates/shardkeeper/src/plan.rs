//! Reconciliation plans
//!
//! A [`Plan`] is an ordered, immutable list of [`Step`]s. Each step maps to
//! exactly one remote mutation call. Plans are produced by
//! [`planner::plan`](crate::planner::plan) and consumed by the orchestrator;
//! if remote state diverges mid-execution the plan is abandoned, never edited.

use crate::error::{ReconcileError, Result};
use crate::status::Status;
use crate::topology::{MemberId, NodeGroupId, Topology};
use serde::{Deserialize, Serialize};
use std::fmt;

/// One remote mutation
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Step {
    /// Add node groups; `preferred_azs` has one entry per new group or is empty
    AddNodeGroups {
        count: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        preferred_azs: Vec<Vec<String>>,
    },
    /// Remove whole node groups
    RemoveNodeGroups { node_group_ids: Vec<NodeGroupId> },
    /// Add replicas to one node group
    AddReplicas {
        node_group_id: NodeGroupId,
        count: usize,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        preferred_azs: Vec<String>,
    },
    /// Remove named replicas from one node group
    RemoveReplicas {
        node_group_id: NodeGroupId,
        member_ids: Vec<MemberId>,
    },
    /// Promote a member to primary
    SetPrimary { member_id: MemberId },
    /// Toggle automatic failover
    SetFailoverEnabled { enabled: bool },
}

impl Step {
    /// Check if this step adds capacity
    pub fn is_add(&self) -> bool {
        matches!(self, Step::AddNodeGroups { .. } | Step::AddReplicas { .. })
    }

    /// Check if this step removes capacity
    pub fn is_remove(&self) -> bool {
        matches!(
            self,
            Step::RemoveNodeGroups { .. } | Step::RemoveReplicas { .. }
        )
    }

    /// Stable step label (logs, metrics, error context)
    pub fn kind(&self) -> &'static str {
        match self {
            Step::AddNodeGroups { .. } => "add_node_groups",
            Step::RemoveNodeGroups { .. } => "remove_node_groups",
            Step::AddReplicas { .. } => "add_replicas",
            Step::RemoveReplicas { .. } => "remove_replicas",
            Step::SetPrimary { .. } => "set_primary",
            Step::SetFailoverEnabled { .. } => "set_failover_enabled",
        }
    }

    /// Apply this step to a topology in memory
    fn apply(&self, topology: &mut Topology) -> std::result::Result<(), String> {
        match self {
            Step::AddNodeGroups {
                count,
                preferred_azs,
            } => {
                topology.add_node_groups(*count, preferred_azs, Status::Available, None);
                Ok(())
            }
            Step::RemoveNodeGroups { node_group_ids } => topology
                .remove_node_groups(node_group_ids)
                .map_err(|e| e.to_string()),
            Step::AddReplicas {
                node_group_id,
                count,
                preferred_azs,
            } => topology
                .add_replicas(node_group_id, *count, preferred_azs, Status::Available, None)
                .map(|_| ())
                .map_err(|e| e.to_string()),
            Step::RemoveReplicas {
                node_group_id,
                member_ids,
            } => topology
                .remove_replicas(node_group_id, member_ids)
                .map_err(|e| e.to_string()),
            Step::SetPrimary { member_id } => {
                topology.set_primary(member_id).map_err(|e| e.to_string())
            }
            Step::SetFailoverEnabled { enabled } => {
                topology.automatic_failover = *enabled;
                Ok(())
            }
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Step::AddNodeGroups { count, .. } => write!(f, "AddNodeGroups({})", count),
            Step::RemoveNodeGroups { node_group_ids } => {
                write!(f, "RemoveNodeGroups([{}])", node_group_ids.join(", "))
            }
            Step::AddReplicas {
                node_group_id,
                count,
                ..
            } => write!(f, "AddReplicas({}, {})", node_group_id, count),
            Step::RemoveReplicas {
                node_group_id,
                member_ids,
            } => write!(
                f,
                "RemoveReplicas({}, [{}])",
                node_group_id,
                member_ids.join(", ")
            ),
            Step::SetPrimary { member_id } => write!(f, "SetPrimary({})", member_id),
            Step::SetFailoverEnabled { enabled } => write!(f, "SetFailoverEnabled({})", enabled),
        }
    }
}

/// Ordered, immutable sequence of steps
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Plan {
    steps: Vec<Step>,
}

impl Plan {
    pub(crate) fn new(steps: Vec<Step>) -> Self {
        Self { steps }
    }

    /// Steps in execution order
    pub fn steps(&self) -> &[Step] {
        &self.steps
    }

    /// Number of steps
    pub fn len(&self) -> usize {
        self.steps.len()
    }

    /// Check if the plan is a no-op
    pub fn is_empty(&self) -> bool {
        self.steps.is_empty()
    }

    /// Iterate steps in execution order
    pub fn iter(&self) -> std::slice::Iter<'_, Step> {
        self.steps.iter()
    }

    /// Apply every step to a copy of `observed`, without touching the remote system
    ///
    /// New members come out `available`. Fails if a step names a node group or
    /// member the topology does not have at that point.
    pub fn project(&self, observed: &Topology) -> Result<Topology> {
        let mut topology = observed.clone();
        for (index, step) in self.steps.iter().enumerate() {
            step.apply(&mut topology).map_err(|reason| {
                ReconcileError::InvalidTopology(format!(
                    "step {} ({}) does not apply: {}",
                    index + 1,
                    step,
                    reason
                ))
            })?;
        }
        Ok(topology)
    }
}

impl<'a> IntoIterator for &'a Plan {
    type Item = &'a Step;
    type IntoIter = std::slice::Iter<'a, Step>;

    fn into_iter(self) -> Self::IntoIter {
        self.steps.iter()
    }
}

impl fmt::Display for Plan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.steps.is_empty() {
            return f.write_str("[]");
        }
        let steps: Vec<String> = self.steps.iter().map(Step::to_string).collect();
        write!(f, "[{}]", steps.join(", "))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::FLAT_NODE_GROUP_ID;

    #[test]
    fn test_step_classification() {
        let add = Step::AddReplicas {
            node_group_id: "0001".into(),
            count: 2,
            preferred_azs: vec![],
        };
        assert!(add.is_add());
        assert!(!add.is_remove());
        assert_eq!(add.kind(), "add_replicas");
        assert_eq!(add.to_string(), "AddReplicas(0001, 2)");

        let failover = Step::SetFailoverEnabled { enabled: false };
        assert!(!failover.is_add() && !failover.is_remove());
    }

    #[test]
    fn test_step_serde_is_tagged() {
        let step = Step::RemoveNodeGroups {
            node_group_ids: vec!["0003".into()],
        };
        let json = serde_json::to_value(&step).unwrap();
        assert_eq!(json["op"], "remove_node_groups");
        assert_eq!(json["node_group_ids"][0], "0003");
    }

    #[test]
    fn test_project_flat_scale_up() {
        let observed = Topology::flat("rg", 2);
        let plan = Plan::new(vec![Step::AddReplicas {
            node_group_id: FLAT_NODE_GROUP_ID.into(),
            count: 2,
            preferred_azs: vec!["us-east-1c".into()],
        }]);
        let projected = plan.project(&observed).unwrap();
        assert_eq!(projected.member_count(), 4);
        let added = projected.find_member("rg-003").unwrap().1;
        assert_eq!(added.availability_zone.as_deref(), Some("us-east-1c"));
        assert!(projected.find_member("rg-004").unwrap().1.availability_zone.is_none());
        // input untouched
        assert_eq!(observed.member_count(), 2);
    }

    #[test]
    fn test_project_rejects_unknown_target() {
        let observed = Topology::clustered("rg", 2, 1);
        let plan = Plan::new(vec![Step::RemoveNodeGroups {
            node_group_ids: vec!["0009".into()],
        }]);
        let err = plan.project(&observed).unwrap_err();
        assert!(err.to_string().contains("0009"));
    }

    #[test]
    fn test_plan_display() {
        assert_eq!(Plan::default().to_string(), "[]");
        let plan = Plan::new(vec![
            Step::SetFailoverEnabled { enabled: false },
            Step::SetPrimary {
                member_id: "rg-002".into(),
            },
        ]);
        assert_eq!(
            plan.to_string(),
            "[SetFailoverEnabled(false), SetPrimary(rg-002)]"
        );
    }
}
