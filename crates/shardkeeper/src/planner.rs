//! Diff planner
//!
//! Pure function from `(observed, desired)` to an ordered [`Plan`]. No I/O.
//!
//! # Ordering
//!
//! ```text
//! AddNodeGroups -> AddReplicas* -> RemoveReplicas* -> RemoveNodeGroups
//!               -> [SetFailoverEnabled(false) -> SetPrimary -> SetFailoverEnabled(orig)]
//! ```
//!
//! Capacity is added before it is removed so it never dips below either the
//! observed or the desired size. Primary relocation always comes last.
//!
//! # Victim selection
//!
//! - Node groups: the highest-numbered IDs go first.
//! - Replicas: newest first (by creation time; members still being created
//!   count as newest, ties broken by ID). The current primary and the desired
//!   primary are never candidates.

use crate::error::{ReconcileError, Result};
use crate::plan::{Plan, Step};
use crate::shape::{DesiredShape, Layout};
use crate::topology::{Member, MemberId, NodeGroup, NodeGroupId, Topology};
use chrono::{DateTime, Utc};

/// Compute the ordered steps that take `observed` to `desired`
pub fn plan(observed: &Topology, desired: &DesiredShape) -> Result<Plan> {
    let layout = desired.layout()?;
    observed.validate()?;

    if layout.is_clustered() != observed.is_clustered() {
        return Err(ReconcileError::TopologyClassChange {
            observed: observed.cluster_mode.label(),
            desired: layout.label(),
        });
    }

    let protected = desired.primary_member.as_deref();
    let mut resize = match layout {
        Layout::Flat { total_members } => plan_flat(observed, desired, total_members, protected)?,
        Layout::Clustered {
            num_node_groups,
            replicas_per_node_group,
        } => plan_clustered(
            observed,
            desired,
            num_node_groups,
            replicas_per_node_group,
            protected,
        )?,
    };

    resize.steps.extend(plan_primary(observed, desired, &resize.removed_groups)?);
    Ok(Plan::new(resize.steps))
}

/// Resize steps plus the node groups they remove
struct Resize {
    steps: Vec<Step>,
    removed_groups: Vec<NodeGroupId>,
}

fn plan_flat(
    observed: &Topology,
    desired: &DesiredShape,
    total_members: usize,
    protected: Option<&str>,
) -> Result<Resize> {
    if total_members < 2 && observed.automatic_failover {
        return Err(ReconcileError::InvalidShape(
            "automatic failover requires at least 2 members".to_string(),
        ));
    }

    // validate() guarantees exactly one node group
    let Some(group) = observed.node_groups.first() else {
        return Err(ReconcileError::InvalidTopology(
            "flat resource has no node group".to_string(),
        ));
    };
    let current = group.members.len();

    let mut steps = Vec::new();
    if total_members > current {
        steps.push(Step::AddReplicas {
            node_group_id: group.id.clone(),
            count: total_members - current,
            preferred_azs: az_slice(&desired.preferred_azs, current, total_members),
        });
    } else if total_members < current {
        steps.push(Step::RemoveReplicas {
            node_group_id: group.id.clone(),
            member_ids: select_victims(group, current - total_members, protected)?,
        });
    }

    Ok(Resize {
        steps,
        removed_groups: Vec::new(),
    })
}

fn plan_clustered(
    observed: &Topology,
    desired: &DesiredShape,
    num_node_groups: usize,
    replicas: usize,
    protected: Option<&str>,
) -> Result<Resize> {
    let groups = observed.sorted_node_groups();
    let current = groups.len();
    let (kept, removed) = groups.split_at(num_node_groups.min(current));
    let group_azs = |index: usize| node_group_azs(desired, index);

    let mut adds = Vec::new();
    let mut removes = Vec::new();

    let new_groups = if num_node_groups > current {
        let ids = observed.next_node_group_ids(num_node_groups - current);
        let mut preferred_azs: Vec<Vec<String>> = (current..num_node_groups)
            .map(|index| az_slice(group_azs(index), 0, 1))
            .collect();
        if preferred_azs.iter().all(Vec::is_empty) {
            preferred_azs.clear();
        }
        adds.push(Step::AddNodeGroups {
            count: ids.len(),
            preferred_azs,
        });
        ids
    } else {
        Vec::new()
    };

    for (index, group) in kept.iter().enumerate() {
        let have = group.replica_count();
        if replicas > have {
            adds.push(Step::AddReplicas {
                node_group_id: group.id.clone(),
                count: replicas - have,
                preferred_azs: az_slice(group_azs(index), 1 + have, 1 + replicas),
            });
        } else if replicas < have {
            removes.push(Step::RemoveReplicas {
                node_group_id: group.id.clone(),
                member_ids: select_victims(group, have - replicas, protected)?,
            });
        }
    }

    // New groups start with a primary only
    if replicas > 0 {
        for (offset, id) in new_groups.iter().enumerate() {
            adds.push(Step::AddReplicas {
                node_group_id: id.clone(),
                count: replicas,
                preferred_azs: az_slice(group_azs(current + offset), 1, 1 + replicas),
            });
        }
    }

    let mut removed_groups: Vec<NodeGroupId> = removed.iter().map(|g| g.id.clone()).collect();
    removed_groups.reverse();
    if !removed_groups.is_empty() {
        removes.push(Step::RemoveNodeGroups {
            node_group_ids: removed_groups.clone(),
        });
    }

    adds.extend(removes);
    Ok(Resize {
        steps: adds,
        removed_groups,
    })
}

fn plan_primary(
    observed: &Topology,
    desired: &DesiredShape,
    removed_groups: &[NodeGroupId],
) -> Result<Vec<Step>> {
    let Some(target) = desired.primary_member.as_deref() else {
        return Ok(Vec::new());
    };

    let (group, member) = observed.find_member(target).ok_or_else(|| {
        ReconcileError::InvalidShape(format!(
            "desired primary '{}' is not a member of '{}'",
            target, observed.resource_id
        ))
    })?;
    if removed_groups.contains(&group.id) {
        return Err(ReconcileError::InvalidShape(format!(
            "desired primary '{}' belongs to node group '{}', which is being removed",
            target, group.id
        )));
    }
    if member.is_primary {
        return Ok(Vec::new());
    }

    Ok(vec![
        Step::SetFailoverEnabled { enabled: false },
        Step::SetPrimary {
            member_id: target.to_string(),
        },
        Step::SetFailoverEnabled {
            enabled: observed.automatic_failover,
        },
    ])
}

/// Pick `count` replicas to remove, newest first
fn select_victims(group: &NodeGroup, count: usize, protected: Option<&str>) -> Result<Vec<MemberId>> {
    let mut candidates: Vec<&Member> = group
        .members
        .iter()
        .filter(|m| !m.is_primary && Some(m.id.as_str()) != protected)
        .collect();

    if candidates.len() < count {
        return Err(ReconcileError::InvalidShape(format!(
            "node group '{}' must lose {} members but only {} are removable",
            group.id,
            count,
            candidates.len()
        )));
    }

    candidates.sort_by(|a, b| removal_key(b).cmp(&removal_key(a)));
    Ok(candidates
        .into_iter()
        .take(count)
        .map(|m| m.id.clone())
        .collect())
}

/// Ascending age order; members still being created sort as newest
fn removal_key(member: &Member) -> (bool, Option<DateTime<Utc>>, &str) {
    (member.created_at.is_none(), member.created_at, member.id.as_str())
}

/// Zones requested for the node group at `index` (sorted position)
fn node_group_azs(desired: &DesiredShape, index: usize) -> &[String] {
    desired
        .node_group_azs
        .get(index)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}

/// Zones for member positions `from..to`, or empty if none were given
fn az_slice(azs: &[String], from: usize, to: usize) -> Vec<String> {
    azs.iter()
        .skip(from)
        .take(to.saturating_sub(from))
        .cloned()
        .collect()
}
