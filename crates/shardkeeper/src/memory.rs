//! In-memory control plane
//!
//! [`MemoryControlPlane`] simulates the remote system closely enough to drive
//! the orchestrator end to end: mutations are acknowledged immediately and
//! then take a configurable number of `describe_topology` polls to settle,
//! the resource refuses structural changes while it is not available, and
//! unknown targets produce the same not-found codes the real service uses.
//!
//! It also records every call and supports fault injection and out-of-band
//! changes, which is what the simulator binary and the test-suite use it for.
//!
//! ```rust,ignore
//! let plane = MemoryControlPlane::new().with_settle_polls(2);
//! plane.insert(Topology::flat("cache", 2));
//! plane.fail_next("add_replicas", ClientError::new("Throttling", "slow down"));
//! ```

use crate::client::{ClientError, ControlPlane};
use crate::status::Status;
use crate::topology::{MemberId, ModelError, NodeGroupId, Topology};
use async_trait::async_trait;
use chrono::DateTime;
use parking_lot::Mutex;
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

/// Creation times handed out by the simulator start here (2024-01-01T00:00:00Z)
const CLOCK_BASE_SECS: i64 = 1_704_067_200;

/// Replicas a single node group may carry
const MAX_REPLICAS_PER_NODE_GROUP: usize = 5;

/// Operation label for `describe_topology` faults
pub const DESCRIBE: &str = "describe_topology";

/// A recorded call
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
    Describe {
        resource_id: String,
    },
    CreateNodeGroups {
        resource_id: String,
        count: usize,
    },
    DeleteNodeGroups {
        resource_id: String,
        node_group_ids: Vec<NodeGroupId>,
    },
    AddReplicas {
        resource_id: String,
        node_group_id: NodeGroupId,
        count: usize,
    },
    RemoveReplicas {
        resource_id: String,
        node_group_id: NodeGroupId,
        member_ids: Vec<MemberId>,
    },
    SetPrimaryMember {
        resource_id: String,
        member_id: MemberId,
    },
    SetAutomaticFailover {
        resource_id: String,
        enabled: bool,
    },
}

impl Call {
    /// Check if this call asked for a change
    pub fn is_mutation(&self) -> bool {
        !matches!(self, Call::Describe { .. })
    }
}

#[derive(Debug)]
struct Resource {
    topology: Topology,
    /// Polls left until the in-flight change settles
    settling: u32,
    /// Changes never settle
    stalled: bool,
    /// Being deleted; disappears once settled
    deleting: bool,
}

#[derive(Debug, Default)]
struct State {
    resources: HashMap<String, Resource>,
    faults: HashMap<String, VecDeque<ClientError>>,
    calls: Vec<Call>,
    settle_polls: u32,
    clock: i64,
}

impl State {
    fn take_fault(&mut self, operation: &str) -> Result<(), ClientError> {
        match self.faults.get_mut(operation).and_then(VecDeque::pop_front) {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    /// Common preamble of every mutation: record, inject, look up, check state
    fn begin(
        &mut self,
        call: Call,
        operation: &str,
        resource_id: &str,
    ) -> Result<&mut Resource, ClientError> {
        self.calls.push(call);
        self.take_fault(operation)?;
        let resource = self
            .resources
            .get_mut(resource_id)
            .ok_or_else(|| not_found_resource(resource_id))?;
        let status = resource.topology.stability_status();
        if resource.deleting || !status.is_available() {
            return Err(ClientError::new(
                "InvalidReplicationGroupState",
                format!("replication group {} is not available ({})", resource_id, status),
            ));
        }
        Ok(resource)
    }

    /// Mark a resource as modifying after an accepted mutation
    fn accepted(&mut self, resource_id: &str) {
        let settle_polls = self.settle_polls;
        let Some(resource) = self.resources.get_mut(resource_id) else {
            return;
        };
        resource.topology.status = Status::Modifying;
        // A stalled change must still have a poll left to settle on once released
        resource.settling = if resource.stalled {
            settle_polls.max(1)
        } else {
            settle_polls
        };
        if resource.settling == 0 {
            self.clock += 1;
            settle(&mut resource.topology, self.clock);
        }
    }
}

/// Finish an in-flight change: everything available, creation times assigned
fn settle(topology: &mut Topology, clock: i64) {
    topology.status = Status::Available;
    for group in &mut topology.node_groups {
        for member in &mut group.members {
            member.status = Status::Available;
            if member.created_at.is_none() {
                member.created_at = DateTime::from_timestamp(CLOCK_BASE_SECS + clock, 0);
            }
        }
    }
}

fn not_found_resource(resource_id: &str) -> ClientError {
    ClientError::new(
        "ReplicationGroupNotFoundFault",
        format!("replication group {} not found", resource_id),
    )
}

fn invalid(message: impl Into<String>) -> ClientError {
    ClientError::new("InvalidParameterValue", message)
}

fn model_error(err: ModelError) -> ClientError {
    match err {
        ModelError::NodeGroupNotFound(id) => ClientError::new(
            "NodeGroupNotFoundFault",
            format!("node group {} not found", id),
        ),
        ModelError::MemberNotFound(id) => ClientError::new(
            "CacheClusterNotFound",
            format!("cache cluster {} not found", id),
        ),
        ModelError::Rejected(reason) => invalid(reason),
    }
}

/// Simulated remote control plane
#[derive(Debug, Clone)]
pub struct MemoryControlPlane {
    state: Arc<Mutex<State>>,
}

impl Default for MemoryControlPlane {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryControlPlane {
    /// Create an empty control plane; changes settle after one poll
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(State {
                settle_polls: 1,
                ..Default::default()
            })),
        }
    }

    /// Number of `describe_topology` polls a change stays in flight
    pub fn with_settle_polls(self, polls: u32) -> Self {
        self.state.lock().settle_polls = polls;
        self
    }

    /// Add or replace a resource
    pub fn insert(&self, topology: Topology) {
        let resource = Resource {
            topology,
            settling: 0,
            stalled: false,
            deleting: false,
        };
        let id = resource.topology.resource_id.clone();
        self.state.lock().resources.insert(id, resource);
    }

    /// Current topology of a resource, without counting as a poll
    pub fn topology(&self, resource_id: &str) -> Option<Topology> {
        self.state
            .lock()
            .resources
            .get(resource_id)
            .map(|r| r.topology.clone())
    }

    /// Fail the next call of `operation` (a step kind or [`DESCRIBE`]) with `err`
    pub fn fail_next(&self, operation: &str, err: ClientError) {
        self.state
            .lock()
            .faults
            .entry(operation.to_string())
            .or_default()
            .push_back(err);
    }

    /// Keep future changes to a resource in flight forever
    pub fn stall(&self, resource_id: &str, stalled: bool) {
        if let Some(resource) = self.state.lock().resources.get_mut(resource_id) {
            resource.stalled = stalled;
        }
    }

    /// Delete a replica behind the engine's back
    ///
    /// Returns `false` if the member does not exist or is a primary.
    pub fn remove_member(&self, resource_id: &str, member_id: &str) -> bool {
        let mut state = self.state.lock();
        let Some(resource) = state.resources.get_mut(resource_id) else {
            return false;
        };
        let Some(group_id) = resource
            .topology
            .find_member(member_id)
            .filter(|(_, m)| !m.is_primary)
            .map(|(g, _)| g.id.clone())
        else {
            return false;
        };
        resource
            .topology
            .remove_replicas(&group_id, &[member_id.to_string()])
            .is_ok()
    }

    /// Start deleting a resource; it vanishes once the change settles
    pub fn begin_delete(&self, resource_id: &str) -> bool {
        let mut state = self.state.lock();
        let settle_polls = state.settle_polls;
        match state.resources.get_mut(resource_id) {
            Some(resource) => {
                resource.deleting = true;
                resource.settling = settle_polls;
                resource.topology.status = Status::Deleting;
                true
            }
            None => false,
        }
    }

    /// Every call made so far, in order
    pub fn calls(&self) -> Vec<Call> {
        self.state.lock().calls.clone()
    }

    /// Number of mutation calls made so far
    pub fn mutation_count(&self) -> usize {
        self.state
            .lock()
            .calls
            .iter()
            .filter(|c| c.is_mutation())
            .count()
    }
}

#[async_trait]
impl ControlPlane for MemoryControlPlane {
    async fn describe_topology(&self, resource_id: &str) -> Result<Topology, ClientError> {
        let mut state = self.state.lock();
        state.calls.push(Call::Describe {
            resource_id: resource_id.to_string(),
        });
        state.take_fault(DESCRIBE)?;

        state.clock += 1;
        let clock = state.clock;
        let resource = state
            .resources
            .get_mut(resource_id)
            .ok_or_else(|| not_found_resource(resource_id))?;

        if resource.stalled || resource.settling == 0 {
            if resource.deleting && !resource.stalled {
                state.resources.remove(resource_id);
                return Err(not_found_resource(resource_id));
            }
            return Ok(resource.topology.clone());
        }

        let snapshot = resource.topology.clone();
        resource.settling -= 1;
        if resource.settling == 0 && !resource.deleting {
            settle(&mut resource.topology, clock);
        }
        Ok(snapshot)
    }

    async fn create_node_groups(
        &self,
        resource_id: &str,
        count: usize,
        preferred_azs: &[Vec<String>],
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        let call = Call::CreateNodeGroups {
            resource_id: resource_id.to_string(),
            count,
        };
        let resource = state.begin(call, "add_node_groups", resource_id)?;
        let topology = &mut resource.topology;
        if !topology.is_clustered() {
            return Err(invalid("node groups can only be added to clustered resources"));
        }
        if count == 0 {
            return Err(invalid("count must be positive"));
        }
        if !preferred_azs.is_empty() && preferred_azs.len() != count {
            return Err(invalid("one availability zone list is required per node group"));
        }
        topology.add_node_groups(count, preferred_azs, Status::Creating, None);
        state.accepted(resource_id);
        Ok(())
    }

    async fn delete_node_groups(
        &self,
        resource_id: &str,
        node_group_ids: &[NodeGroupId],
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        let call = Call::DeleteNodeGroups {
            resource_id: resource_id.to_string(),
            node_group_ids: node_group_ids.to_vec(),
        };
        let resource = state.begin(call, "remove_node_groups", resource_id)?;
        if !resource.topology.is_clustered() {
            return Err(invalid("node groups can only be removed from clustered resources"));
        }
        resource
            .topology
            .remove_node_groups(node_group_ids)
            .map_err(model_error)?;
        state.accepted(resource_id);
        Ok(())
    }

    async fn add_replicas(
        &self,
        resource_id: &str,
        node_group_id: &str,
        count: usize,
        preferred_azs: &[String],
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        let call = Call::AddReplicas {
            resource_id: resource_id.to_string(),
            node_group_id: node_group_id.to_string(),
            count,
        };
        let resource = state.begin(call, "add_replicas", resource_id)?;
        let topology = &mut resource.topology;
        let replicas = topology
            .node_group(node_group_id)
            .map(|g| g.replica_count())
            .ok_or_else(|| model_error(ModelError::NodeGroupNotFound(node_group_id.to_string())))?;
        if count == 0 {
            return Err(invalid("count must be positive"));
        }
        if replicas + count > MAX_REPLICAS_PER_NODE_GROUP {
            return Err(invalid(format!(
                "node group {} cannot have more than {} replicas",
                node_group_id, MAX_REPLICAS_PER_NODE_GROUP
            )));
        }
        topology
            .add_replicas(node_group_id, count, preferred_azs, Status::Creating, None)
            .map_err(model_error)?;
        state.accepted(resource_id);
        Ok(())
    }

    async fn remove_replicas(
        &self,
        resource_id: &str,
        node_group_id: &str,
        member_ids: &[MemberId],
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        let call = Call::RemoveReplicas {
            resource_id: resource_id.to_string(),
            node_group_id: node_group_id.to_string(),
            member_ids: member_ids.to_vec(),
        };
        let resource = state.begin(call, "remove_replicas", resource_id)?;
        let topology = &mut resource.topology;
        if !topology.is_clustered()
            && topology.automatic_failover
            && topology.member_count().saturating_sub(member_ids.len()) < 2
        {
            return Err(ClientError::new(
                "InvalidParameterCombination",
                "automatic failover requires at least one replica",
            ));
        }
        topology
            .remove_replicas(node_group_id, member_ids)
            .map_err(model_error)?;
        state.accepted(resource_id);
        Ok(())
    }

    async fn set_primary_member(
        &self,
        resource_id: &str,
        member_id: &str,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        let call = Call::SetPrimaryMember {
            resource_id: resource_id.to_string(),
            member_id: member_id.to_string(),
        };
        let resource = state.begin(call, "set_primary", resource_id)?;
        if resource.topology.automatic_failover {
            return Err(ClientError::new(
                "InvalidParameterCombination",
                "cannot set a primary while automatic failover is enabled",
            ));
        }
        resource
            .topology
            .set_primary(member_id)
            .map_err(model_error)?;
        state.accepted(resource_id);
        Ok(())
    }

    async fn set_automatic_failover(
        &self,
        resource_id: &str,
        enabled: bool,
    ) -> Result<(), ClientError> {
        let mut state = self.state.lock();
        let call = Call::SetAutomaticFailover {
            resource_id: resource_id.to_string(),
            enabled,
        };
        let resource = state.begin(call, "set_failover_enabled", resource_id)?;
        let topology = &mut resource.topology;
        if enabled && !topology.is_clustered() && topology.member_count() < 2 {
            return Err(ClientError::new(
                "InvalidParameterCombination",
                "automatic failover requires at least one replica",
            ));
        }
        topology.automatic_failover = enabled;
        state.accepted(resource_id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::FLAT_NODE_GROUP_ID;

    #[tokio::test]
    async fn test_change_settles_after_polls() {
        let plane = MemoryControlPlane::new().with_settle_polls(2);
        plane.insert(Topology::flat("rg", 2));

        plane
            .add_replicas("rg", FLAT_NODE_GROUP_ID, 1, &[])
            .await
            .unwrap();

        let first = plane.describe_topology("rg").await.unwrap();
        assert_eq!(first.stability_status(), Status::Modifying);
        assert_eq!(first.member_count(), 3);
        assert!(first.find_member("rg-003").unwrap().1.created_at.is_none());

        let second = plane.describe_topology("rg").await.unwrap();
        assert_eq!(second.stability_status(), Status::Modifying);

        let settled = plane.describe_topology("rg").await.unwrap();
        assert_eq!(settled.stability_status(), Status::Available);
        assert!(settled.members().all(|m| m.created_at.is_some()));
    }

    #[tokio::test]
    async fn test_rejects_changes_while_busy() {
        let plane = MemoryControlPlane::new();
        plane.insert(Topology::flat("rg", 2));
        plane
            .add_replicas("rg", FLAT_NODE_GROUP_ID, 1, &[])
            .await
            .unwrap();

        let err = plane
            .add_replicas("rg", FLAT_NODE_GROUP_ID, 1, &[])
            .await
            .unwrap_err();
        assert_eq!(err.code, "InvalidReplicationGroupState");
    }

    #[tokio::test]
    async fn test_primary_guard() {
        let plane = MemoryControlPlane::new().with_settle_polls(0);
        plane.insert(Topology::flat("rg", 2).with_automatic_failover(true));

        let err = plane.set_primary_member("rg", "rg-002").await.unwrap_err();
        assert_eq!(err.code, "InvalidParameterCombination");

        plane.set_automatic_failover("rg", false).await.unwrap();
        plane.set_primary_member("rg", "rg-002").await.unwrap();
        let topology = plane.topology("rg").unwrap();
        assert!(topology.find_member("rg-002").unwrap().1.is_primary);
    }

    #[tokio::test]
    async fn test_not_found_codes() {
        let plane = MemoryControlPlane::new().with_settle_polls(0);
        plane.insert(Topology::clustered("rg", 2, 1));

        let err = plane.describe_topology("other").await.unwrap_err();
        assert_eq!(err.code, "ReplicationGroupNotFoundFault");

        let err = plane
            .delete_node_groups("rg", &["0009".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code, "NodeGroupNotFoundFault");

        let err = plane
            .remove_replicas("rg", "0001", &["rg-0001-009".to_string()])
            .await
            .unwrap_err();
        assert_eq!(err.code, "CacheClusterNotFound");
    }

    #[tokio::test]
    async fn test_out_of_band_removal_and_deletion() {
        let plane = MemoryControlPlane::new().with_settle_polls(1);
        plane.insert(Topology::flat("rg", 3));

        assert!(!plane.remove_member("rg", "rg-001"));
        assert!(plane.remove_member("rg", "rg-003"));
        assert_eq!(plane.topology("rg").unwrap().member_count(), 2);

        assert!(plane.begin_delete("rg"));
        let deleting = plane.describe_topology("rg").await.unwrap();
        assert_eq!(deleting.status, Status::Deleting);
        let err = plane.describe_topology("rg").await.unwrap_err();
        assert_eq!(err.code, "ReplicationGroupNotFoundFault");
    }

    #[tokio::test]
    async fn test_fault_injection_and_call_log() {
        let plane = MemoryControlPlane::new();
        plane.insert(Topology::flat("rg", 2));
        plane.fail_next(DESCRIBE, ClientError::new("Throttling", "slow down"));

        assert!(plane.describe_topology("rg").await.is_err());
        assert!(plane.describe_topology("rg").await.is_ok());
        assert_eq!(plane.calls().len(), 2);
        assert_eq!(plane.mutation_count(), 0);
    }

    #[tokio::test]
    async fn test_stalled_changes_never_settle() {
        let plane = MemoryControlPlane::new();
        plane.insert(Topology::flat("rg", 2));
        plane.stall("rg", true);
        plane
            .add_replicas("rg", FLAT_NODE_GROUP_ID, 1, &[])
            .await
            .unwrap();
        for _ in 0..5 {
            let topology = plane.describe_topology("rg").await.unwrap();
            assert_eq!(topology.stability_status(), Status::Modifying);
        }
    }

    #[tokio::test]
    async fn test_released_stall_settles_without_settle_polls() {
        let plane = MemoryControlPlane::new().with_settle_polls(0);
        plane.insert(Topology::flat("rg", 2));
        plane.stall("rg", true);
        plane
            .add_replicas("rg", FLAT_NODE_GROUP_ID, 1, &[])
            .await
            .unwrap();
        let stalled = plane.describe_topology("rg").await.unwrap();
        assert_eq!(stalled.stability_status(), Status::Modifying);

        plane.stall("rg", false);
        plane.describe_topology("rg").await.unwrap();
        let settled = plane.describe_topology("rg").await.unwrap();
        assert_eq!(settled.stability_status(), Status::Available);
        assert_eq!(settled.member_count(), 3);
    }
}
