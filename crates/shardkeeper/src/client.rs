//! Remote control-plane client
//!
//! The engine talks to the remote system only through [`ControlPlane`]. Every
//! mutation is request/acknowledge: it starts asynchronous remote work and
//! returns as soon as the request is accepted. Convergence is always
//! confirmed by polling [`ControlPlane::describe_topology`], never assumed
//! from a successful mutation call.
//!
//! Implementations are injected into the [`Reconciler`](crate::Reconciler);
//! there is no process-wide client state. Cancellation is cooperative: the
//! orchestrator drops an in-flight call future when its cancellation token
//! fires or its deadline passes, so implementations must be cancel-safe.

use crate::topology::{MemberId, NodeGroupId, Topology};
use async_trait::async_trait;
use thiserror::Error;

/// Error reported by the remote control plane
///
/// `code` is the remote system's machine-readable error code (for example
/// `Throttling` or `ReplicationGroupNotFoundFault`). Classification into
/// transient / fatal / not-found happens in [`crate::executor::classify`].
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{code}: {message}")]
pub struct ClientError {
    /// Remote error code
    pub code: String,
    /// Human-readable message
    pub message: String,
}

impl ClientError {
    /// Create a new client error
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
        }
    }
}

/// The narrow interface the engine needs from the remote system
#[async_trait]
pub trait ControlPlane: Send + Sync {
    /// Read the current topology of a resource
    async fn describe_topology(&self, resource_id: &str) -> Result<Topology, ClientError>;

    /// Add `count` node groups; `preferred_azs` has one entry per new group
    /// (primary first) or is empty
    async fn create_node_groups(
        &self,
        resource_id: &str,
        count: usize,
        preferred_azs: &[Vec<String>],
    ) -> Result<(), ClientError>;

    /// Remove whole node groups
    async fn delete_node_groups(
        &self,
        resource_id: &str,
        node_group_ids: &[NodeGroupId],
    ) -> Result<(), ClientError>;

    /// Add `count` replicas to one node group
    async fn add_replicas(
        &self,
        resource_id: &str,
        node_group_id: &str,
        count: usize,
        preferred_azs: &[String],
    ) -> Result<(), ClientError>;

    /// Remove specific replicas from one node group
    async fn remove_replicas(
        &self,
        resource_id: &str,
        node_group_id: &str,
        member_ids: &[MemberId],
    ) -> Result<(), ClientError>;

    /// Promote a member to primary of its node group
    async fn set_primary_member(&self, resource_id: &str, member_id: &str)
        -> Result<(), ClientError>;

    /// Toggle automatic failover for the resource
    async fn set_automatic_failover(
        &self,
        resource_id: &str,
        enabled: bool,
    ) -> Result<(), ClientError>;
}
