//! Step executor
//!
//! Issues exactly one remote mutation per [`Step`] and classifies failures.
//! A not-found reply to a removal means the target is already absent; to any
//! other step it means remote state diverged and is fatal. The executor never retries; bounded retries of a single transient failure
//! happen in the orchestrator (see [`crate::retry`]).

use crate::client::{ClientError, ControlPlane};
use crate::error::{ReconcileError, Result};
use crate::plan::Step;
use tracing::debug;

/// How a remote error should be treated
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorClass {
    /// Safe to retry the same call later
    Transient,
    /// Retrying will not help; replan required
    Fatal,
    /// The target does not exist
    NotFound,
}

/// Remote error codes that indicate a temporary condition
const TRANSIENT_CODES: &[&str] = &[
    "Throttling",
    "ThrottlingException",
    "RequestLimitExceeded",
    "ServiceUnavailable",
    "InternalFailure",
    "InvalidReplicationGroupState",
    "DependencyViolation",
];

/// Remote error codes that mean the target is gone
const NOT_FOUND_CODES: &[&str] = &[
    "ReplicationGroupNotFoundFault",
    "CacheClusterNotFound",
    "CacheClusterNotFoundFault",
    "NodeGroupNotFoundFault",
];

/// Classify a remote error
///
/// This is the only place that matches on remote error-code strings.
pub fn classify(err: &ClientError) -> ErrorClass {
    let code = err.code.as_str();
    if TRANSIENT_CODES.contains(&code) {
        ErrorClass::Transient
    } else if NOT_FOUND_CODES.contains(&code) || code.ends_with("NotFound") {
        ErrorClass::NotFound
    } else {
        ErrorClass::Fatal
    }
}

/// What a step did
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StepOutcome {
    /// The remote system accepted the mutation
    Applied,
    /// A removal target was already gone
    AlreadyAbsent,
}

/// Issue the remote call for one step
pub async fn execute<C>(client: &C, resource_id: &str, step: &Step) -> Result<StepOutcome>
where
    C: ControlPlane + ?Sized,
{
    debug!(resource_id = %resource_id, step = %step, "Issuing step");

    let result = match step {
        Step::AddNodeGroups {
            count,
            preferred_azs,
        } => {
            client
                .create_node_groups(resource_id, *count, preferred_azs)
                .await
        }
        Step::RemoveNodeGroups { node_group_ids } => {
            client.delete_node_groups(resource_id, node_group_ids).await
        }
        Step::AddReplicas {
            node_group_id,
            count,
            preferred_azs,
        } => {
            client
                .add_replicas(resource_id, node_group_id, *count, preferred_azs)
                .await
        }
        Step::RemoveReplicas {
            node_group_id,
            member_ids,
        } => {
            client
                .remove_replicas(resource_id, node_group_id, member_ids)
                .await
        }
        Step::SetPrimary { member_id } => client.set_primary_member(resource_id, member_id).await,
        Step::SetFailoverEnabled { enabled } => {
            client.set_automatic_failover(resource_id, *enabled).await
        }
    };

    match result {
        Ok(()) => Ok(StepOutcome::Applied),
        Err(source) => match classify(&source) {
            ErrorClass::NotFound if step.is_remove() => {
                debug!(resource_id = %resource_id, step = %step, error = %source, "Removal target already absent");
                Ok(StepOutcome::AlreadyAbsent)
            }
            // A missing target mid-plan means remote state diverged
            ErrorClass::NotFound | ErrorClass::Fatal => Err(ReconcileError::FatalClient {
                operation: step.kind(),
                source,
            }),
            ErrorClass::Transient => Err(ReconcileError::TransientClient {
                operation: step.kind(),
                source,
            }),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::{Call, MemoryControlPlane};
    use crate::topology::{Topology, FLAT_NODE_GROUP_ID};

    #[test]
    fn test_classify() {
        assert_eq!(
            classify(&ClientError::new("Throttling", "slow down")),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ClientError::new("DependencyViolation", "in use")),
            ErrorClass::Transient
        );
        assert_eq!(
            classify(&ClientError::new("NodeGroupNotFoundFault", "gone")),
            ErrorClass::NotFound
        );
        assert_eq!(
            classify(&ClientError::new("CacheNodeNotFound", "gone")),
            ErrorClass::NotFound
        );
        assert_eq!(
            classify(&ClientError::new("InvalidParameterValue", "bad")),
            ErrorClass::Fatal
        );
    }

    #[tokio::test]
    async fn test_execute_maps_step_to_call() {
        let plane = MemoryControlPlane::new().with_settle_polls(0);
        plane.insert(Topology::flat("rg", 2));

        let step = Step::AddReplicas {
            node_group_id: FLAT_NODE_GROUP_ID.into(),
            count: 1,
            preferred_azs: vec![],
        };
        let outcome = execute(&plane, "rg", &step).await.unwrap();
        assert_eq!(outcome, StepOutcome::Applied);
        assert_eq!(
            plane.calls(),
            vec![Call::AddReplicas {
                resource_id: "rg".into(),
                node_group_id: FLAT_NODE_GROUP_ID.into(),
                count: 1,
            }]
        );
    }

    #[tokio::test]
    async fn test_remove_of_absent_target_is_success() {
        let plane = MemoryControlPlane::new().with_settle_polls(0);
        plane.insert(Topology::clustered("rg", 2, 0));

        let step = Step::RemoveNodeGroups {
            node_group_ids: vec!["0007".into()],
        };
        let outcome = execute(&plane, "rg", &step).await.unwrap();
        assert_eq!(outcome, StepOutcome::AlreadyAbsent);
    }

    #[tokio::test]
    async fn test_add_to_absent_target_is_fatal() {
        let plane = MemoryControlPlane::new().with_settle_polls(0);
        plane.insert(Topology::clustered("rg", 2, 0));

        let step = Step::AddReplicas {
            node_group_id: "0007".into(),
            count: 1,
            preferred_azs: vec![],
        };
        let err = execute(&plane, "rg", &step).await.unwrap_err();
        assert!(!err.is_not_found());
        assert!(!err.is_retriable());
        assert!(matches!(
            err,
            ReconcileError::FatalClient { operation: "add_replicas", .. }
        ));

        let err = execute(
            &plane,
            "rg",
            &Step::SetPrimary {
                member_id: "rg-0001-009".into(),
            },
        )
        .await
        .unwrap_err();
        assert_eq!(err.kind(), "fatal_client");
    }

    #[tokio::test]
    async fn test_injected_faults_are_classified() {
        let plane = MemoryControlPlane::new();
        plane.insert(Topology::flat("rg", 2));
        let step = Step::SetFailoverEnabled { enabled: true };

        plane.fail_next("set_failover_enabled", ClientError::new("Throttling", "slow down"));
        let err = execute(&plane, "rg", &step).await.unwrap_err();
        assert!(err.is_retriable());

        plane.fail_next(
            "set_failover_enabled",
            ClientError::new("InvalidParameterCombination", "nope"),
        );
        let err = execute(&plane, "rg", &step).await.unwrap_err();
        assert!(matches!(
            err,
            ReconcileError::FatalClient {
                operation: "set_failover_enabled",
                ..
            }
        ));
    }
}
