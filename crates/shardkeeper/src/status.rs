//! Remote lifecycle status
//!
//! The remote control plane reports lifecycle state as free-form strings
//! ("available", "modifying", ...). They are parsed into [`Status`] at the
//! client boundary; the only other place raw strings appear is the
//! `pending`/`target` sets of the convergence waiter.

use serde::{Deserialize, Serialize};
use std::fmt;

const AVAILABLE: &str = "available";
const CREATING: &str = "creating";
const MODIFYING: &str = "modifying";
const DELETING: &str = "deleting";
const SNAPSHOTTING: &str = "snapshotting";
const REBOOTING: &str = "rebooting cluster nodes";
const CREATE_FAILED: &str = "create-failed";

/// Lifecycle status of a resource or one of its members
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum Status {
    /// Stable and accepting structural changes
    #[default]
    Available,
    /// Being provisioned
    Creating,
    /// A structural or configuration change is in flight
    Modifying,
    /// Being torn down
    Deleting,
    /// A backup is being taken
    Snapshotting,
    /// Member nodes are restarting
    Rebooting,
    /// Provisioning failed; will not recover on its own
    CreateFailed,
    /// Any status this crate does not model explicitly
    Other(String),
}

impl Status {
    /// Wire representation
    pub fn as_str(&self) -> &str {
        match self {
            Status::Available => AVAILABLE,
            Status::Creating => CREATING,
            Status::Modifying => MODIFYING,
            Status::Deleting => DELETING,
            Status::Snapshotting => SNAPSHOTTING,
            Status::Rebooting => REBOOTING,
            Status::CreateFailed => CREATE_FAILED,
            Status::Other(s) => s,
        }
    }

    /// Check if the resource is stable
    pub fn is_available(&self) -> bool {
        matches!(self, Status::Available)
    }

    /// Check if the status is a transition the remote system completes on its own
    pub fn is_transitional(&self) -> bool {
        matches!(
            self,
            Status::Creating
                | Status::Modifying
                | Status::Deleting
                | Status::Snapshotting
                | Status::Rebooting
        )
    }

    /// Statuses that mean "still converging" while waiting for a resource to
    /// become available after a structural change
    pub fn stabilizing() -> Vec<String> {
        [
            Status::Creating,
            Status::Modifying,
            Status::Snapshotting,
            Status::Deleting,
            Status::Rebooting,
        ]
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
    }

    /// Statuses that mean "still going away" while waiting for deletion
    pub fn vanishing() -> Vec<String> {
        [
            Status::Creating,
            Status::Available,
            Status::Modifying,
            Status::Deleting,
        ]
        .iter()
        .map(|s| s.as_str().to_string())
        .collect()
    }

    /// Single-element target set for "available"
    pub fn available_target() -> Vec<String> {
        vec![AVAILABLE.to_string()]
    }
}

impl From<&str> for Status {
    fn from(s: &str) -> Self {
        match s {
            AVAILABLE => Status::Available,
            CREATING => Status::Creating,
            MODIFYING => Status::Modifying,
            DELETING => Status::Deleting,
            SNAPSHOTTING => Status::Snapshotting,
            REBOOTING => Status::Rebooting,
            CREATE_FAILED => Status::CreateFailed,
            other => Status::Other(other.to_string()),
        }
    }
}

impl From<String> for Status {
    fn from(s: String) -> Self {
        Status::from(s.as_str())
    }
}

impl From<Status> for String {
    fn from(s: Status) -> Self {
        match s {
            Status::Other(s) => s,
            known => known.as_str().to_string(),
        }
    }
}

impl fmt::Display for Status {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
