//! # Shardkeeper
//!
//! Topology reconciliation for replicated, partitioned cache clusters:
//! - **Planning**: minimal, ordered mutation plan from observed to desired shape
//! - **Execution**: one remote call per step, with error classification
//! - **Convergence**: bounded, cancellable polling until the resource settles
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                        Reconciler                           │
//! ├──────────────┬──────────────┬───────────────────────────────┤
//! │   Planner    │   Executor   │       Convergence Waiter      │
//! │   (pure)     │  (1 call per │   (poll until available,      │
//! │              │    step)     │    timeout or cancel)         │
//! ├──────────────┴──────────────┴───────────────────────────────┤
//! │              ControlPlane (injected remote client)          │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Example Usage
//!
//! ```rust,ignore
//! use shardkeeper::{DesiredShape, MemoryControlPlane, ReconcileConfig, Reconciler, Topology};
//! use tokio_util::sync::CancellationToken;
//!
//! let plane = Arc::new(MemoryControlPlane::new());
//! plane.insert(Topology::clustered("cache", 3, 2));
//!
//! let reconciler = Reconciler::new(plane, ReconcileConfig::default())?;
//! let topology = reconciler
//!     .reconcile(
//!         &CancellationToken::new(),
//!         "cache",
//!         &DesiredShape::clustered(2, 1),
//!         &Default::default(),
//!     )
//!     .await?;
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod memory;
pub mod observability;
pub mod plan;
pub mod planner;
pub mod reconcile;
pub mod retry;
pub mod shape;
pub mod status;
pub mod topology;
pub mod waiter;

// Re-export main types
pub use client::{ClientError, ControlPlane};
pub use config::{ReconcileConfig, ReconcileOptions};
pub use error::{ReconcileError, ReconcileFailure, Result};
pub use executor::{classify, ErrorClass, StepOutcome};
pub use memory::MemoryControlPlane;
pub use observability::ReconcileMetrics;
pub use plan::{Plan, Step};
pub use reconcile::Reconciler;
pub use retry::RetryConfig;
pub use shape::{DesiredShape, Layout};
pub use status::Status;
pub use topology::{
    validate_resource_id, ClusterMode, Member, MemberId, NodeGroup, NodeGroupId, Topology,
};
pub use waiter::{Refreshed, StateChangeConf};

/// Re-export common types
pub mod prelude {
    pub use crate::client::*;
    pub use crate::config::*;
    pub use crate::error::*;
    pub use crate::plan::*;
    pub use crate::reconcile::Reconciler;
    pub use crate::shape::*;
    pub use crate::topology::*;
}
