//! K8s-style reconciliation of per-member projects against one group.
//!
//! The controller watches exactly one named group and keeps, for every
//! member, a project named after them plus a `<member>-edit` role binding
//! granting the `edit` cluster role on it:
//!
//! - **Observe**: a [`GroupObserver`] delivers `Created` / `Updated` /
//!   `Deleted` events for the target group over a bounded channel
//! - **Diff**: [`diff`] turns two observations into added / removed members
//! - **Reconcile**: the [`Reconciler`] provisions added members and
//!   deprovisions removed ones through a [`ResourceGateway`]
//! - **Loop**: the [`ControlLoop`] ties them together, one pass at a time
//!
//! # Failure model
//!
//! Not-found and already-exists answers are idempotency signals, not errors.
//! Any other gateway failure abandons that one member for the current pass
//! and is recorded in the [`PassReport`]; it is attempted again the next
//! time a membership change includes it.
//! Only subscription and initial sync failures stop the loop.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use group_sync_reconciler::{
//!     ControlLoop, ControllerConfig, Group, InMemoryGateway, Reconciler, SnapshotObserver,
//! };
//!
//! #[tokio::main]
//! async fn main() -> group_sync_reconciler::Result<()> {
//!     let config = ControllerConfig::new().with_target_group("redhat-ai-dev-users");
//!     let gateway = Arc::new(InMemoryGateway::new());
//!     let reconciler = Arc::new(Reconciler::new(gateway));
//!     let (observer, feed) = SnapshotObserver::from_config(&config);
//!
//!     feed.upsert(Group::new(config.target_group.clone(), ["alice", "bob"]))?;
//!     feed.mark_synced()?;
//!
//!     let control = ControlLoop::new(config, observer, reconciler)?;
//!     let stopper = control.stopper();
//!     // stopper.stop() from a signal handler
//!     control.run().await?;
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod diff;
pub mod error;
pub mod gateway;
pub mod r#loop;
pub mod observer;
pub mod reconciler;
pub mod types;

// Re-export main types
pub use config::{
    ControllerConfig, DEFAULT_EVENT_QUEUE_CAPACITY, DEFAULT_RESYNC_PERIOD, DEFAULT_TARGET_GROUP,
    TARGET_GROUP_ENV, resolve_target_group,
};
pub use diff::diff;
pub use error::{
    Error, GatewayError, GatewayResult, MemberError, MemberResult, MemberStep, ResourceKind,
    Result,
};
pub use gateway::{GatewayCall, GatewayOp, InMemoryGateway, ResourceGateway};
pub use r#loop::{ControlLoop, GroupEventHandler, LoopState, LoopStopper, LoopSummary};
pub use observer::{GroupFeed, GroupObserver, SnapshotObserver};
pub use reconciler::Reconciler;
pub use types::{
    DeprovisionOutcome, Group, GroupEvent, GroupName, MemberFailure, MemberId, MemberSet,
    MembershipDelta, PassReport, Project, ProjectName, ProvisionOutcome, ResourceChange,
    RoleBinding,
};
