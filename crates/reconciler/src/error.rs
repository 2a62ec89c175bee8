//! Error types for the reconciler crate.

use thiserror::Error;

/// Result type alias for reconciler operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Result type alias for resource gateway calls.
pub type GatewayResult<T> = std::result::Result<T, GatewayError>;

/// Result type alias for per-member operations.
pub type MemberResult<T> = std::result::Result<T, MemberError>;

/// Outcome of a failed resource gateway call.
///
/// `NotFound` and `AlreadyExists` are idempotency signals the reconciler
/// interprets; only `Other` is a genuine failure.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum GatewayError {
    #[error("{kind} '{name}' not found")]
    NotFound { kind: ResourceKind, name: String },

    #[error("{kind} '{name}' already exists")]
    AlreadyExists { kind: ResourceKind, name: String },

    #[error("{operation} failed: {reason}")]
    Other { operation: String, reason: String },
}

impl GatewayError {
    /// Create a not found error.
    pub fn not_found(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::NotFound {
            kind,
            name: name.into(),
        }
    }

    /// Create an already exists error.
    pub fn already_exists(kind: ResourceKind, name: impl Into<String>) -> Self {
        Self::AlreadyExists {
            kind,
            name: name.into(),
        }
    }

    /// Create a generic failure.
    pub fn other(operation: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Other {
            operation: operation.into(),
            reason: reason.into(),
        }
    }

    /// Whether this is a not found signal.
    #[must_use]
    pub const fn is_not_found(&self) -> bool {
        matches!(self, Self::NotFound { .. })
    }

    /// Whether this is an already exists signal.
    #[must_use]
    pub const fn is_already_exists(&self) -> bool {
        matches!(self, Self::AlreadyExists { .. })
    }
}

/// Kind of resource a gateway call addressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResourceKind {
    Project,
    RoleBinding,
}

impl std::fmt::Display for ResourceKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Project => write!(f, "project"),
            Self::RoleBinding => write!(f, "role binding"),
        }
    }
}

/// Reconciler error types.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to subscribe to group '{group}': {reason}")]
    SubscriptionFailed { group: String, reason: String },

    #[error("initial sync of group '{group}' did not complete")]
    SyncFailed { group: String },

    #[error("observer error: {reason}")]
    Observer { reason: String },

    #[error("invalid configuration: {reason}")]
    InvalidConfig { reason: String },
}

impl Error {
    /// Create a subscription failed error.
    pub fn subscription_failed(group: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::SubscriptionFailed {
            group: group.into(),
            reason: reason.into(),
        }
    }

    /// Create a sync failed error.
    pub fn sync_failed(group: impl Into<String>) -> Self {
        Self::SyncFailed {
            group: group.into(),
        }
    }

    /// Create an observer error.
    pub fn observer(reason: impl Into<String>) -> Self {
        Self::Observer {
            reason: reason.into(),
        }
    }

    /// Create an invalid config error.
    pub fn invalid_config(reason: impl Into<String>) -> Self {
        Self::InvalidConfig {
            reason: reason.into(),
        }
    }
}

/// A gateway failure that abandoned one member's processing.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{step} failed for member '{member}': {source}")]
pub struct MemberError {
    pub member: String,
    pub step: MemberStep,
    #[source]
    pub source: GatewayError,
}

impl MemberError {
    /// Create a member error.
    pub fn new(member: impl Into<String>, step: MemberStep, source: GatewayError) -> Self {
        Self {
            member: member.into(),
            step,
            source,
        }
    }
}

/// The step of member (de)provisioning that failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MemberStep {
    LookupProject,
    CreateProject,
    DeleteProject,
    LookupRoleBinding,
    CreateRoleBinding,
}

impl std::fmt::Display for MemberStep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let label = match self {
            Self::LookupProject => "project lookup",
            Self::CreateProject => "project creation",
            Self::DeleteProject => "project deletion",
            Self::LookupRoleBinding => "role binding lookup",
            Self::CreateRoleBinding => "role binding creation",
        };
        f.write_str(label)
    }
}
