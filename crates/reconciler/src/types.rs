//! Core types for the reconciler.

use std::collections::BTreeSet;
use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use ulid::Ulid;

use crate::error::{MemberError, MemberStep};

/// API group of the RBAC resources.
pub const RBAC_API_GROUP: &str = "rbac.authorization.k8s.io";

/// Cluster role granted to every member on their own project.
pub const EDIT_CLUSTER_ROLE: &str = "edit";

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            /// Create from anything string-like.
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            /// Borrow the underlying string.
            #[must_use]
            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Username of a group member.
    MemberId
);

string_id!(
    /// Name of the watched group.
    GroupName
);

string_id!(
    /// Name of a per-member project.
    ProjectName
);

impl ProjectName {
    /// Projects are named after the member that owns them.
    #[must_use]
    pub fn for_member(member: &MemberId) -> Self {
        Self(member.as_str().to_string())
    }
}

/// Set of members, duplicates collapsed.
pub type MemberSet = BTreeSet<MemberId>;

/// Observed state of a group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Group {
    pub name: GroupName,
    #[serde(default)]
    pub users: Vec<MemberId>,
    #[serde(default)]
    pub resource_version: String,
}

impl Group {
    /// Create a group with the given members.
    pub fn new<I, M>(name: impl Into<GroupName>, users: I) -> Self
    where
        I: IntoIterator<Item = M>,
        M: Into<MemberId>,
    {
        Self {
            name: name.into(),
            users: users.into_iter().map(Into::into).collect(),
            resource_version: String::new(),
        }
    }

    /// Set the resource version.
    #[must_use]
    pub fn with_resource_version(mut self, version: impl Into<String>) -> Self {
        self.resource_version = version.into();
        self
    }

    /// Members as a set.
    #[must_use]
    pub fn member_set(&self) -> MemberSet {
        self.users.iter().cloned().collect()
    }
}

/// Lifecycle event for the watched group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupEvent {
    Created(Group),
    Updated { old: Group, new: Group },
    Deleted(Group),
}

impl GroupEvent {
    /// Name of the group the event concerns.
    #[must_use]
    pub fn group_name(&self) -> &GroupName {
        match self {
            Self::Created(group) | Self::Deleted(group) => &group.name,
            Self::Updated { new, .. } => &new.name,
        }
    }

    /// Short label for logging.
    #[must_use]
    pub const fn kind(&self) -> &'static str {
        match self {
            Self::Created(_) => "created",
            Self::Updated { .. } => "updated",
            Self::Deleted(_) => "deleted",
        }
    }
}

/// Members that joined and left between two observations.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct MembershipDelta {
    pub added: MemberSet,
    pub removed: MemberSet,
}

impl MembershipDelta {
    /// True when nobody joined or left.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty()
    }
}

/// A project known to the resource store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Project {
    pub name: ProjectName,
}

/// Subject of a role binding.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Subject {
    pub kind: String,
    pub api_group: String,
    pub name: String,
}

/// Role a binding grants.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleRef {
    pub kind: String,
    pub api_group: String,
    pub name: String,
}

/// Namespace-scoped grant of a cluster role to a member.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RoleBinding {
    pub name: String,
    pub project: ProjectName,
    pub subjects: Vec<Subject>,
    pub role_ref: RoleRef,
}

impl RoleBinding {
    /// Name of the edit binding inside `project`.
    #[must_use]
    pub fn edit_name(project: &ProjectName) -> String {
        format!("{project}-edit")
    }

    /// Binding that grants `member` the `edit` cluster role on `project`.
    #[must_use]
    pub fn edit(project: &ProjectName, member: &MemberId) -> Self {
        Self {
            name: Self::edit_name(project),
            project: project.clone(),
            subjects: vec![Subject {
                kind: "User".to_string(),
                api_group: RBAC_API_GROUP.to_string(),
                name: member.to_string(),
            }],
            role_ref: RoleRef {
                kind: "ClusterRole".to_string(),
                api_group: RBAC_API_GROUP.to_string(),
                name: EDIT_CLUSTER_ROLE.to_string(),
            },
        }
    }
}

/// What happened to one resource during provisioning.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResourceChange {
    Created,
    AlreadyPresent,
}

/// Result of provisioning one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProvisionOutcome {
    pub project: ResourceChange,
    pub role_binding: ResourceChange,
}

/// Result of deprovisioning one member.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeprovisionOutcome {
    Deleted,
    AlreadyAbsent,
}

/// A member whose processing was abandoned during a pass.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MemberFailure {
    pub member: MemberId,
    pub step: MemberStep,
    pub reason: String,
}

impl From<MemberError> for MemberFailure {
    fn from(err: MemberError) -> Self {
        Self {
            member: MemberId::from(err.member),
            step: err.step,
            reason: err.source.to_string(),
        }
    }
}

/// Summary of one reconciliation pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PassReport {
    pub pass_id: Ulid,
    pub group: GroupName,
    pub started_at: DateTime<Utc>,
    pub provisioned: Vec<(MemberId, ProvisionOutcome)>,
    pub deprovisioned: Vec<(MemberId, DeprovisionOutcome)>,
    pub failures: Vec<MemberFailure>,
}

impl PassReport {
    /// Start an empty report for `group`.
    #[must_use]
    pub fn new(group: GroupName) -> Self {
        Self {
            pass_id: Ulid::new(),
            group,
            started_at: Utc::now(),
            provisioned: Vec::new(),
            deprovisioned: Vec::new(),
            failures: Vec::new(),
        }
    }

    /// True when every member in the pass was handled.
    #[must_use]
    pub fn converged(&self) -> bool {
        self.failures.is_empty()
    }

    /// Members touched by this pass, failed or not.
    #[must_use]
    pub fn members_seen(&self) -> usize {
        self.provisioned
            .len()
            .saturating_add(self.deprovisioned.len())
            .saturating_add(self.failures.len())
    }

    /// Look up a member's failure, if any.
    #[must_use]
    pub fn failure_for(&self, member: &MemberId) -> Option<&MemberFailure> {
        self.failures.iter().find(|f| &f.member == member)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_member_set_collapses_duplicates() {
        let group = Group::new("devs", ["alice", "bob", "alice"]);
        assert_eq!(group.users.len(), 3);
        assert_eq!(group.member_set().len(), 2);
    }

    #[test]
    fn test_edit_binding_shape() {
        let member = MemberId::from("alice");
        let project = ProjectName::for_member(&member);
        let binding = RoleBinding::edit(&project, &member);

        assert_eq!(binding.name, "alice-edit");
        assert_eq!(binding.project.as_str(), "alice");
        assert_eq!(binding.role_ref.kind, "ClusterRole");
        assert_eq!(binding.role_ref.name, EDIT_CLUSTER_ROLE);
        assert_eq!(binding.subjects.len(), 1);
        assert!(binding
            .subjects
            .iter()
            .all(|s| s.kind == "User" && s.name == "alice" && s.api_group == RBAC_API_GROUP));
    }

    #[test]
    fn test_group_event_name() {
        let old = Group::new("devs", ["alice"]).with_resource_version("1");
        let new = Group::new("devs", ["bob"]).with_resource_version("2");
        let event = GroupEvent::Updated { old, new };
        assert_eq!(event.group_name().as_str(), "devs");
        assert_eq!(event.kind(), "updated");
    }

    #[test]
    fn test_empty_report_is_converged() {
        let report = PassReport::new(GroupName::from("devs"));
        assert!(report.converged());
        assert_eq!(report.members_seen(), 0);
    }

    #[test]
    fn test_group_deserializes_without_version() -> Result<(), serde_json::Error> {
        let group: Group = serde_json::from_str(r#"{"name":"devs","users":["alice"]}"#)?;
        assert_eq!(group.resource_version, "");
        assert_eq!(group.users, vec![MemberId::from("alice")]);
        Ok(())
    }
}
