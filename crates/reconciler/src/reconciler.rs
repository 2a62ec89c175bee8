//! Reconciler implementation.

use std::sync::Arc;

use itertools::Itertools;
use tracing::{debug, error, info, warn};

use crate::error::{MemberError, MemberResult, MemberStep};
use crate::gateway::ResourceGateway;
use crate::types::{
    DeprovisionOutcome, GroupName, MemberFailure, MemberId, MembershipDelta, PassReport,
    ProjectName, ProvisionOutcome, ResourceChange, RoleBinding,
};

/// Drives projects and role bindings toward a group's membership.
pub struct Reconciler {
    gateway: Arc<dyn ResourceGateway>,
}

impl Reconciler {
    /// Create a new reconciler.
    pub fn new(gateway: Arc<dyn ResourceGateway>) -> Self {
        Self { gateway }
    }

    /// Run one reconciliation pass for `delta`.
    ///
    /// Every member is attempted; failures are recorded in the report and
    /// never stop the remaining members.
    pub async fn reconcile(&self, group: &GroupName, delta: &MembershipDelta) -> PassReport {
        let mut report = PassReport::new(group.clone());

        if delta.is_empty() {
            debug!(group = %group, pass_id = %report.pass_id, "No membership changes");
            return report;
        }

        if !delta.added.is_empty() {
            info!(
                group = %group,
                pass_id = %report.pass_id,
                users = %delta.added.iter().join(", "),
                "Users added to group"
            );
        }
        for member in &delta.added {
            match self.ensure_member_provisioned(member).await {
                Ok(outcome) => report.provisioned.push((member.clone(), outcome)),
                Err(e) => report.failures.push(MemberFailure::from(e)),
            }
        }

        if !delta.removed.is_empty() {
            info!(
                group = %group,
                pass_id = %report.pass_id,
                users = %delta.removed.iter().join(", "),
                "Users removed from group"
            );
        }
        for member in &delta.removed {
            match self.ensure_member_deprovisioned(member).await {
                Ok(outcome) => report.deprovisioned.push((member.clone(), outcome)),
                Err(e) => report.failures.push(MemberFailure::from(e)),
            }
        }

        if report.converged() {
            info!(
                group = %group,
                pass_id = %report.pass_id,
                members = report.members_seen(),
                "Reconciliation pass complete"
            );
        } else {
            warn!(
                group = %group,
                pass_id = %report.pass_id,
                failed = report.failures.len(),
                members = report.members_seen(),
                "Reconciliation pass finished with failures"
            );
        }

        report
    }

    /// Make sure `member` has a project and an edit role binding on it.
    ///
    /// # Errors
    ///
    /// Returns a `MemberError` when a gateway call fails for any reason
    /// other than the expected not-found / already-exists signals.
    pub async fn ensure_member_provisioned(
        &self,
        member: &MemberId,
    ) -> MemberResult<ProvisionOutcome> {
        let project = ProjectName::for_member(member);
        let project_change = self.ensure_project(member, &project).await?;
        let role_binding = self.ensure_role_binding(member, &project).await?;

        Ok(ProvisionOutcome {
            project: project_change,
            role_binding,
        })
    }

    /// Make sure `member` no longer has a project.
    ///
    /// Role bindings are left alone; they are scoped to the project and go
    /// away with it.
    ///
    /// # Errors
    ///
    /// Returns a `MemberError` when the lookup or the delete fails.
    pub async fn ensure_member_deprovisioned(
        &self,
        member: &MemberId,
    ) -> MemberResult<DeprovisionOutcome> {
        let project = ProjectName::for_member(member);

        match self.gateway.get_project(&project).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                debug!(member = %member, project = %project, "Project does not exist");
                return Ok(DeprovisionOutcome::AlreadyAbsent);
            }
            Err(e) => {
                error!(member = %member, project = %project, error = %e, "Error checking if project exists");
                return Err(MemberError::new(
                    member.as_str(),
                    MemberStep::LookupProject,
                    e,
                ));
            }
        }

        match self.gateway.delete_project(&project).await {
            Ok(()) => {
                info!(member = %member, project = %project, "Deleted project");
                Ok(DeprovisionOutcome::Deleted)
            }
            Err(e) if e.is_not_found() => {
                debug!(member = %member, project = %project, "Project already gone");
                Ok(DeprovisionOutcome::AlreadyAbsent)
            }
            Err(e) => {
                error!(member = %member, project = %project, error = %e, "Error deleting project");
                Err(MemberError::new(
                    member.as_str(),
                    MemberStep::DeleteProject,
                    e,
                ))
            }
        }
    }

    async fn ensure_project(
        &self,
        member: &MemberId,
        project: &ProjectName,
    ) -> MemberResult<ResourceChange> {
        match self.gateway.get_project(project).await {
            Ok(_) => {
                info!(member = %member, project = %project, "Project already exists");
                return Ok(ResourceChange::AlreadyPresent);
            }
            Err(e) if e.is_not_found() => {
                info!(member = %member, project = %project, "Project not found");
            }
            Err(e) => {
                error!(member = %member, project = %project, error = %e, "Error checking if project exists");
                return Err(MemberError::new(
                    member.as_str(),
                    MemberStep::LookupProject,
                    e,
                ));
            }
        }

        match self.gateway.create_project(project).await {
            Ok(_) => {
                info!(member = %member, project = %project, "Created project");
                Ok(ResourceChange::Created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(member = %member, project = %project, "Project appeared concurrently");
                Ok(ResourceChange::AlreadyPresent)
            }
            Err(e) => {
                error!(member = %member, project = %project, error = %e, "Error creating project");
                Err(MemberError::new(
                    member.as_str(),
                    MemberStep::CreateProject,
                    e,
                ))
            }
        }
    }

    async fn ensure_role_binding(
        &self,
        member: &MemberId,
        project: &ProjectName,
    ) -> MemberResult<ResourceChange> {
        let binding = RoleBinding::edit(project, member);

        match self.gateway.get_role_binding(project, &binding.name).await {
            Ok(_) => {
                info!(member = %member, project = %project, role_binding = %binding.name, "RoleBinding already exists");
                return Ok(ResourceChange::AlreadyPresent);
            }
            Err(e) if e.is_not_found() => {
                info!(member = %member, project = %project, role_binding = %binding.name, "RoleBinding not found");
            }
            Err(e) => {
                error!(member = %member, project = %project, error = %e, "Error checking if RoleBinding exists");
                return Err(MemberError::new(
                    member.as_str(),
                    MemberStep::LookupRoleBinding,
                    e,
                ));
            }
        }

        match self.gateway.create_role_binding(&binding).await {
            Ok(_) => {
                info!(member = %member, project = %project, role_binding = %binding.name, "Created edit RoleBinding");
                Ok(ResourceChange::Created)
            }
            Err(e) if e.is_already_exists() => {
                debug!(member = %member, project = %project, role_binding = %binding.name, "RoleBinding appeared concurrently");
                Ok(ResourceChange::AlreadyPresent)
            }
            Err(e) => {
                error!(member = %member, project = %project, error = %e, "Error creating edit RoleBinding");
                Err(MemberError::new(
                    member.as_str(),
                    MemberStep::CreateRoleBinding,
                    e,
                ))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{GatewayError, ResourceKind};
    use crate::gateway::{GatewayOp, InMemoryGateway};
    use crate::types::MemberSet;

    fn setup() -> (Reconciler, Arc<InMemoryGateway>) {
        let gateway = Arc::new(InMemoryGateway::new());
        let reconciler = Reconciler::new(gateway.clone());
        (reconciler, gateway)
    }

    fn members(names: &[&str]) -> MemberSet {
        names.iter().map(|n| MemberId::from(*n)).collect()
    }

    #[tokio::test]
    async fn test_provision_creates_project_and_binding() {
        let (reconciler, gateway) = setup();
        let outcome = reconciler
            .ensure_member_provisioned(&MemberId::from("alice"))
            .await;

        assert_eq!(
            outcome.ok(),
            Some(ProvisionOutcome {
                project: ResourceChange::Created,
                role_binding: ResourceChange::Created,
            })
        );
        assert!(gateway.has_project("alice").await);
        assert_eq!(gateway.role_bindings("alice").await.len(), 1);
    }

    #[tokio::test]
    async fn test_provision_tolerates_create_race() {
        let (reconciler, gateway) = setup();
        // Lookup misses but another actor wins the create.
        gateway
            .respond_with(
                GatewayOp::CreateProject,
                "alice",
                GatewayError::already_exists(ResourceKind::Project, "alice"),
            )
            .await;
        gateway.insert_project("alice").await;
        gateway
            .respond_with(
                GatewayOp::GetProject,
                "alice",
                GatewayError::not_found(ResourceKind::Project, "alice"),
            )
            .await;

        let outcome = reconciler
            .ensure_member_provisioned(&MemberId::from("alice"))
            .await;
        assert_eq!(
            outcome.ok(),
            Some(ProvisionOutcome {
                project: ResourceChange::AlreadyPresent,
                role_binding: ResourceChange::Created,
            })
        );
        assert_eq!(gateway.call_count(GatewayOp::CreateProject, "alice").await, 1);
    }

    #[tokio::test]
    async fn test_provision_tolerates_role_binding_create_race() {
        let (reconciler, gateway) = setup();
        gateway.insert_project("alice").await;
        gateway
            .respond_with(
                GatewayOp::GetRoleBinding,
                "alice-edit",
                GatewayError::not_found(ResourceKind::RoleBinding, "alice-edit"),
            )
            .await;
        gateway
            .respond_with(
                GatewayOp::CreateRoleBinding,
                "alice-edit",
                GatewayError::already_exists(ResourceKind::RoleBinding, "alice-edit"),
            )
            .await;

        let outcome = reconciler
            .ensure_member_provisioned(&MemberId::from("alice"))
            .await;
        assert_eq!(
            outcome.ok(),
            Some(ProvisionOutcome {
                project: ResourceChange::AlreadyPresent,
                role_binding: ResourceChange::AlreadyPresent,
            })
        );
        assert_eq!(
            gateway
                .call_count(GatewayOp::CreateRoleBinding, "alice-edit")
                .await,
            1
        );
    }

    #[tokio::test]
    async fn test_deprovision_tolerates_delete_race() {
        let (reconciler, gateway) = setup();
        // Lookup finds the project but someone else deletes it first.
        gateway.insert_project("bob").await;
        gateway
            .respond_with(
                GatewayOp::DeleteProject,
                "bob",
                GatewayError::not_found(ResourceKind::Project, "bob"),
            )
            .await;

        let outcome = reconciler
            .ensure_member_deprovisioned(&MemberId::from("bob"))
            .await;
        assert_eq!(outcome.ok(), Some(DeprovisionOutcome::AlreadyAbsent));
        assert_eq!(gateway.call_count(GatewayOp::GetProject, "bob").await, 1);
        assert_eq!(gateway.call_count(GatewayOp::DeleteProject, "bob").await, 1);
    }

    #[tokio::test]
    async fn test_project_lookup_failure_aborts_member() {
        let (reconciler, gateway) = setup();
        gateway
            .fail_on(GatewayOp::GetProject, "alice", "connection reset")
            .await;

        let outcome = reconciler
            .ensure_member_provisioned(&MemberId::from("alice"))
            .await;
        assert!(matches!(
            outcome,
            Err(MemberError {
                step: MemberStep::LookupProject,
                ..
            })
        ));
        assert_eq!(gateway.call_count(GatewayOp::CreateProject, "alice").await, 0);
    }

    #[tokio::test]
    async fn test_binding_failure_is_reported_with_step() {
        let (reconciler, gateway) = setup();
        gateway
            .fail_on(GatewayOp::CreateRoleBinding, "alice-edit", "forbidden")
            .await;

        let outcome = reconciler
            .ensure_member_provisioned(&MemberId::from("alice"))
            .await;
        assert!(matches!(
            outcome,
            Err(MemberError {
                step: MemberStep::CreateRoleBinding,
                ..
            })
        ));
        // The project step already succeeded and is not rolled back.
        assert!(gateway.has_project("alice").await);
    }

    #[tokio::test]
    async fn test_deprovision_missing_project_is_noop() {
        let (reconciler, gateway) = setup();
        let outcome = reconciler
            .ensure_member_deprovisioned(&MemberId::from("bob"))
            .await;

        assert_eq!(outcome.ok(), Some(DeprovisionOutcome::AlreadyAbsent));
        assert_eq!(gateway.call_count(GatewayOp::DeleteProject, "bob").await, 0);
    }

    #[tokio::test]
    async fn test_deprovision_lookup_failure_skips_delete() {
        let (reconciler, gateway) = setup();
        gateway.insert_project("bob").await;
        gateway
            .fail_on(GatewayOp::GetProject, "bob", "timeout")
            .await;

        let outcome = reconciler
            .ensure_member_deprovisioned(&MemberId::from("bob"))
            .await;
        assert!(outcome.is_err());
        assert!(gateway.has_project("bob").await);
        assert_eq!(gateway.call_count(GatewayOp::DeleteProject, "bob").await, 0);
    }

    #[tokio::test]
    async fn test_reconcile_records_failures_and_continues() {
        let (reconciler, gateway) = setup();
        gateway
            .fail_on(GatewayOp::CreateProject, "alice", "quota exceeded")
            .await;
        gateway
            .fail_on(GatewayOp::DeleteProject, "carol", "conflict")
            .await;
        gateway.insert_project("carol").await;
        gateway.insert_project("dave").await;

        let delta = MembershipDelta {
            added: members(&["alice", "bob"]),
            removed: members(&["carol", "dave"]),
        };
        let report = reconciler.reconcile(&GroupName::from("devs"), &delta).await;

        assert!(!report.converged());
        assert_eq!(report.failures.len(), 2);
        assert_eq!(
            report.failure_for(&MemberId::from("alice")).map(|f| f.step),
            Some(MemberStep::CreateProject)
        );
        assert_eq!(
            report.failure_for(&MemberId::from("carol")).map(|f| f.step),
            Some(MemberStep::DeleteProject)
        );
        assert!(gateway.has_project("bob").await);
        assert!(!gateway.has_project("dave").await);
        assert_eq!(report.members_seen(), 4);
    }

    #[tokio::test]
    async fn test_empty_delta_touches_nothing() {
        let (reconciler, gateway) = setup();
        let report = reconciler
            .reconcile(&GroupName::from("devs"), &MembershipDelta::default())
            .await;

        assert!(report.converged());
        assert!(gateway.calls().await.is_empty());
    }
}
