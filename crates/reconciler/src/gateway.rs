//! Resource gateway: the store projects and role bindings live in.

use std::collections::{BTreeMap, HashMap};

use async_trait::async_trait;
use serde::Serialize;
use tokio::sync::RwLock;
use tracing::debug;

use crate::error::{GatewayError, GatewayResult, ResourceKind};
use crate::types::{Project, ProjectName, RoleBinding};

/// Verbs the reconciler issues against the resource store.
#[async_trait]
pub trait ResourceGateway: Send + Sync {
    /// Look up a project by name.
    async fn get_project(&self, name: &ProjectName) -> GatewayResult<Project>;

    /// Create a project.
    async fn create_project(&self, name: &ProjectName) -> GatewayResult<Project>;

    /// Delete a project.
    async fn delete_project(&self, name: &ProjectName) -> GatewayResult<()>;

    /// Look up a role binding inside a project.
    async fn get_role_binding(&self, project: &ProjectName, name: &str)
    -> GatewayResult<RoleBinding>;

    /// Create a role binding inside its project.
    async fn create_role_binding(&self, binding: &RoleBinding) -> GatewayResult<RoleBinding>;
}

/// Gateway operation, used for call logs and failure injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum GatewayOp {
    GetProject,
    CreateProject,
    DeleteProject,
    GetRoleBinding,
    CreateRoleBinding,
}

impl GatewayOp {
    const fn label(self) -> &'static str {
        match self {
            Self::GetProject => "get project",
            Self::CreateProject => "create project",
            Self::DeleteProject => "delete project",
            Self::GetRoleBinding => "get role binding",
            Self::CreateRoleBinding => "create role binding",
        }
    }
}

/// One recorded gateway call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GatewayCall {
    pub op: GatewayOp,
    pub target: String,
}

#[derive(Debug, Default, Clone, Serialize)]
struct ProjectRecord {
    role_bindings: BTreeMap<String, RoleBinding>,
}

#[derive(Debug, Default)]
struct StoreState {
    projects: BTreeMap<ProjectName, ProjectRecord>,
    failures: HashMap<(GatewayOp, String), GatewayError>,
    calls: Vec<GatewayCall>,
}

impl StoreState {
    /// Record the call and return an injected failure if one is armed.
    fn enter(&mut self, op: GatewayOp, target: &str) -> GatewayResult<()> {
        self.calls.push(GatewayCall {
            op,
            target: target.to_string(),
        });
        match self.failures.get(&(op, target.to_string())) {
            Some(err) => Err(err.clone()),
            None => Ok(()),
        }
    }
}

/// In-memory resource store.
///
/// Role bindings are namespace-scoped: they live inside their project and
/// disappear with it.
#[derive(Debug, Default)]
pub struct InMemoryGateway {
    state: RwLock<StoreState>,
}

impl InMemoryGateway {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a project without any role binding.
    pub async fn insert_project(&self, name: impl Into<ProjectName>) {
        self.state
            .write()
            .await
            .projects
            .entry(name.into())
            .or_default();
    }

    /// Seed a role binding, creating its project if needed.
    pub async fn insert_role_binding(&self, binding: RoleBinding) {
        self.state
            .write()
            .await
            .projects
            .entry(binding.project.clone())
            .or_default()
            .role_bindings
            .insert(binding.name.clone(), binding);
    }

    /// Make every `op` against `target` fail with a generic error.
    ///
    /// For role binding operations `target` is the binding name.
    pub async fn fail_on(&self, op: GatewayOp, target: impl Into<String>, reason: impl Into<String>) {
        let err = GatewayError::other(op.label(), reason);
        self.respond_with(op, target, err).await;
    }

    /// Make every `op` against `target` answer with `err`.
    pub async fn respond_with(&self, op: GatewayOp, target: impl Into<String>, err: GatewayError) {
        self.state
            .write()
            .await
            .failures
            .insert((op, target.into()), err);
    }

    /// Remove every injected failure.
    pub async fn clear_failures(&self) {
        self.state.write().await.failures.clear();
    }

    /// Names of all projects, sorted.
    pub async fn project_names(&self) -> Vec<ProjectName> {
        self.state.read().await.projects.keys().cloned().collect()
    }

    /// Whether a project exists.
    pub async fn has_project(&self, name: &str) -> bool {
        self.state
            .read()
            .await
            .projects
            .contains_key(&ProjectName::from(name))
    }

    /// Role bindings inside a project.
    pub async fn role_bindings(&self, project: &str) -> Vec<RoleBinding> {
        self.state
            .read()
            .await
            .projects
            .get(&ProjectName::from(project))
            .map(|record| record.role_bindings.values().cloned().collect())
            .unwrap_or_default()
    }

    /// Every call made so far, in order.
    pub async fn calls(&self) -> Vec<GatewayCall> {
        self.state.read().await.calls.clone()
    }

    /// Number of calls of `op` against `target`.
    pub async fn call_count(&self, op: GatewayOp, target: &str) -> usize {
        self.state
            .read()
            .await
            .calls
            .iter()
            .filter(|call| call.op == op && call.target == target)
            .count()
    }

    /// JSON snapshot of projects and their bindings.
    ///
    /// # Errors
    ///
    /// Returns an error if the snapshot cannot be serialized.
    pub async fn snapshot_json(&self) -> serde_json::Result<serde_json::Value> {
        serde_json::to_value(&self.state.read().await.projects)
    }
}

#[async_trait]
impl ResourceGateway for InMemoryGateway {
    async fn get_project(&self, name: &ProjectName) -> GatewayResult<Project> {
        let mut state = self.state.write().await;
        state.enter(GatewayOp::GetProject, name.as_str())?;
        if state.projects.contains_key(name) {
            Ok(Project { name: name.clone() })
        } else {
            Err(GatewayError::not_found(ResourceKind::Project, name.as_str()))
        }
    }

    async fn create_project(&self, name: &ProjectName) -> GatewayResult<Project> {
        let mut state = self.state.write().await;
        state.enter(GatewayOp::CreateProject, name.as_str())?;
        if state.projects.contains_key(name) {
            return Err(GatewayError::already_exists(
                ResourceKind::Project,
                name.as_str(),
            ));
        }
        state.projects.insert(name.clone(), ProjectRecord::default());
        debug!(project = %name, "Stored project");
        Ok(Project { name: name.clone() })
    }

    async fn delete_project(&self, name: &ProjectName) -> GatewayResult<()> {
        let mut state = self.state.write().await;
        state.enter(GatewayOp::DeleteProject, name.as_str())?;
        match state.projects.remove(name) {
            Some(_) => {
                debug!(project = %name, "Removed project");
                Ok(())
            }
            None => Err(GatewayError::not_found(ResourceKind::Project, name.as_str())),
        }
    }

    async fn get_role_binding(
        &self,
        project: &ProjectName,
        name: &str,
    ) -> GatewayResult<RoleBinding> {
        let mut state = self.state.write().await;
        state.enter(GatewayOp::GetRoleBinding, name)?;
        state
            .projects
            .get(project)
            .and_then(|record| record.role_bindings.get(name))
            .cloned()
            .ok_or_else(|| GatewayError::not_found(ResourceKind::RoleBinding, name))
    }

    async fn create_role_binding(&self, binding: &RoleBinding) -> GatewayResult<RoleBinding> {
        let mut state = self.state.write().await;
        state.enter(GatewayOp::CreateRoleBinding, &binding.name)?;
        let record = state.projects.get_mut(&binding.project).ok_or_else(|| {
            GatewayError::not_found(ResourceKind::Project, binding.project.as_str())
        })?;
        if record.role_bindings.contains_key(&binding.name) {
            return Err(GatewayError::already_exists(
                ResourceKind::RoleBinding,
                binding.name.as_str(),
            ));
        }
        record
            .role_bindings
            .insert(binding.name.clone(), binding.clone());
        debug!(project = %binding.project, role_binding = %binding.name, "Stored role binding");
        Ok(binding.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::MemberId;

    fn edit_binding(user: &str) -> RoleBinding {
        let member = MemberId::from(user);
        RoleBinding::edit(&ProjectName::for_member(&member), &member)
    }

    #[tokio::test]
    async fn test_create_project_twice_reports_conflict() {
        let gateway = InMemoryGateway::new();
        let name = ProjectName::from("alice");

        assert!(gateway.create_project(&name).await.is_ok());
        let second = gateway.create_project(&name).await;
        assert!(second.is_err_and(|e| e.is_already_exists()));
    }

    #[tokio::test]
    async fn test_delete_missing_project_is_not_found() {
        let gateway = InMemoryGateway::new();
        let result = gateway.delete_project(&ProjectName::from("ghost")).await;
        assert!(result.is_err_and(|e| e.is_not_found()));
    }

    #[tokio::test]
    async fn test_role_binding_requires_project() {
        let gateway = InMemoryGateway::new();
        let result = gateway.create_role_binding(&edit_binding("alice")).await;
        assert!(result.is_err_and(|e| e.is_not_found()));
    }

    #[tokio::test]
    async fn test_deleting_project_drops_its_bindings() {
        let gateway = InMemoryGateway::new();
        gateway.insert_role_binding(edit_binding("alice")).await;
        assert_eq!(gateway.role_bindings("alice").await.len(), 1);

        assert!(gateway
            .delete_project(&ProjectName::from("alice"))
            .await
            .is_ok());
        assert!(gateway.role_bindings("alice").await.is_empty());
        assert!(!gateway.has_project("alice").await);
    }

    #[tokio::test]
    async fn test_injected_failure_is_reported_and_logged() {
        let gateway = InMemoryGateway::new();
        gateway
            .fail_on(GatewayOp::GetProject, "alice", "connection refused")
            .await;

        let result = gateway.get_project(&ProjectName::from("alice")).await;
        assert!(matches!(result, Err(GatewayError::Other { .. })));
        assert_eq!(gateway.call_count(GatewayOp::GetProject, "alice").await, 1);

        gateway.clear_failures().await;
        let result = gateway.get_project(&ProjectName::from("alice")).await;
        assert!(result.is_err_and(|e| e.is_not_found()));
    }

    #[tokio::test]
    async fn test_snapshot_lists_projects() -> serde_json::Result<()> {
        let gateway = InMemoryGateway::new();
        gateway.insert_project("alice").await;
        let snapshot = gateway.snapshot_json().await?;
        assert!(snapshot.get("alice").is_some());
        Ok(())
    }
}
