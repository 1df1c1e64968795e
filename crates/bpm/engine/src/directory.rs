//! Identity directory contract and an in-memory implementation

use crate::error::DirectoryResult;
use async_trait::async_trait;
use bpm_types::{Department, DeptId, DirectoryUser, RoleId, UserId};
use indexmap::IndexMap;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;

/// Read-only identity lookups consumed by assignee resolution.
///
/// Implementations return raw records, including disabled and deleted
/// users; filtering is the caller's job.
#[async_trait]
pub trait Directory: Send + Sync {
    /// Users with the given ids, in request order; unknown ids are skipped
    async fn users_by_ids(&self, ids: &[UserId]) -> DirectoryResult<Vec<DirectoryUser>>;

    /// Users holding any of the roles
    async fn users_by_roles(&self, roles: &[RoleId]) -> DirectoryResult<Vec<DirectoryUser>>;

    /// Users belonging to a department
    async fn users_by_department(&self, dept: &DeptId) -> DirectoryResult<Vec<DirectoryUser>>;

    /// Department record, if it exists
    async fn department(&self, dept: &DeptId) -> DirectoryResult<Option<Department>>;

    /// Single-user lookup
    async fn user(&self, id: &UserId) -> DirectoryResult<Option<DirectoryUser>> {
        let mut users = self.users_by_ids(std::slice::from_ref(id)).await?;
        Ok(users.pop())
    }
}

/// In-memory directory for development, tests and fixture seeding
#[derive(Debug, Default, Clone)]
pub struct MemoryDirectory {
    users: Arc<RwLock<IndexMap<UserId, DirectoryUser>>>,
    departments: Arc<RwLock<HashMap<DeptId, Department>>>,
}

impl MemoryDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert_user(&self, user: DirectoryUser) {
        self.users.write().await.insert(user.id.clone(), user);
    }

    pub async fn insert_department(&self, dept: Department) {
        self.departments.write().await.insert(dept.id.clone(), dept);
    }

    /// Soft-delete or re-enable a user in place
    pub async fn set_enabled(&self, id: &UserId, enabled: bool) -> bool {
        match self.users.write().await.get_mut(id) {
            Some(user) => {
                user.enabled = enabled;
                true
            }
            None => false,
        }
    }

    pub async fn user_count(&self) -> usize {
        self.users.read().await.len()
    }
}

#[async_trait]
impl Directory for MemoryDirectory {
    async fn users_by_ids(&self, ids: &[UserId]) -> DirectoryResult<Vec<DirectoryUser>> {
        let users = self.users.read().await;
        Ok(ids.iter().filter_map(|id| users.get(id).cloned()).collect())
    }

    async fn users_by_roles(&self, roles: &[RoleId]) -> DirectoryResult<Vec<DirectoryUser>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .filter(|u| roles.iter().any(|r| u.has_role(r)))
            .cloned()
            .collect())
    }

    async fn users_by_department(&self, dept: &DeptId) -> DirectoryResult<Vec<DirectoryUser>> {
        let users = self.users.read().await;
        Ok(users
            .values()
            .filter(|u| u.dept_id.as_ref() == Some(dept))
            .cloned()
            .collect())
    }

    async fn department(&self, dept: &DeptId) -> DirectoryResult<Option<Department>> {
        Ok(self.departments.read().await.get(dept).cloned())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn directory() -> MemoryDirectory {
        let dir = MemoryDirectory::new();
        dir.insert_user(DirectoryUser::new("u1", "Ann").in_dept("d1", "Sales").with_role("manager"))
            .await;
        dir.insert_user(DirectoryUser::new("u2", "Ben").in_dept("d1", "Sales"))
            .await;
        dir.insert_user(DirectoryUser::new("u3", "Cat").with_role("manager").disabled())
            .await;
        dir.insert_department(Department::new("d1", "Sales").with_leader("u1"))
            .await;
        dir
    }

    #[tokio::test]
    async fn test_users_by_ids_keeps_request_order() {
        let dir = directory().await;
        let users = dir
            .users_by_ids(&[UserId::new("u2"), UserId::new("missing"), UserId::new("u1")])
            .await
            .unwrap();
        let ids: Vec<&str> = users.iter().map(|u| u.id.as_str()).collect();
        assert_eq!(ids, vec!["u2", "u1"]);
    }

    #[tokio::test]
    async fn test_users_by_roles_returns_raw_records() {
        let dir = directory().await;
        let users = dir.users_by_roles(&[RoleId::new("manager")]).await.unwrap();
        assert_eq!(users.len(), 2);
        assert!(users.iter().any(|u| !u.enabled));
    }

    #[tokio::test]
    async fn test_department_lookup() {
        let dir = directory().await;
        let dept = dir.department(&DeptId::new("d1")).await.unwrap().unwrap();
        assert_eq!(dept.leader_id, Some(UserId::new("u1")));
        assert!(dir.department(&DeptId::new("nope")).await.unwrap().is_none());
        assert_eq!(dir.users_by_department(&DeptId::new("d1")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_single_user_lookup_and_disable() {
        let dir = directory().await;
        assert!(dir.set_enabled(&UserId::new("u2"), false).await);
        let user = dir.user(&UserId::new("u2")).await.unwrap().unwrap();
        assert!(!user.enabled);
        assert!(dir.user(&UserId::new("zz")).await.unwrap().is_none());
    }
}
