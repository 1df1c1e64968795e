//! Assignee resolution: turns a node's assignee rule into concrete identities
//!
//! An empty result is not an error. It tells the engine to apply the
//! node's empty-assignee policy.

use crate::condition_evaluator::lookup_path;
use crate::directory::Directory;
use bpm_types::{AssigneeRule, DeptId, DirectoryUser, FlowResult, Identity, RoleId, UserId};
use serde_json::Value;
use std::collections::HashSet;
use std::sync::Arc;

/// Who started the instance and what they submitted
#[derive(Clone, Copy, Debug)]
pub struct ResolveContext<'a> {
    pub initiator_id: &'a UserId,
    pub initiator_dept: Option<&'a DeptId>,
    pub form: &'a Value,
}

/// Resolves assignee rules against the identity directory
#[derive(Clone)]
pub struct AssigneeResolver {
    directory: Arc<dyn Directory>,
}

impl AssigneeResolver {
    pub fn new(directory: Arc<dyn Directory>) -> Self {
        Self { directory }
    }

    pub fn directory(&self) -> &Arc<dyn Directory> {
        &self.directory
    }

    /// Resolve a rule to enabled, non-deleted identities, deduplicated by id
    /// in first-seen order.
    pub async fn resolve(
        &self,
        rule: &AssigneeRule,
        ctx: ResolveContext<'_>,
    ) -> FlowResult<Vec<Identity>> {
        let users = match rule {
            AssigneeRule::Role { role_ids } => self.by_roles(role_ids).await?,
            AssigneeRule::DeptLeader { dept_id } => {
                let dept = dept_id.as_ref().or(ctx.initiator_dept);
                self.dept_leader(dept).await?
            }
            AssigneeRule::SpecificUser { user_ids } => self.specific_users(user_ids).await?,
            AssigneeRule::InitiatorLeader => self.dept_leader(ctx.initiator_dept).await?,
            AssigneeRule::FormField { field } => {
                let ids = user_ids_from_form(ctx.form, field);
                self.specific_users(&ids).await?
            }
        };

        let mut seen = HashSet::new();
        let identities = users
            .into_iter()
            .filter(|u| u.is_active())
            .filter(|u| seen.insert(u.id.clone()))
            .map(|u| u.identity())
            .collect::<Vec<_>>();

        tracing::debug!(
            initiator = %ctx.initiator_id,
            resolved = identities.len(),
            "Resolved assignees"
        );
        Ok(identities)
    }

    /// The fallback assignee for the TO_ADMIN policy: the first enabled
    /// holder of the admin role.
    pub async fn admin_fallback(&self, admin_role: &RoleId) -> FlowResult<Option<Identity>> {
        let admins = self.by_roles(std::slice::from_ref(admin_role)).await?;
        Ok(admins.into_iter().find(|u| u.is_active()).map(|u| u.identity()))
    }

    async fn by_roles(&self, role_ids: &[RoleId]) -> FlowResult<Vec<DirectoryUser>> {
        if role_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.directory.users_by_roles(role_ids).await?)
    }

    async fn specific_users(&self, user_ids: &[UserId]) -> FlowResult<Vec<DirectoryUser>> {
        if user_ids.is_empty() {
            return Ok(Vec::new());
        }
        Ok(self.directory.users_by_ids(user_ids).await?)
    }

    async fn dept_leader(&self, dept_id: Option<&DeptId>) -> FlowResult<Vec<DirectoryUser>> {
        let Some(dept_id) = dept_id else {
            return Ok(Vec::new());
        };
        let Some(dept) = self.directory.department(dept_id).await? else {
            tracing::debug!(dept_id = %dept_id, "Department not found");
            return Ok(Vec::new());
        };
        let Some(leader_id) = dept.leader_id else {
            return Ok(Vec::new());
        };
        let mut leaders = self.directory.users_by_ids(&[leader_id]).await?;
        for leader in &mut leaders {
            if leader.dept_name.is_none() && leader.dept_id.as_ref() == Some(&dept.id) {
                leader.dept_name = Some(dept.name.clone());
            }
        }
        Ok(leaders)
    }
}

/// Read user id(s) from a form field: a scalar id or an array of ids.
/// Numbers are accepted and stringified; anything else is ignored.
fn user_ids_from_form(form: &Value, field: &str) -> Vec<UserId> {
    fn scalar(value: &Value) -> Option<UserId> {
        match value {
            Value::String(s) if !s.trim().is_empty() => Some(UserId::new(s.trim())),
            Value::Number(n) => Some(UserId::new(n.to_string())),
            _ => None,
        }
    }

    match lookup_path(form, field) {
        Some(Value::Array(items)) => items.iter().filter_map(scalar).collect(),
        Some(value) => scalar(value).into_iter().collect(),
        None => Vec::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::directory::MemoryDirectory;
    use bpm_types::Department;
    use serde_json::json;

    async fn resolver() -> AssigneeResolver {
        let dir = MemoryDirectory::new();
        dir.insert_user(DirectoryUser::new("m1", "Mia").in_dept("sales", "Sales").with_role("manager"))
            .await;
        dir.insert_user(DirectoryUser::new("m2", "Max").with_role("manager").with_role("finance"))
            .await;
        dir.insert_user(DirectoryUser::new("m3", "Moe").with_role("manager").disabled())
            .await;
        dir.insert_user(DirectoryUser::new("e1", "Eve").in_dept("sales", "Sales"))
            .await;
        dir.insert_user(DirectoryUser::new("a1", "Ada").with_role("admin").disabled())
            .await;
        dir.insert_user(DirectoryUser::new("a2", "Abe").with_role("admin"))
            .await;
        dir.insert_department(Department::new("sales", "Sales").with_leader("m1"))
            .await;
        dir.insert_department(Department::new("empty", "No Leader"))
            .await;
        AssigneeResolver::new(Arc::new(dir))
    }

    fn ctx<'a>(initiator: &'a UserId, dept: Option<&'a DeptId>, form: &'a Value) -> ResolveContext<'a> {
        ResolveContext {
            initiator_id: initiator,
            initiator_dept: dept,
            form,
        }
    }

    fn ids(identities: &[Identity]) -> Vec<&str> {
        identities.iter().map(|i| i.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_role_filters_disabled_and_dedupes() {
        let r = resolver().await;
        let initiator = UserId::new("e1");
        let form = json!({});
        let rule = AssigneeRule::Role {
            role_ids: vec![RoleId::new("manager"), RoleId::new("finance")],
        };
        let out = r.resolve(&rule, ctx(&initiator, None, &form)).await.unwrap();
        assert_eq!(ids(&out), vec!["m1", "m2"]);
    }

    #[tokio::test]
    async fn test_dept_leader_explicit_and_fallback() {
        let r = resolver().await;
        let initiator = UserId::new("e1");
        let sales = DeptId::new("sales");
        let form = json!({});

        let explicit = AssigneeRule::DeptLeader {
            dept_id: Some(DeptId::new("sales")),
        };
        let out = r.resolve(&explicit, ctx(&initiator, None, &form)).await.unwrap();
        assert_eq!(ids(&out), vec!["m1"]);
        assert_eq!(out[0].dept_name.as_deref(), Some("Sales"));

        let implicit = AssigneeRule::DeptLeader { dept_id: None };
        let out = r.resolve(&implicit, ctx(&initiator, Some(&sales), &form)).await.unwrap();
        assert_eq!(ids(&out), vec!["m1"]);

        let no_leader = AssigneeRule::DeptLeader {
            dept_id: Some(DeptId::new("empty")),
        };
        assert!(r.resolve(&no_leader, ctx(&initiator, None, &form)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_initiator_leader() {
        let r = resolver().await;
        let initiator = UserId::new("e1");
        let sales = DeptId::new("sales");
        let form = json!({});
        let out = r
            .resolve(&AssigneeRule::InitiatorLeader, ctx(&initiator, Some(&sales), &form))
            .await
            .unwrap();
        assert_eq!(ids(&out), vec!["m1"]);

        let none = r
            .resolve(&AssigneeRule::InitiatorLeader, ctx(&initiator, None, &form))
            .await
            .unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn test_specific_users_filters_inactive() {
        let r = resolver().await;
        let initiator = UserId::new("e1");
        let form = json!({});
        let rule = AssigneeRule::SpecificUser {
            user_ids: vec![UserId::new("m3"), UserId::new("e1"), UserId::new("ghost")],
        };
        let out = r.resolve(&rule, ctx(&initiator, None, &form)).await.unwrap();
        assert_eq!(ids(&out), vec!["e1"]);
    }

    #[tokio::test]
    async fn test_form_field_scalar_and_array() {
        let r = resolver().await;
        let initiator = UserId::new("e1");
        let rule = AssigneeRule::FormField {
            field: "reviewers".into(),
        };

        let form = json!({"reviewers": ["m2", "e1", "m2"]});
        let out = r.resolve(&rule, ctx(&initiator, None, &form)).await.unwrap();
        assert_eq!(ids(&out), vec!["m2", "e1"]);

        let form = json!({"reviewers": "m1"});
        let out = r.resolve(&rule, ctx(&initiator, None, &form)).await.unwrap();
        assert_eq!(ids(&out), vec!["m1"]);

        let form = json!({"other": "m1"});
        assert!(r.resolve(&rule, ctx(&initiator, None, &form)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_admin_fallback_skips_disabled() {
        let r = resolver().await;
        let admin = r.admin_fallback(&RoleId::new("admin")).await.unwrap().unwrap();
        assert_eq!(admin.id, UserId::new("a2"));
        assert!(r.admin_fallback(&RoleId::new("nobody")).await.unwrap().is_none());
    }
}
