//! Identities as seen through the directory, and the acting principal

use crate::{DeptId, RoleId, UserId};
use serde::{Deserialize, Serialize};

/// A resolved assignee
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Identity {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dept_id: Option<DeptId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dept_name: Option<String>,
}

/// A user record as returned by the identity directory
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirectoryUser {
    pub id: UserId,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dept_id: Option<DeptId>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dept_name: Option<String>,
    #[serde(default)]
    pub role_ids: Vec<RoleId>,
    #[serde(default = "default_enabled")]
    pub enabled: bool,
    #[serde(default)]
    pub deleted: bool,
}

fn default_enabled() -> bool {
    true
}

impl DirectoryUser {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: UserId::new(id),
            name: name.into(),
            dept_id: None,
            dept_name: None,
            role_ids: Vec::new(),
            enabled: true,
            deleted: false,
        }
    }

    pub fn in_dept(mut self, dept_id: impl Into<String>, dept_name: impl Into<String>) -> Self {
        self.dept_id = Some(DeptId::new(dept_id));
        self.dept_name = Some(dept_name.into());
        self
    }

    pub fn with_role(mut self, role: impl Into<String>) -> Self {
        self.role_ids.push(RoleId::new(role));
        self
    }

    pub fn disabled(mut self) -> Self {
        self.enabled = false;
        self
    }

    /// Enabled and not soft-deleted
    pub fn is_active(&self) -> bool {
        self.enabled && !self.deleted
    }

    pub fn has_role(&self, role: &RoleId) -> bool {
        self.role_ids.contains(role)
    }

    pub fn identity(&self) -> Identity {
        Identity {
            id: self.id.clone(),
            name: self.name.clone(),
            dept_id: self.dept_id.clone(),
            dept_name: self.dept_name.clone(),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Department {
    pub id: DeptId,
    pub name: String,
    /// User id of the department leader, if configured
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub leader_id: Option<UserId>,
}

impl Department {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        Self {
            id: DeptId::new(id),
            name: name.into(),
            leader_id: None,
        }
    }

    pub fn with_leader(mut self, leader: impl Into<String>) -> Self {
        self.leader_id = Some(UserId::new(leader));
        self
    }
}

/// The principal performing an operation. Passed explicitly to every
/// mutating call.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Actor {
    User { id: UserId, name: String },
    System,
}

impl Actor {
    pub fn user(id: UserId, name: impl Into<String>) -> Self {
        Self::User {
            id,
            name: name.into(),
        }
    }

    pub fn user_id(&self) -> Option<&UserId> {
        match self {
            Self::User { id, .. } => Some(id),
            Self::System => None,
        }
    }

    pub fn display_name(&self) -> &str {
        match self {
            Self::User { name, .. } => name,
            Self::System => "system",
        }
    }

    pub fn is(&self, user: &UserId) -> bool {
        self.user_id() == Some(user)
    }
}

impl std::fmt::Display for Actor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::User { id, .. } => write!(f, "user:{}", id),
            Self::System => f.write_str("system"),
        }
    }
}

impl From<&DirectoryUser> for Actor {
    fn from(user: &DirectoryUser) -> Self {
        Self::user(user.id.clone(), user.name.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directory_user_activity() {
        let user = DirectoryUser::new("u1", "Ann").with_role("manager");
        assert!(user.is_active());
        assert!(user.has_role(&RoleId::new("manager")));
        assert!(!user.clone().disabled().is_active());

        let mut deleted = user;
        deleted.deleted = true;
        assert!(!deleted.is_active());
    }

    #[test]
    fn test_actor_identity_checks() {
        let actor = Actor::user(UserId::new("u1"), "Ann");
        assert!(actor.is(&UserId::new("u1")));
        assert!(!actor.is(&UserId::new("u2")));
        assert!(!Actor::System.is(&UserId::new("u1")));
        assert_eq!(Actor::System.to_string(), "system");
    }

    #[test]
    fn test_user_deserializes_enabled_by_default() {
        let user: DirectoryUser =
            serde_json::from_str(r#"{"id": "u9", "name": "Zed", "role_ids": ["admin"]}"#).unwrap();
        assert!(user.enabled);
        assert!(!user.deleted);
    }
}
