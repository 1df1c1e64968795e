//! String-backed identifier newtypes

use serde::{Deserialize, Serialize};

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub String);

        impl $name {
            pub fn new(id: impl Into<String>) -> Self {
                Self(id.into())
            }

            pub fn generate() -> Self {
                Self(uuid::Uuid::new_v4().to_string())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }

            pub fn short(&self) -> &str {
                &self.0[..8.min(self.0.len())]
            }
        }

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "{}", self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }
    };
}

string_id!(
    /// Identifier of one flow definition row (one version of one business code)
    FlowDefinitionId
);
string_id!(
    /// Identifier of a running or finished flow instance
    FlowInstanceId
);
string_id!(
    /// Identifier of an approval task
    TaskId
);
string_id!(
    /// Identifier of a graph node, unique within one definition
    NodeId
);
string_id!(
    /// Identity directory user id
    UserId
);
string_id!(
    /// Identity directory department id
    DeptId
);
string_id!(
    /// Identity directory role id
    RoleId
);
string_id!(FlowLogId);
string_id!(CopyRecordId);
