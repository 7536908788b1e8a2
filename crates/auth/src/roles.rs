use std::borrow::Cow;

use serde::{Deserialize, Serialize};

/// Role name carried by a credential or stored on a user row.
///
/// Roles stay opaque strings at this layer; the two the platform knows about
/// are exposed as constants and callers decide what an unknown role means.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Role(Cow<'static, str>);

impl Role {
    /// Teaching-committee member; owns and manages courses.
    pub const ADMIN: Role = Role(Cow::Borrowed("admin"));
    pub const STUDENT: Role = Role(Cow::Borrowed("student"));

    pub fn new(name: impl Into<Cow<'static, str>>) -> Self {
        Self(name.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn is_admin(&self) -> bool {
        self.as_str() == "admin"
    }

    pub fn is_student(&self) -> bool {
        self.as_str() == "student"
    }
}

impl core::fmt::Display for Role {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for Role {
    fn from(value: &str) -> Self {
        Self(Cow::Owned(value.to_string()))
    }
}
