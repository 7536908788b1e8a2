use serde::{Deserialize, Serialize};
use thiserror::Error;

use eduapp_core::UserId;

use crate::Role;

/// Already-authenticated caller identity.
///
/// Produced by the token layer and placed on job payloads as-is.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credential {
    pub user_id: UserId,
    pub role: Role,
    pub user_name: String,
}

impl Credential {
    pub fn new(user_id: UserId, role: Role, user_name: impl Into<String>) -> Self {
        Self {
            user_id,
            role,
            user_name: user_name.into(),
        }
    }
}

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum CredentialError {
    #[error("credential has a non-positive user id ({0})")]
    InvalidUserId(i64),

    #[error("credential has an empty user name")]
    MissingUserName,

    #[error("credential has an empty role")]
    MissingRole,

    #[error("credential does not match stored user {user_name} (expected id {expected}, got {actual})")]
    Mismatch {
        user_name: String,
        expected: UserId,
        actual: UserId,
    },
}

/// Structurally validate a credential taken from a job payload.
///
/// Cross-checking against the stored user is up to the caller, see
/// [`Credential::matches`].
pub fn validate_credential(credential: &Credential) -> Result<(), CredentialError> {
    if credential.user_id.get() <= 0 {
        return Err(CredentialError::InvalidUserId(credential.user_id.get()));
    }
    if credential.user_name.trim().is_empty() {
        return Err(CredentialError::MissingUserName);
    }
    if credential.role.as_str().trim().is_empty() {
        return Err(CredentialError::MissingRole);
    }
    Ok(())
}

impl Credential {
    /// Check that the stored user looked up by `user_name` is the same user
    /// the credential claims to be.
    pub fn matches(&self, stored_user_id: UserId) -> Result<(), CredentialError> {
        if self.user_id != stored_user_id {
            return Err(CredentialError::Mismatch {
                user_name: self.user_name.clone(),
                expected: stored_user_id,
                actual: self.user_id,
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cred() -> Credential {
        Credential::new(UserId::new(5), Role::ADMIN, "alice")
    }

    #[test]
    fn valid_credential_passes() {
        assert!(validate_credential(&cred()).is_ok());
    }

    #[test]
    fn rejects_empty_user_name() {
        let mut c = cred();
        c.user_name = "  ".to_string();
        assert_eq!(validate_credential(&c), Err(CredentialError::MissingUserName));
    }

    #[test]
    fn rejects_non_positive_id() {
        let mut c = cred();
        c.user_id = UserId::new(0);
        assert_eq!(validate_credential(&c), Err(CredentialError::InvalidUserId(0)));
    }

    #[test]
    fn mismatch_against_stored_user() {
        let err = cred().matches(UserId::new(6)).unwrap_err();
        assert!(matches!(err, CredentialError::Mismatch { .. }));
        assert!(cred().matches(UserId::new(5)).is_ok());
    }

    #[test]
    fn serializes_with_snake_case_fields() {
        let json = serde_json::to_value(cred()).unwrap();
        assert_eq!(json["user_id"], 5);
        assert_eq!(json["role"], "admin");
        assert_eq!(json["user_name"], "alice");
    }
}
