//! `eduapp-auth`: the authenticated identity boundary.
//!
//! Token issuance and verification happen upstream. Jobs carry the resulting
//! [`Credential`] explicitly in their payload and handlers validate it; nothing
//! here looks identity up from ambient state.

pub mod credential;
pub mod roles;

pub use credential::{Credential, CredentialError, validate_credential};
pub use roles::Role;
