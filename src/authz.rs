//! Role predicates for presentation code.
//!
//! These only decide what to render. The identity service enforces
//! authorization on every protected call regardless of what they return.

use crate::types::Role;

pub const ROLE_ADMIN: &str = "ROLE_ADMIN";
pub const ROLE_USER: &str = "ROLE_USER";

#[must_use]
pub fn has_role(roles: &[Role], role: &str) -> bool {
    roles.iter().any(|r| r.as_str() == role)
}

#[must_use]
pub fn has_any_role(roles: &[Role], wanted: &[&str]) -> bool {
    wanted.iter().any(|role| has_role(roles, role))
}

/// Whether privileged (admin) views may be shown.
#[must_use]
pub fn is_admin(roles: &[Role]) -> bool {
    has_role(roles, ROLE_ADMIN)
}
