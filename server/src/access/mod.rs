//! TokenGate: bearer-token authorization.
//!
//! Every request (other than the health check) carries a JWT bearer token.
//! `apply_auth` (see [`http`]) extracts the tenant id from the URI,
//! resolves that tenant's verification key via [`crate::tenant_keys`],
//! decodes the token, and attaches the resulting [`Claims`] to the request.
//! Route handlers then call [`Claims::require_any_role`] with the roles
//! their operation requires.
//!
//! ## Supplying the token
//!
//! - As a normal Bearer token.
//! - As the password in Basic Auth. The username is ignored.

pub mod http;

use filegate_token::Token;

use crate::error::{ServerError, ServerResult};

/// Roles allowed to read or write tenant data (spec §4.1, §6.1 upload/
/// resumable/proxy routes).
pub const IMPORT_EXPORT_ROLES: &[&str] = &["import_user", "export_user", "admin_user"];

/// Roles allowed to list or download exported files (spec §4.1, §6.1 `export`).
pub const EXPORT_ROLES: &[&str] = &["export_user", "admin_user"];

/// The authenticated caller's claims, as exposed to route handlers.
#[derive(Debug, Clone)]
pub struct Claims {
    user: String,
    groups: Vec<String>,
    roles: Vec<String>,
}

impl From<&Token> for Claims {
    fn from(token: &Token) -> Self {
        Self {
            user: token.user().to_owned(),
            groups: token.groups().to_owned(),
            roles: token.roles().to_owned(),
        }
    }
}

impl Claims {
    pub fn user(&self) -> &str {
        &self.user
    }

    pub fn groups(&self) -> &[String] {
        &self.groups
    }

    pub fn roles(&self) -> &[String] {
        &self.roles
    }

    /// Requires that at least one of `roles_allowed` is present in
    /// `claims.roles` (spec §4.1).
    pub fn require_any_role(&self, roles_allowed: &[&str]) -> ServerResult<()> {
        if roles_allowed
            .iter()
            .any(|r| self.roles.iter().any(|g| g == r))
        {
            Ok(())
        } else {
            tracing::debug!(user = %self.user, "caller has none of the required roles");
            Err(ServerError::AuthRejected)
        }
    }

    /// Requires that `group` is among `claims.groups`.
    pub fn require_group(&self, group: &str) -> ServerResult<()> {
        if self.groups.iter().any(|g| g == group) {
            Ok(())
        } else {
            Err(ServerError::AuthRejected)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn claims(roles: &[&str], groups: &[&str]) -> Claims {
        Claims {
            user: "alice".to_owned(),
            groups: groups.iter().map(|s| s.to_string()).collect(),
            roles: roles.iter().map(|s| s.to_string()).collect(),
        }
    }

    #[test]
    fn test_require_any_role_accepts_overlap() {
        claims(&["import_user"], &[])
            .require_any_role(IMPORT_EXPORT_ROLES)
            .unwrap();
    }

    #[test]
    fn test_require_any_role_rejects_no_overlap() {
        let err = claims(&["guest"], &[]).require_any_role(IMPORT_EXPORT_ROLES).unwrap_err();
        assert!(matches!(err, ServerError::AuthRejected));
    }

    #[test]
    fn test_require_any_role_export_rejects_import_only() {
        let err = claims(&["import_user"], &[]).require_any_role(EXPORT_ROLES).unwrap_err();
        assert!(matches!(err, ServerError::AuthRejected));
    }

    #[test]
    fn test_require_group_membership() {
        let c = claims(&[], &["p11-member-group"]);
        c.require_group("p11-member-group").unwrap();
        assert!(matches!(c.require_group("p12-member-group"), Err(ServerError::AuthRejected)));
    }
}
