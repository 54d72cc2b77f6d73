//! Email-to-role mapping from the startup allow-lists.
//!
//! Runtime mutations are in-memory only and gated to super-admin callers;
//! durable role changes go through configuration reload.

use crate::auth::models::{Permissions, UserRole};
use crate::error::AuthzError;
use crate::logging::{log_info, log_warn};
use std::collections::HashSet;
use std::sync::RwLock;

/// Maps emails to roles using the configured allow-lists.
#[derive(Debug)]
pub struct RoleManager {
    admins: RwLock<HashSet<String>>,
    super_admins: RwLock<HashSet<String>>,
}

impl RoleManager {
    /// Build from the configured allow-lists (already lowercased).
    pub fn new(admin_emails: &[String], super_admin_emails: &[String]) -> Self {
        Self {
            admins: RwLock::new(admin_emails.iter().cloned().collect()),
            super_admins: RwLock::new(super_admin_emails.iter().cloned().collect()),
        }
    }

    /// Derive the role for an email. Case-insensitive.
    pub fn role(&self, email: &str) -> UserRole {
        let email = email.to_lowercase();
        if self.super_admins.read().expect("role lock").contains(&email) {
            UserRole::SuperAdmin
        } else if self.admins.read().expect("role lock").contains(&email) {
            UserRole::Admin
        } else {
            UserRole::User
        }
    }

    /// The permission bundle for a role.
    pub fn permissions(&self, role: UserRole) -> Permissions {
        Permissions::for_role(role)
    }

    /// Grant admin to `email`. Caller must hold super-admin.
    ///
    /// The grant does not persist across restarts.
    pub fn add_admin(&self, caller_role: UserRole, email: &str) -> Result<(), AuthzError> {
        self.require_super_admin(caller_role)?;
        let email = email.to_lowercase();
        self.admins.write().expect("role lock").insert(email.clone());
        log_info!(email = %email, "Admin role granted (in-memory)");
        Ok(())
    }

    /// Revoke admin from `email`. Caller must hold super-admin.
    pub fn remove_admin(&self, caller_role: UserRole, email: &str) -> Result<(), AuthzError> {
        self.require_super_admin(caller_role)?;
        let email = email.to_lowercase();
        let removed = self.admins.write().expect("role lock").remove(&email);
        if !removed {
            log_warn!(email = %email, "Admin revocation for email that held no admin role");
        }
        Ok(())
    }

    fn require_super_admin(&self, caller_role: UserRole) -> Result<(), AuthzError> {
        if caller_role != UserRole::SuperAdmin {
            return Err(AuthzError::InsufficientRole {
                required: UserRole::SuperAdmin.as_str().to_string(),
                actual: caller_role.as_str().to_string(),
            });
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn manager() -> RoleManager {
        RoleManager::new(
            &["admin@example.com".to_string()],
            &["root@example.com".to_string()],
        )
    }

    #[test]
    fn test_role_derivation_precedence() {
        let m = manager();
        assert_eq!(m.role("root@example.com"), UserRole::SuperAdmin);
        assert_eq!(m.role("admin@example.com"), UserRole::Admin);
        assert_eq!(m.role("anyone@example.com"), UserRole::User);
    }

    #[test]
    fn test_role_lookup_is_case_insensitive() {
        let m = manager();
        assert_eq!(m.role("Admin@Example.COM"), UserRole::Admin);
    }

    #[test]
    fn test_admin_mutation_requires_super_admin() {
        let m = manager();

        let err = m.add_admin(UserRole::Admin, "new@example.com").unwrap_err();
        assert!(matches!(err, AuthzError::InsufficientRole { .. }));

        m.add_admin(UserRole::SuperAdmin, "new@example.com").unwrap();
        assert_eq!(m.role("new@example.com"), UserRole::Admin);

        m.remove_admin(UserRole::SuperAdmin, "new@example.com").unwrap();
        assert_eq!(m.role("new@example.com"), UserRole::User);
    }
}
