//! User identity types: roles, permission bundles, and the authenticated
//! user produced by token validation.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// User roles, derived from the email allow-lists at startup.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UserRole {
    /// Regular user.
    User,
    /// Operational admin.
    Admin,
    /// Full-control admin; may mutate role assignments.
    SuperAdmin,
}

impl UserRole {
    /// Stable wire name.
    pub fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Admin => "admin",
            Self::SuperAdmin => "super_admin",
        }
    }
}

impl std::fmt::Display for UserRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Fixed permission bundle per role.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Permissions {
    /// May submit guidance requests.
    pub can_use_guidance: bool,
    /// May view their own usage.
    pub can_view_own_usage: bool,
    /// May view the cost dashboard.
    pub can_view_cost_dashboard: bool,
    /// May manage users.
    pub can_manage_users: bool,
    /// May block users.
    pub can_block_users: bool,
    /// May view system-wide costs.
    pub can_view_system_costs: bool,
    /// May set budget caps.
    pub can_configure_budgets: bool,
    /// May call admin endpoints.
    pub can_access_admin_endpoints: bool,
    /// May clear budget blocks and overrides.
    pub can_override_budget_limits: bool,
    /// May operate emergency controls.
    pub can_manage_emergency_controls: bool,
}

impl Permissions {
    /// The permission bundle for a role.
    pub fn for_role(role: UserRole) -> Self {
        let user = Self {
            can_use_guidance: true,
            can_view_own_usage: true,
            can_view_cost_dashboard: false,
            can_manage_users: false,
            can_block_users: false,
            can_view_system_costs: false,
            can_configure_budgets: false,
            can_access_admin_endpoints: false,
            can_override_budget_limits: false,
            can_manage_emergency_controls: false,
        };
        match role {
            UserRole::User => user,
            UserRole::Admin => Self {
                can_view_cost_dashboard: true,
                can_manage_users: true,
                can_block_users: true,
                can_view_system_costs: true,
                can_configure_budgets: true,
                can_access_admin_endpoints: true,
                ..user
            },
            UserRole::SuperAdmin => Self {
                can_view_cost_dashboard: true,
                can_manage_users: true,
                can_block_users: true,
                can_view_system_costs: true,
                can_configure_budgets: true,
                can_access_admin_endpoints: true,
                can_override_budget_limits: true,
                can_manage_emergency_controls: true,
                ..user
            },
        }
    }
}

/// A validated caller. Role and permissions are derived once per request
/// from the startup allow-lists; there is no per-request role mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuthenticatedUser {
    /// Subject id from the token (`sub`/`oid`).
    pub subject: String,
    /// Email, lowercased.
    pub email: String,
    /// Display name.
    pub name: String,
    /// Derived role.
    pub role: UserRole,
    /// Derived permission bundle.
    pub permissions: Permissions,
    /// Last-login timestamp.
    pub last_login: DateTime<Utc>,
    /// Whether the account is active.
    pub active: bool,
}
