//! Authorization module - permission codes, policy engine and enforcement
//!
//! - `module:action` permission codes with module and global wildcards
//! - pattern expansion for declarative role setup
//! - pluggable policy evaluator with factory scoping
//! - configurable enforcement modes (off/advisory/strict)

mod evaluator;
pub mod patterns;
mod principal;

pub use evaluator::{DefaultPolicyEvaluator, PolicyEvaluator};
pub use patterns::{has_permission, resolve_permission_patterns, PatternResolution};
pub use principal::{Principal, ResourceContext};

use crate::errors::AppError;

/// Authorization enforcement mode
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthzMode {
    /// No permission checks (development mode)
    Off,
    /// Log denials but allow requests (testing mode)
    Advisory,
    /// Enforce 403 on denied requests (production mode)
    Strict,
}

impl AuthzMode {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "off" => AuthzMode::Off,
            "advisory" => AuthzMode::Advisory,
            _ => AuthzMode::Strict,
        }
    }
}

/// Evaluates `permission` and applies the enforcement mode.
pub async fn enforce(
    evaluator: &dyn PolicyEvaluator,
    mode: AuthzMode,
    principal: &Principal,
    permission: &str,
    ctx: &ResourceContext,
) -> Result<(), AppError> {
    if mode == AuthzMode::Off {
        return Ok(());
    }

    let allowed = evaluator.can(principal, permission, ctx).await;
    apply(mode, principal, allowed, || format!("missing permission {permission}"))
}

/// Applies the enforcement mode to a decision made outside the evaluator.
pub fn apply(
    mode: AuthzMode,
    principal: &Principal,
    allowed: bool,
    denial: impl FnOnce() -> String,
) -> Result<(), AppError> {
    if allowed || mode == AuthzMode::Off {
        return Ok(());
    }

    let message = denial();
    match mode {
        AuthzMode::Advisory => {
            tracing::warn!(
                user_id = %principal.user_id,
                denial = %message,
                "advisory mode: permission denied but request allowed"
            );
            Ok(())
        }
        _ => Err(AppError::forbidden(message)),
    }
}

/// Well-known role codes
pub mod roles {
    pub const SUPER_ADMIN: &str = "SUPER_ADMIN";
    pub const FACTORY_ADMIN: &str = "FACTORY_ADMIN";
    pub const SAFETY_MANAGER: &str = "SAFETY_MANAGER";
    pub const INSPECTOR: &str = "INSPECTOR";
}

/// Well-known permission codes
pub mod permissions {
    // Equipment
    pub const EQUIPMENT_READ: &str = "equipment:read";

    // Inspection
    pub const INSPECTION_READ_OWN: &str = "inspection:read:own";
    pub const INSPECTION_CREATE: &str = "inspection:create";

    // Issue
    pub const ISSUE_CREATE: &str = "issue:create";

    // User
    pub const USER_READ: &str = "user:read";
    pub const USER_CREATE: &str = "user:create";

    // RBAC administration
    pub const ROLE_READ: &str = "role:read";
    pub const ROLE_CREATE: &str = "role:create";
    pub const ROLE_UPDATE: &str = "role:update";
    pub const ROLE_DELETE: &str = "role:delete";
    pub const ROLE_ASSIGN: &str = "role:assign";
    pub const PERMISSION_READ: &str = "permission:read";
    pub const PERMISSION_MANAGE: &str = "permission:manage";
    pub const PERMISSION_GRANT: &str = "permission:grant";
    pub const AUDIT_READ: &str = "audit:read";

    // Profile
    pub const PROFILE_READ_OWN: &str = "profile:read:own";
}
