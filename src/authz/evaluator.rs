use async_trait::async_trait;

use super::principal::{Principal, ResourceContext};

/// Policy evaluator trait for pluggable authorization logic
#[async_trait]
pub trait PolicyEvaluator: Send + Sync {
    /// Check if the principal has permission to perform an action
    async fn can(&self, principal: &Principal, permission: &str, ctx: &ResourceContext) -> bool;
}

/// Default policy evaluator over wildcard permission codes
///
/// Evaluation order:
/// 1. global wildcard -> allow (any factory)
/// 2. resource in another factory than the principal's, or an unscoped
///    write by a factory-bound principal -> deny
/// 3. literal or module wildcard match -> allow
/// 4. deny
#[derive(Debug, Clone, Default)]
pub struct DefaultPolicyEvaluator;

impl DefaultPolicyEvaluator {
    pub fn new() -> Self {
        Self
    }

    fn factory_matches(principal: &Principal, ctx: &ResourceContext) -> bool {
        match (principal.factory_id, ctx.factory_id) {
            (Some(own), Some(target)) => own == target,
            // Principals without a factory are organisation-wide.
            (None, _) => true,
            // Factory-bound principals may read organisation-wide data but not change it.
            (Some(_), None) => !ctx.write,
        }
    }
}

#[async_trait]
impl PolicyEvaluator for DefaultPolicyEvaluator {
    async fn can(&self, principal: &Principal, permission: &str, ctx: &ResourceContext) -> bool {
        if principal.is_global() {
            tracing::debug!(
                user_id = %principal.user_id,
                permission = %permission,
                "global wildcard"
            );
            return true;
        }

        if !Self::factory_matches(principal, ctx) {
            tracing::debug!(
                user_id = %principal.user_id,
                permission = %permission,
                factory_id = ?ctx.factory_id,
                "factory scope mismatch"
            );
            return false;
        }

        if principal.has_permission(permission) {
            tracing::debug!(
                user_id = %principal.user_id,
                permission = %permission,
                "permission match"
            );
            return true;
        }

        tracing::debug!(
            user_id = %principal.user_id,
            permission = %permission,
            "permission denied"
        );
        false
    }
}
