//! Effective permission resolution.
//!
//! Every call re-reads roles, links and overrides from the store; nothing is
//! cached across requests.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::authz::patterns::{covers, is_wildcard};
use crate::db::row_parsers;
use crate::db::Database;
use crate::errors::AppResult;
use crate::models::rbac::{EffectivePermissions, ResolvedRole, UserPermissionOverride};

#[derive(Debug, Clone)]
pub struct PermissionResolver {
    db: Database,
}

impl PermissionResolver {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Roles and flattened permission codes for `user_id`. Unscoped rows
    /// always count; rows scoped to a factory count only when `factory_id`
    /// names that factory. An empty result is not an error.
    pub async fn resolve_effective_permissions(
        &self,
        user_id: Uuid,
        factory_id: Option<Uuid>,
    ) -> AppResult<EffectivePermissions> {
        self.resolve_at(user_id, factory_id, None, Utc::now()).await
    }

    /// Like [`Self::resolve_effective_permissions`], but when no assignment
    /// resolves, the active role named by `fallback_role` (the baseline role
    /// on the user record) stands in for it.
    pub async fn resolve_with_fallback(
        &self,
        user_id: Uuid,
        factory_id: Option<Uuid>,
        fallback_role: Option<&str>,
    ) -> AppResult<EffectivePermissions> {
        self.resolve_at(user_id, factory_id, fallback_role, Utc::now()).await
    }

    pub async fn resolve_at(
        &self,
        user_id: Uuid,
        factory_id: Option<Uuid>,
        fallback_role: Option<&str>,
        now: DateTime<Utc>,
    ) -> AppResult<EffectivePermissions> {
        let mut roles = self.assigned_roles(user_id, factory_id).await?;
        if roles.is_empty() {
            if let Some(code) = fallback_role {
                if let Some(role) = self.baseline_role(code).await? {
                    tracing::debug!(%user_id, role = %role.code, "no assignments, using baseline role");
                    roles.push(role);
                }
            }
        }

        let mut role_codes = Vec::new();
        for role in &roles {
            role_codes.extend(self.role_permission_codes(role.id).await?);
        }

        let overrides = self.overrides(user_id, factory_id).await?;
        let needs_catalog = overrides.iter().any(|o| !o.granted && o.is_effective_at(now))
            && role_codes
                .iter()
                .chain(overrides.iter().filter(|o| o.granted).map(|o| &o.permission_code))
                .any(|code| is_wildcard(code));
        let catalog = if needs_catalog {
            self.active_codes().await?
        } else {
            Vec::new()
        };

        let all_permissions = combine_grants(role_codes, &overrides, &catalog, now);

        tracing::debug!(
            %user_id,
            factory_id = ?factory_id,
            roles = roles.len(),
            permissions = all_permissions.len(),
            "resolved effective permissions"
        );

        Ok(EffectivePermissions {
            user_id,
            factory_id,
            roles,
            all_permissions,
        })
    }

    async fn assigned_roles(&self, user_id: Uuid, factory_id: Option<Uuid>) -> AppResult<Vec<ResolvedRole>> {
        let factory = factory_id.map(|f| f.to_string());
        let rows = sqlx::query(
            "SELECT r.id, r.code, r.name, r.level, ura.factory_id, ura.created_at AS assigned_at \
             FROM user_role_assignments ura \
             JOIN roles r ON r.id = ura.role_id \
             WHERE ura.user_id = ?1 AND ura.is_active = 1 AND r.is_active = 1 \
               AND (ura.factory_id IS NULL OR ura.factory_id = ?2)",
        )
        .bind(user_id.to_string())
        .bind(factory)
        .fetch_all(self.db.pool())
        .await?;

        let found = rows
            .iter()
            .map(row_parsers::resolved_role_from_row)
            .collect::<AppResult<Vec<_>>>()?;

        Ok(order_roles(found))
    }

    async fn baseline_role(&self, code: &str) -> AppResult<Option<ResolvedRole>> {
        let row = sqlx::query(
            "SELECT id, code, name, level, NULL AS factory_id, created_at AS assigned_at \
             FROM roles WHERE code = ? AND is_active = 1",
        )
        .bind(code)
        .fetch_optional(self.db.pool())
        .await?;

        row.as_ref().map(row_parsers::resolved_role_from_row).transpose()
    }

    async fn role_permission_codes(&self, role_id: Uuid) -> AppResult<Vec<String>> {
        let codes = sqlx::query_scalar::<_, String>(
            "SELECT p.code FROM role_permissions rp \
             JOIN permissions p ON p.id = rp.permission_id \
             WHERE rp.role_id = ? AND rp.is_active = 1 AND p.is_active = 1",
        )
        .bind(role_id.to_string())
        .fetch_all(self.db.pool())
        .await?;

        Ok(codes)
    }

    async fn overrides(&self, user_id: Uuid, factory_id: Option<Uuid>) -> AppResult<Vec<UserPermissionOverride>> {
        let factory = factory_id.map(|f| f.to_string());
        let rows = sqlx::query(
            "SELECT upo.*, p.code AS permission_code \
             FROM user_permission_overrides upo \
             JOIN permissions p ON p.id = upo.permission_id \
             WHERE upo.user_id = ?1 AND upo.is_active = 1 AND p.is_active = 1 \
               AND (upo.factory_id IS NULL OR upo.factory_id = ?2)",
        )
        .bind(user_id.to_string())
        .bind(factory)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(row_parsers::override_from_row).collect()
    }

    async fn active_codes(&self) -> AppResult<Vec<String>> {
        let codes = sqlx::query_scalar::<_, String>("SELECT code FROM permissions WHERE is_active = 1")
            .fetch_all(self.db.pool())
            .await?;
        Ok(codes)
    }
}

/// Collapses duplicate assignments of one role (a factory-scoped assignment
/// beats an unscoped one, otherwise the earliest wins) and orders the result
/// by level descending, grant time ascending, code ascending.
pub fn order_roles(found: Vec<ResolvedRole>) -> Vec<ResolvedRole> {
    let mut by_role: HashMap<Uuid, ResolvedRole> = HashMap::new();
    for role in found {
        match by_role.get(&role.id) {
            Some(existing) if !prefer(&role, existing) => {}
            _ => {
                by_role.insert(role.id, role);
            }
        }
    }

    let mut roles: Vec<ResolvedRole> = by_role.into_values().collect();
    roles.sort_by(|a, b| {
        b.level
            .cmp(&a.level)
            .then_with(|| a.assigned_at.cmp(&b.assigned_at))
            .then_with(|| a.code.cmp(&b.code))
    });
    roles
}

fn prefer(candidate: &ResolvedRole, existing: &ResolvedRole) -> bool {
    match (candidate.factory_id.is_some(), existing.factory_id.is_some()) {
        (true, false) => true,
        (false, true) => false,
        _ => candidate.assigned_at < existing.assigned_at,
    }
}

/// Union of role-derived codes and granting overrides, minus everything an
/// effective denying override covers. A granted wildcard that is broader
/// than a deny is expanded against `catalog` first so the rest of its codes
/// survive. Output is sorted and de-duplicated.
pub fn combine_grants(
    role_codes: impl IntoIterator<Item = String>,
    overrides: &[UserPermissionOverride],
    catalog: &[String],
    now: DateTime<Utc>,
) -> Vec<String> {
    let effective: Vec<&UserPermissionOverride> = overrides.iter().filter(|o| o.is_effective_at(now)).collect();

    let mut granted: BTreeSet<String> = role_codes.into_iter().collect();
    granted.extend(
        effective
            .iter()
            .filter(|o| o.granted)
            .map(|o| o.permission_code.clone()),
    );

    let denied: Vec<&str> = effective
        .iter()
        .filter(|o| !o.granted)
        .map(|o| o.permission_code.as_str())
        .collect();
    if denied.is_empty() {
        return granted.into_iter().collect();
    }

    let is_denied = |code: &str| denied.iter().any(|deny| covers(deny, code));

    let mut result = BTreeSet::new();
    for code in granted {
        if is_denied(&code) {
            continue;
        }
        if is_wildcard(&code) && denied.iter().any(|deny| covers(&code, deny)) {
            result.extend(
                catalog
                    .iter()
                    .filter(|c| !is_wildcard(c) && covers(&code, c) && !is_denied(c))
                    .cloned(),
            );
        } else {
            result.insert(code);
        }
    }

    result.into_iter().collect()
}
