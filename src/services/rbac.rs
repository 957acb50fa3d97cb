//! Role and permission mutations.
//!
//! Every mutating method runs in a single transaction and writes exactly one
//! change-log row through [`audit::record_change`] before committing. No-op
//! calls (deactivating something already inactive) write nothing.

use chrono::{DateTime, Utc};
use serde_json::json;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::authz::patterns::split_code;
use crate::authz::resolve_permission_patterns;
use crate::db::row_parsers;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::audit::{ChangeAction, Operator};
use crate::models::rbac::{
    Permission, PermissionCreateRequest, PermissionUpdateRequest, Role, RoleCreateRequest, RoleUpdateRequest,
    RoleWithPermissions, SetRolePermissionsOutcome, UserPermissionOverride, UserRoleAssignment,
};
use crate::services::audit::{self, ChangeRecord};

const DEFAULT_SCOPE: &str = "factory";

#[derive(Debug, Clone)]
pub struct RbacService {
    db: Database,
}

impl RbacService {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    // =========================================================================
    // PERMISSIONS
    // =========================================================================

    pub async fn list_permissions(&self, module: Option<&str>) -> AppResult<Vec<Permission>> {
        let rows = sqlx::query("SELECT * FROM permissions WHERE (?1 IS NULL OR module = ?1) ORDER BY module, code")
            .bind(module)
            .fetch_all(self.db.pool())
            .await?;

        rows.iter().map(row_parsers::permission_from_row).collect()
    }

    pub async fn get_permission(&self, id: Uuid) -> AppResult<Permission> {
        let mut conn = self.db.pool().acquire().await?;
        fetch_permission(&mut conn, id).await
    }

    pub async fn create_permission(&self, req: PermissionCreateRequest, operator: &Operator) -> AppResult<Permission> {
        let code = req.code.trim().to_string();
        let mut violations = Vec::new();
        let parts = split_code(&code).filter(|(module, _)| *module != "*");
        if parts.is_none() {
            violations.push(format!("permission code must have the form module:action, got '{code}'"));
        }
        if req.name.trim().is_empty() {
            violations.push("permission name must not be empty".to_string());
        }
        let Some((module, action)) = parts else {
            return Err(AppError::validation(violations));
        };
        if !violations.is_empty() {
            return Err(AppError::validation(violations));
        }

        let mut tx = self.db.begin_write().await?;

        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM permissions WHERE code = ?")
            .bind(&code)
            .fetch_one(&mut *tx)
            .await?;
        if exists > 0 {
            return Err(AppError::conflict(format!("permission {code} already exists")));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO permissions (id, code, name, description, module, action, scope, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&code)
        .bind(req.name.trim())
        .bind(&req.description)
        .bind(module)
        .bind(action)
        .bind(req.scope.as_deref().unwrap_or(DEFAULT_SCOPE))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let permission = fetch_permission(&mut tx, id).await?;
        audit::record_change(
            &mut tx,
            operator,
            ChangeRecord::new(ChangeAction::CreatePermission)
                .permission(id)
                .new_value(&permission)
                .reason(req.reason),
        )
        .await?;
        tx.commit().await?;

        Ok(permission)
    }

    /// Name, description and scope are editable; the code never changes.
    pub async fn update_permission(
        &self,
        id: Uuid,
        req: PermissionUpdateRequest,
        operator: &Operator,
    ) -> AppResult<Permission> {
        if matches!(&req.name, Some(name) if name.trim().is_empty()) {
            return Err(AppError::validation(vec!["permission name must not be empty".to_string()]));
        }

        let mut tx = self.db.begin_write().await?;
        let old = fetch_permission(&mut tx, id).await?;

        sqlx::query("UPDATE permissions SET name = ?, description = ?, scope = ?, updated_at = ? WHERE id = ?")
            .bind(req.name.as_deref().map(str::trim).unwrap_or(&old.name))
            .bind(req.description.as_ref().or(old.description.as_ref()))
            .bind(req.scope.as_deref().unwrap_or(&old.scope))
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        let updated = fetch_permission(&mut tx, id).await?;
        audit::record_change(
            &mut tx,
            operator,
            ChangeRecord::new(ChangeAction::UpdatePermission)
                .permission(id)
                .old(&old)
                .new_value(&updated)
                .reason(req.reason),
        )
        .await?;
        tx.commit().await?;

        Ok(updated)
    }

    /// Soft delete. Role links stay in place but stop resolving.
    pub async fn deactivate_permission(
        &self,
        id: Uuid,
        reason: Option<String>,
        operator: &Operator,
    ) -> AppResult<Permission> {
        let mut tx = self.db.begin_write().await?;
        let old = fetch_permission(&mut tx, id).await?;
        if !old.is_active {
            return Ok(old);
        }

        sqlx::query("UPDATE permissions SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        let updated = fetch_permission(&mut tx, id).await?;
        audit::record_change(
            &mut tx,
            operator,
            ChangeRecord::new(ChangeAction::DeactivatePermission)
                .permission(id)
                .old(&old)
                .new_value(&updated)
                .reason(reason),
        )
        .await?;
        tx.commit().await?;

        Ok(updated)
    }

    // =========================================================================
    // ROLES
    // =========================================================================

    pub async fn list_roles(&self) -> AppResult<Vec<Role>> {
        let rows = sqlx::query("SELECT * FROM roles ORDER BY level DESC, code")
            .fetch_all(self.db.pool())
            .await?;

        rows.iter().map(row_parsers::role_from_row).collect()
    }

    pub async fn get_role(&self, id: Uuid) -> AppResult<Role> {
        let mut conn = self.db.pool().acquire().await?;
        fetch_role(&mut conn, id).await
    }

    pub async fn find_role_by_code(&self, code: &str) -> AppResult<Option<Role>> {
        let row = sqlx::query("SELECT * FROM roles WHERE code = ?")
            .bind(code)
            .fetch_optional(self.db.pool())
            .await?;

        row.as_ref().map(row_parsers::role_from_row).transpose()
    }

    pub async fn get_role_with_permissions(&self, id: Uuid) -> AppResult<RoleWithPermissions> {
        let mut conn = self.db.pool().acquire().await?;
        let role = fetch_role(&mut conn, id).await?;

        let rows = sqlx::query(
            "SELECT p.* FROM role_permissions rp JOIN permissions p ON p.id = rp.permission_id \
             WHERE rp.role_id = ? AND rp.is_active = 1 ORDER BY p.code",
        )
        .bind(id.to_string())
        .fetch_all(&mut *conn)
        .await?;
        let permissions = rows
            .iter()
            .map(row_parsers::permission_from_row)
            .collect::<AppResult<Vec<_>>>()?;

        Ok(RoleWithPermissions { role, permissions })
    }

    pub async fn create_role(&self, req: RoleCreateRequest, operator: &Operator) -> AppResult<Role> {
        self.insert_role(req, false, operator).await
    }

    /// Seeded roles; these refuse deletion and deactivation.
    pub async fn create_system_role(&self, req: RoleCreateRequest, operator: &Operator) -> AppResult<Role> {
        self.insert_role(req, true, operator).await
    }

    async fn insert_role(&self, req: RoleCreateRequest, is_system: bool, operator: &Operator) -> AppResult<Role> {
        let code = req.code.trim().to_string();
        let mut violations = Vec::new();
        if code.is_empty() || code.contains(char::is_whitespace) {
            violations.push("role code must be a non-empty token without spaces".to_string());
        }
        if req.name.trim().is_empty() {
            violations.push("role name must not be empty".to_string());
        }
        if !violations.is_empty() {
            return Err(AppError::validation(violations));
        }

        let mut tx = self.db.begin_write().await?;

        let exists = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM roles WHERE code = ?")
            .bind(&code)
            .fetch_one(&mut *tx)
            .await?;
        if exists > 0 {
            return Err(AppError::conflict(format!("role {code} already exists")));
        }

        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query(
            "INSERT INTO roles (id, code, name, description, level, is_system, is_default, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&code)
        .bind(req.name.trim())
        .bind(&req.description)
        .bind(req.level)
        .bind(is_system)
        .bind(req.is_default)
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await?;

        let role = fetch_role(&mut tx, id).await?;
        audit::record_change(
            &mut tx,
            operator,
            ChangeRecord::new(ChangeAction::CreateRole)
                .role(id)
                .new_value(&role)
                .reason(req.reason),
        )
        .await?;
        tx.commit().await?;

        Ok(role)
    }

    pub async fn update_role(&self, id: Uuid, req: RoleUpdateRequest, operator: &Operator) -> AppResult<Role> {
        if matches!(&req.name, Some(name) if name.trim().is_empty()) {
            return Err(AppError::validation(vec!["role name must not be empty".to_string()]));
        }

        let mut tx = self.db.begin_write().await?;
        let old = fetch_role(&mut tx, id).await?;

        sqlx::query("UPDATE roles SET name = ?, description = ?, level = ?, is_default = ?, updated_at = ? WHERE id = ?")
            .bind(req.name.as_deref().map(str::trim).unwrap_or(&old.name))
            .bind(req.description.as_ref().or(old.description.as_ref()))
            .bind(req.level.unwrap_or(old.level))
            .bind(req.is_default.unwrap_or(old.is_default))
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        let updated = fetch_role(&mut tx, id).await?;
        audit::record_change(
            &mut tx,
            operator,
            ChangeRecord::new(ChangeAction::UpdateRole)
                .role(id)
                .old(&old)
                .new_value(&updated)
                .reason(req.reason),
        )
        .await?;
        tx.commit().await?;

        Ok(updated)
    }

    pub async fn deactivate_role(&self, id: Uuid, reason: Option<String>, operator: &Operator) -> AppResult<Role> {
        let mut tx = self.db.begin_write().await?;
        let old = fetch_role(&mut tx, id).await?;
        if old.is_system {
            return Err(AppError::forbidden(format!("system role {} cannot be deactivated", old.code)));
        }
        if !old.is_active {
            return Ok(old);
        }

        sqlx::query("UPDATE roles SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        let updated = fetch_role(&mut tx, id).await?;
        audit::record_change(
            &mut tx,
            operator,
            ChangeRecord::new(ChangeAction::DeactivateRole)
                .role(id)
                .old(&old)
                .new_value(&updated)
                .reason(reason),
        )
        .await?;
        tx.commit().await?;

        Ok(updated)
    }

    /// Hard delete with explicit cleanup of the role's permission links and
    /// user assignments, all in one transaction.
    pub async fn delete_role(&self, id: Uuid, reason: Option<String>, operator: &Operator) -> AppResult<()> {
        let mut tx = self.db.begin_write().await?;
        let old = fetch_role(&mut tx, id).await?;
        if old.is_system {
            return Err(AppError::forbidden(format!("system role {} cannot be deleted", old.code)));
        }

        let links = sqlx::query("DELETE FROM role_permissions WHERE role_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        let assignments = sqlx::query("DELETE FROM user_role_assignments WHERE role_id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?
            .rows_affected();
        sqlx::query("DELETE FROM roles WHERE id = ?")
            .bind(id.to_string())
            .execute(&mut *tx)
            .await?;

        audit::record_change(
            &mut tx,
            operator,
            ChangeRecord::new(ChangeAction::DeleteRole)
                .role(id)
                .old(&old)
                .new_value(&json!({
                    "rolePermissionsRemoved": links,
                    "assignmentsRemoved": assignments,
                }))
                .reason(reason),
        )
        .await?;
        tx.commit().await?;

        tracing::info!(role = %old.code, links, assignments, "role deleted");
        Ok(())
    }

    /// Replaces every permission link of a role with the expansion of
    /// `patterns` against the current catalog. Unmatched exact codes are
    /// skipped, logged and returned to the caller.
    pub async fn set_role_permissions<S: AsRef<str>>(
        &self,
        role_id: Uuid,
        patterns: &[S],
        reason: Option<String>,
        operator: &Operator,
    ) -> AppResult<SetRolePermissionsOutcome> {
        let mut tx = self.db.begin_write().await?;
        let role = fetch_role(&mut tx, role_id).await?;

        let catalog_rows = sqlx::query("SELECT * FROM permissions").fetch_all(&mut *tx).await?;
        let catalog = catalog_rows
            .iter()
            .map(row_parsers::permission_from_row)
            .collect::<AppResult<Vec<_>>>()?;
        let resolution = resolve_permission_patterns(patterns, &catalog);
        for pattern in &resolution.unmatched {
            tracing::warn!(role = %role.code, pattern = %pattern, "permission pattern matched nothing");
        }

        let old_codes = sqlx::query_scalar::<_, String>(
            "SELECT p.code FROM role_permissions rp JOIN permissions p ON p.id = rp.permission_id \
             WHERE rp.role_id = ? ORDER BY p.code",
        )
        .bind(role_id.to_string())
        .fetch_all(&mut *tx)
        .await?;

        sqlx::query("DELETE FROM role_permissions WHERE role_id = ?")
            .bind(role_id.to_string())
            .execute(&mut *tx)
            .await?;

        let now = Utc::now();
        for permission_id in &resolution.permission_ids {
            sqlx::query(
                "INSERT INTO role_permissions (id, role_id, permission_id, is_active, created_at, updated_at) \
                 VALUES (?, ?, ?, 1, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(role_id.to_string())
            .bind(permission_id.to_string())
            .bind(now)
            .bind(now)
            .execute(&mut *tx)
            .await?;
        }

        let mut new_codes: Vec<&str> = catalog
            .iter()
            .filter(|p| resolution.permission_ids.contains(&p.id))
            .map(|p| p.code.as_str())
            .collect();
        new_codes.sort_unstable();
        let pattern_list: Vec<&str> = patterns.iter().map(|p| p.as_ref()).collect();

        audit::record_change(
            &mut tx,
            operator,
            ChangeRecord::new(ChangeAction::SetRolePermissions)
                .role(role_id)
                .old(&json!({ "codes": old_codes }))
                .new_value(&json!({
                    "patterns": pattern_list,
                    "codes": new_codes,
                    "unmatched": resolution.unmatched,
                }))
                .reason(reason),
        )
        .await?;
        tx.commit().await?;

        Ok(SetRolePermissionsOutcome {
            role_id,
            assigned: resolution.permission_ids.len(),
            unmatched: resolution.unmatched,
        })
    }

    // =========================================================================
    // USER-ROLE ASSIGNMENTS
    // =========================================================================

    pub async fn list_user_roles(&self, user_id: Uuid) -> AppResult<Vec<UserRoleAssignment>> {
        let rows = sqlx::query(
            "SELECT * FROM user_role_assignments WHERE user_id = ? ORDER BY julianday(created_at), id",
        )
        .bind(user_id.to_string())
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(row_parsers::assignment_from_row).collect()
    }

    pub async fn assign_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        factory_id: Option<Uuid>,
        reason: Option<String>,
        operator: &Operator,
    ) -> AppResult<UserRoleAssignment> {
        let mut tx = self.db.begin_write().await?;
        let assignment = assign_role_in(&mut tx, user_id, role_id, factory_id, reason, operator).await?;
        tx.commit().await?;
        Ok(assignment)
    }

    /// Soft revoke; the row is kept for history.
    pub async fn revoke_role(
        &self,
        user_id: Uuid,
        role_id: Uuid,
        factory_id: Option<Uuid>,
        reason: Option<String>,
        operator: &Operator,
    ) -> AppResult<UserRoleAssignment> {
        let mut tx = self.db.begin_write().await?;

        let old = find_assignment(&mut tx, user_id, role_id, factory_id)
            .await?
            .filter(|a| a.is_active)
            .ok_or_else(|| AppError::not_found("active role assignment"))?;

        sqlx::query("UPDATE user_role_assignments SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(old.id.to_string())
            .execute(&mut *tx)
            .await?;

        let updated = find_assignment(&mut tx, user_id, role_id, factory_id)
            .await?
            .ok_or_else(|| AppError::internal("assignment vanished during revoke"))?;
        audit::record_change(
            &mut tx,
            operator,
            ChangeRecord::new(ChangeAction::RevokeRole)
                .target_user(user_id)
                .role(role_id)
                .old(&old)
                .new_value(&updated)
                .reason(reason),
        )
        .await?;
        tx.commit().await?;

        Ok(updated)
    }

    // =========================================================================
    // USER PERMISSION OVERRIDES
    // =========================================================================

    pub async fn list_user_overrides(&self, user_id: Uuid) -> AppResult<Vec<UserPermissionOverride>> {
        let rows = sqlx::query(
            "SELECT upo.*, p.code AS permission_code FROM user_permission_overrides upo \
             JOIN permissions p ON p.id = upo.permission_id \
             WHERE upo.user_id = ? ORDER BY julianday(upo.created_at), upo.id",
        )
        .bind(user_id.to_string())
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(row_parsers::override_from_row).collect()
    }

    /// Creates or replaces the override for (user, permission, factory).
    /// `granted = false` records an explicit denial.
    #[allow(clippy::too_many_arguments)]
    pub async fn set_override(
        &self,
        user_id: Uuid,
        permission_id: Uuid,
        factory_id: Option<Uuid>,
        granted: bool,
        expires_at: Option<DateTime<Utc>>,
        reason: Option<String>,
        operator: &Operator,
    ) -> AppResult<UserPermissionOverride> {
        let now = Utc::now();
        if matches!(expires_at, Some(at) if at <= now) {
            return Err(AppError::bad_request("expiresAt must be in the future"));
        }

        let mut tx = self.db.begin_write().await?;
        ensure_user(&mut tx, user_id).await?;
        ensure_factory(&mut tx, factory_id).await?;
        let permission = fetch_permission(&mut tx, permission_id).await?;
        if !permission.is_active {
            return Err(AppError::bad_request(format!("permission {} is inactive", permission.code)));
        }

        let old = find_override(&mut tx, user_id, permission_id, factory_id).await?;
        match &old {
            Some(existing) => {
                sqlx::query(
                    "UPDATE user_permission_overrides SET granted = ?, expires_at = ?, is_active = 1, granted_by = ?, reason = ?, updated_at = ? \
                     WHERE id = ?",
                )
                .bind(granted)
                .bind(expires_at)
                .bind(operator.user_id.map(|u| u.to_string()))
                .bind(&reason)
                .bind(now)
                .bind(existing.id.to_string())
                .execute(&mut *tx)
                .await?;
            }
            None => {
                sqlx::query(
                    "INSERT INTO user_permission_overrides (id, user_id, permission_id, factory_id, granted, expires_at, is_active, granted_by, reason, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?, ?, ?)",
                )
                .bind(Uuid::new_v4().to_string())
                .bind(user_id.to_string())
                .bind(permission_id.to_string())
                .bind(factory_id.map(|f| f.to_string()))
                .bind(granted)
                .bind(expires_at)
                .bind(operator.user_id.map(|u| u.to_string()))
                .bind(&reason)
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
            }
        }

        let updated = find_override(&mut tx, user_id, permission_id, factory_id)
            .await?
            .ok_or_else(|| AppError::internal("override missing after write"))?;
        let action = if granted {
            ChangeAction::GrantPermission
        } else {
            ChangeAction::DenyPermission
        };
        let mut record = ChangeRecord::new(action)
            .target_user(user_id)
            .permission(permission_id)
            .new_value(&updated)
            .reason(reason);
        if let Some(old) = &old {
            record = record.old(old);
        }
        audit::record_change(&mut tx, operator, record).await?;
        tx.commit().await?;

        Ok(updated)
    }

    pub async fn revoke_override(
        &self,
        user_id: Uuid,
        permission_id: Uuid,
        factory_id: Option<Uuid>,
        reason: Option<String>,
        operator: &Operator,
    ) -> AppResult<UserPermissionOverride> {
        let mut tx = self.db.begin_write().await?;

        let old = find_override(&mut tx, user_id, permission_id, factory_id)
            .await?
            .filter(|o| o.is_active)
            .ok_or_else(|| AppError::not_found("active permission override"))?;

        sqlx::query("UPDATE user_permission_overrides SET is_active = 0, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(old.id.to_string())
            .execute(&mut *tx)
            .await?;

        let updated = find_override(&mut tx, user_id, permission_id, factory_id)
            .await?
            .ok_or_else(|| AppError::internal("override vanished during revoke"))?;
        audit::record_change(
            &mut tx,
            operator,
            ChangeRecord::new(ChangeAction::RevokePermission)
                .target_user(user_id)
                .permission(permission_id)
                .old(&old)
                .new_value(&updated)
                .reason(reason),
        )
        .await?;
        tx.commit().await?;

        Ok(updated)
    }

    /// Ends an override now by moving its expiry to the current instant.
    pub async fn expire_override(
        &self,
        override_id: Uuid,
        reason: Option<String>,
        operator: &Operator,
    ) -> AppResult<UserPermissionOverride> {
        let mut tx = self.db.begin_write().await?;
        let old = fetch_override(&mut tx, override_id).await?;
        let now = Utc::now();
        if !old.is_effective_at(now) {
            return Ok(old);
        }

        sqlx::query("UPDATE user_permission_overrides SET expires_at = ?, updated_at = ? WHERE id = ?")
            .bind(now)
            .bind(now)
            .bind(override_id.to_string())
            .execute(&mut *tx)
            .await?;

        let updated = fetch_override(&mut tx, override_id).await?;
        audit::record_change(
            &mut tx,
            operator,
            ChangeRecord::new(ChangeAction::ExpirePermission)
                .target_user(old.user_id)
                .permission(old.permission_id)
                .old(&old)
                .new_value(&updated)
                .reason(reason),
        )
        .await?;
        tx.commit().await?;

        Ok(updated)
    }
}

/// Grants a role on an existing connection or transaction, writing its
/// change-log row there too. A previously revoked assignment is reactivated
/// and takes the current instant as its grant time.
pub async fn assign_role_in(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    role_id: Uuid,
    factory_id: Option<Uuid>,
    reason: Option<String>,
    operator: &Operator,
) -> AppResult<UserRoleAssignment> {
    ensure_user(conn, user_id).await?;
    ensure_factory(conn, factory_id).await?;
    let role = fetch_role(conn, role_id).await?;
    if !role.is_active {
        return Err(AppError::bad_request(format!("role {} is inactive", role.code)));
    }

    let now = Utc::now();
    let old = find_assignment(conn, user_id, role_id, factory_id).await?;
    match &old {
        Some(existing) if existing.is_active => {
            return Err(AppError::conflict(format!("role {} already assigned", role.code)));
        }
        Some(existing) => {
            sqlx::query(
                "UPDATE user_role_assignments SET is_active = 1, granted_by = ?, created_at = ?, updated_at = ? WHERE id = ?",
            )
            .bind(operator.user_id.map(|u| u.to_string()))
            .bind(now)
            .bind(now)
            .bind(existing.id.to_string())
            .execute(&mut *conn)
            .await?;
        }
        None => {
            sqlx::query(
                "INSERT INTO user_role_assignments (id, user_id, role_id, factory_id, granted_by, is_active, created_at, updated_at) \
                 VALUES (?, ?, ?, ?, ?, 1, ?, ?)",
            )
            .bind(Uuid::new_v4().to_string())
            .bind(user_id.to_string())
            .bind(role_id.to_string())
            .bind(factory_id.map(|f| f.to_string()))
            .bind(operator.user_id.map(|u| u.to_string()))
            .bind(now)
            .bind(now)
            .execute(&mut *conn)
            .await?;
        }
    }

    let assignment = find_assignment(conn, user_id, role_id, factory_id)
        .await?
        .ok_or_else(|| AppError::internal("assignment missing after write"))?;
    let mut record = ChangeRecord::new(ChangeAction::AssignRole)
        .target_user(user_id)
        .role(role_id)
        .new_value(&assignment)
        .reason(reason);
    if let Some(old) = &old {
        record = record.old(old);
    }
    audit::record_change(conn, operator, record).await?;

    Ok(assignment)
}

async fn fetch_permission(conn: &mut SqliteConnection, id: Uuid) -> AppResult<Permission> {
    let row = sqlx::query("SELECT * FROM permissions WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found(format!("permission {id}")))?;
    row_parsers::permission_from_row(&row)
}

async fn fetch_role(conn: &mut SqliteConnection, id: Uuid) -> AppResult<Role> {
    let row = sqlx::query("SELECT * FROM roles WHERE id = ?")
        .bind(id.to_string())
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found(format!("role {id}")))?;
    row_parsers::role_from_row(&row)
}

async fn fetch_override(conn: &mut SqliteConnection, id: Uuid) -> AppResult<UserPermissionOverride> {
    let row = sqlx::query(
        "SELECT upo.*, p.code AS permission_code FROM user_permission_overrides upo \
         JOIN permissions p ON p.id = upo.permission_id WHERE upo.id = ?",
    )
    .bind(id.to_string())
    .fetch_optional(&mut *conn)
    .await?
    .ok_or_else(|| AppError::not_found(format!("permission override {id}")))?;
    row_parsers::override_from_row(&row)
}

async fn find_assignment(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    role_id: Uuid,
    factory_id: Option<Uuid>,
) -> AppResult<Option<UserRoleAssignment>> {
    let row = sqlx::query(
        "SELECT * FROM user_role_assignments \
         WHERE user_id = ? AND role_id = ? AND COALESCE(factory_id, '') = COALESCE(?, '')",
    )
    .bind(user_id.to_string())
    .bind(role_id.to_string())
    .bind(factory_id.map(|f| f.to_string()))
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(row_parsers::assignment_from_row).transpose()
}

async fn find_override(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    permission_id: Uuid,
    factory_id: Option<Uuid>,
) -> AppResult<Option<UserPermissionOverride>> {
    let row = sqlx::query(
        "SELECT upo.*, p.code AS permission_code FROM user_permission_overrides upo \
         JOIN permissions p ON p.id = upo.permission_id \
         WHERE upo.user_id = ? AND upo.permission_id = ? AND COALESCE(upo.factory_id, '') = COALESCE(?, '')",
    )
    .bind(user_id.to_string())
    .bind(permission_id.to_string())
    .bind(factory_id.map(|f| f.to_string()))
    .fetch_optional(&mut *conn)
    .await?;

    row.as_ref().map(row_parsers::override_from_row).transpose()
}

async fn ensure_user(conn: &mut SqliteConnection, user_id: Uuid) -> AppResult<()> {
    let found = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE id = ?")
        .bind(user_id.to_string())
        .fetch_one(&mut *conn)
        .await?;
    if found == 0 {
        return Err(AppError::not_found(format!("user {user_id}")));
    }
    Ok(())
}

async fn ensure_factory(conn: &mut SqliteConnection, factory_id: Option<Uuid>) -> AppResult<()> {
    let Some(factory_id) = factory_id else {
        return Ok(());
    };
    let found = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM factories WHERE id = ?")
        .bind(factory_id.to_string())
        .fetch_one(&mut *conn)
        .await?;
    if found == 0 {
        return Err(AppError::not_found(format!("factory {factory_id}")));
    }
    Ok(())
}
