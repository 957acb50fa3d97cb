//! RBAC Admin API Routes
//!
//! Permission catalog, roles, user role assignments, per-user overrides,
//! effective permissions and the change log. Every mutation is recorded in
//! the change log by the service layer.

use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::{permissions, ResourceContext};
use crate::errors::AppError;
use crate::jwt::AuthUser;
use crate::models::audit::{ChangeLogQuery, PermissionChangeLog};
use crate::models::rbac::*;
use crate::routes::operator;

// =============================================================================
// ROUTER
// =============================================================================

pub fn routes() -> Router<AppState> {
    Router::new()
        // Permissions
        .route("/permissions", get(list_permissions).post(create_permission))
        .route(
            "/permissions/:permission_id",
            get(get_permission).put(update_permission).delete(deactivate_permission),
        )
        // Roles
        .route("/roles", get(list_roles).post(create_role))
        .route("/roles/:role_id", get(get_role).put(update_role).delete(delete_role))
        .route("/roles/:role_id/deactivate", post(deactivate_role))
        .route("/roles/:role_id/permissions", get(get_role_permissions).put(set_role_permissions))
        // User role assignments
        .route("/users/:user_id/roles", get(get_user_roles).post(assign_role_to_user))
        .route("/users/:user_id/roles/:role_id", axum::routing::delete(revoke_role_from_user))
        // User overrides
        .route("/users/:user_id/overrides", get(get_user_overrides).post(set_user_override))
        .route(
            "/users/:user_id/overrides/:permission_id",
            axum::routing::delete(revoke_user_override),
        )
        .route("/overrides/:override_id/expire", post(expire_override))
        // Effective permissions (computed)
        .route("/users/:user_id/effective-permissions", get(get_effective_permissions))
        // Change log
        .route("/change-logs", get(list_change_logs))
}

// =============================================================================
// PERMISSION ENDPOINTS
// =============================================================================

/// List the permission catalog
#[utoipa::path(
    get,
    path = "/rbac/permissions",
    tag = "RBAC",
    params(PermissionListQuery),
    responses((status = 200, description = "Permission catalog", body = Vec<Permission>)),
    security(("bearerAuth" = []))
)]
pub async fn list_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<PermissionListQuery>,
) -> Result<Json<Vec<Permission>>, AppError> {
    auth.require(&state, permissions::PERMISSION_READ).await?;
    Ok(Json(state.rbac.list_permissions(query.module.as_deref()).await?))
}

#[utoipa::path(
    post,
    path = "/rbac/permissions",
    tag = "RBAC",
    request_body = PermissionCreateRequest,
    responses(
        (status = 201, description = "Permission created", body = Permission),
        (status = 409, description = "Code already exists"),
        (status = 422, description = "Malformed code"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(req): Json<PermissionCreateRequest>,
) -> Result<(StatusCode, Json<Permission>), AppError> {
    auth.require_write(&state, permissions::PERMISSION_MANAGE).await?;
    let permission = state.rbac.create_permission(req, &operator(&auth, &headers)).await?;
    Ok((StatusCode::CREATED, Json(permission)))
}

#[utoipa::path(
    get,
    path = "/rbac/permissions/{permission_id}",
    tag = "RBAC",
    params(("permission_id" = Uuid, Path, description = "Permission ID")),
    responses(
        (status = 200, description = "Permission", body = Permission),
        (status = 404, description = "Permission not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(permission_id): Path<Uuid>,
) -> Result<Json<Permission>, AppError> {
    auth.require(&state, permissions::PERMISSION_READ).await?;
    Ok(Json(state.rbac.get_permission(permission_id).await?))
}

#[utoipa::path(
    put,
    path = "/rbac/permissions/{permission_id}",
    tag = "RBAC",
    params(("permission_id" = Uuid, Path, description = "Permission ID")),
    request_body = PermissionUpdateRequest,
    responses((status = 200, description = "Permission updated", body = Permission)),
    security(("bearerAuth" = []))
)]
pub async fn update_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(permission_id): Path<Uuid>,
    Json(req): Json<PermissionUpdateRequest>,
) -> Result<Json<Permission>, AppError> {
    auth.require_write(&state, permissions::PERMISSION_MANAGE).await?;
    let permission = state
        .rbac
        .update_permission(permission_id, req, &operator(&auth, &headers))
        .await?;
    Ok(Json(permission))
}

/// Soft delete: the permission stops resolving but keeps its history
#[utoipa::path(
    delete,
    path = "/rbac/permissions/{permission_id}",
    tag = "RBAC",
    params(("permission_id" = Uuid, Path, description = "Permission ID"), ReasonQuery),
    responses((status = 200, description = "Permission deactivated", body = Permission)),
    security(("bearerAuth" = []))
)]
pub async fn deactivate_permission(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(permission_id): Path<Uuid>,
    Query(query): Query<ReasonQuery>,
) -> Result<Json<Permission>, AppError> {
    auth.require_write(&state, permissions::PERMISSION_MANAGE).await?;
    let permission = state
        .rbac
        .deactivate_permission(permission_id, query.reason, &operator(&auth, &headers))
        .await?;
    Ok(Json(permission))
}

// =============================================================================
// ROLE ENDPOINTS
// =============================================================================

/// List all roles
#[utoipa::path(
    get,
    path = "/rbac/roles",
    tag = "RBAC",
    responses((status = 200, description = "List of roles", body = Vec<Role>)),
    security(("bearerAuth" = []))
)]
pub async fn list_roles(State(state): State<AppState>, auth: AuthUser) -> Result<Json<Vec<Role>>, AppError> {
    auth.require(&state, permissions::ROLE_READ).await?;
    Ok(Json(state.rbac.list_roles().await?))
}

/// Create a new role
#[utoipa::path(
    post,
    path = "/rbac/roles",
    tag = "RBAC",
    request_body = RoleCreateRequest,
    responses(
        (status = 201, description = "Role created", body = Role),
        (status = 409, description = "Role code already exists"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(req): Json<RoleCreateRequest>,
) -> Result<(StatusCode, Json<Role>), AppError> {
    auth.require_write(&state, permissions::ROLE_CREATE).await?;
    let role = state.rbac.create_role(req, &operator(&auth, &headers)).await?;
    Ok((StatusCode::CREATED, Json(role)))
}

/// Get a role with its permissions
#[utoipa::path(
    get,
    path = "/rbac/roles/{role_id}",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role ID")),
    responses(
        (status = 200, description = "Role with permissions", body = RoleWithPermissions),
        (status = 404, description = "Role not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_role(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(role_id): Path<Uuid>,
) -> Result<Json<RoleWithPermissions>, AppError> {
    auth.require(&state, permissions::ROLE_READ).await?;
    Ok(Json(state.rbac.get_role_with_permissions(role_id).await?))
}

#[utoipa::path(
    put,
    path = "/rbac/roles/{role_id}",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role ID")),
    request_body = RoleUpdateRequest,
    responses((status = 200, description = "Role updated", body = Role)),
    security(("bearerAuth" = []))
)]
pub async fn update_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(role_id): Path<Uuid>,
    Json(req): Json<RoleUpdateRequest>,
) -> Result<Json<Role>, AppError> {
    auth.require_write(&state, permissions::ROLE_UPDATE).await?;
    Ok(Json(state.rbac.update_role(role_id, req, &operator(&auth, &headers)).await?))
}

#[utoipa::path(
    post,
    path = "/rbac/roles/{role_id}/deactivate",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role ID"), ReasonQuery),
    responses(
        (status = 200, description = "Role deactivated", body = Role),
        (status = 403, description = "System roles cannot be deactivated"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn deactivate_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(role_id): Path<Uuid>,
    Query(query): Query<ReasonQuery>,
) -> Result<Json<Role>, AppError> {
    auth.require_write(&state, permissions::ROLE_UPDATE).await?;
    let role = state
        .rbac
        .deactivate_role(role_id, query.reason, &operator(&auth, &headers))
        .await?;
    Ok(Json(role))
}

/// Delete a role together with its permission links and assignments
#[utoipa::path(
    delete,
    path = "/rbac/roles/{role_id}",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role ID"), ReasonQuery),
    responses(
        (status = 204, description = "Role deleted"),
        (status = 403, description = "System roles cannot be deleted"),
        (status = 404, description = "Role not found"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn delete_role(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(role_id): Path<Uuid>,
    Query(query): Query<ReasonQuery>,
) -> Result<StatusCode, AppError> {
    auth.require_write(&state, permissions::ROLE_DELETE).await?;
    state
        .rbac
        .delete_role(role_id, query.reason, &operator(&auth, &headers))
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

#[utoipa::path(
    get,
    path = "/rbac/roles/{role_id}/permissions",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role ID")),
    responses((status = 200, description = "Permissions linked to the role", body = Vec<Permission>)),
    security(("bearerAuth" = []))
)]
pub async fn get_role_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(role_id): Path<Uuid>,
) -> Result<Json<Vec<Permission>>, AppError> {
    auth.require(&state, permissions::ROLE_READ).await?;
    let role = state.rbac.get_role_with_permissions(role_id).await?;
    Ok(Json(role.permissions))
}

/// Replace a role's permissions with the expansion of a pattern list
#[utoipa::path(
    put,
    path = "/rbac/roles/{role_id}/permissions",
    tag = "RBAC",
    params(("role_id" = Uuid, Path, description = "Role ID")),
    request_body = SetRolePermissionsRequest,
    responses((status = 200, description = "Links replaced; unmatched codes listed", body = SetRolePermissionsOutcome)),
    security(("bearerAuth" = []))
)]
pub async fn set_role_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(role_id): Path<Uuid>,
    Json(req): Json<SetRolePermissionsRequest>,
) -> Result<Json<SetRolePermissionsOutcome>, AppError> {
    auth.require_write(&state, permissions::ROLE_UPDATE).await?;
    let outcome = state
        .rbac
        .set_role_permissions(role_id, &req.patterns, req.reason, &operator(&auth, &headers))
        .await?;
    Ok(Json(outcome))
}

// =============================================================================
// USER ROLE ASSIGNMENT ENDPOINTS
// =============================================================================

#[utoipa::path(
    get,
    path = "/rbac/users/{user_id}/roles",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User ID")),
    responses((status = 200, description = "Role assignments, including revoked ones", body = Vec<UserRoleAssignment>)),
    security(("bearerAuth" = []))
)]
pub async fn get_user_roles(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<UserRoleAssignment>>, AppError> {
    auth.require(&state, permissions::ROLE_READ).await?;
    Ok(Json(state.rbac.list_user_roles(user_id).await?))
}

#[utoipa::path(
    post,
    path = "/rbac/users/{user_id}/roles",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User ID")),
    request_body = AssignRoleRequest,
    responses(
        (status = 201, description = "Role assigned", body = UserRoleAssignment),
        (status = 403, description = "Role ranks above the caller's own, or unscoped assignment by a factory-bound caller"),
        (status = 409, description = "Role already assigned"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn assign_role_to_user(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
    Json(req): Json<AssignRoleRequest>,
) -> Result<(StatusCode, Json<UserRoleAssignment>), AppError> {
    auth.require_in(
        &state,
        permissions::ROLE_ASSIGN,
        &ResourceContext::new().with_factory(req.factory_id).for_write(),
    )
    .await?;
    let role = state.rbac.get_role(req.role_id).await?;
    auth.require_role_within_reach(&state, &role).await?;

    let assignment = state
        .rbac
        .assign_role(user_id, req.role_id, req.factory_id, req.reason, &operator(&auth, &headers))
        .await?;
    Ok((StatusCode::CREATED, Json(assignment)))
}

#[utoipa::path(
    delete,
    path = "/rbac/users/{user_id}/roles/{role_id}",
    tag = "RBAC",
    params(
        ("user_id" = Uuid, Path, description = "User ID"),
        ("role_id" = Uuid, Path, description = "Role ID"),
        ScopeQuery
    ),
    responses(
        (status = 200, description = "Assignment revoked", body = UserRoleAssignment),
        (status = 404, description = "No active assignment"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn revoke_role_from_user(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((user_id, role_id)): Path<(Uuid, Uuid)>,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<UserRoleAssignment>, AppError> {
    auth.require_in(
        &state,
        permissions::ROLE_ASSIGN,
        &ResourceContext::new().with_factory(scope.factory_id).for_write(),
    )
    .await?;

    let assignment = state
        .rbac
        .revoke_role(user_id, role_id, scope.factory_id, scope.reason, &operator(&auth, &headers))
        .await?;
    Ok(Json(assignment))
}

// =============================================================================
// USER OVERRIDE ENDPOINTS
// =============================================================================

#[utoipa::path(
    get,
    path = "/rbac/users/{user_id}/overrides",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User ID")),
    responses((status = 200, description = "Direct grants and denials", body = Vec<UserPermissionOverride>)),
    security(("bearerAuth" = []))
)]
pub async fn get_user_overrides(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> Result<Json<Vec<UserPermissionOverride>>, AppError> {
    auth.require(&state, permissions::PERMISSION_READ).await?;
    Ok(Json(state.rbac.list_user_overrides(user_id).await?))
}

/// Grant (`granted: true`) or explicitly deny (`granted: false`) a permission
#[utoipa::path(
    post,
    path = "/rbac/users/{user_id}/overrides",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User ID")),
    request_body = OverrideRequest,
    responses(
        (status = 200, description = "Override stored", body = UserPermissionOverride),
        (status = 400, description = "Expiry in the past or inactive permission"),
        (status = 403, description = "Caller does not hold the permission"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn set_user_override(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(user_id): Path<Uuid>,
    Json(req): Json<OverrideRequest>,
) -> Result<Json<UserPermissionOverride>, AppError> {
    auth.require_in(
        &state,
        permissions::PERMISSION_GRANT,
        &ResourceContext::new().with_factory(req.factory_id).for_write(),
    )
    .await?;
    let permission = state.rbac.get_permission(req.permission_id).await?;
    auth.require_held(&state, &permission.code)?;

    let stored = state
        .rbac
        .set_override(
            user_id,
            req.permission_id,
            req.factory_id,
            req.granted,
            req.expires_at,
            req.reason,
            &operator(&auth, &headers),
        )
        .await?;
    Ok(Json(stored))
}

#[utoipa::path(
    delete,
    path = "/rbac/users/{user_id}/overrides/{permission_id}",
    tag = "RBAC",
    params(
        ("user_id" = Uuid, Path, description = "User ID"),
        ("permission_id" = Uuid, Path, description = "Permission ID"),
        ScopeQuery
    ),
    responses(
        (status = 200, description = "Override revoked", body = UserPermissionOverride),
        (status = 404, description = "No active override"),
    ),
    security(("bearerAuth" = []))
)]
pub async fn revoke_user_override(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path((user_id, permission_id)): Path<(Uuid, Uuid)>,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<UserPermissionOverride>, AppError> {
    auth.require_in(
        &state,
        permissions::PERMISSION_GRANT,
        &ResourceContext::new().with_factory(scope.factory_id).for_write(),
    )
    .await?;

    let revoked = state
        .rbac
        .revoke_override(user_id, permission_id, scope.factory_id, scope.reason, &operator(&auth, &headers))
        .await?;
    Ok(Json(revoked))
}

#[utoipa::path(
    post,
    path = "/rbac/overrides/{override_id}/expire",
    tag = "RBAC",
    params(("override_id" = Uuid, Path, description = "Override ID"), ReasonQuery),
    responses((status = 200, description = "Override expired now", body = UserPermissionOverride)),
    security(("bearerAuth" = []))
)]
pub async fn expire_override(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Path(override_id): Path<Uuid>,
    Query(query): Query<ReasonQuery>,
) -> Result<Json<UserPermissionOverride>, AppError> {
    auth.require_write(&state, permissions::PERMISSION_GRANT).await?;
    let expired = state
        .rbac
        .expire_override(override_id, query.reason, &operator(&auth, &headers))
        .await?;
    Ok(Json(expired))
}

// =============================================================================
// EFFECTIVE PERMISSIONS & CHANGE LOG
// =============================================================================

/// Users may always read their own effective permissions
#[utoipa::path(
    get,
    path = "/rbac/users/{user_id}/effective-permissions",
    tag = "RBAC",
    params(("user_id" = Uuid, Path, description = "User ID"), ScopeQuery),
    responses((status = 200, description = "Computed effective permissions", body = EffectivePermissions)),
    security(("bearerAuth" = []))
)]
pub async fn get_effective_permissions(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
    Query(scope): Query<ScopeQuery>,
) -> Result<Json<EffectivePermissions>, AppError> {
    if auth.user_id != user_id {
        auth.require(&state, permissions::PERMISSION_READ).await?;
    }

    let effective = state
        .resolver
        .resolve_effective_permissions(user_id, scope.factory_id)
        .await?;
    Ok(Json(effective))
}

#[utoipa::path(
    get,
    path = "/rbac/change-logs",
    tag = "RBAC",
    params(ChangeLogQuery),
    responses((status = 200, description = "Change log, newest first", body = Vec<PermissionChangeLog>)),
    security(("bearerAuth" = []))
)]
pub async fn list_change_logs(
    State(state): State<AppState>,
    auth: AuthUser,
    Query(query): Query<ChangeLogQuery>,
) -> Result<Json<Vec<PermissionChangeLog>>, AppError> {
    auth.require(&state, permissions::AUDIT_READ).await?;
    Ok(Json(state.audit.list(&query).await?))
}
