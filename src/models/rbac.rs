use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

// =============================================================================
// PERMISSION
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Permission {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub module: String,
    pub action: String,
    pub scope: String,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionCreateRequest {
    #[schema(example = "equipment:import")]
    pub code: String,
    #[schema(example = "Import equipment")]
    pub name: String,
    pub description: Option<String>,
    #[schema(example = "factory")]
    pub scope: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionUpdateRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub scope: Option<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct PermissionListQuery {
    /// Only permissions of this module
    pub module: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ReasonQuery {
    pub reason: Option<String>,
}

// =============================================================================
// ROLE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Role {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub level: i64,
    pub is_system: bool,
    pub is_default: bool,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleCreateRequest {
    #[schema(example = "SHIFT_LEAD")]
    pub code: String,
    #[schema(example = "Shift lead")]
    pub name: String,
    pub description: Option<String>,
    #[serde(default)]
    pub level: i64,
    #[serde(default)]
    pub is_default: bool,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleUpdateRequest {
    pub name: Option<String>,
    pub description: Option<String>,
    pub level: Option<i64>,
    pub is_default: Option<bool>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RoleWithPermissions {
    #[serde(flatten)]
    pub role: Role,
    pub permissions: Vec<Permission>,
}

// =============================================================================
// ROLE-PERMISSION LINK
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RolePermission {
    pub id: Uuid,
    pub role_id: Uuid,
    pub permission_id: Uuid,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetRolePermissionsRequest {
    /// Exact codes, `module:*` or `*`
    #[schema(example = json!(["equipment:*", "inspection:read"]))]
    pub patterns: Vec<String>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SetRolePermissionsOutcome {
    pub role_id: Uuid,
    pub assigned: usize,
    /// Exact codes that matched no active permission and were skipped
    pub unmatched: Vec<String>,
}

// =============================================================================
// USER-ROLE ASSIGNMENT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserRoleAssignment {
    pub id: Uuid,
    pub user_id: Uuid,
    pub role_id: Uuid,
    pub factory_id: Option<Uuid>,
    pub granted_by: Option<Uuid>,
    pub is_active: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct AssignRoleRequest {
    pub role_id: Uuid,
    pub factory_id: Option<Uuid>,
    pub reason: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ScopeQuery {
    pub factory_id: Option<Uuid>,
    pub reason: Option<String>,
}

// =============================================================================
// USER PERMISSION OVERRIDE
// =============================================================================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserPermissionOverride {
    pub id: Uuid,
    pub user_id: Uuid,
    pub permission_id: Uuid,
    pub permission_code: String,
    pub factory_id: Option<Uuid>,
    /// `false` is an explicit denial
    pub granted: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub is_active: bool,
    pub granted_by: Option<Uuid>,
    pub reason: Option<String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl UserPermissionOverride {
    /// Active and not past its expiry at `now`.
    pub fn is_effective_at(&self, now: DateTime<Utc>) -> bool {
        self.is_active && self.expires_at.map_or(true, |expires_at| expires_at > now)
    }
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct OverrideRequest {
    pub permission_id: Uuid,
    pub factory_id: Option<Uuid>,
    #[serde(default = "default_granted")]
    pub granted: bool,
    pub expires_at: Option<DateTime<Utc>>,
    pub reason: Option<String>,
}

fn default_granted() -> bool {
    true
}

// =============================================================================
// EFFECTIVE PERMISSIONS (computed)
// =============================================================================

/// A role reached through an active assignment.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ResolvedRole {
    pub id: Uuid,
    pub code: String,
    pub name: String,
    pub level: i64,
    pub factory_id: Option<Uuid>,
    pub assigned_at: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EffectivePermissions {
    pub user_id: Uuid,
    pub factory_id: Option<Uuid>,
    /// Ordered by level descending, then assignment time ascending
    pub roles: Vec<ResolvedRole>,
    /// Sorted, de-duplicated codes
    pub all_permissions: Vec<String>,
}

impl EffectivePermissions {
    pub fn primary_role(&self) -> Option<&ResolvedRole> {
        self.roles.first()
    }

    pub fn has_permission(&self, required: &str) -> bool {
        crate::authz::has_permission(&self.all_permissions, required)
    }

    pub fn is_empty(&self) -> bool {
        self.roles.is_empty() && self.all_permissions.is_empty()
    }
}
