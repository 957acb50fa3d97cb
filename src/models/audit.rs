use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use utoipa::{IntoParams, ToSchema};
use uuid::Uuid;

/// Kind of RBAC mutation recorded in the change log.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeAction {
    CreatePermission,
    UpdatePermission,
    DeactivatePermission,
    CreateRole,
    UpdateRole,
    DeactivateRole,
    DeleteRole,
    SetRolePermissions,
    AssignRole,
    RevokeRole,
    GrantPermission,
    DenyPermission,
    RevokePermission,
    ExpirePermission,
}

impl ChangeAction {
    pub const ALL: [ChangeAction; 14] = [
        ChangeAction::CreatePermission,
        ChangeAction::UpdatePermission,
        ChangeAction::DeactivatePermission,
        ChangeAction::CreateRole,
        ChangeAction::UpdateRole,
        ChangeAction::DeactivateRole,
        ChangeAction::DeleteRole,
        ChangeAction::SetRolePermissions,
        ChangeAction::AssignRole,
        ChangeAction::RevokeRole,
        ChangeAction::GrantPermission,
        ChangeAction::DenyPermission,
        ChangeAction::RevokePermission,
        ChangeAction::ExpirePermission,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ChangeAction::CreatePermission => "CREATE_PERMISSION",
            ChangeAction::UpdatePermission => "UPDATE_PERMISSION",
            ChangeAction::DeactivatePermission => "DEACTIVATE_PERMISSION",
            ChangeAction::CreateRole => "CREATE_ROLE",
            ChangeAction::UpdateRole => "UPDATE_ROLE",
            ChangeAction::DeactivateRole => "DEACTIVATE_ROLE",
            ChangeAction::DeleteRole => "DELETE_ROLE",
            ChangeAction::SetRolePermissions => "SET_ROLE_PERMISSIONS",
            ChangeAction::AssignRole => "ASSIGN_ROLE",
            ChangeAction::RevokeRole => "REVOKE_ROLE",
            ChangeAction::GrantPermission => "GRANT_PERMISSION",
            ChangeAction::DenyPermission => "DENY_PERMISSION",
            ChangeAction::RevokePermission => "REVOKE_PERMISSION",
            ChangeAction::ExpirePermission => "EXPIRE_PERMISSION",
        }
    }
}

impl fmt::Display for ChangeAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChangeAction {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        ChangeAction::ALL
            .iter()
            .copied()
            .find(|action| action.as_str() == s)
            .ok_or_else(|| format!("unknown change action: {s}"))
    }
}

/// Who made a change and from where.
#[derive(Debug, Clone, Default)]
pub struct Operator {
    /// `None` for system actions such as seeding
    pub user_id: Option<Uuid>,
    pub ip: Option<String>,
    pub user_agent: Option<String>,
}

impl Operator {
    pub fn system() -> Self {
        Self::default()
    }

    pub fn user(user_id: Uuid) -> Self {
        Self {
            user_id: Some(user_id),
            ..Self::default()
        }
    }
}

/// One append-only change-log row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PermissionChangeLog {
    pub id: Uuid,
    pub action: ChangeAction,
    pub target_user_id: Option<Uuid>,
    pub operator_id: Option<Uuid>,
    pub role_id: Option<Uuid>,
    pub permission_id: Option<Uuid>,
    #[schema(value_type = Object)]
    pub old_value: Option<Value>,
    #[schema(value_type = Object)]
    pub new_value: Option<Value>,
    pub reason: Option<String>,
    pub ip_address: Option<String>,
    pub user_agent: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default, Deserialize, IntoParams)]
#[serde(rename_all = "camelCase")]
#[into_params(parameter_in = Query)]
pub struct ChangeLogQuery {
    pub user_id: Option<Uuid>,
    pub action: Option<String>,
    pub limit: Option<i64>,
}
