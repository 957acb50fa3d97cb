use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::jwt::TokenType;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "snake_case")]
pub enum RevocationReason {
    Logout,
    Rotation,
    AdminAction,
}

impl RevocationReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            RevocationReason::Logout => "logout",
            RevocationReason::Rotation => "rotation",
            RevocationReason::AdminAction => "admin_action",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "logout" => Some(RevocationReason::Logout),
            "rotation" => Some(RevocationReason::Rotation),
            "admin_action" => Some(RevocationReason::AdminAction),
            _ => None,
        }
    }
}

/// Blacklist entry. `token_id` is the jti, or a digest of the raw token
/// when no jti could be recovered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevokedToken {
    pub id: Uuid,
    pub token_id: String,
    pub user_id: Option<Uuid>,
    pub token_type: TokenType,
    pub reason: RevocationReason,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct RevokeTokenRequest {
    pub token: String,
    pub token_type: TokenType,
}
