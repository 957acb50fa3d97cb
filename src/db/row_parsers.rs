use chrono::{DateTime, NaiveDate, NaiveDateTime, TimeZone, Utc};
use serde_json::Value;
use sqlx::sqlite::SqliteRow;
use sqlx::Row;
use uuid::Uuid;

use crate::errors::AppError;
use crate::jwt::TokenType;
use crate::models::audit::PermissionChangeLog;
use crate::models::rbac::{Permission, ResolvedRole, Role, UserPermissionOverride, UserRoleAssignment};
use crate::models::token::{RevocationReason, RevokedToken};
use crate::models::user::{DbUser, Factory};

pub fn parse_datetime(s: &str) -> Result<DateTime<Utc>, AppError> {
    let s = s.trim();

    // RFC3339, which is what sqlx writes for DateTime<Utc>
    if let Ok(dt) = DateTime::parse_from_rfc3339(s) {
        return Ok(dt.with_timezone(&Utc));
    }

    // SQLite CURRENT_TIMESTAMP format, optional fractional seconds
    if let Ok(naive) = NaiveDateTime::parse_from_str(s, "%Y-%m-%d %H:%M:%S%.f") {
        return Ok(Utc.from_utc_datetime(&naive));
    }

    if let Ok(naive_date) = NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        let ndt = naive_date
            .and_hms_opt(0, 0, 0)
            .ok_or_else(|| AppError::internal("invalid datetime: date out of range".to_string()))?;
        return Ok(Utc.from_utc_datetime(&ndt));
    }

    Err(AppError::internal(format!("invalid datetime: {}", s)))
}

fn text(row: &SqliteRow, col: &str) -> Result<String, AppError> {
    row.try_get(col)
        .map_err(|e| AppError::internal(format!("missing {}: {}", col, e)))
}

fn opt_text(row: &SqliteRow, col: &str) -> Result<Option<String>, AppError> {
    row.try_get(col)
        .map_err(|e| AppError::internal(format!("missing {}: {}", col, e)))
}

fn flag(row: &SqliteRow, col: &str) -> Result<bool, AppError> {
    row.try_get(col)
        .map_err(|e| AppError::internal(format!("missing {}: {}", col, e)))
}

fn uuid(row: &SqliteRow, col: &str) -> Result<Uuid, AppError> {
    let s = text(row, col)?;
    Uuid::parse_str(&s).map_err(|e| AppError::internal(format!("invalid uuid in {}: {}", col, e)))
}

fn opt_uuid(row: &SqliteRow, col: &str) -> Result<Option<Uuid>, AppError> {
    match opt_text(row, col)? {
        Some(s) if !s.trim().is_empty() => Uuid::parse_str(&s)
            .map(Some)
            .map_err(|e| AppError::internal(format!("invalid uuid in {}: {}", col, e))),
        _ => Ok(None),
    }
}

fn datetime(row: &SqliteRow, col: &str) -> Result<DateTime<Utc>, AppError> {
    parse_datetime(&text(row, col)?)
}

fn opt_datetime(row: &SqliteRow, col: &str) -> Result<Option<DateTime<Utc>>, AppError> {
    match opt_text(row, col)? {
        Some(s) if !s.trim().is_empty() => Ok(Some(parse_datetime(&s)?)),
        _ => Ok(None),
    }
}

fn opt_json(row: &SqliteRow, col: &str) -> Result<Option<Value>, AppError> {
    match opt_text(row, col)? {
        Some(s) => serde_json::from_str(&s)
            .map(Some)
            .map_err(|e| AppError::internal(format!("invalid json in {}: {}", col, e))),
        None => Ok(None),
    }
}

pub fn permission_from_row(row: &SqliteRow) -> Result<Permission, AppError> {
    Ok(Permission {
        id: uuid(row, "id")?,
        code: text(row, "code")?,
        name: text(row, "name")?,
        description: opt_text(row, "description")?,
        module: text(row, "module")?,
        action: text(row, "action")?,
        scope: text(row, "scope")?,
        is_active: flag(row, "is_active")?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
    })
}

pub fn role_from_row(row: &SqliteRow) -> Result<Role, AppError> {
    let level: i64 = row
        .try_get("level")
        .map_err(|e| AppError::internal(format!("missing level: {}", e)))?;

    Ok(Role {
        id: uuid(row, "id")?,
        code: text(row, "code")?,
        name: text(row, "name")?,
        description: opt_text(row, "description")?,
        level,
        is_system: flag(row, "is_system")?,
        is_default: flag(row, "is_default")?,
        is_active: flag(row, "is_active")?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
    })
}

/// Expects role columns plus `factory_id` and `assigned_at` from the assignment.
pub fn resolved_role_from_row(row: &SqliteRow) -> Result<ResolvedRole, AppError> {
    let level: i64 = row
        .try_get("level")
        .map_err(|e| AppError::internal(format!("missing level: {}", e)))?;

    Ok(ResolvedRole {
        id: uuid(row, "id")?,
        code: text(row, "code")?,
        name: text(row, "name")?,
        level,
        factory_id: opt_uuid(row, "factory_id")?,
        assigned_at: datetime(row, "assigned_at")?,
    })
}

pub fn assignment_from_row(row: &SqliteRow) -> Result<UserRoleAssignment, AppError> {
    Ok(UserRoleAssignment {
        id: uuid(row, "id")?,
        user_id: uuid(row, "user_id")?,
        role_id: uuid(row, "role_id")?,
        factory_id: opt_uuid(row, "factory_id")?,
        granted_by: opt_uuid(row, "granted_by")?,
        is_active: flag(row, "is_active")?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
    })
}

/// Expects override columns plus the joined `permission_code`.
pub fn override_from_row(row: &SqliteRow) -> Result<UserPermissionOverride, AppError> {
    Ok(UserPermissionOverride {
        id: uuid(row, "id")?,
        user_id: uuid(row, "user_id")?,
        permission_id: uuid(row, "permission_id")?,
        permission_code: text(row, "permission_code")?,
        factory_id: opt_uuid(row, "factory_id")?,
        granted: flag(row, "granted")?,
        expires_at: opt_datetime(row, "expires_at")?,
        is_active: flag(row, "is_active")?,
        granted_by: opt_uuid(row, "granted_by")?,
        reason: opt_text(row, "reason")?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
    })
}

pub fn change_log_from_row(row: &SqliteRow) -> Result<PermissionChangeLog, AppError> {
    let action = text(row, "action")?
        .parse()
        .map_err(AppError::internal)?;

    Ok(PermissionChangeLog {
        id: uuid(row, "id")?,
        action,
        target_user_id: opt_uuid(row, "target_user_id")?,
        operator_id: opt_uuid(row, "operator_id")?,
        role_id: opt_uuid(row, "role_id")?,
        permission_id: opt_uuid(row, "permission_id")?,
        old_value: opt_json(row, "old_value")?,
        new_value: opt_json(row, "new_value")?,
        reason: opt_text(row, "reason")?,
        ip_address: opt_text(row, "ip_address")?,
        user_agent: opt_text(row, "user_agent")?,
        created_at: datetime(row, "created_at")?,
    })
}

pub fn revoked_token_from_row(row: &SqliteRow) -> Result<RevokedToken, AppError> {
    let token_type = match text(row, "token_type")?.as_str() {
        "access" => TokenType::Access,
        "refresh" => TokenType::Refresh,
        other => return Err(AppError::internal(format!("invalid token_type: {}", other))),
    };
    let reason_s = text(row, "reason")?;
    let reason = RevocationReason::parse(&reason_s)
        .ok_or_else(|| AppError::internal(format!("invalid revocation reason: {}", reason_s)))?;

    Ok(RevokedToken {
        id: uuid(row, "id")?,
        token_id: text(row, "token_id")?,
        user_id: opt_uuid(row, "user_id")?,
        token_type,
        reason,
        expires_at: datetime(row, "expires_at")?,
        created_at: datetime(row, "created_at")?,
    })
}

pub fn db_user_from_row(row: &SqliteRow) -> Result<DbUser, AppError> {
    Ok(DbUser {
        id: uuid(row, "id")?,
        username: text(row, "username")?,
        password_hash: text(row, "password_hash")?,
        display_name: text(row, "display_name")?,
        role: text(row, "role")?,
        factory_id: opt_uuid(row, "factory_id")?,
        is_active: flag(row, "is_active")?,
        last_login_at: opt_datetime(row, "last_login_at")?,
        created_at: datetime(row, "created_at")?,
        updated_at: datetime(row, "updated_at")?,
    })
}

pub fn factory_from_row(row: &SqliteRow) -> Result<Factory, AppError> {
    Ok(Factory {
        id: uuid(row, "id")?,
        name: text(row, "name")?,
        code: text(row, "code")?,
        is_active: flag(row, "is_active")?,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_rfc3339_and_sqlite_formats() {
        let a = parse_datetime("2025-03-01T10:00:00+00:00").unwrap();
        let b = parse_datetime("2025-03-01 10:00:00").unwrap();
        let c = parse_datetime("2025-03-01T10:00:00.250Z").unwrap();
        assert_eq!(a, b);
        assert!(c > a);
        assert_eq!(parse_datetime("2025-03-01").unwrap().timestamp(), a.timestamp() - 36_000);
        assert!(parse_datetime("yesterday").is_err());
    }
}
