//! Append-only change log for RBAC mutations.
//!
//! Rows are written through [`record_change`] on the same connection (and so
//! the same transaction) as the mutation they describe.

use chrono::{DateTime, Utc};
use serde_json::Value;
use sqlx::SqliteConnection;
use uuid::Uuid;

use crate::db::row_parsers;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::audit::{ChangeAction, ChangeLogQuery, Operator, PermissionChangeLog};

const DEFAULT_LIMIT: i64 = 100;
const MAX_LIMIT: i64 = 1000;

/// Fields of a change-log row that the caller supplies.
#[derive(Debug, Clone)]
pub struct ChangeRecord {
    pub action: ChangeAction,
    pub target_user_id: Option<Uuid>,
    pub role_id: Option<Uuid>,
    pub permission_id: Option<Uuid>,
    pub old_value: Option<Value>,
    pub new_value: Option<Value>,
    pub reason: Option<String>,
}

impl ChangeRecord {
    pub fn new(action: ChangeAction) -> Self {
        Self {
            action,
            target_user_id: None,
            role_id: None,
            permission_id: None,
            old_value: None,
            new_value: None,
            reason: None,
        }
    }

    pub fn target_user(mut self, user_id: Uuid) -> Self {
        self.target_user_id = Some(user_id);
        self
    }

    pub fn role(mut self, role_id: Uuid) -> Self {
        self.role_id = Some(role_id);
        self
    }

    pub fn permission(mut self, permission_id: Uuid) -> Self {
        self.permission_id = Some(permission_id);
        self
    }

    pub fn old<T: serde::Serialize>(mut self, value: &T) -> Self {
        self.old_value = serde_json::to_value(value).ok();
        self
    }

    pub fn new_value<T: serde::Serialize>(mut self, value: &T) -> Self {
        self.new_value = serde_json::to_value(value).ok();
        self
    }

    pub fn reason(mut self, reason: Option<String>) -> Self {
        self.reason = reason;
        self
    }
}

pub async fn record_change(
    conn: &mut SqliteConnection,
    operator: &Operator,
    record: ChangeRecord,
) -> AppResult<Uuid> {
    let id = Uuid::new_v4();
    let old_value = record.old_value.as_ref().map(Value::to_string);
    let new_value = record.new_value.as_ref().map(Value::to_string);

    sqlx::query(
        "INSERT INTO permission_change_logs (id, action, target_user_id, operator_id, role_id, permission_id, old_value, new_value, reason, ip_address, user_agent, created_at) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id.to_string())
    .bind(record.action.as_str())
    .bind(record.target_user_id.map(|u| u.to_string()))
    .bind(operator.user_id.map(|u| u.to_string()))
    .bind(record.role_id.map(|u| u.to_string()))
    .bind(record.permission_id.map(|u| u.to_string()))
    .bind(old_value)
    .bind(new_value)
    .bind(&record.reason)
    .bind(&operator.ip)
    .bind(&operator.user_agent)
    .bind(Utc::now())
    .execute(&mut *conn)
    .await?;

    tracing::info!(
        action = %record.action,
        operator_id = ?operator.user_id,
        target_user_id = ?record.target_user_id,
        "permission change recorded"
    );

    Ok(id)
}

/// Read side of the change log plus the retention job.
#[derive(Debug, Clone)]
pub struct AuditTrail {
    db: Database,
}

impl AuditTrail {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Newest first.
    pub async fn list(&self, query: &ChangeLogQuery) -> AppResult<Vec<PermissionChangeLog>> {
        let action = match &query.action {
            Some(raw) => Some(raw.parse::<ChangeAction>().map_err(AppError::bad_request)?),
            None => None,
        };
        let limit = query.limit.unwrap_or(DEFAULT_LIMIT).clamp(1, MAX_LIMIT);
        let user_id = query.user_id.map(|u| u.to_string());

        let rows = sqlx::query(
            "SELECT * FROM permission_change_logs \
             WHERE (?1 IS NULL OR target_user_id = ?1) AND (?2 IS NULL OR action = ?2) \
             ORDER BY julianday(created_at) DESC, rowid DESC LIMIT ?3",
        )
        .bind(user_id)
        .bind(action.map(|a| a.as_str()))
        .bind(limit)
        .fetch_all(self.db.pool())
        .await?;

        rows.iter().map(row_parsers::change_log_from_row).collect()
    }

    /// Bulk retention: removes rows created before `cutoff`.
    pub async fn prune_older_than(&self, cutoff: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM permission_change_logs WHERE julianday(created_at) < julianday(?)")
            .bind(cutoff)
            .execute(self.db.pool())
            .await?;

        tracing::info!(removed = result.rows_affected(), %cutoff, "pruned permission change logs");
        Ok(result.rows_affected())
    }
}
