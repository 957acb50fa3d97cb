use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::db::row_parsers;
use crate::db::Database;
use crate::errors::AppResult;
use crate::jwt::TokenType;
use crate::models::token::{RevocationReason, RevokedToken};

/// Token blacklist keyed by jti.
#[derive(Debug, Clone)]
pub struct RevocationStore {
    db: Database,
}

/// Key under which a token is blacklisted. Raw JWTs (anything containing a
/// `.`) are stored as a SHA-256 digest so bearer material never lands in the
/// table; bare ids are used as-is.
pub fn revocation_key(token_or_id: &str) -> String {
    if token_or_id.contains('.') {
        hex::encode(Sha256::digest(token_or_id.as_bytes()))
    } else {
        token_or_id.to_string()
    }
}

impl RevocationStore {
    pub fn new(db: Database) -> Self {
        Self { db }
    }

    /// Records a revocation. Returns `false` when the token was already on
    /// the list; revoking the same token twice changes nothing.
    pub async fn add(
        &self,
        token_or_id: &str,
        user_id: Option<Uuid>,
        token_type: TokenType,
        reason: RevocationReason,
        expires_at: DateTime<Utc>,
        jti: Option<Uuid>,
    ) -> AppResult<bool> {
        let token_id = match jti {
            Some(jti) => jti.to_string(),
            None => revocation_key(token_or_id),
        };

        let inserted = sqlx::query(
            "INSERT OR IGNORE INTO revoked_tokens (id, token_id, user_id, token_type, reason, expires_at, created_at) \
             VALUES (?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4().to_string())
        .bind(&token_id)
        .bind(user_id.map(|u| u.to_string()))
        .bind(token_type.as_str())
        .bind(reason.as_str())
        .bind(expires_at)
        .bind(Utc::now())
        .execute(self.db.pool())
        .await?
        .rows_affected()
            == 1;

        if inserted {
            tracing::info!(%token_type, reason = reason.as_str(), user_id = ?user_id, "token revoked");
        }
        Ok(inserted)
    }

    pub async fn is_revoked(&self, token_or_id: &str) -> AppResult<bool> {
        let found = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM revoked_tokens WHERE token_id = ?")
            .bind(revocation_key(token_or_id))
            .fetch_one(self.db.pool())
            .await?;
        Ok(found > 0)
    }

    pub async fn list_for_user(&self, user_id: Uuid) -> AppResult<Vec<RevokedToken>> {
        let rows = sqlx::query("SELECT * FROM revoked_tokens WHERE user_id = ? ORDER BY julianday(created_at) DESC")
            .bind(user_id.to_string())
            .fetch_all(self.db.pool())
            .await?;

        rows.iter().map(row_parsers::revoked_token_from_row).collect()
    }

    /// Drops entries whose token would already fail its expiry check.
    pub async fn purge_expired(&self, now: DateTime<Utc>) -> AppResult<u64> {
        let result = sqlx::query("DELETE FROM revoked_tokens WHERE julianday(expires_at) <= julianday(?)")
            .bind(now)
            .execute(self.db.pool())
            .await?;

        tracing::info!(removed = result.rows_affected(), "purged expired revocations");
        Ok(result.rows_affected())
    }
}
