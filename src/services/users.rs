use chrono::Utc;
use sqlx::{Connection, SqliteConnection};
use uuid::Uuid;

use crate::db::row_parsers;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::models::audit::Operator;
use crate::models::user::{CreateUserRequest, User};
use crate::services::rbac::assign_role_in;
use crate::utils::{hash_password, password_violations};

const MIN_USERNAME_LENGTH: usize = 3;

#[derive(Debug, Clone)]
pub struct UserService {
    db: Database,
    bcrypt_cost: u32,
}

impl UserService {
    pub fn new(db: Database, bcrypt_cost: u32) -> Self {
        Self { db, bcrypt_cost }
    }

    /// Creates an account and auto-assigns the role matching its baseline
    /// role code plus every active default role that does not outrank it. The assignment step runs in
    /// a savepoint: if it fails, the user is still created and keeps only the
    /// baseline role on its record.
    pub async fn create_user(&self, req: CreateUserRequest, operator: &Operator) -> AppResult<User> {
        let username = req.username.trim().to_string();
        let mut violations = Vec::new();

        if username.chars().count() < MIN_USERNAME_LENGTH {
            violations.push(format!("username must be at least {MIN_USERNAME_LENGTH} characters"));
        }
        if req.display_name.trim().is_empty() {
            violations.push("display name must not be empty".to_string());
        }
        if req.role.trim().is_empty() {
            violations.push("role must not be empty".to_string());
        }

        let taken = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM users WHERE username = ?")
            .bind(&username)
            .fetch_one(self.db.pool())
            .await?;
        if taken > 0 {
            violations.push("username already exists".to_string());
        }

        if let Some(factory_id) = req.factory_id {
            let found = sqlx::query_scalar::<_, i64>("SELECT COUNT(*) FROM factories WHERE id = ?")
                .bind(factory_id.to_string())
                .fetch_one(self.db.pool())
                .await?;
            if found == 0 {
                violations.push("factory does not exist".to_string());
            }
        }

        violations.extend(password_violations(&req.password));
        if !violations.is_empty() {
            return Err(AppError::validation(violations));
        }

        let password_hash = hash_password(&req.password, self.bcrypt_cost)?;
        let id = Uuid::new_v4();
        let now = Utc::now();
        let role = req.role.trim();

        let mut tx = self.db.begin_write().await?;
        sqlx::query(
            "INSERT INTO users (id, username, password_hash, display_name, role, factory_id, is_active, created_at, updated_at) \
             VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)",
        )
        .bind(id.to_string())
        .bind(&username)
        .bind(&password_hash)
        .bind(req.display_name.trim())
        .bind(role)
        .bind(req.factory_id.map(|f| f.to_string()))
        .bind(now)
        .bind(now)
        .execute(&mut *tx)
        .await
        .map_err(username_conflict)?;

        let mut savepoint = tx.begin().await?;
        match assign_initial_roles(&mut savepoint, id, role, operator).await {
            Ok(assigned) => {
                savepoint.commit().await?;
                tracing::info!(user_id = %id, assigned, "initial roles assigned");
            }
            Err(err) => {
                savepoint.rollback().await?;
                tracing::warn!(user_id = %id, role = %role, error = %err, "role auto-assignment failed, user keeps baseline role only");
            }
        }

        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_one(&mut *tx)
            .await?;
        let user = row_parsers::db_user_from_row(&row)?;
        tx.commit().await?;

        tracing::info!(user_id = %id, username = %username, "user created");
        Ok(user.into())
    }

    pub async fn get_user(&self, id: Uuid) -> AppResult<User> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ?")
            .bind(id.to_string())
            .fetch_optional(self.db.pool())
            .await?
            .ok_or_else(|| AppError::not_found(format!("user {id}")))?;

        Ok(row_parsers::db_user_from_row(&row)?.into())
    }

    pub async fn find_by_username(&self, username: &str) -> AppResult<Option<User>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ?")
            .bind(username)
            .fetch_optional(self.db.pool())
            .await?;

        Ok(row.as_ref().map(row_parsers::db_user_from_row).transpose()?.map(User::from))
    }
}

/// A concurrent signup can take the name between the check and the insert.
fn username_conflict(err: sqlx::Error) -> AppError {
    if let sqlx::Error::Database(db) = &err {
        if db.is_unique_violation() {
            return AppError::validation(vec!["username already exists".to_string()]);
        }
    }
    err.into()
}

/// Assigns the unscoped role whose code is `base_role`, then every other
/// active default role ranked at or below it. A missing base role fails the
/// whole step.
async fn assign_initial_roles(
    conn: &mut SqliteConnection,
    user_id: Uuid,
    base_role: &str,
    operator: &Operator,
) -> AppResult<usize> {
    let base_id = sqlx::query_scalar::<_, String>("SELECT id FROM roles WHERE code = ? AND is_active = 1")
        .bind(base_role)
        .fetch_optional(&mut *conn)
        .await?
        .ok_or_else(|| AppError::not_found(format!("role {base_role}")))?;

    let default_ids = sqlx::query_scalar::<_, String>(
        "SELECT id FROM roles \
         WHERE is_default = 1 AND is_active = 1 AND id <> ?1 \
           AND level <= (SELECT level FROM roles WHERE id = ?1) \
         ORDER BY level DESC, code",
    )
    .bind(&base_id)
    .fetch_all(&mut *conn)
    .await?;

    let mut assigned = 0;
    for role_id in std::iter::once(base_id).chain(default_ids) {
        let role_id = Uuid::parse_str(&role_id).map_err(|e| AppError::internal(format!("invalid role id: {e}")))?;
        assign_role_in(
            conn,
            user_id,
            role_id,
            None,
            Some("automatic assignment at account creation".to_string()),
            operator,
        )
        .await?;
        assigned += 1;
    }

    Ok(assigned)
}
