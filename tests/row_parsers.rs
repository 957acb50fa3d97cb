use sqlx::SqlitePool;
use uuid::Uuid;
use chrono::{Duration, Utc};

use fire_safety_auth::db::row_parsers::{
    change_log_from_row, db_user_from_row, override_from_row, revoked_token_from_row, role_from_row,
};
use fire_safety_auth::jwt::TokenType;
use fire_safety_auth::models::audit::ChangeAction;
use fire_safety_auth::models::token::RevocationReason;

async fn setup_pool() -> SqlitePool {
    SqlitePool::connect("sqlite::memory:").await.expect("connect")
}

#[tokio::test]
async fn parse_role_row_text_uuid() {
    let pool = setup_pool().await;
    sqlx::query(
        "CREATE TABLE roles (id TEXT, code TEXT, name TEXT, description TEXT, level INTEGER, is_system BOOLEAN, is_default BOOLEAN, is_active BOOLEAN, created_at TEXT, updated_at TEXT)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let id = Uuid::new_v4();
    let created = Utc::now().to_rfc3339();

    sqlx::query("INSERT INTO roles (id, code, name, description, level, is_system, is_default, is_active, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
        .bind(id.to_string())
        .bind("SHIFT_LEAD")
        .bind("Shift lead")
        .bind(Option::<String>::None)
        .bind(40i64)
        .bind(false)
        .bind(true)
        .bind(true)
        .bind(created.clone())
        .bind(created.clone())
        .execute(&pool)
        .await
        .unwrap();

    let row = sqlx::query("SELECT * FROM roles WHERE id = ?")
        .bind(id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();

    let parsed = role_from_row(&row).expect("parse");
    assert_eq!(parsed.id, id);
    assert_eq!(parsed.code, "SHIFT_LEAD");
    assert_eq!(parsed.level, 40);
    assert!(!parsed.is_system);
    assert!(parsed.is_default);
    assert!(parsed.description.is_none());
}

#[tokio::test]
async fn parse_user_row_with_sqlite_timestamps() {
    let pool = setup_pool().await;
    sqlx::query(
        "CREATE TABLE users (id TEXT, username TEXT, password_hash TEXT, display_name TEXT, role TEXT, factory_id TEXT, is_active BOOLEAN, last_login_at TEXT, created_at TEXT DEFAULT CURRENT_TIMESTAMP, updated_at TEXT DEFAULT CURRENT_TIMESTAMP)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let id = Uuid::new_v4();
    let factory_id = Uuid::new_v4();

    // created_at/updated_at come from CURRENT_TIMESTAMP, not RFC3339
    sqlx::query("INSERT INTO users (id, username, password_hash, display_name, role, factory_id, is_active, last_login_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?)")
        .bind(id.to_string())
        .bind("inspector1")
        .bind("$2b$04$hash")
        .bind("Inspector One")
        .bind("INSPECTOR")
        .bind(factory_id.to_string())
        .bind(true)
        .bind(Option::<String>::None)
        .execute(&pool)
        .await
        .unwrap();

    let row = sqlx::query("SELECT * FROM users WHERE id = ?")
        .bind(id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();

    let parsed = db_user_from_row(&row).expect("parse");
    assert_eq!(parsed.id, id);
    assert_eq!(parsed.factory_id, Some(factory_id));
    assert_eq!(parsed.role, "INSPECTOR");
    assert!(parsed.last_login_at.is_none());
    assert!(parsed.created_at <= Utc::now());
}

#[tokio::test]
async fn parse_override_row_with_joined_code() {
    let pool = setup_pool().await;
    sqlx::query(
        "CREATE TABLE user_permission_overrides (id TEXT, user_id TEXT, permission_id TEXT, factory_id TEXT, granted BOOLEAN, expires_at TEXT, is_active BOOLEAN, granted_by TEXT, reason TEXT, created_at TEXT, updated_at TEXT)",
    )
    .execute(&pool)
    .await
    .unwrap();
    sqlx::query("CREATE TABLE permissions (id TEXT, code TEXT)")
        .execute(&pool)
        .await
        .unwrap();

    let id = Uuid::new_v4();
    let user_id = Uuid::new_v4();
    let permission_id = Uuid::new_v4();
    let expires = Utc::now() + Duration::days(3);
    let now = Utc::now().to_rfc3339();

    sqlx::query("INSERT INTO permissions (id, code) VALUES (?, ?)")
        .bind(permission_id.to_string())
        .bind("report:export")
        .execute(&pool)
        .await
        .unwrap();
    sqlx::query("INSERT INTO user_permission_overrides (id, user_id, permission_id, factory_id, granted, expires_at, is_active, granted_by, reason, created_at, updated_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
        .bind(id.to_string())
        .bind(user_id.to_string())
        .bind(permission_id.to_string())
        .bind(Option::<String>::None)
        .bind(false)
        .bind(expires.to_rfc3339())
        .bind(true)
        .bind("")
        .bind(Some("temporary restriction".to_string()))
        .bind(now.clone())
        .bind(now.clone())
        .execute(&pool)
        .await
        .unwrap();

    let row = sqlx::query(
        "SELECT o.*, p.code AS permission_code FROM user_permission_overrides o JOIN permissions p ON p.id = o.permission_id WHERE o.id = ?",
    )
    .bind(id.to_string())
    .fetch_one(&pool)
    .await
    .unwrap();

    let parsed = override_from_row(&row).expect("parse");
    assert_eq!(parsed.user_id, user_id);
    assert_eq!(parsed.permission_code, "report:export");
    assert!(!parsed.granted);
    assert!(parsed.factory_id.is_none());
    // blank uuid text reads as absent
    assert!(parsed.granted_by.is_none());
    assert_eq!(parsed.expires_at.map(|e| e.timestamp()), Some(expires.timestamp()));
}

#[tokio::test]
async fn parse_change_log_row_with_json_values() {
    let pool = setup_pool().await;
    sqlx::query(
        "CREATE TABLE permission_change_logs (id TEXT, action TEXT, target_user_id TEXT, operator_id TEXT, role_id TEXT, permission_id TEXT, old_value TEXT, new_value TEXT, reason TEXT, ip_address TEXT, user_agent TEXT, created_at TEXT)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let id = Uuid::new_v4();
    let role_id = Uuid::new_v4();

    sqlx::query("INSERT INTO permission_change_logs (id, action, target_user_id, operator_id, role_id, permission_id, old_value, new_value, reason, ip_address, user_agent, created_at) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)")
        .bind(id.to_string())
        .bind("DELETE_ROLE")
        .bind(Option::<String>::None)
        .bind(Option::<String>::None)
        .bind(role_id.to_string())
        .bind(Option::<String>::None)
        .bind(Some(r#"{"code":"SHIFT_LEAD"}"#.to_string()))
        .bind(Some(r#"{"rolePermissionsRemoved":3,"assignmentsRemoved":1}"#.to_string()))
        .bind(Option::<String>::None)
        .bind(Some("127.0.0.1".to_string()))
        .bind(Option::<String>::None)
        .bind(Utc::now().to_rfc3339())
        .execute(&pool)
        .await
        .unwrap();

    let row = sqlx::query("SELECT * FROM permission_change_logs WHERE id = ?")
        .bind(id.to_string())
        .fetch_one(&pool)
        .await
        .unwrap();

    let parsed = change_log_from_row(&row).expect("parse");
    assert_eq!(parsed.action, ChangeAction::DeleteRole);
    assert_eq!(parsed.role_id, Some(role_id));
    assert_eq!(parsed.old_value.unwrap()["code"], "SHIFT_LEAD");
    assert_eq!(parsed.new_value.unwrap()["assignmentsRemoved"], 1);
    assert_eq!(parsed.ip_address.as_deref(), Some("127.0.0.1"));
}

#[tokio::test]
async fn parse_revoked_token_rejects_unknown_type() {
    let pool = setup_pool().await;
    sqlx::query(
        "CREATE TABLE revoked_tokens (id TEXT, token_id TEXT, user_id TEXT, token_type TEXT, reason TEXT, expires_at TEXT, created_at TEXT)",
    )
    .execute(&pool)
    .await
    .unwrap();

    let now = Utc::now().to_rfc3339();
    for (token_type, jti) in [("refresh", "jti-good"), ("session", "jti-bad")] {
        sqlx::query("INSERT INTO revoked_tokens (id, token_id, user_id, token_type, reason, expires_at, created_at) VALUES (?, ?, ?, ?, ?, ?, ?)")
            .bind(Uuid::new_v4().to_string())
            .bind(jti)
            .bind(Option::<String>::None)
            .bind(token_type)
            .bind("logout")
            .bind(now.clone())
            .bind(now.clone())
            .execute(&pool)
            .await
            .unwrap();
    }

    let good = sqlx::query("SELECT * FROM revoked_tokens WHERE token_id = 'jti-good'")
        .fetch_one(&pool)
        .await
        .unwrap();
    let parsed = revoked_token_from_row(&good).expect("parse");
    assert_eq!(parsed.token_type, TokenType::Refresh);
    assert_eq!(parsed.reason, RevocationReason::Logout);
    assert!(parsed.user_id.is_none());

    let bad = sqlx::query("SELECT * FROM revoked_tokens WHERE token_id = 'jti-bad'")
        .fetch_one(&pool)
        .await
        .unwrap();
    assert!(revoked_token_from_row(&bad).is_err());
}
