#![allow(dead_code)]

use anyhow::{Context, Result};
use axum::body::{self, Body};
use axum::http::{Request, StatusCode};
use axum::Router;
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::sqlite::SqliteConnectOptions;
use sqlx::SqlitePool;
use tempfile::TempDir;
use tower::util::ServiceExt; // for `oneshot`
use uuid::Uuid;

use fire_safety_auth::jwt::JwtConfig;
use fire_safety_auth::models::audit::Operator;
use fire_safety_auth::models::user::{CreateUserRequest, User};
use fire_safety_auth::services::UserService;
use fire_safety_auth::{create_app_with_config, seed, AppConfig, Database};

pub const PASSWORD: &str = "Str0ng!Pass";
pub const TEST_BCRYPT_COST: u32 = 4;

pub struct TestApp {
    pub app: Router,
    pub db: Database,
    pub config: AppConfig,
    // keeps the database file alive for the duration of the test
    _dir: TempDir,
}

pub fn test_config() -> AppConfig {
    let mut config = AppConfig::new(JwtConfig::new("test-access-secret", "test-refresh-secret"));
    config.bcrypt_cost = TEST_BCRYPT_COST;
    config
}

/// Migrated, seeded database in a temp dir plus the router on top of it.
pub async fn spawn_app() -> Result<TestApp> {
    spawn_app_with(test_config()).await
}

pub async fn spawn_app_with(config: AppConfig) -> Result<TestApp> {
    let dir = tempfile::tempdir().context("failed to create tempdir")?;
    let db_path = dir.path().join("test.db");
    let opts = fire_safety_auth::db::tune(SqliteConnectOptions::new().filename(db_path.as_path()));
    let pool = SqlitePool::connect_with(opts).await?;

    let migrator =
        sqlx::migrate::Migrator::new(std::path::Path::new(env!("CARGO_MANIFEST_DIR")).join("migrations")).await?;
    migrator.run(&pool).await?;

    let db = Database::from_pool(pool);
    seed::seed(&db).await?;

    let app = create_app_with_config(db.clone(), config.clone()).await?;

    Ok(TestApp {
        app,
        db,
        config,
        _dir: dir,
    })
}

impl TestApp {
    pub fn users(&self) -> UserService {
        UserService::new(self.db.clone(), TEST_BCRYPT_COST)
    }

    pub async fn create_factory(&self, code: &str) -> Result<Uuid> {
        let id = Uuid::new_v4();
        let now = Utc::now();
        sqlx::query("INSERT INTO factories (id, name, code, is_active, created_at, updated_at) VALUES (?, ?, ?, 1, ?, ?)")
            .bind(id.to_string())
            .bind(format!("Factory {code}"))
            .bind(code)
            .bind(now)
            .bind(now)
            .execute(self.db.pool())
            .await?;
        Ok(id)
    }

    pub async fn create_user(&self, username: &str, role: &str, factory_id: Option<Uuid>) -> Result<User> {
        let user = self
            .users()
            .create_user(
                CreateUserRequest {
                    username: username.to_string(),
                    password: PASSWORD.to_string(),
                    display_name: username.to_string(),
                    role: role.to_string(),
                    factory_id,
                },
                &Operator::system(),
            )
            .await?;
        Ok(user)
    }

    pub async fn permission_id(&self, code: &str) -> Result<Uuid> {
        let id: String = sqlx::query_scalar("SELECT id FROM permissions WHERE code = ?")
            .bind(code)
            .fetch_one(self.db.pool())
            .await
            .with_context(|| format!("permission {code} not seeded"))?;
        Ok(Uuid::parse_str(&id)?)
    }

    pub async fn role_id(&self, code: &str) -> Result<Uuid> {
        let id: String = sqlx::query_scalar("SELECT id FROM roles WHERE code = ?")
            .bind(code)
            .fetch_one(self.db.pool())
            .await
            .with_context(|| format!("role {code} not seeded"))?;
        Ok(Uuid::parse_str(&id)?)
    }

    pub async fn send(
        &self,
        method: &str,
        uri: &str,
        token: Option<&str>,
        body: Option<Value>,
    ) -> Result<(StatusCode, Value)> {
        let mut builder = Request::builder().method(method).uri(uri);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {token}"));
        }
        let req = match body {
            Some(body) => builder
                .header("content-type", "application/json")
                .body(Body::from(body.to_string()))?,
            None => builder.body(Body::empty())?,
        };

        let resp = self.app.clone().oneshot(req).await?;
        let status = resp.status();
        let bytes = body::to_bytes(resp.into_body(), 10_485_760).await?;
        let value = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes)
                .with_context(|| format!("non-json body: {}", String::from_utf8_lossy(&bytes)))?
        };
        Ok((status, value))
    }

    /// Logs in and returns the full response body.
    pub async fn login(&self, username: &str, password: &str) -> Result<Value> {
        let (status, body) = self
            .send(
                "POST",
                "/auth/login",
                None,
                Some(json!({ "username": username, "password": password })),
            )
            .await?;
        if status != StatusCode::OK {
            anyhow::bail!("login failed: {} - {}", status, body);
        }
        Ok(body)
    }

    pub async fn access_token(&self, username: &str) -> Result<String> {
        let body = self.login(username, PASSWORD).await?;
        body["accessToken"]
            .as_str()
            .map(str::to_string)
            .context("missing accessToken")
    }

    pub async fn admin_token(&self) -> Result<String> {
        seed::create_admin(&self.db, TEST_BCRYPT_COST, "admin", PASSWORD).await?;
        self.access_token("admin").await
    }
}

pub fn codes(value: &Value) -> Vec<String> {
    value
        .as_array()
        .map(|items| {
            items
                .iter()
                .filter_map(|item| item.as_str().map(str::to_string))
                .collect()
        })
        .unwrap_or_default()
}
