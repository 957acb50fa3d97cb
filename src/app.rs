use std::sync::Arc;

use axum::http::Method;
use axum::routing::get;
use axum::Router;
use sqlx::SqlitePool;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::authz::{DefaultPolicyEvaluator, PolicyEvaluator};
use crate::config::AppConfig;
use crate::db::Database;
use crate::errors::AppError;
use crate::events::{self, EventBus};
use crate::jwt::JwtConfig;
use crate::routes::{auth, health, rbac, users};
use crate::services::{AuditTrail, AuthService, PermissionResolver, RbacService, RevocationStore, UserService};

/// Every service is built once from the same database handle and shared
/// by reference-counted clones across requests.
#[derive(Clone)]
pub struct AppState {
    pub db: Database,
    pub jwt: Arc<JwtConfig>,
    pub config: Arc<AppConfig>,
    pub evaluator: Arc<dyn PolicyEvaluator>,
    pub resolver: PermissionResolver,
    pub rbac: RbacService,
    pub audit: AuditTrail,
    pub revocation: RevocationStore,
    pub auth: AuthService,
    pub users: UserService,
    pub event_bus: EventBus,
}

impl AppState {
    pub fn new(db: Database, config: AppConfig, event_bus: EventBus) -> Self {
        let jwt = Arc::new(config.jwt.clone());
        let resolver = PermissionResolver::new(db.clone());
        let revocation = RevocationStore::new(db.clone());
        let auth = AuthService::new(
            db.clone(),
            Arc::clone(&jwt),
            resolver.clone(),
            revocation.clone(),
            event_bus.clone(),
            config.bcrypt_cost,
        )
        .with_single_use_refresh(config.single_use_refresh);

        Self {
            rbac: RbacService::new(db.clone()),
            audit: AuditTrail::new(db.clone()),
            users: UserService::new(db.clone(), config.bcrypt_cost),
            evaluator: Arc::new(DefaultPolicyEvaluator::new()),
            config: Arc::new(config),
            resolver,
            revocation,
            auth,
            jwt,
            event_bus,
            db,
        }
    }
}

/// Builds the router with configuration read from the environment.
pub async fn create_app(pool: SqlitePool) -> Result<Router, AppError> {
    let config = AppConfig::from_env()?;
    create_app_with_config(Database::from_pool(pool), config).await
}

pub async fn create_app_with_config(db: Database, config: AppConfig) -> Result<Router, AppError> {
    let (event_bus, rx) = events::init_event_bus();
    tokio::spawn(events::start_event_listener(rx, db.pool().clone()));

    let state = AppState::new(db, config, event_bus);
    Ok(build_router(state))
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::POST, Method::PUT, Method::DELETE, Method::OPTIONS])
        .allow_origin(Any)
        .allow_headers(Any);

    Router::new()
        .route("/api/health", get(health::health))
        .nest("/auth", auth::routes())
        .nest("/rbac", rbac::routes())
        .nest("/users", users::routes())
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}
