use axum::extract::{Path, State};
use axum::http::{HeaderMap, StatusCode};
use axum::routing::{get, post};
use axum::{Json, Router};
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::{permissions, ResourceContext};
use crate::errors::AppResult;
use crate::jwt::AuthUser;
use crate::models::user::{CreateUserRequest, User};
use crate::routes::operator;

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/", post(create_user))
        .route("/:user_id", get(get_user))
}

#[utoipa::path(
    post,
    path = "/users",
    tag = "Users",
    request_body = CreateUserRequest,
    responses(
        (status = 201, description = "User created", body = User),
        (status = 403, description = "Missing user:create in the target factory, or role ranks above the caller's own"),
        (status = 422, description = "Every violated rule, listed in details")
    ),
    security(("bearerAuth" = []))
)]
pub async fn create_user(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(req): Json<CreateUserRequest>,
) -> AppResult<(StatusCode, Json<User>)> {
    auth.require_in(
        &state,
        permissions::USER_CREATE,
        &ResourceContext::new().with_factory(req.factory_id).for_write(),
    )
    .await?;
    if let Some(role) = state.rbac.find_role_by_code(req.role.trim()).await? {
        auth.require_role_within_reach(&state, &role).await?;
    }

    let user = state.users.create_user(req, &operator(&auth, &headers)).await?;
    Ok((StatusCode::CREATED, Json(user)))
}

#[utoipa::path(
    get,
    path = "/users/{user_id}",
    tag = "Users",
    params(("user_id" = Uuid, Path, description = "User ID")),
    responses(
        (status = 200, description = "User", body = User),
        (status = 404, description = "User not found")
    ),
    security(("bearerAuth" = []))
)]
pub async fn get_user(
    State(state): State<AppState>,
    auth: AuthUser,
    Path(user_id): Path<Uuid>,
) -> AppResult<Json<User>> {
    let user = state.users.get_user(user_id).await?;
    if auth.user_id != user_id {
        auth.require_in(
            &state,
            permissions::USER_READ,
            &ResourceContext::new().with_factory(user.factory_id),
        )
        .await?;
    }
    Ok(Json(user))
}
