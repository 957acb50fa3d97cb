use axum::extract::State;
use axum::http::HeaderMap;
use axum::routing::{get, post};
use axum::{Json, Router};

use crate::app::AppState;
use crate::authz::permissions;
use crate::errors::AppResult;
use crate::events::RequestContext;
use crate::jwt::{bearer_token, AuthUser};
use crate::models::token::RevokeTokenRequest;
use crate::models::user::{
    ChangePasswordRequest, LoginRequest, LoginResponse, LogoutRequest, MeResponse, RefreshRequest, RefreshResponse,
    SuccessResponse,
};

pub fn routes() -> Router<AppState> {
    Router::new()
        .route("/login", post(login))
        .route("/refresh", post(refresh))
        .route("/logout", post(logout))
        .route("/me", get(me))
        .route("/change-password", post(change_password))
        .route("/revoke", post(revoke))
}

#[utoipa::path(
    post,
    path = "/auth/login",
    tag = "Auth",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Login successful", body = LoginResponse),
        (status = 401, description = "Invalid credentials")
    )
)]
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<LoginRequest>,
) -> AppResult<Json<LoginResponse>> {
    let response = state
        .auth
        .login(
            &payload.username,
            &payload.password,
            payload.remember_me,
            Some(RequestContext::from_headers(&headers)),
        )
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/auth/refresh",
    tag = "Auth",
    request_body = RefreshRequest,
    responses(
        (status = 200, description = "New access token", body = RefreshResponse),
        (status = 401, description = "Invalid or expired token")
    )
)]
pub async fn refresh(
    State(state): State<AppState>,
    Json(payload): Json<RefreshRequest>,
) -> AppResult<Json<RefreshResponse>> {
    Ok(Json(state.auth.refresh(&payload.refresh_token).await?))
}

/// Works without a valid access token; a bearer header, when present, is
/// revoked alongside the refresh token.
#[utoipa::path(
    post,
    path = "/auth/logout",
    tag = "Auth",
    request_body = LogoutRequest,
    responses((status = 200, description = "Always succeeds", body = SuccessResponse))
)]
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<LogoutRequest>,
) -> Json<SuccessResponse> {
    let response = state
        .auth
        .logout(
            &payload.refresh_token,
            bearer_token(&headers),
            Some(RequestContext::from_headers(&headers)),
        )
        .await;
    Json(response)
}

#[utoipa::path(
    get,
    path = "/auth/me",
    tag = "Auth",
    responses(
        (status = 200, description = "Current user and token claims", body = MeResponse),
        (status = 401, description = "Invalid or expired token")
    ),
    security(("bearerAuth" = []))
)]
pub async fn me(State(state): State<AppState>, auth: AuthUser) -> AppResult<Json<MeResponse>> {
    let user = state.auth.current_user(auth.user_id).await?;
    Ok(Json(MeResponse {
        user,
        claims: auth.claims,
    }))
}

#[utoipa::path(
    post,
    path = "/auth/change-password",
    tag = "Auth",
    request_body = ChangePasswordRequest,
    responses(
        (status = 200, description = "Password changed", body = SuccessResponse),
        (status = 401, description = "Current password incorrect"),
        (status = 422, description = "New password violates the policy")
    ),
    security(("bearerAuth" = []))
)]
pub async fn change_password(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(payload): Json<ChangePasswordRequest>,
) -> AppResult<Json<SuccessResponse>> {
    let response = state
        .auth
        .change_password(
            auth.user_id,
            &payload.old_password,
            &payload.new_password,
            Some(RequestContext::from_headers(&headers)),
        )
        .await?;
    Ok(Json(response))
}

#[utoipa::path(
    post,
    path = "/auth/revoke",
    tag = "Auth",
    request_body = RevokeTokenRequest,
    responses(
        (status = 200, description = "Token revoked", body = SuccessResponse),
        (status = 403, description = "Missing permission:manage")
    ),
    security(("bearerAuth" = []))
)]
pub async fn revoke(
    State(state): State<AppState>,
    auth: AuthUser,
    headers: HeaderMap,
    Json(payload): Json<RevokeTokenRequest>,
) -> AppResult<Json<SuccessResponse>> {
    auth.require_write(&state, permissions::PERMISSION_MANAGE).await?;

    let response = state
        .auth
        .revoke_token(
            &payload.token,
            payload.token_type,
            auth.user_id,
            Some(RequestContext::from_headers(&headers)),
        )
        .await?;
    Ok(Json(response))
}
