use std::sync::Arc;

use axum::{routing::get, Json, Router};
use utoipa::openapi::security::{HttpAuthScheme, HttpBuilder, SecurityScheme};
use utoipa::openapi::server::Server;
use utoipa::{Modify, OpenApi};
use utoipa_swagger_ui::SwaggerUi;

use crate::jwt::{TokenClaims, TokenType};
use crate::models;
use crate::routes;

#[derive(OpenApi)]
#[openapi(
    info(
        title = "Fire Safety Auth API",
        description = "Authentication, token lifecycle and role-based access control."
    ),
    paths(
        routes::health::health,
        routes::auth::login,
        routes::auth::refresh,
        routes::auth::logout,
        routes::auth::me,
        routes::auth::change_password,
        routes::auth::revoke,
        routes::users::create_user,
        routes::users::get_user,
        routes::rbac::list_permissions,
        routes::rbac::create_permission,
        routes::rbac::get_permission,
        routes::rbac::update_permission,
        routes::rbac::deactivate_permission,
        routes::rbac::list_roles,
        routes::rbac::create_role,
        routes::rbac::get_role,
        routes::rbac::update_role,
        routes::rbac::deactivate_role,
        routes::rbac::delete_role,
        routes::rbac::get_role_permissions,
        routes::rbac::set_role_permissions,
        routes::rbac::get_user_roles,
        routes::rbac::assign_role_to_user,
        routes::rbac::revoke_role_from_user,
        routes::rbac::get_user_overrides,
        routes::rbac::set_user_override,
        routes::rbac::revoke_user_override,
        routes::rbac::expire_override,
        routes::rbac::get_effective_permissions,
        routes::rbac::list_change_logs,
    ),
    components(
        schemas(
            routes::health::HealthResponse,
            TokenClaims,
            TokenType,
            models::user::User,
            models::user::Factory,
            models::user::SessionUser,
            models::user::CreateUserRequest,
            models::user::LoginRequest,
            models::user::LoginResponse,
            models::user::RefreshRequest,
            models::user::RefreshResponse,
            models::user::LogoutRequest,
            models::user::ChangePasswordRequest,
            models::user::SuccessResponse,
            models::user::MeResponse,
            models::token::RevokeTokenRequest,
            models::token::RevocationReason,
            models::rbac::Permission,
            models::rbac::PermissionCreateRequest,
            models::rbac::PermissionUpdateRequest,
            models::rbac::Role,
            models::rbac::RoleCreateRequest,
            models::rbac::RoleUpdateRequest,
            models::rbac::RoleWithPermissions,
            models::rbac::SetRolePermissionsRequest,
            models::rbac::SetRolePermissionsOutcome,
            models::rbac::UserRoleAssignment,
            models::rbac::AssignRoleRequest,
            models::rbac::UserPermissionOverride,
            models::rbac::OverrideRequest,
            models::rbac::ResolvedRole,
            models::rbac::EffectivePermissions,
            models::audit::ChangeAction,
            models::audit::PermissionChangeLog,
        )
    ),
    modifiers(&SecurityAddon),
    tags(
        (name = "Health", description = "Liveness"),
        (name = "Auth", description = "Login, token refresh, logout and password management"),
        (name = "Users", description = "User accounts"),
        (name = "RBAC", description = "Roles, permissions, assignments, overrides and the change log")
    )
)]
pub struct ApiDoc;

struct SecurityAddon;

impl Modify for SecurityAddon {
    fn modify(&self, openapi: &mut utoipa::openapi::OpenApi) {
        if let Some(components) = openapi.components.as_mut() {
            components.add_security_scheme(
                "bearerAuth",
                SecurityScheme::Http(
                    HttpBuilder::new()
                        .scheme(HttpAuthScheme::Bearer)
                        .bearer_format("JWT")
                        .build(),
                ),
            );
        }
    }
}

pub fn build_openapi(port: u16) -> utoipa::openapi::OpenApi {
    let mut doc = ApiDoc::openapi();
    doc.servers = Some(vec![Server::new(format!("http://localhost:{port}"))]);
    doc
}

pub fn swagger_routes(doc: utoipa::openapi::OpenApi) -> anyhow::Result<Router> {
    let swagger_config = utoipa_swagger_ui::Config::new(["/api-docs/openapi.json"])
        .try_it_out_enabled(true)
        .with_credentials(true)
        .persist_authorization(true);

    let doc_json = Arc::new(serde_json::to_value(&doc)?);

    let json_route = {
        let doc_json = Arc::clone(&doc_json);
        get(move || {
            let doc_json = Arc::clone(&doc_json);
            async move { Json((*doc_json).clone()) }
        })
    };

    Ok(Router::new()
        .route("/api-docs/openapi.json", json_route)
        .merge(SwaggerUi::new("/docs").config(swagger_config)))
}
