use axum::http::HeaderMap;

use crate::events::RequestContext;
use crate::jwt::AuthUser;
use crate::models::audit::Operator;

pub mod auth;
pub mod health;
pub mod rbac;
pub mod users;

/// Change-log operator for an authenticated request.
pub(crate) fn operator(auth: &AuthUser, headers: &HeaderMap) -> Operator {
    let ctx = RequestContext::from_headers(headers);
    Operator {
        user_id: Some(auth.user_id),
        ip: ctx.ip,
        user_agent: ctx.user_agent,
    }
}
