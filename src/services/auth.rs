//! Login, refresh, logout and password change.
//!
//! Login and refresh always re-read role and permission state; the claims in
//! an access token are a snapshot taken at issue time.

use std::sync::Arc;

use chrono::{DateTime, Duration, TimeZone, Utc};
use serde_json::json;
use uuid::Uuid;

use crate::db::row_parsers;
use crate::db::Database;
use crate::errors::{AppError, AppResult};
use crate::events::{self, names, EventBus, RequestContext, Severity};
use crate::jwt::{AccessClaimsInput, JwtConfig, TokenClaims, TokenError, TokenType};
use crate::models::token::RevocationReason;
use crate::models::user::{DbUser, Factory, LoginResponse, RefreshResponse, SessionUser, SuccessResponse, User};
use crate::services::resolver::PermissionResolver;
use crate::services::revocation::RevocationStore;
use crate::utils::{hash_password, password_violations, verify_against_dummy, verify_password};

#[derive(Clone)]
pub struct AuthService {
    db: Database,
    jwt: Arc<JwtConfig>,
    resolver: PermissionResolver,
    revocation: RevocationStore,
    event_bus: EventBus,
    bcrypt_cost: u32,
    single_use_refresh: bool,
}

impl AuthService {
    pub fn new(
        db: Database,
        jwt: Arc<JwtConfig>,
        resolver: PermissionResolver,
        revocation: RevocationStore,
        event_bus: EventBus,
        bcrypt_cost: u32,
    ) -> Self {
        Self {
            db,
            jwt,
            resolver,
            revocation,
            event_bus,
            bcrypt_cost,
            single_use_refresh: false,
        }
    }

    pub fn with_single_use_refresh(mut self, single_use: bool) -> Self {
        self.single_use_refresh = single_use;
        self
    }

    pub async fn login(
        &self,
        username: &str,
        password: &str,
        remember_me: bool,
        context: Option<RequestContext>,
    ) -> AppResult<LoginResponse> {
        let user = match self.find_active_user_by_username(username.trim()).await? {
            Some(user) => user,
            None => {
                verify_against_dummy(password, self.bcrypt_cost);
                tracing::warn!(username = %username, "login failed: unknown or inactive user");
                self.login_failed(None, username, "unknown_user", context);
                return Err(AppError::invalid_credentials());
            }
        };

        if !verify_password(password, &user.password_hash)? {
            tracing::warn!(user_id = %user.id, "login failed: wrong password");
            self.login_failed(Some(user.id), username, "wrong_password", context);
            return Err(AppError::invalid_credentials());
        }

        let session = self.session_for(&user).await?;
        let access = self.jwt.issue_access_token(&access_input(&session))?;
        let refresh = self.jwt.issue_refresh_token(user.id, remember_me)?;

        sqlx::query("UPDATE users SET last_login_at = ?, updated_at = ? WHERE id = ?")
            .bind(Utc::now())
            .bind(Utc::now())
            .bind(user.id.to_string())
            .execute(self.db.pool())
            .await?;

        let factory = match user.factory_id {
            Some(factory_id) => self.find_factory(factory_id).await?,
            None => None,
        };

        tracing::info!(user_id = %user.id, role = %session.role, "user logged in");
        events::publish_auth_event(
            &self.event_bus,
            names::LOGIN_SUCCEEDED,
            Some(user.id),
            Some(user.id),
            json!({ "rememberMe": remember_me, "role": session.role }),
            context,
            Severity::Important,
        );

        Ok(LoginResponse {
            access_token: access.token,
            refresh_token: refresh.token,
            user: session,
            factory,
        })
    }

    /// Issues a new access token from a refresh token. By default the refresh
    /// token is not consumed and may be presented again until it expires or is
    /// revoked. Under the single-use policy it is blacklisted with reason
    /// `rotation` and a replacement with the same lifetime class is returned.
    pub async fn refresh(&self, refresh_token: &str) -> AppResult<RefreshResponse> {
        let claims = self.jwt.verify(refresh_token, TokenType::Refresh)?;

        if self.single_use_refresh {
            // Consuming is the check: of two concurrent presentations only one inserts.
            let expires_at = Utc
                .timestamp_opt(claims.exp, 0)
                .single()
                .unwrap_or_else(Utc::now);
            let consumed = self
                .revocation
                .add(
                    refresh_token,
                    Some(claims.user_id),
                    TokenType::Refresh,
                    RevocationReason::Rotation,
                    expires_at,
                    Some(claims.jti),
                )
                .await?;
            if !consumed {
                tracing::warn!(user_id = %claims.user_id, jti = %claims.jti, "refresh token presented again after rotation");
                return Err(TokenError::Revoked.into());
            }
        } else if self.revocation.is_revoked(&claims.jti.to_string()).await? {
            return Err(TokenError::Revoked.into());
        }

        let user = self
            .find_active_user(claims.user_id)
            .await?
            .ok_or_else(|| TokenError::Invalid("subject is unknown or inactive".to_string()))?;

        let session = self.session_for(&user).await?;
        let access = self.jwt.issue_access_token(&access_input(&session))?;

        let rotated = if self.single_use_refresh {
            let remember_me = claims.exp - claims.iat > self.jwt.refresh_exp_days * 24 * 60 * 60;
            Some(self.jwt.issue_refresh_token(user.id, remember_me)?.token)
        } else {
            None
        };

        tracing::debug!(user_id = %user.id, rotated = rotated.is_some(), "access token refreshed");
        events::publish_auth_event(
            &self.event_bus,
            names::TOKEN_REFRESHED,
            Some(user.id),
            Some(user.id),
            json!({ "refreshJti": claims.jti }),
            None,
            Severity::Noise,
        );

        Ok(RefreshResponse {
            access_token: access.token,
            refresh_token: rotated,
            user: session,
        })
    }

    /// Blacklists the refresh token (and the access token, when given). Never
    /// fails: the client drops its copy regardless, so blacklist errors are
    /// only logged.
    pub async fn logout(
        &self,
        refresh_token: &str,
        access_token: Option<&str>,
        context: Option<RequestContext>,
    ) -> SuccessResponse {
        let claims = self.jwt.decode_lenient(refresh_token, TokenType::Refresh);
        let user_id = claims.as_ref().map(|c| c.user_id);
        let fallback_expiry = Utc::now() + Duration::days(self.jwt.remember_me_exp_days);

        if let Err(err) = self
            .blacklist(refresh_token, claims.as_ref(), TokenType::Refresh, RevocationReason::Logout, fallback_expiry)
            .await
        {
            tracing::warn!(error = %err, user_id = ?user_id, "logout: failed to blacklist refresh token");
        }

        if let Some(access_token) = access_token {
            let access_claims = self.jwt.decode_lenient(access_token, TokenType::Access);
            let fallback_expiry = Utc::now() + Duration::hours(self.jwt.access_exp_hours);
            if let Err(err) = self
                .blacklist(
                    access_token,
                    access_claims.as_ref(),
                    TokenType::Access,
                    RevocationReason::Logout,
                    fallback_expiry,
                )
                .await
            {
                tracing::warn!(error = %err, user_id = ?user_id, "logout: failed to blacklist access token");
            }
        }

        events::publish_auth_event(
            &self.event_bus,
            names::LOGOUT,
            user_id,
            user_id,
            json!({ "decoded": claims.is_some() }),
            context,
            Severity::Noise,
        );

        SuccessResponse::ok()
    }

    pub async fn change_password(
        &self,
        user_id: Uuid,
        old_password: &str,
        new_password: &str,
        context: Option<RequestContext>,
    ) -> AppResult<SuccessResponse> {
        let user = self
            .find_active_user(user_id)
            .await?
            .ok_or_else(|| AppError::not_found(format!("user {user_id}")))?;

        if !verify_password(old_password, &user.password_hash)? {
            return Err(AppError::unauthorized("current password is incorrect"));
        }

        let mut violations = password_violations(new_password);
        if new_password == old_password {
            violations.push("new password must differ from the current password".to_string());
        }
        if !violations.is_empty() {
            return Err(AppError::validation(violations));
        }

        let password_hash = hash_password(new_password, self.bcrypt_cost)?;
        sqlx::query("UPDATE users SET password_hash = ?, updated_at = ? WHERE id = ?")
            .bind(password_hash)
            .bind(Utc::now())
            .bind(user_id.to_string())
            .execute(self.db.pool())
            .await?;

        tracing::info!(%user_id, "password changed");
        events::publish_auth_event(
            &self.event_bus,
            names::PASSWORD_CHANGED,
            Some(user_id),
            Some(user_id),
            json!({}),
            context,
            Severity::Critical,
        );

        Ok(SuccessResponse::ok())
    }

    /// Administrative revocation of an arbitrary token.
    pub async fn revoke_token(
        &self,
        token: &str,
        token_type: TokenType,
        operator_id: Uuid,
        context: Option<RequestContext>,
    ) -> AppResult<SuccessResponse> {
        let claims = self.jwt.decode_lenient(token, token_type);
        let fallback_expiry = match token_type {
            TokenType::Access => Utc::now() + Duration::hours(self.jwt.access_exp_hours),
            TokenType::Refresh => Utc::now() + Duration::days(self.jwt.remember_me_exp_days),
        };

        self.blacklist(token, claims.as_ref(), token_type, RevocationReason::AdminAction, fallback_expiry)
            .await?;

        events::publish_auth_event(
            &self.event_bus,
            names::TOKEN_REVOKED,
            Some(operator_id),
            claims.as_ref().map(|c| c.user_id),
            json!({ "tokenType": token_type, "jti": claims.as_ref().map(|c| c.jti) }),
            context,
            Severity::Critical,
        );

        Ok(SuccessResponse::ok())
    }

    /// The user's current identity and permissions. Falls back to the
    /// baseline role on the user record when no assignment resolves.
    pub async fn session_for(&self, user: &DbUser) -> AppResult<SessionUser> {
        let effective = self
            .resolver
            .resolve_with_fallback(user.id, user.factory_id, Some(&user.role))
            .await?;

        let role = effective
            .primary_role()
            .map(|role| role.code.clone())
            .unwrap_or_else(|| user.role.clone());

        Ok(SessionUser {
            id: user.id,
            username: user.username.clone(),
            display_name: user.display_name.clone(),
            role,
            factory_id: user.factory_id,
            permissions: effective.all_permissions,
        })
    }

    pub async fn current_user(&self, user_id: Uuid) -> AppResult<User> {
        self.find_active_user(user_id)
            .await?
            .map(User::from)
            .ok_or_else(|| AppError::not_found(format!("user {user_id}")))
    }

    async fn blacklist(
        &self,
        raw: &str,
        claims: Option<&TokenClaims>,
        token_type: TokenType,
        reason: RevocationReason,
        fallback_expiry: DateTime<Utc>,
    ) -> AppResult<()> {
        let expires_at = claims
            .and_then(|c| Utc.timestamp_opt(c.exp, 0).single())
            .unwrap_or(fallback_expiry);

        self.revocation
            .add(raw, claims.map(|c| c.user_id), token_type, reason, expires_at, claims.map(|c| c.jti))
            .await?;
        Ok(())
    }

    fn login_failed(&self, user_id: Option<Uuid>, username: &str, reason: &str, context: Option<RequestContext>) {
        events::publish_auth_event(
            &self.event_bus,
            names::LOGIN_FAILED,
            None,
            user_id,
            json!({ "username": username, "reason": reason }),
            context,
            Severity::Important,
        );
    }

    async fn find_active_user_by_username(&self, username: &str) -> AppResult<Option<DbUser>> {
        let row = sqlx::query("SELECT * FROM users WHERE username = ? AND is_active = 1")
            .bind(username)
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(row_parsers::db_user_from_row).transpose()
    }

    async fn find_active_user(&self, user_id: Uuid) -> AppResult<Option<DbUser>> {
        let row = sqlx::query("SELECT * FROM users WHERE id = ? AND is_active = 1")
            .bind(user_id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(row_parsers::db_user_from_row).transpose()
    }

    async fn find_factory(&self, factory_id: Uuid) -> AppResult<Option<Factory>> {
        let row = sqlx::query("SELECT * FROM factories WHERE id = ?")
            .bind(factory_id.to_string())
            .fetch_optional(self.db.pool())
            .await?;
        row.as_ref().map(row_parsers::factory_from_row).transpose()
    }
}

fn access_input(session: &SessionUser) -> AccessClaimsInput {
    AccessClaimsInput {
        user_id: session.id,
        username: session.username.clone(),
        role: session.role.clone(),
        factory_id: session.factory_id,
        permissions: session.permissions.clone(),
    }
}
