use std::fmt;
use std::sync::Arc;

use axum::async_trait;
use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use axum::http::HeaderMap;
use chrono::{Duration, Utc};
use jsonwebtoken::errors::ErrorKind;
use jsonwebtoken::{Algorithm, DecodingKey, EncodingKey, Header, Validation};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::app::AppState;
use crate::authz::{AuthzMode, Principal, ResourceContext};
use crate::config::RevocationCheck;
use crate::errors::AppError;
use crate::models::rbac::Role;

pub const DEFAULT_ISSUER: &str = "fire-safety-system";
pub const DEFAULT_AUDIENCE: &str = "fire-safety-client";

// Development-only fallbacks. Production refuses to start without real secrets.
pub const DEV_ACCESS_SECRET: &str = "fire-safety-dev-access-secret-change-me";
pub const DEV_REFRESH_SECRET: &str = "fire-safety-dev-refresh-secret-change-me";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum TokenType {
    Access,
    Refresh,
}

impl TokenType {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenType::Access => "access",
            TokenType::Refresh => "refresh",
        }
    }
}

impl fmt::Display for TokenType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Verification failures. Kept distinct for logs; clients only ever see
/// one "invalid or expired token" message.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum TokenError {
    #[error("token expired")]
    Expired,
    #[error("malformed token or invalid signature: {0}")]
    Invalid(String),
    #[error("wrong token type, expected {expected}")]
    WrongType { expected: TokenType },
    #[error("token revoked")]
    Revoked,
    #[error("failed to sign token: {0}")]
    Signing(String),
}

/// Claim set shared by access and refresh tokens. Refresh tokens leave the
/// identity snapshot fields empty.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct TokenClaims {
    pub user_id: Uuid,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(default)]
    pub factory_id: Option<Uuid>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub permissions: Vec<String>,
    #[serde(rename = "type")]
    pub token_type: TokenType,
    pub iat: i64,
    pub jti: Uuid,
    pub exp: i64,
    pub iss: String,
    pub aud: String,
}

/// Identity snapshot embedded in an access token.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccessClaimsInput {
    pub user_id: Uuid,
    pub username: String,
    pub role: String,
    pub factory_id: Option<Uuid>,
    pub permissions: Vec<String>,
}

#[derive(Debug, Clone)]
pub struct IssuedToken {
    pub token: String,
    pub claims: TokenClaims,
}

#[derive(Debug, Clone)]
pub struct JwtConfig {
    pub access_secret: Arc<Vec<u8>>,
    pub refresh_secret: Arc<Vec<u8>>,
    pub access_exp_hours: i64,
    pub refresh_exp_days: i64,
    pub remember_me_exp_days: i64,
    pub issuer: String,
    pub audience: String,
}

impl JwtConfig {
    pub fn new(access_secret: impl Into<Vec<u8>>, refresh_secret: impl Into<Vec<u8>>) -> Self {
        Self {
            access_secret: Arc::new(access_secret.into()),
            refresh_secret: Arc::new(refresh_secret.into()),
            access_exp_hours: 24,
            refresh_exp_days: 30,
            remember_me_exp_days: 90,
            issuer: DEFAULT_ISSUER.to_string(),
            audience: DEFAULT_AUDIENCE.to_string(),
        }
    }

    /// Reads secrets and lifetimes from the environment. Missing secrets fall
    /// back to the development defaults unless `production` is set.
    pub fn from_env(production: bool) -> Result<Self, AppError> {
        let access_secret = read_secret("JWT_SECRET", DEV_ACCESS_SECRET, production)?;
        let refresh_secret = read_secret("JWT_REFRESH_SECRET", DEV_REFRESH_SECRET, production)?;

        let mut config = Self::new(access_secret, refresh_secret);
        config.access_exp_hours = env_i64("JWT_EXP_HOURS", 24)?;
        config.refresh_exp_days = env_i64("JWT_REFRESH_EXP_DAYS", 30)?;
        config.remember_me_exp_days = env_i64("JWT_REMEMBER_ME_EXP_DAYS", 90)?;
        if let Ok(issuer) = std::env::var("JWT_ISSUER") {
            config.issuer = issuer;
        }
        if let Ok(audience) = std::env::var("JWT_AUDIENCE") {
            config.audience = audience;
        }

        Ok(config)
    }

    pub fn issue_access_token(&self, input: &AccessClaimsInput) -> Result<IssuedToken, TokenError> {
        let now = Utc::now();
        let claims = TokenClaims {
            user_id: input.user_id,
            username: Some(input.username.clone()),
            role: Some(input.role.clone()),
            factory_id: input.factory_id,
            permissions: input.permissions.clone(),
            token_type: TokenType::Access,
            iat: now.timestamp(),
            jti: Uuid::new_v4(),
            exp: (now + Duration::hours(self.access_exp_hours)).timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        self.sign(claims)
    }

    pub fn issue_refresh_token(&self, user_id: Uuid, remember_me: bool) -> Result<IssuedToken, TokenError> {
        let now = Utc::now();
        let days = if remember_me {
            self.remember_me_exp_days
        } else {
            self.refresh_exp_days
        };

        let claims = TokenClaims {
            user_id,
            username: None,
            role: None,
            factory_id: None,
            permissions: Vec::new(),
            token_type: TokenType::Refresh,
            iat: now.timestamp(),
            jti: Uuid::new_v4(),
            exp: (now + Duration::days(days)).timestamp(),
            iss: self.issuer.clone(),
            aud: self.audience.clone(),
        };

        self.sign(claims)
    }

    /// Full verification: type, signature with the type's secret, expiry,
    /// issuer and audience.
    pub fn verify(&self, token: &str, expected: TokenType) -> Result<TokenClaims, TokenError> {
        // Classify the token first so a refresh token presented as an access
        // token reports WrongType instead of a bare signature mismatch.
        let peeked = self.peek(token)?;
        if peeked.token_type != expected {
            return Err(TokenError::WrongType { expected });
        }

        jsonwebtoken::decode::<TokenClaims>(token, &self.decoding_key(expected), &self.validation(true))
            .map(|data| data.claims)
            .map_err(map_jwt_error)
    }

    /// Best-effort decode used at logout: prefer a signature-checked decode
    /// that ignores expiry, then fall back to reading the raw payload.
    pub fn decode_lenient(&self, token: &str, expected: TokenType) -> Option<TokenClaims> {
        let verified = jsonwebtoken::decode::<TokenClaims>(
            token,
            &self.decoding_key(expected),
            &self.validation(false),
        );

        match verified {
            Ok(data) => Some(data.claims),
            Err(err) => {
                tracing::debug!(error = %err, "lenient decode falling back to raw payload");
                self.peek(token).ok()
            }
        }
    }

    /// Reads the payload without checking anything.
    fn peek(&self, token: &str) -> Result<TokenClaims, TokenError> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.insecure_disable_signature_validation();
        validation.validate_exp = false;
        validation.validate_aud = false;
        validation.required_spec_claims.clear();

        jsonwebtoken::decode::<TokenClaims>(token, &DecodingKey::from_secret(&[]), &validation)
            .map(|data| data.claims)
            .map_err(|err| TokenError::Invalid(err.to_string()))
    }

    fn sign(&self, claims: TokenClaims) -> Result<IssuedToken, TokenError> {
        let key = EncodingKey::from_secret(self.secret(claims.token_type));
        let token = jsonwebtoken::encode(&Header::new(Algorithm::HS256), &claims, &key)
            .map_err(|err| TokenError::Signing(err.to_string()))?;

        Ok(IssuedToken { token, claims })
    }

    fn validation(&self, validate_exp: bool) -> Validation {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = validate_exp;
        validation.set_issuer(&[self.issuer.as_str()]);
        validation.set_audience(&[self.audience.as_str()]);
        validation.set_required_spec_claims(&["exp", "iat", "iss", "aud"]);
        validation
    }

    fn secret(&self, token_type: TokenType) -> &[u8] {
        match token_type {
            TokenType::Access => &self.access_secret,
            TokenType::Refresh => &self.refresh_secret,
        }
    }

    fn decoding_key(&self, token_type: TokenType) -> DecodingKey {
        DecodingKey::from_secret(self.secret(token_type))
    }
}

fn map_jwt_error(err: jsonwebtoken::errors::Error) -> TokenError {
    match err.kind() {
        ErrorKind::ExpiredSignature => TokenError::Expired,
        _ => TokenError::Invalid(err.to_string()),
    }
}

fn read_secret(var: &str, fallback: &str, production: bool) -> Result<String, AppError> {
    match std::env::var(var) {
        Ok(value) if !value.trim().is_empty() => Ok(value),
        _ if production => Err(AppError::configuration(format!("{var} must be set in production"))),
        _ => {
            tracing::warn!(variable = var, "using insecure development signing secret");
            Ok(fallback.to_string())
        }
    }
}

fn env_i64(var: &str, default: i64) -> Result<i64, AppError> {
    std::env::var(var)
        .map(|val| val.parse::<i64>())
        .unwrap_or(Ok(default))
        .map_err(|_| AppError::configuration(format!("{var} must be a valid integer")))
}

pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(axum::http::header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
}

/// Verified access-token claims attached to a request.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user_id: Uuid,
    pub token: String,
    pub claims: TokenClaims,
}

impl AuthUser {
    pub fn principal(&self) -> Principal {
        Principal::new(self.user_id)
            .with_role(self.claims.role.clone())
            .with_factory(self.claims.factory_id)
            .with_permissions(self.claims.permissions.clone())
    }

    /// Runs the policy evaluator under the configured enforcement mode.
    pub async fn require(&self, state: &AppState, permission: &str) -> Result<(), AppError> {
        self.require_in(state, permission, &ResourceContext::new()).await
    }

    /// Like [`Self::require`] for actions that change organisation-wide state.
    pub async fn require_write(&self, state: &AppState, permission: &str) -> Result<(), AppError> {
        self.require_in(state, permission, &ResourceContext::new().for_write()).await
    }

    pub async fn require_in(
        &self,
        state: &AppState,
        permission: &str,
        ctx: &ResourceContext,
    ) -> Result<(), AppError> {
        crate::authz::enforce(
            state.evaluator.as_ref(),
            state.config.authz_mode,
            &self.principal(),
            permission,
            ctx,
        )
        .await
    }

    /// Refuses handing out a role ranked above the caller's own primary role.
    pub async fn require_role_within_reach(&self, state: &AppState, role: &Role) -> Result<(), AppError> {
        let principal = self.principal();
        if state.config.authz_mode == AuthzMode::Off || principal.is_global() {
            return Ok(());
        }

        let own = state
            .resolver
            .resolve_with_fallback(self.user_id, self.claims.factory_id, self.claims.role.as_deref())
            .await?;
        let allowed = own.primary_role().is_some_and(|primary| role.level <= primary.level);
        crate::authz::apply(state.config.authz_mode, &principal, allowed, || {
            format!("role {} ranks above your own", role.code)
        })
    }

    /// Refuses granting or denying a permission the caller does not hold.
    pub fn require_held(&self, state: &AppState, code: &str) -> Result<(), AppError> {
        let principal = self.principal();
        let allowed = principal.has_permission(code);
        crate::authz::apply(state.config.authz_mode, &principal, allowed, || {
            format!("cannot delegate {code} without holding it")
        })
    }
}

#[async_trait]
impl FromRequestParts<AppState> for AuthUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(&parts.headers)
            .ok_or_else(|| AppError::unauthorized("Authorization header missing"))?;

        let claims = state.jwt.verify(token, TokenType::Access)?;

        if state.config.revocation_check == RevocationCheck::Always
            && state.revocation.is_revoked(&claims.jti.to_string()).await?
        {
            return Err(TokenError::Revoked.into());
        }

        Ok(AuthUser {
            user_id: claims.user_id,
            token: token.to_string(),
            claims,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn config() -> JwtConfig {
        JwtConfig::new("access-test-secret", "refresh-test-secret")
    }

    fn input() -> AccessClaimsInput {
        AccessClaimsInput {
            user_id: Uuid::new_v4(),
            username: "inspector1".to_string(),
            role: "INSPECTOR".to_string(),
            factory_id: Some(Uuid::new_v4()),
            permissions: vec!["equipment:read".to_string(), "issue:create".to_string()],
        }
    }

    #[test]
    fn access_token_round_trips() {
        let jwt = config();
        let input = input();
        let issued = jwt.issue_access_token(&input).unwrap();

        let claims = jwt.verify(&issued.token, TokenType::Access).unwrap();
        assert_eq!(claims, issued.claims);
        assert_eq!(claims.user_id, input.user_id);
        assert_eq!(claims.username.as_deref(), Some("inspector1"));
        assert_eq!(claims.role.as_deref(), Some("INSPECTOR"));
        assert_eq!(claims.factory_id, input.factory_id);
        assert_eq!(claims.permissions, input.permissions);
        assert_eq!(claims.token_type, TokenType::Access);
        assert_eq!(claims.iss, DEFAULT_ISSUER);
        assert_eq!(claims.aud, DEFAULT_AUDIENCE);
    }

    #[test]
    fn each_token_gets_a_fresh_jti() {
        let jwt = config();
        let input = input();
        let a = jwt.issue_access_token(&input).unwrap();
        let b = jwt.issue_access_token(&input).unwrap();
        assert_ne!(a.claims.jti, b.claims.jti);
    }

    #[test]
    fn claim_names_match_the_wire_shape() {
        let jwt = config();
        let issued = jwt.issue_access_token(&input()).unwrap();
        let value = serde_json::to_value(&issued.claims).unwrap();
        for key in ["userId", "username", "role", "factoryId", "permissions", "type", "iat", "jti"] {
            assert!(value.get(key).is_some(), "missing claim {key}");
        }
        assert_eq!(value["type"], "access");
    }

    #[test]
    fn refresh_token_rejected_as_access() {
        let jwt = config();
        let issued = jwt.issue_refresh_token(Uuid::new_v4(), false).unwrap();
        let err = jwt.verify(&issued.token, TokenType::Access).unwrap_err();
        assert_eq!(err, TokenError::WrongType { expected: TokenType::Access });
    }

    #[test]
    fn remember_me_extends_refresh_lifetime() {
        let jwt = config();
        let short = jwt.issue_refresh_token(Uuid::new_v4(), false).unwrap();
        let long = jwt.issue_refresh_token(Uuid::new_v4(), true).unwrap();
        let short_days = (short.claims.exp - short.claims.iat) / 86_400;
        let long_days = (long.claims.exp - long.claims.iat) / 86_400;
        assert_eq!(short_days, 30);
        assert_eq!(long_days, 90);
    }

    #[test]
    fn expired_token_is_reported_as_expired() {
        let mut jwt = config();
        jwt.refresh_exp_days = -1;
        let issued = jwt.issue_refresh_token(Uuid::new_v4(), false).unwrap();
        assert_eq!(jwt.verify(&issued.token, TokenType::Refresh).unwrap_err(), TokenError::Expired);
    }

    #[test]
    fn foreign_signature_is_invalid() {
        let jwt = config();
        let other = JwtConfig::new("someone-else", "someone-else-too");
        let issued = other.issue_access_token(&input()).unwrap();
        assert!(matches!(jwt.verify(&issued.token, TokenType::Access), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn wrong_audience_is_invalid() {
        let jwt = config();
        let mut other = config();
        other.audience = "somebody-else".to_string();
        let issued = other.issue_access_token(&input()).unwrap();
        assert!(matches!(jwt.verify(&issued.token, TokenType::Access), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn garbage_is_invalid() {
        assert!(matches!(config().verify("not.a.jwt", TokenType::Access), Err(TokenError::Invalid(_))));
    }

    #[test]
    fn lenient_decode_recovers_expired_and_foreign_tokens() {
        let mut jwt = config();
        jwt.refresh_exp_days = -1;
        let user_id = Uuid::new_v4();
        let expired = jwt.issue_refresh_token(user_id, false).unwrap();
        let recovered = jwt.decode_lenient(&expired.token, TokenType::Refresh).unwrap();
        assert_eq!(recovered.user_id, user_id);
        assert_eq!(recovered.jti, expired.claims.jti);

        let foreign = JwtConfig::new("x", "y").issue_refresh_token(user_id, false).unwrap();
        let recovered = jwt.decode_lenient(&foreign.token, TokenType::Refresh).unwrap();
        assert_eq!(recovered.user_id, user_id);

        assert!(jwt.decode_lenient("garbage", TokenType::Refresh).is_none());
    }
}
