use crate::authz::AuthzMode;
use crate::errors::AppError;
use crate::jwt::JwtConfig;

/// bcrypt work factor for newly hashed passwords.
pub const DEFAULT_BCRYPT_COST: u32 = 12;

/// When access-token verification consults the revocation store.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RevocationCheck {
    /// Every authenticated request
    Always,
    /// Only refresh and logout
    RefreshOnly,
}

impl RevocationCheck {
    pub fn parse(value: &str) -> Self {
        match value.trim().to_lowercase().as_str() {
            "refresh-only" | "refresh_only" => RevocationCheck::RefreshOnly,
            _ => RevocationCheck::Always,
        }
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub jwt: JwtConfig,
    pub authz_mode: AuthzMode,
    pub revocation_check: RevocationCheck,
    /// Blacklist each refresh token on use and hand out a replacement
    pub single_use_refresh: bool,
    pub bcrypt_cost: u32,
}

impl AppConfig {
    pub fn new(jwt: JwtConfig) -> Self {
        Self {
            jwt,
            authz_mode: AuthzMode::Strict,
            revocation_check: RevocationCheck::Always,
            single_use_refresh: false,
            bcrypt_cost: DEFAULT_BCRYPT_COST,
        }
    }

    pub fn from_env() -> Result<Self, AppError> {
        let production = std::env::var("APP_ENV")
            .map(|env| env.eq_ignore_ascii_case("production"))
            .unwrap_or(false);

        let mut config = Self::new(JwtConfig::from_env(production)?);

        if let Ok(mode) = std::env::var("AUTHZ_MODE") {
            config.authz_mode = AuthzMode::parse(&mode);
        }
        if let Ok(check) = std::env::var("TOKEN_REVOCATION_CHECK") {
            config.revocation_check = RevocationCheck::parse(&check);
        }
        if let Ok(single_use) = std::env::var("REFRESH_TOKEN_SINGLE_USE") {
            config.single_use_refresh = matches!(single_use.trim(), "1" | "true" | "yes");
        }
        if let Ok(cost) = std::env::var("BCRYPT_COST") {
            config.bcrypt_cost = cost
                .parse::<u32>()
                .map_err(|_| AppError::configuration("BCRYPT_COST must be a valid integer"))?;
        }

        if production && config.authz_mode != AuthzMode::Strict {
            tracing::warn!(mode = ?config.authz_mode, "authorization is not enforced in production");
        }

        Ok(config)
    }
}
