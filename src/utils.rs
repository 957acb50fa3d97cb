use std::sync::OnceLock;

use crate::errors::AppError;

const MIN_PASSWORD_LENGTH: usize = 8;
/// bcrypt ignores everything past this many bytes.
const MAX_PASSWORD_BYTES: usize = 72;
const PASSWORD_SYMBOLS: &str = "!@#$%^&*(),.?\":{}|<>";

/// Returns every rule the password breaks; empty when it is acceptable.
pub fn password_violations(password: &str) -> Vec<String> {
    let mut violations = Vec::new();
    let length = password.chars().count();

    if length < MIN_PASSWORD_LENGTH {
        violations.push(format!("password must be at least {MIN_PASSWORD_LENGTH} characters"));
    }
    if password.len() > MAX_PASSWORD_BYTES {
        violations.push(format!("password must be at most {MAX_PASSWORD_BYTES} bytes"));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        violations.push("password must contain an uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        violations.push("password must contain a lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        violations.push("password must contain a digit".to_string());
    }
    if !password.chars().any(|c| PASSWORD_SYMBOLS.contains(c)) {
        violations.push(format!("password must contain one of {PASSWORD_SYMBOLS}"));
    }

    violations
}

/// Hashes an already validated password.
pub fn hash_password(password: &str, cost: u32) -> Result<String, AppError> {
    bcrypt::hash(password, cost).map_err(|err| AppError::internal(format!("failed to hash password: {err}")))
}

pub fn verify_password(password: &str, password_hash: &str) -> Result<bool, AppError> {
    bcrypt::verify(password, password_hash)
        .map_err(|err| AppError::internal(format!("invalid password hash: {err}")))
}

fn dummy_hash(cost: u32) -> Option<&'static str> {
    static DUMMY_HASH: OnceLock<Option<String>> = OnceLock::new();
    DUMMY_HASH
        .get_or_init(|| bcrypt::hash("no-such-user", cost).ok())
        .as_deref()
}

/// Spends one bcrypt verification on a throwaway hash so a login for an
/// unknown username takes as long as a wrong password. Always `false`.
pub fn verify_against_dummy(password: &str, cost: u32) -> bool {
    match dummy_hash(cost) {
        Some(hash) => {
            let _ = bcrypt::verify(password, hash);
            false
        }
        None => false,
    }
}
