//! Local credential handling: argon2id hashing, wrong-credential delay and lockout.

use std::time::Duration;

use argon2::password_hash::SaltString;
use argon2::{Algorithm, Argon2, Params, PasswordHash, PasswordHasher as _, PasswordVerifier as _, Version};
use chrono::Utc;
use rand::rngs::OsRng;
use rand::Rng;

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::models::User;
use crate::repo::Repo;

pub const MIN_PASSWORD_LEN: usize = 8;
pub const MAX_PASSWORD_LEN: usize = 63;

#[derive(Clone)]
pub struct PasswordHasher {
    params: Params,
}

impl PasswordHasher {
    /// `cost` is log2 of the argon2 memory size in KiB.
    pub fn new(cost: u32) -> Result<Self, ApiError> {
        let params = Params::new(1u32 << cost.clamp(3, 20), 2, 1, None).map_err(|e| {
            tracing::error!(error = %e, "invalid argon2 parameters");
            ApiError::Internal
        })?;
        Ok(Self { params })
    }

    fn argon2(&self) -> Argon2<'static> {
        Argon2::new(Algorithm::Argon2id, Version::V0x13, self.params.clone())
    }

    pub fn hash(&self, password: &str) -> Result<String, ApiError> {
        let salt = SaltString::generate(&mut OsRng);
        self.argon2()
            .hash_password(password.as_bytes(), &salt)
            .map(|h| h.to_string())
            .map_err(|e| {
                tracing::error!(error = %e, "password hashing failed");
                ApiError::Internal
            })
    }

    /// Constant-time with respect to the stored hash. Parameters embedded in
    /// the stored PHC string take precedence over the current cost.
    pub fn verify(&self, stored: &str, password: &str) -> bool {
        match PasswordHash::new(stored) {
            Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
            Err(_) => false,
        }
    }

    /// Hashing off the async executor.
    pub async fn hash_async(&self, password: String) -> Result<String, ApiError> {
        let me = self.clone();
        tokio::task::spawn_blocking(move || me.hash(&password)).await.map_err(|_| ApiError::Internal)?
    }

    pub async fn verify_async(&self, stored: String, password: String) -> bool {
        let me = self.clone();
        tokio::task::spawn_blocking(move || me.verify(&stored, &password)).await.unwrap_or(false)
    }
}

/// Length plus mixed character classes.
pub fn validate_password(p: &str) -> Result<(), ApiError> {
    let n = p.chars().count();
    if !(MIN_PASSWORD_LEN..=MAX_PASSWORD_LEN).contains(&n) {
        return Err(ApiError::invalid_prop(format!("password must be {MIN_PASSWORD_LEN} to {MAX_PASSWORD_LEN} characters")));
    }
    let upper = p.chars().any(|c| c.is_uppercase());
    let lower = p.chars().any(|c| c.is_lowercase());
    let other = p.chars().any(|c| !c.is_alphabetic());
    if !(upper && lower && other) {
        return Err(ApiError::invalid_prop("password must contain upper- and lowercase letters and a digit or symbol"));
    }
    Ok(())
}

/// Sleeps a uniformly random interval in the configured range. Not cancellable
/// by the caller: it runs on its own task and is awaited to completion.
pub async fn wrong_auth_delay(cfg: &AppConfig) {
    let (min, max) = (cfg.wrong_auth_delay_min, cfg.wrong_auth_delay_max);
    if max.is_zero() {
        return;
    }
    let ms = rand::thread_rng().gen_range(min.as_millis() as u64..=max.as_millis() as u64);
    let _ = tokio::spawn(tokio::time::sleep(Duration::from_millis(ms))).await;
}

/// Records a failed attempt and locks the account once `max_attempts` is reached.
pub async fn register_failure(repo: &dyn Repo, user: &mut User, max_attempts: i64) -> Result<(), ApiError> {
    user.failed_login_attempts += 1;
    if !user.locked && i64::from(user.failed_login_attempts) >= max_attempts {
        user.locked = true;
        user.locked_time = Some(Utc::now());
        tracing::warn!(user = %user.id, attempts = user.failed_login_attempts, "account locked after failed logins");
    }
    repo.update_user(user).await?;
    Ok(())
}

pub async fn register_success(repo: &dyn Repo, user: &mut User) -> Result<(), ApiError> {
    user.failed_login_attempts = 0;
    user.last_login = Some(Utc::now());
    repo.update_user(user).await?;
    Ok(())
}

pub fn unlock(user: &mut User) {
    user.locked = false;
    user.locked_time = None;
    user.failed_login_attempts = 0;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn verify_accepts_only_the_original() {
        let h = PasswordHasher::new(3).unwrap();
        let stored = h.hash("S3cretPwd!").unwrap();
        assert!(stored.starts_with("$argon2id$"));
        assert!(h.verify(&stored, "S3cretPwd!"));
        assert!(!h.verify(&stored, "S3cretPwd?"));
        assert!(!h.verify("", "S3cretPwd!"));
    }

    #[test]
    fn salts_differ() {
        let h = PasswordHasher::new(3).unwrap();
        assert_ne!(h.hash("S3cretPwd!").unwrap(), h.hash("S3cretPwd!").unwrap());
    }

    #[test]
    fn password_rules() {
        assert!(validate_password("S3cretPwd!").is_ok());
        assert!(validate_password("short1A").is_err());
        assert!(validate_password("alllowercase1").is_err());
        assert!(validate_password("NoDigitsOrSymbols").is_err());
    }

    #[tokio::test]
    async fn zero_delay_returns_immediately() {
        let cfg = AppConfig::for_tests();
        let started = std::time::Instant::now();
        wrong_auth_delay(&cfg).await;
        assert!(started.elapsed() < Duration::from_millis(50));
    }
}
