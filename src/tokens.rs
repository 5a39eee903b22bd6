//! Opaque capability tokens (email confirmation, password reset, login exchange).

use chrono::{Duration, Utc};
use rand::RngCore;

use crate::error::ApiError;
use crate::models::{Id, Token, TokenScope};
use crate::repo::{Repo, RepoError};

pub const CONFIRM_EMAIL_TTL_HOURS: i64 = 72;
pub const RESET_PASSWORD_TTL_HOURS: i64 = 12;
pub const LOGIN_EXCHANGE_TTL_MINUTES: i64 = 10;

/// 32 random bytes rendered as lowercase hex.
pub fn random_value() -> String {
    let mut b = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut b);
    hex::encode(b)
}

fn is_well_formed(value: &str) -> bool {
    value.len() == 64 && value.bytes().all(|c| c.is_ascii_digit() || (b'a'..=b'f').contains(&c))
}

pub async fn create(repo: &dyn Repo, owner: Id, scope: TokenScope, ttl: Duration, multi_use: bool) -> Result<Token, ApiError> {
    let token = Token { value: random_value(), owner, scope, expires_time: Utc::now() + ttl, multi_use };
    repo.create_token(&token).await?;
    Ok(token)
}

/// Looks a token up by its wire value. Expired tokens count as missing unless
/// `allow_expired` is set, which must never be used to authorise anything.
pub async fn find(repo: &dyn Repo, value: &str, allow_expired: bool) -> Result<Token, ApiError> {
    let value = value.trim().to_ascii_lowercase();
    if !is_well_formed(&value) {
        return Err(ApiError::BadToken);
    }
    match repo.find_token(&value).await {
        Ok(t) if allow_expired || !t.is_expired() => Ok(t),
        Ok(_) | Err(RepoError::NotFound) => Err(ApiError::BadToken),
        Err(e) => Err(e.into()),
    }
}

pub async fn update(repo: &dyn Repo, token: &Token) -> Result<(), ApiError> {
    repo.update_token(token).await?;
    Ok(())
}

pub async fn delete(repo: &dyn Repo, value: &str) -> Result<(), ApiError> {
    repo.delete_token(value).await?;
    Ok(())
}

/// Consumes a live token of the given scope. Single-use tokens are gone once
/// this returns, whatever the caller does next; a scope mismatch leaves the
/// token in place.
pub async fn consume(repo: &dyn Repo, value: &str, scope: TokenScope) -> Result<Token, ApiError> {
    let value = value.trim().to_ascii_lowercase();
    if !is_well_formed(&value) {
        return Err(ApiError::BadToken);
    }
    let token = match repo.take_token(&value, scope).await {
        Ok(t) => t,
        Err(RepoError::NotFound) => return Err(ApiError::BadToken),
        Err(e) => return Err(e.into()),
    };
    if token.is_expired() {
        tracing::warn!(scope = token.scope.as_str(), "rejected expired token");
        return Err(ApiError::BadToken);
    }
    Ok(token)
}

#[cfg(all(test, feature = "inmem-store"))]
mod tests {
    use super::*;
    use crate::models::ANONYMOUS_USER_ID;
    use crate::repo::inmem::InMemRepo;

    #[test]
    fn values_are_64_hex_chars() {
        let v = random_value();
        assert!(is_well_formed(&v));
        assert_ne!(v, random_value());
    }

    #[tokio::test]
    async fn single_use_token_is_gone_after_consume() {
        let repo = InMemRepo::new();
        let t = create(&repo, ANONYMOUS_USER_ID, TokenScope::LoginExchange, Duration::minutes(5), false).await.unwrap();
        consume(&repo, &t.value, TokenScope::LoginExchange).await.unwrap();
        assert_eq!(consume(&repo, &t.value, TokenScope::LoginExchange).await.unwrap_err(), ApiError::BadToken);
    }

    #[tokio::test]
    async fn expired_tokens_only_visible_when_asked() {
        let repo = InMemRepo::new();
        let t = create(&repo, ANONYMOUS_USER_ID, TokenScope::ConfirmEmail, Duration::seconds(-1), false).await.unwrap();
        assert_eq!(find(&repo, &t.value, false).await.unwrap_err(), ApiError::BadToken);
        assert!(find(&repo, &t.value, true).await.is_ok());
    }

    #[tokio::test]
    async fn wrong_scope_is_rejected() {
        let repo = InMemRepo::new();
        let t = create(&repo, ANONYMOUS_USER_ID, TokenScope::ResetPassword, Duration::hours(1), false).await.unwrap();
        assert_eq!(consume(&repo, &t.value, TokenScope::ConfirmEmail).await.unwrap_err(), ApiError::BadToken);
    }
}
