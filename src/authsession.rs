//! Short-lived server-side state for OAuth and SSO round-trips.

use actix_web::cookie::{time, Cookie, SameSite};
use chrono::{Duration, Utc};
use uuid::Uuid;

use crate::error::ApiError;
use crate::models::{AuthSession, Id};
use crate::repo::{Repo, RepoError};

pub const AUTH_SESSION_COOKIE: &str = "auth-session";
pub const AUTH_SESSION_TTL_MINUTES: i64 = 15;

pub async fn create(repo: &dyn Repo, session_data: String, host: &str, token_value: &str) -> Result<AuthSession, ApiError> {
    let now = Utc::now();
    let s = AuthSession {
        id: Uuid::new_v4(),
        token_value: token_value.to_string(),
        host: host.to_string(),
        session_data,
        created_time: now,
        expires_time: now + Duration::minutes(AUTH_SESSION_TTL_MINUTES),
    };
    repo.create_auth_session(&s).await?;
    Ok(s)
}

/// Reads and deletes the session in one step. Expired sessions are consumed too,
/// but reported as missing.
pub async fn take(repo: &dyn Repo, id: Id) -> Result<AuthSession, ApiError> {
    match repo.take_auth_session(id).await {
        Ok(s) if s.expires_time > Utc::now() => Ok(s),
        Ok(_) | Err(RepoError::NotFound) => Err(ApiError::BadToken),
        Err(e) => Err(e.into()),
    }
}

/// Cookie carrying the auth-session id back to the callback. Cross-site capable
/// only over HTTPS.
pub fn cookie(id: Id, https: bool) -> Cookie<'static> {
    let mut c = Cookie::build(AUTH_SESSION_COOKIE, id.to_string())
        .path("/")
        .http_only(true)
        .max_age(time::Duration::minutes(AUTH_SESSION_TTL_MINUTES))
        .finish();
    if https {
        c.set_secure(true);
        c.set_same_site(SameSite::None);
    } else {
        c.set_same_site(SameSite::Lax);
    }
    c
}

pub fn removal_cookie() -> Cookie<'static> {
    let mut c = Cookie::build(AUTH_SESSION_COOKIE, "").path("/").http_only(true).finish();
    c.make_removal();
    c
}
