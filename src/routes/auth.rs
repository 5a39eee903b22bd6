//! Admin UI authentication, email confirmation, password reset and
//! notification unsubscribe.

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::dynconfig;
use crate::error::ApiError;
use crate::models::{PrincipalView, TokenScope, User, UserAuthKind};
use crate::password::{self, validate_password};
use crate::principal::{AuthUser, Principal};
use crate::repo::RepoError;
use crate::routes::{no_content, parse_id, AppState};
use crate::tokens;
use crate::usersession::{self, ClientInfo};

// ---------------- Shared credential helpers ----------------

pub(crate) fn validate_email(email: &str) -> Result<String, ApiError> {
    let e = email.trim().to_lowercase();
    let valid = e.len() <= 254
        && matches!(e.split_once('@'), Some((local, domain)) if !local.is_empty() && domain.contains('.') && !domain.starts_with('.') && !domain.ends_with('.'))
        && !e.chars().any(char::is_whitespace);
    if valid {
        Ok(e)
    } else {
        Err(ApiError::invalid_prop("invalid email address"))
    }
}

pub(crate) fn validate_name(name: &str) -> Result<String, ApiError> {
    let n = name.trim();
    if n.is_empty() || n.chars().count() > 63 {
        return Err(ApiError::invalid_prop("name must be 1 to 63 characters"));
    }
    Ok(n.to_string())
}

/// Empty is allowed; anything else must be an absolute http(s) URL.
pub(crate) fn validate_website(url: Option<&str>) -> Result<String, ApiError> {
    let u = url.map(str::trim).unwrap_or_default();
    if u.is_empty() {
        return Ok(String::new());
    }
    match url::Url::parse(u) {
        Ok(parsed) if matches!(parsed.scheme(), "http" | "https") && u.len() <= 2083 => Ok(u.to_string()),
        _ => Err(ApiError::invalid_prop("invalid website URL")),
    }
}

/// Checks local credentials. Every failure before the account state checks
/// sleeps the wrong-credential delay and reports `invalid-credentials`.
pub(crate) async fn authenticate_local(st: &AppState, email: &str, pwd: &str) -> Result<User, ApiError> {
    let repo = st.repo.as_ref();
    let found = match repo.find_user_by_email(email.trim()).await {
        Ok(u) => Some(u),
        Err(RepoError::NotFound) => None,
        Err(e) => return Err(e.into()),
    };
    let mut user = match found {
        Some(u) if !u.system_account && u.auth_kind() == UserAuthKind::Local && !u.password_hash.is_empty() => u,
        Some(u) => {
            warn!(user = %u.id, "local login attempted for a non-local account");
            password::wrong_auth_delay(&st.cfg).await;
            return Err(ApiError::InvalidCredentials);
        }
        None => {
            warn!("local login attempted for an unknown email");
            password::wrong_auth_delay(&st.cfg).await;
            return Err(ApiError::InvalidCredentials);
        }
    };
    if user.locked {
        warn!(user = %user.id, "login attempted on a locked account");
        password::wrong_auth_delay(&st.cfg).await;
        return Err(ApiError::InvalidCredentials);
    }
    if !st.hasher.verify_async(user.password_hash.clone(), pwd.to_string()).await {
        let max = st.dyn_config.get_int(dynconfig::AUTH_LOGIN_MAX_ATTEMPTS).await;
        password::register_failure(repo, &mut user, max).await?;
        warn!(user = %user.id, attempts = user.failed_login_attempts, "wrong password");
        password::wrong_auth_delay(&st.cfg).await;
        return Err(ApiError::InvalidCredentials);
    }
    if user.banned {
        return Err(ApiError::UserBanned);
    }
    if !user.confirmed {
        return Err(ApiError::EmailNotConfirmed);
    }
    password::register_success(repo, &mut user).await?;
    Ok(user)
}

pub(crate) struct LocalSignup {
    pub email: String,
    pub name: String,
    pub password: String,
    pub website_url: Option<String>,
    /// Page URL for widget signups, empty for the admin UI.
    pub signup_host: String,
    pub lang_id: Option<String>,
}

/// Creates a local account and mails a confirmation link when `confirm_key`
/// asks for one. The first account on an instance without a superuser becomes
/// one when `bootstrap_superuser` is set.
pub(crate) async fn register_local(st: &AppState, s: LocalSignup, client: &ClientInfo, confirm_key: &str, bootstrap_superuser: bool) -> Result<User, ApiError> {
    let repo = st.repo.as_ref();
    let email = validate_email(&s.email)?;
    let name = validate_name(&s.name)?;
    validate_password(&s.password)?;
    let website_url = validate_website(s.website_url.as_deref())?;
    match repo.find_user_by_email(&email).await {
        Ok(_) => return Err(ApiError::EmailAlreadyExists),
        Err(RepoError::NotFound) => {}
        Err(e) => return Err(e.into()),
    }

    let mut user = User::new(&email, &name);
    user.password_hash = st.hasher.hash_async(s.password).await?;
    user.website_url = website_url;
    user.signup_ip = st.cfg.mask_ip(&client.ip);
    user.signup_host = s.signup_host;
    if let Some(lang) = s.lang_id.filter(|l| st.cfg.ui_languages.contains(l)) {
        user.lang_id = lang;
    }
    if bootstrap_superuser && repo.count_superusers().await? == 0 {
        info!(email = %user.email, "first user becomes superuser");
        user.is_superuser = true;
        user.confirm();
    }
    let needs_confirmation = !user.confirmed && st.cfg.mail_enabled() && st.dyn_config.get_bool(confirm_key).await;
    if !needs_confirmation {
        user.confirm();
    }
    match repo.create_user(&user).await {
        Ok(()) => {}
        Err(RepoError::Conflict) => return Err(ApiError::EmailAlreadyExists),
        Err(e) => return Err(e.into()),
    }
    info!(user = %user.id, confirmed = user.confirmed, "local user signed up");

    if needs_confirmation {
        let token = tokens::create(repo, user.id, TokenScope::ConfirmEmail, Duration::hours(tokens::CONFIRM_EMAIL_TTL_HOURS), false).await?;
        if let Err(e) = st.notifier.send_confirmation(&user, &token.value).await {
            warn!(user = %user.id, error = %e, "confirmation email failed");
            return Err(ApiError::EmailSendFailure);
        }
    }
    Ok(user)
}

// ---------------- Admin UI endpoints ----------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[utoipa::path(
    post,
    path = "/api/auth/login",
    request_body = LoginRequest,
    responses(
        (status = 200, description = "Logged in; session cookie set", body = PrincipalView),
        (status = 401, description = "Invalid credentials, unconfirmed email or banned user")
    )
)]
pub async fn login(req: HttpRequest, st: web::Data<AppState>, body: web::Json<LoginRequest>) -> Result<HttpResponse, ApiError> {
    let client = ClientInfo::from_request(&req);
    st.rate_limiter.login(&client.ip)?;
    let user = authenticate_local(&st, &body.email, &body.password).await?;
    let session = usersession::create(st.repo.as_ref(), &st.cfg, user.id, "", &client).await?;
    info!(user = %user.id, "admin login");
    Ok(HttpResponse::Ok()
        .cookie(usersession::cookie(usersession::encode(user.id, session.id), &st.cfg))
        .json(PrincipalView::new(&user, None)))
}

pub async fn logout(auth: Option<AuthUser>, st: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    if let Some(a) = auth {
        usersession::delete(st.repo.as_ref(), a.session_id).await?;
    }
    Ok(HttpResponse::NoContent().cookie(usersession::removal_cookie()).finish())
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SignupRequest {
    pub email: String,
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub website_url: Option<String>,
    #[serde(default)]
    pub lang_id: Option<String>,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SignupResponse {
    pub is_confirmed: bool,
}

#[utoipa::path(
    post,
    path = "/api/auth/signup",
    request_body = SignupRequest,
    responses(
        (status = 200, description = "Account created", body = SignupResponse),
        (status = 403, description = "Signups are disabled"),
        (status = 409, description = "Email already registered")
    )
)]
pub async fn signup(req: HttpRequest, st: web::Data<AppState>, body: web::Json<SignupRequest>) -> Result<HttpResponse, ApiError> {
    let client = ClientInfo::from_request(&req);
    st.rate_limiter.signup(&client.ip)?;
    if !st.dyn_config.get_bool(dynconfig::AUTH_SIGNUP_ENABLED).await {
        return Err(ApiError::SignupsForbidden);
    }
    let b = body.into_inner();
    let s = LocalSignup {
        email: b.email,
        name: b.name,
        password: b.password,
        website_url: b.website_url,
        signup_host: String::new(),
        lang_id: b.lang_id,
    };
    let user = register_local(&st, s, &client, dynconfig::AUTH_SIGNUP_CONFIRM_USER, true).await?;
    Ok(HttpResponse::Ok().json(SignupResponse { is_confirmed: user.confirmed }))
}

pub async fn cur_user(principal: Principal) -> HttpResponse {
    match principal.view() {
        Some(v) => HttpResponse::Ok().json(v),
        None => no_content(),
    }
}

#[derive(Debug, Deserialize)]
pub struct TokenQuery {
    pub token: String,
}

/// Confirms the address and sends the browser back where the signup happened.
pub async fn confirm(st: web::Data<AppState>, q: web::Query<TokenQuery>) -> Result<HttpResponse, ApiError> {
    let repo = st.repo.as_ref();
    let token = tokens::consume(repo, &q.token, TokenScope::ConfirmEmail).await?;
    let mut user = repo.find_user_by_id(token.owner).await.map_err(|e| match e {
        RepoError::NotFound => ApiError::BadToken,
        other => other.into(),
    })?;
    user.confirm();
    repo.update_user(&user).await?;
    info!(user = %user.id, "email confirmed");
    let target = match url::Url::parse(&user.signup_host) {
        Ok(u) if matches!(u.scheme(), "http" | "https") => user.signup_host.clone(),
        _ => format!("{}/{}/auth/login?confirmed=true", st.cfg.base_url, st.cfg.default_language),
    };
    Ok(HttpResponse::Found().insert_header((header::LOCATION, target)).finish())
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PwdResetSendRequest {
    pub email: String,
}

/// Always succeeds so that the response says nothing about the address.
pub async fn pwd_reset_send(st: web::Data<AppState>, body: web::Json<PwdResetSendRequest>) -> Result<HttpResponse, ApiError> {
    let repo = st.repo.as_ref();
    let user = match repo.find_user_by_email(body.email.trim()).await {
        Ok(u) => u,
        Err(RepoError::NotFound) => {
            warn!("password reset requested for an unknown email");
            return Ok(no_content());
        }
        Err(e) => return Err(e.into()),
    };
    if user.system_account || user.auth_kind() != UserAuthKind::Local {
        warn!(user = %user.id, "password reset requested for a non-local account");
        return Ok(no_content());
    }
    let token = tokens::create(repo, user.id, TokenScope::ResetPassword, Duration::hours(tokens::RESET_PASSWORD_TTL_HOURS), false).await?;
    if let Err(e) = st.notifier.send_password_reset(&user, &token.value).await {
        warn!(user = %user.id, error = %e, "password reset email failed");
    }
    Ok(no_content())
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PwdResetChangeRequest {
    pub token: String,
    pub password: String,
}

pub async fn pwd_reset_change(st: web::Data<AppState>, body: web::Json<PwdResetChangeRequest>) -> Result<HttpResponse, ApiError> {
    let repo = st.repo.as_ref();
    validate_password(&body.password)?;
    let token = tokens::consume(repo, &body.token, TokenScope::ResetPassword).await?;
    let mut user = repo.find_user_by_id(token.owner).await.map_err(|e| match e {
        RepoError::NotFound => ApiError::BadToken,
        other => other.into(),
    })?;
    if user.auth_kind() != UserAuthKind::Local || user.system_account {
        return Err(ApiError::NoLocalUser);
    }
    user.password_hash = st.hasher.hash_async(body.password.clone()).await?;
    password::unlock(&mut user);
    user.confirm();
    repo.update_user(&user).await?;
    usersession::expire_all_for(repo, user.id).await?;
    info!(user = %user.id, "password reset");
    Ok(no_content())
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnsubscribeQuery {
    pub secret_token: String,
    pub domain: String,
    pub kind: String,
}

pub async fn unsubscribe(st: web::Data<AppState>, q: web::Query<UnsubscribeQuery>) -> Result<HttpResponse, ApiError> {
    let repo = st.repo.as_ref();
    let secret = parse_id(&q.secret_token)?;
    let domain_id = parse_id(&q.domain)?;
    let user = repo.find_user_by_secret_token(secret).await.map_err(|e| match e {
        RepoError::NotFound => ApiError::BadToken,
        other => other.into(),
    })?;
    let mut du = repo.find_domain_user(domain_id, user.id).await?;
    match q.kind.as_str() {
        "reply" => du.notify_replies = false,
        "moderator" => du.notify_moderator = false,
        "commentStatus" => du.notify_comment_status = false,
        _ => return Err(ApiError::invalid_input("unknown notification kind")),
    }
    repo.upsert_domain_user(&du).await?;
    info!(user = %user.id, domain = %domain_id, kind = %q.kind, "unsubscribed");
    Ok(HttpResponse::Ok()
        .content_type(mime::TEXT_HTML_UTF_8)
        .body("<!doctype html><html><body><p>You have been unsubscribed.</p></body></html>"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn email_rules() {
        assert_eq!(validate_email(" A@B.co ").unwrap(), "a@b.co");
        assert!(validate_email("nope").is_err());
        assert!(validate_email("a@b").is_err());
        assert!(validate_email("a b@c.de").is_err());
    }

    #[test]
    fn website_rules() {
        assert_eq!(validate_website(None).unwrap(), "");
        assert!(validate_website(Some("https://x.test/me")).is_ok());
        assert!(validate_website(Some("javascript:alert(1)")).is_err());
    }
}
