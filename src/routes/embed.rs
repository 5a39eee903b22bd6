//! Endpoints called by the embedded widget. Cross-origin by nature, so these
//! are exempt from the XSRF check and authenticate via the session header.

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use chrono::Duration;
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;

use crate::authz;
use crate::comments::{self, domain_by_host, ListQuery, NewComment};
use crate::dynconfig;
use crate::error::ApiError;
use crate::models::{CommentView, DomainUser, Id, PrincipalView, TokenScope, UserAuthKind, ANONYMOUS_USER_ID};
use crate::principal::{AuthUser, Principal};
use crate::repo::{OptionalExt, RepoError};
use crate::routes::auth::{authenticate_local, register_local, validate_name, validate_website, LocalSignup, SignupResponse};
use crate::routes::{no_content, AppState, SessionResponse};
use crate::tokens;
use crate::usersession::{self, ClientInfo};
use crate::votes;
use crate::web::builtin_messages;

/// Loads the caller's membership on the domain, creating a commenter row on
/// first contact.
async fn ensure_member(st: &AppState, domain_id: Id, user_id: Id) -> Result<DomainUser, ApiError> {
    let repo = st.repo.as_ref();
    if let Some(du) = repo.find_domain_user(domain_id, user_id).await.optional()? {
        return Ok(du);
    }
    let du = DomainUser::commenter(domain_id, user_id);
    repo.upsert_domain_user(&du).await?;
    Ok(du)
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct EmbedLoginRequest {
    pub email: String,
    pub password: String,
    pub host: String,
}

#[utoipa::path(
    post,
    path = "/api/embed/auth/login",
    request_body = EmbedLoginRequest,
    responses(
        (status = 200, description = "Logged in", body = SessionResponse),
        (status = 401, description = "invalid-credentials, email-not-confirmed or user-banned")
    )
)]
pub async fn login(req: HttpRequest, st: web::Data<AppState>, body: web::Json<EmbedLoginRequest>) -> Result<HttpResponse, ApiError> {
    let client = ClientInfo::from_request(&req);
    st.rate_limiter.login(&client.ip)?;
    let domain = domain_by_host(st.repo.as_ref(), &body.host).await?;
    let user = authenticate_local(&st, &body.email, &body.password).await?;
    let principal = Principal::Authenticated { user, domain_user: None }.for_domain(st.repo.as_ref(), domain.id).await?;
    let idps = st.repo.domain_idps(domain.id).await?;
    if !authz::domain_allows(&principal, &domain, &idps) {
        return Err(ApiError::FeatureDisabled(Some("local authentication is disabled for the domain".into())));
    }
    let Principal::Authenticated { user, .. } = principal else { return Err(ApiError::Internal) };
    let du = ensure_member(&st, domain.id, user.id).await?;
    let principal = Principal::Authenticated { user, domain_user: Some(du) };
    let session = usersession::create(st.repo.as_ref(), &st.cfg, principal.user_id(), &domain.host, &client).await?;
    info!(user = %principal.user_id(), domain = %domain.id, "embed login");
    let Some(view) = principal.view() else { return Err(ApiError::Internal) };
    Ok(HttpResponse::Ok().json(SessionResponse { session_token: usersession::encode(principal.user_id(), session.id), principal: view }))
}

pub async fn logout(auth: Option<AuthUser>, st: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    if let Some(a) = auth {
        usersession::delete(st.repo.as_ref(), a.session_id).await?;
        info!(user = %a.user.id, "embed logout");
    }
    Ok(no_content())
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EmbedSignupRequest {
    pub email: String,
    pub name: String,
    pub password: String,
    #[serde(default)]
    pub website_url: Option<String>,
    pub host: String,
    /// Page the signup happened on; the confirmation link returns there.
    #[serde(default)]
    pub url: String,
}

#[utoipa::path(
    post,
    path = "/api/embed/auth/signup",
    request_body = EmbedSignupRequest,
    responses(
        (status = 200, description = "Account created", body = SignupResponse),
        (status = 403, description = "signups-forbidden"),
        (status = 409, description = "email-already-exists")
    )
)]
pub async fn signup(req: HttpRequest, st: web::Data<AppState>, body: web::Json<EmbedSignupRequest>) -> Result<HttpResponse, ApiError> {
    let client = ClientInfo::from_request(&req);
    st.rate_limiter.signup(&client.ip)?;
    let domain = domain_by_host(st.repo.as_ref(), &body.host).await?;
    if !domain.auth_local || !st.dyn_config.domain_get_bool(domain.id, dynconfig::AUTH_SIGNUP_ENABLED).await {
        return Err(ApiError::SignupsForbidden);
    }
    let b = body.into_inner();
    let signup_host = if is_page_of(&b.url, &domain.host) { b.url.clone() } else { domain.root_url() };
    let s = LocalSignup { email: b.email, name: b.name, password: b.password, website_url: b.website_url, signup_host, lang_id: None };
    let user = register_local(&st, s, &client, dynconfig::AUTH_SIGNUP_CONFIRM_COMMENTER, false).await?;
    st.repo.upsert_domain_user(&DomainUser::commenter(domain.id, user.id)).await?;
    Ok(HttpResponse::Ok().json(SignupResponse { is_confirmed: user.confirmed }))
}

/// True when `page_url` is an http(s) URL whose authority is exactly `host`.
fn is_page_of(page_url: &str, host: &str) -> bool {
    let Ok(u) = url::Url::parse(page_url) else { return false };
    if !matches!(u.scheme(), "http" | "https") {
        return false;
    }
    let Some(h) = u.host_str() else { return false };
    let authority = match u.port() {
        Some(p) => format!("{h}:{p}"),
        None => h.to_string(),
    };
    authority.eq_ignore_ascii_case(host)
}

#[derive(Debug, Deserialize)]
pub struct HostQuery {
    #[serde(default)]
    pub host: Option<String>,
}

/// The caller with their membership on `host`, or 204 when not logged in.
pub async fn cur_user(st: web::Data<AppState>, principal: Principal, q: web::Query<HostQuery>) -> Result<HttpResponse, ApiError> {
    if principal.is_anonymous() {
        return Ok(no_content());
    }
    let principal = match q.host.as_deref().filter(|h| !h.trim().is_empty()) {
        Some(host) => match st.repo.find_domain_by_host(host.trim()).await {
            Ok(d) => principal.for_domain(st.repo.as_ref(), d.id).await?,
            Err(RepoError::NotFound) => principal,
            Err(e) => return Err(e.into()),
        },
        None => principal,
    };
    Ok(match principal.view() {
        Some(v) => HttpResponse::Ok().json(v),
        None => no_content(),
    })
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserUpdateRequest {
    pub host: String,
    pub name: Option<String>,
    pub website_url: Option<String>,
    pub lang_id: Option<String>,
    pub notify_replies: Option<bool>,
    pub notify_moderator: Option<bool>,
    pub notify_comment_status: Option<bool>,
}

/// Profile fields are editable for local accounts only; notification
/// preferences apply to the membership on `host`.
pub async fn update_user(auth: AuthUser, st: web::Data<AppState>, body: web::Json<UserUpdateRequest>) -> Result<HttpResponse, ApiError> {
    let repo = st.repo.as_ref();
    let domain = domain_by_host(repo, &body.host).await?;
    let mut user = auth.user;
    let local = user.auth_kind() == UserAuthKind::Local;
    let mut changed = false;
    if let Some(name) = body.name.as_deref() {
        let name = validate_name(name)?;
        if name != user.name {
            if !local {
                return Err(ApiError::ImmutableProperty);
            }
            user.name = name;
            changed = true;
        }
    }
    if let Some(url) = body.website_url.as_deref() {
        let url = validate_website(Some(url))?;
        if url != user.website_url {
            if !local {
                return Err(ApiError::ImmutableProperty);
            }
            user.website_url = url;
            changed = true;
        }
    }
    if let Some(lang) = body.lang_id.as_deref().filter(|l| *l != user.lang_id) {
        if !st.cfg.ui_languages.iter().any(|l| l == lang) {
            return Err(ApiError::invalid_prop("unsupported language"));
        }
        user.lang_id = lang.to_string();
        changed = true;
    }
    if changed {
        repo.update_user(&user).await?;
    }

    let mut du = ensure_member(&st, domain.id, user.id).await?;
    du.notify_replies = body.notify_replies.unwrap_or(du.notify_replies);
    du.notify_moderator = body.notify_moderator.unwrap_or(du.notify_moderator);
    du.notify_comment_status = body.notify_comment_status.unwrap_or(du.notify_comment_status);
    repo.upsert_domain_user(&du).await?;
    Ok(no_content())
}

#[derive(Debug, Serialize, ToSchema)]
pub struct LoginTokenResponse {
    pub token: String,
}

/// An anonymous token the widget hands to an OAuth or SSO popup and later
/// redeems for a session.
pub async fn login_token_new(st: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let token = tokens::create(st.repo.as_ref(), ANONYMOUS_USER_ID, TokenScope::LoginExchange, Duration::minutes(tokens::LOGIN_EXCHANGE_TTL_MINUTES), false).await?;
    Ok(HttpResponse::Ok().json(LoginTokenResponse { token: token.value }))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct RedeemRequest {
    pub token: String,
    pub host: String,
}

pub async fn login_token_redeem(req: HttpRequest, st: web::Data<AppState>, body: web::Json<RedeemRequest>) -> Result<HttpResponse, ApiError> {
    let repo = st.repo.as_ref();
    let domain = domain_by_host(repo, &body.host).await?;
    let pending = tokens::find(repo, &body.token, false).await?;
    if pending.scope != TokenScope::LoginExchange || pending.owner == ANONYMOUS_USER_ID {
        return Err(ApiError::BadToken);
    }
    let token = tokens::consume(repo, &body.token, TokenScope::LoginExchange).await?;
    let user = repo.find_user_by_id(token.owner).await.map_err(|e| match e {
        RepoError::NotFound => ApiError::BadToken,
        other => other.into(),
    })?;
    if user.system_account || user.locked {
        return Err(ApiError::Unauthorized);
    }
    if user.banned {
        return Err(ApiError::UserBanned);
    }
    let du = ensure_member(&st, domain.id, user.id).await?;
    let client = ClientInfo::from_request(&req);
    let session = usersession::create(repo, &st.cfg, user.id, &domain.host, &client).await?;
    info!(user = %user.id, domain = %domain.id, "login token redeemed");
    Ok(HttpResponse::Ok().json(SessionResponse {
        session_token: usersession::encode(user.id, session.id),
        principal: PrincipalView::new(&user, Some(&du)),
    }))
}

// ---------------- Comments ----------------

#[derive(Debug, Deserialize, ToSchema)]
pub struct CommentListRequest {
    pub host: String,
    pub path: String,
    #[serde(default)]
    pub sort: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/embed/comment/list",
    request_body = CommentListRequest,
    responses(
        (status = 200, description = "Visible comments of the page", body = comments::PageComments),
        (status = 400, description = "unknown-host or invalid path")
    )
)]
pub async fn comment_list(st: web::Data<AppState>, principal: Principal, body: web::Json<CommentListRequest>) -> Result<HttpResponse, ApiError> {
    let b = body.into_inner();
    let page = comments::list(&st, principal, ListQuery { host: b.host, path: b.path, sort: b.sort }).await?;
    Ok(HttpResponse::Ok().json(page))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommentNewRequest {
    pub host: String,
    pub path: String,
    #[serde(default)]
    pub parent_id: Option<Id>,
    pub markdown: String,
    /// Display name for anonymous comments.
    #[serde(default)]
    pub author_name: Option<String>,
    #[serde(default)]
    pub page_title: Option<String>,
}

#[utoipa::path(
    post,
    path = "/api/embed/comment/new",
    request_body = CommentNewRequest,
    responses(
        (status = 200, description = "Stored comment with its initial state", body = comments::Submitted),
        (status = 400, description = "domain-readonly, page-readonly, no-root-comment or invalid input"),
        (status = 401, description = "Principal kind not allowed on the domain")
    )
)]
pub async fn comment_new(req: HttpRequest, st: web::Data<AppState>, principal: Principal, body: web::Json<CommentNewRequest>) -> Result<HttpResponse, ApiError> {
    let client = ClientInfo::from_request(&req);
    st.rate_limiter.comment(&client.ip)?;
    let b = body.into_inner();
    let new = NewComment {
        host: b.host,
        path: b.path,
        parent_id: b.parent_id,
        markdown: b.markdown,
        author_name: b.author_name,
        page_title: b.page_title,
    };
    let submitted = comments::submit(&st, principal, new, &client).await?;
    Ok(HttpResponse::Ok().json(submitted))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ModerateRequest {
    pub comment_id: Id,
    pub approve: bool,
}

pub async fn comment_moderate(st: web::Data<AppState>, principal: Principal, body: web::Json<ModerateRequest>) -> Result<HttpResponse, ApiError> {
    comments::moderate(&st, principal, body.comment_id, body.approve).await?;
    Ok(no_content())
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommentIdRequest {
    pub comment_id: Id,
}

pub async fn comment_delete(st: web::Data<AppState>, principal: Principal, body: web::Json<CommentIdRequest>) -> Result<HttpResponse, ApiError> {
    comments::delete(&st, principal, body.comment_id).await?;
    Ok(no_content())
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct VoteRequest {
    pub comment_id: Id,
    pub direction: i64,
}

#[utoipa::path(
    post,
    path = "/api/embed/comment/vote",
    request_body = VoteRequest,
    responses(
        (status = 204, description = "Vote recorded"),
        (status = 401, description = "Anonymous voter"),
        (status = 403, description = "self-vote")
    )
)]
pub async fn comment_vote(st: web::Data<AppState>, principal: Principal, body: web::Json<VoteRequest>) -> Result<HttpResponse, ApiError> {
    votes::set_vote(st.repo.as_ref(), principal, body.comment_id, body.direction).await?;
    Ok(no_content())
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct EditRequest {
    pub comment_id: Id,
    pub markdown: String,
}

pub async fn comment_edit(st: web::Data<AppState>, principal: Principal, body: web::Json<EditRequest>) -> Result<HttpResponse, ApiError> {
    let view: CommentView = comments::edit(&st, principal, body.comment_id, &body.markdown).await?;
    Ok(HttpResponse::Ok().json(view))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct PreviewRequest {
    pub host: String,
    pub markdown: String,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct PreviewResponse {
    pub html: String,
}

pub async fn comment_preview(st: web::Data<AppState>, body: web::Json<PreviewRequest>) -> Result<HttpResponse, ApiError> {
    let html = comments::preview(&st, &body.host, &body.markdown).await?;
    Ok(HttpResponse::Ok().json(PreviewResponse { html }))
}

/// Widget strings. Unsupported languages are redirected to the default one.
pub async fn i18n_messages(st: web::Data<AppState>, path: web::Path<String>) -> HttpResponse {
    let lang = path.into_inner();
    let supported = st.cfg.ui_languages.iter().any(|l| *l == lang);
    if supported {
        if let Some(asset) = st.assets.get(&format!("/{lang}/i18n/messages.json")) {
            return HttpResponse::Ok().content_type(asset.mime.clone()).body(asset.bytes.clone());
        }
        if let Some(messages) = builtin_messages(&lang) {
            return HttpResponse::Ok().json(messages);
        }
    }
    if lang == st.cfg.default_language {
        return HttpResponse::Ok().json(builtin_messages("en").unwrap_or_default());
    }
    HttpResponse::TemporaryRedirect()
        .insert_header((header::LOCATION, format!("/api/embed/i18n/{}/messages", st.cfg.default_language)))
        .finish()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn page_must_sit_on_the_domain_host() {
        assert!(is_page_of("https://example.com/posts/1", "example.com"));
        assert!(is_page_of("http://localhost:8080/", "localhost:8080"));
        assert!(!is_page_of("https://example.co/phish", "example.com"));
        assert!(!is_page_of("https://example.com.evil.net/", "example.com"));
        assert!(!is_page_of("https://example.com:444/", "example.com"));
        assert!(!is_page_of("javascript://example.com/", "example.com"));
        assert!(!is_page_of("not a url", "example.com"));
    }
}
