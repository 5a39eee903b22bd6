//! OAuth and SSO round-trips. `init` parks the handshake in an auth session and
//! redirects; `callback` finishes it, binds the login token to the user and
//! answers with a small HTML page that talks to the widget.

use std::collections::HashMap;

use actix_web::http::header;
use actix_web::{web, HttpRequest, HttpResponse};
use serde::Deserialize;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use crate::authsession::{self, AUTH_SESSION_COOKIE};
use crate::comments::domain_by_host;
use crate::error::ApiError;
use crate::idp::{FederatedUser, ProviderSession};
use crate::models::{Domain, DomainUser, Token, TokenScope, User, UserAuthKind, ANONYMOUS_USER_ID};
use crate::repo::{OptionalExt, RepoError};
use crate::routes::AppState;
use crate::sso::{self, SsoPayload};
use crate::storage;
use crate::tokens;
use crate::usersession::{self, ClientInfo};

const SSO: &str = "sso";

fn callback_url(st: &AppState, provider: &str) -> String {
    format!("{}/api/auth/oauth/{provider}/callback", st.cfg.base_url)
}

/// The pending login token; it must still be unbound.
async fn pending_token(st: &AppState, value: &str) -> Result<Token, ApiError> {
    let t = tokens::find(st.repo.as_ref(), value, false).await?;
    if t.scope != TokenScope::LoginExchange || t.owner != ANONYMOUS_USER_ID {
        return Err(ApiError::BadToken);
    }
    Ok(t)
}

#[derive(Debug, Deserialize)]
pub struct InitQuery {
    #[serde(default)]
    pub token: Option<String>,
    #[serde(default)]
    pub host: Option<String>,
}

#[utoipa::path(
    get,
    path = "/api/auth/oauth/{provider}/init",
    params(
        ("provider" = String, Path, description = "Identity provider id or `sso`"),
        ("token" = Option<String>, Query, description = "Anonymous login token to bind"),
        ("host" = Option<String>, Query, description = "Embedding domain; empty for the admin UI")
    ),
    responses(
        (status = 302, description = "Redirect to the provider"),
        (status = 400, description = "idp-unknown, idp-unconfigured or sso-misconfigured")
    )
)]
pub async fn init(st: web::Data<AppState>, path: web::Path<String>, q: web::Query<InitQuery>) -> Result<HttpResponse, ApiError> {
    let provider = path.into_inner();
    let repo = st.repo.as_ref();
    let domain = match q.host.as_deref().map(str::trim).filter(|h| !h.is_empty()) {
        Some(h) => Some(domain_by_host(repo, h).await?),
        None => None,
    };

    // The admin UI has no widget to redeem a token, so it gets a fresh one here
    let token = match q.token.as_deref().filter(|t| !t.is_empty()) {
        Some(t) => pending_token(&st, t).await?.value,
        None if domain.is_none() => {
            tokens::create(repo, ANONYMOUS_USER_ID, TokenScope::LoginExchange, chrono::Duration::minutes(tokens::LOGIN_EXCHANGE_TTL_MINUTES), false)
                .await?
                .value
        }
        None => return Err(ApiError::BadToken),
    };

    let (location, session_data) = if provider == SSO {
        let Some(domain) = domain.as_ref() else {
            return Err(ApiError::invalid_input("host is required for SSO"));
        };
        let (url, secret) = sso::domain_settings(domain)?;
        (sso::redirect_url(url, &token, secret)?, String::new())
    } else {
        let idp = st.idps.get(&provider)?;
        if let Some(d) = domain.as_ref() {
            if !repo.domain_idps(d.id).await?.iter().any(|i| *i == provider) {
                return Err(ApiError::FeatureDisabled(Some(format!("{provider} is not enabled for the domain"))));
            }
        }
        let ps = idp.begin_auth(&callback_url(&st, &provider))?;
        (ps.auth_url.clone(), ps.marshal())
    };

    let host = domain.as_ref().map(|d| d.host.as_str()).unwrap_or_default();
    let session = authsession::create(repo, session_data, host, &token).await?;
    info!(provider = %provider, host, "auth handshake started");
    Ok(HttpResponse::Found()
        .insert_header((header::LOCATION, location))
        .cookie(authsession::cookie(session.id, st.cfg.is_https()))
        .finish())
}

/// How the callback page reports back.
#[derive(Debug, Default)]
struct Reply {
    /// Non-interactive SSO runs in a hidden iframe and posts to its parent.
    frame: bool,
    target_origin: Option<String>,
    admin_session: Option<String>,
}

pub async fn callback(
    req: HttpRequest,
    st: web::Data<AppState>,
    path: web::Path<String>,
    q: web::Query<HashMap<String, String>>,
) -> HttpResponse {
    let provider = path.into_inner();
    let mut reply = Reply::default();
    let result = finish(&req, &st, &provider, &q, &mut reply).await;
    let mut resp = match &result {
        Ok(()) => render(&reply, None),
        Err(e) => {
            warn!(provider = %provider, error = %e, "auth handshake failed");
            render(&reply, Some(e))
        }
    };
    if let Err(e) = resp.add_removal_cookie(&authsession::removal_cookie()) {
        warn!(error = %e, "cannot clear auth session cookie");
    }
    if let Some(value) = reply.admin_session.take() {
        if let Err(e) = resp.add_cookie(&usersession::cookie(value, &st.cfg)) {
            warn!(error = %e, "cannot set session cookie");
        }
    }
    resp
}

async fn finish(req: &HttpRequest, st: &AppState, provider: &str, params: &HashMap<String, String>, reply: &mut Reply) -> Result<(), ApiError> {
    let repo = st.repo.as_ref();
    let session_id = req
        .cookie(AUTH_SESSION_COOKIE)
        .and_then(|c| Uuid::parse_str(c.value()).ok())
        .ok_or(ApiError::BadToken)?;
    let session = authsession::take(repo, session_id).await?;
    let domain = if session.host.is_empty() { None } else { Some(domain_by_host(repo, &session.host).await?) };
    if let Some(d) = domain.as_ref() {
        reply.target_origin = Some(d.root_url());
    }
    let mut token = pending_token(st, &session.token_value).await?;

    let (mut user, role) = if provider == SSO {
        let Some(domain) = domain.as_ref() else { return Err(ApiError::BadToken) };
        reply.frame = domain.sso_non_interactive;
        let (_, secret) = sso::domain_settings(domain)?;
        let payload = params.get("payload").map(String::as_str).unwrap_or_default();
        let hmac = params.get("hmac").map(String::as_str).unwrap_or_default();
        let p = sso::open_payload(payload, hmac, secret, &session.token_value)?;
        let role = p.role.clone();
        (sso_user(st, domain, p).await?, role)
    } else {
        let idp = st.idps.get(provider)?;
        let ps = ProviderSession::unmarshal(&session.session_data)?;
        let access_token = idp.authorize(&st.http, &ps, params, &callback_url(st, provider)).await?;
        let fu = idp.fetch_user(&st.http, &access_token).await?;
        (federated_user(st, idp.id(), fu).await?, None)
    };

    if user.system_account || user.locked {
        return Err(ApiError::Unauthorized);
    }
    if user.banned {
        return Err(ApiError::UserBanned);
    }
    user.last_login = Some(chrono::Utc::now());
    repo.update_user(&user).await?;

    if let Some(d) = domain.as_ref() {
        let mut du = repo.find_domain_user(d.id, user.id).await.optional()?.unwrap_or_else(|| DomainUser::commenter(d.id, user.id));
        sso::apply_role(&mut du, role.as_deref());
        du.normalize();
        repo.upsert_domain_user(&du).await?;
    }

    token.owner = user.id;
    tokens::update(repo, &token).await?;
    info!(user = %user.id, provider, host = %session.host, "login token bound");

    if domain.is_none() {
        let client = ClientInfo::from_request(req);
        let us = usersession::create(repo, &st.cfg, user.id, "", &client).await?;
        reply.admin_session = Some(usersession::encode(user.id, us.id));
    }
    Ok(())
}

/// Finds the SSO account for the payload email, creating it on first login.
/// SSO identities are trusted to carry a verified email.
async fn sso_user(st: &AppState, domain: &Domain, p: SsoPayload) -> Result<User, ApiError> {
    let repo = st.repo.as_ref();
    let email = p.email.trim().to_lowercase();
    let website = p.link.as_deref().map(|l| super::auth::validate_website(Some(l))).transpose()?.unwrap_or_default();
    match repo.find_user_by_email(&email).await.optional()? {
        Some(mut u) => {
            match u.auth_kind() {
                UserAuthKind::Sso => {}
                UserAuthKind::Local => return Err(ApiError::LoginLocally),
                UserAuthKind::Federated(idp) => return Err(ApiError::LoginUsingIdp(Some(idp))),
            }
            u.name = p.name.trim().to_string();
            u.website_url = website;
            Ok(u)
        }
        None => {
            let mut u = User::new(&email, &p.name);
            u.federated_sso = true;
            u.federated_id = email.clone();
            u.website_url = website;
            u.signup_host = domain.host.clone();
            u.confirm();
            create_federated(st, u, p.photo.as_deref().unwrap_or_default()).await
        }
    }
}

async fn federated_user(st: &AppState, idp: &str, fu: FederatedUser) -> Result<User, ApiError> {
    let repo = st.repo.as_ref();
    if let Some(u) = repo.find_user_by_federated_id(idp, &fu.id).await.optional()? {
        return Ok(u);
    }
    if let Some(u) = repo.find_user_by_email(&fu.email).await.optional()? {
        return Err(match u.auth_kind() {
            UserAuthKind::Local => ApiError::LoginLocally,
            UserAuthKind::Sso => ApiError::LoginUsingSso,
            UserAuthKind::Federated(other) => ApiError::LoginUsingIdp(Some(other)),
        });
    }
    let name = if fu.name.trim().is_empty() { fu.email.split('@').next().unwrap_or_default().to_string() } else { fu.name.clone() };
    let mut u = User::new(&fu.email, &name);
    u.federated_idp = Some(idp.to_string());
    u.federated_id = fu.id.clone();
    u.website_url = super::auth::validate_website(Some(&fu.website_url)).unwrap_or_default();
    u.confirm();
    create_federated(st, u, &fu.avatar_url).await
}

async fn create_federated(st: &AppState, mut u: User, avatar_url: &str) -> Result<User, ApiError> {
    match st.repo.create_user(&u).await {
        Ok(()) => {}
        Err(RepoError::Conflict) => return Err(ApiError::EmailAlreadyExists),
        Err(e) => return Err(e.into()),
    }
    info!(user = %u.id, "federated user created");
    if storage::import_remote(st.avatars.as_ref(), &st.http, u.id, avatar_url).await {
        u.has_avatar = true;
    }
    Ok(u)
}

/// JSON safe to inline in a script element.
fn script_json(v: &serde_json::Value) -> String {
    v.to_string().replace('<', "\\u003c")
}

fn render(reply: &Reply, err: Option<&ApiError>) -> HttpResponse {
    let result = match err {
        None => json!({"type": "auth.sso.result", "success": true}),
        Some(e) => json!({"type": "auth.sso.result", "success": false, "error": e.id()}),
    };
    let origin = script_json(&json!(reply.target_origin.as_deref().unwrap_or("*")));
    let body = if reply.frame {
        format!(
            "<!doctype html><html><body><script>window.parent.postMessage({}, {origin});</script></body></html>",
            script_json(&result)
        )
    } else if let Some(e) = err {
        format!(
            "<!doctype html><html><head><title>Login failed</title></head><body><h1>Login failed</h1><p>{}</p>\
             <script>if (window.opener) window.opener.postMessage({}, {origin});</script></body></html>",
            ammonia::clean_text(&e.to_string()),
            script_json(&result)
        )
    } else {
        "<!doctype html><html><body><script>window.close();</script><p>You may close this window.</p></body></html>".to_string()
    };
    HttpResponse::Ok().content_type(mime::TEXT_HTML_UTF_8).body(body)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn script_json_cannot_close_the_tag() {
        let v = json!({"error": "</script><script>alert(1)"});
        assert!(!script_json(&v).contains("</script>"));
    }

    #[test]
    fn frame_reply_posts_to_parent() {
        let reply = Reply { frame: true, target_origin: Some("https://x.test".into()), admin_session: None };
        let resp = render(&reply, Some(&ApiError::BadToken));
        assert_eq!(resp.status(), actix_web::http::StatusCode::OK);
    }
}
