//! Who is making a request. Credentials are looked for in the session header,
//! then the admin session cookie (outside XSRF-exempt paths), then the legacy
//! commenter token.

use actix_web::dev::Payload;
use actix_web::{web, FromRequest, HttpRequest};
use actix_web_httpauth::extractors::bearer::BearerAuth;
use futures_util::future::LocalBoxFuture;
use uuid::Uuid;

use crate::error::ApiError;
use crate::middleware::is_xsrf_safe_path;
use crate::models::{DomainUser, Id, PrincipalView, User, ANONYMOUS_USER_ID};
use crate::repo::{OptionalExt, Repo, RepoError};
use crate::routes::AppState;
use crate::usersession::{self, SESSION_COOKIE, SESSION_HEADER};

pub const COMMENTER_TOKEN_HEADER: &str = "X-Commenter-Token";
const ANONYMOUS_TOKEN: &str = "anonymous";

#[derive(Debug, Clone)]
pub enum Principal {
    Anonymous,
    Authenticated { user: User, domain_user: Option<DomainUser> },
}

impl Principal {
    pub fn user_id(&self) -> Id {
        match self {
            Principal::Anonymous => ANONYMOUS_USER_ID,
            Principal::Authenticated { user, .. } => user.id,
        }
    }

    pub fn is_anonymous(&self) -> bool {
        matches!(self, Principal::Anonymous)
    }

    pub fn user(&self) -> Option<&User> {
        match self {
            Principal::Anonymous => None,
            Principal::Authenticated { user, .. } => Some(user),
        }
    }

    pub fn domain_user(&self) -> Option<&DomainUser> {
        match self {
            Principal::Anonymous => None,
            Principal::Authenticated { domain_user, .. } => domain_user.as_ref(),
        }
    }

    pub fn is_superuser(&self) -> bool {
        self.user().map(|u| u.is_superuser).unwrap_or(false)
    }

    pub fn is_owner(&self) -> bool {
        self.domain_user().map(|du| du.is_owner).unwrap_or(false)
    }

    pub fn is_moderator_plus(&self) -> bool {
        self.domain_user().map(DomainUser::is_moderator_plus).unwrap_or(false)
    }

    /// Stamps the principal with its membership row on `domain_id`, if any.
    pub async fn for_domain(self, repo: &dyn Repo, domain_id: Id) -> Result<Principal, ApiError> {
        match self {
            Principal::Anonymous => Ok(Principal::Anonymous),
            Principal::Authenticated { user, .. } => {
                let domain_user = repo.find_domain_user(domain_id, user.id).await.optional()?;
                Ok(Principal::Authenticated { user, domain_user })
            }
        }
    }

    pub fn view(&self) -> Option<PrincipalView> {
        match self {
            Principal::Anonymous => None,
            Principal::Authenticated { user, domain_user } => Some(PrincipalView::new(user, domain_user.as_ref())),
        }
    }
}

/// Outcome of looking for credentials on a request.
#[derive(Debug)]
pub enum Resolution {
    /// Nothing was presented.
    Missing,
    /// Credentials explicitly naming the anonymous user.
    Anonymous,
    User(User, Id),
    /// Something was presented but does not authenticate.
    Invalid,
}

enum Credential {
    Session(Id, Id),
    SessionId(Id),
    Anonymous,
    Malformed,
}

fn header<'a>(req: &'a HttpRequest, name: &str) -> Option<&'a str> {
    req.headers().get(name).and_then(|v| v.to_str().ok()).map(str::trim).filter(|v| !v.is_empty())
}

fn parse_session(value: &str) -> Credential {
    usersession::decode(value).map(|(u, s)| Credential::Session(u, s)).unwrap_or(Credential::Malformed)
}

fn parse_commenter_token(value: &str) -> Credential {
    if value == ANONYMOUS_TOKEN {
        return Credential::Anonymous;
    }
    match hex::decode(value) {
        Ok(b) if b.len() == 16 => Uuid::from_slice(&b).map(Credential::SessionId).unwrap_or(Credential::Malformed),
        _ => Credential::Malformed,
    }
}

fn find_credential(req: &HttpRequest) -> Option<Credential> {
    if let Some(v) = header(req, SESSION_HEADER) {
        return Some(parse_session(v));
    }
    // The admin cookie is only honoured where the XSRF pair is enforced
    if !is_xsrf_safe_path(req.path()) {
        if let Some(c) = req.cookie(SESSION_COOKIE).filter(|c| !c.value().is_empty()) {
            return Some(parse_session(c.value()));
        }
    }
    if let Some(v) = header(req, COMMENTER_TOKEN_HEADER) {
        return Some(parse_commenter_token(v));
    }
    if let Ok(bearer) = BearerAuth::from_request(req, &mut Payload::None).into_inner() {
        return Some(parse_commenter_token(bearer.token()));
    }
    None
}

/// Resolves the request's credentials without loading any domain membership.
pub async fn resolve(repo: &dyn Repo, req: &HttpRequest) -> Result<Resolution, ApiError> {
    let (user_id, session_id) = match find_credential(req) {
        None => return Ok(Resolution::Missing),
        Some(Credential::Anonymous) => return Ok(Resolution::Anonymous),
        Some(Credential::Malformed) => {
            tracing::debug!("malformed session credentials");
            return Ok(Resolution::Invalid);
        }
        Some(Credential::Session(u, s)) => (u, s),
        Some(Credential::SessionId(s)) => match repo.find_user_session(s).await {
            Ok(sess) => (sess.user_id, s),
            Err(RepoError::NotFound) => return Ok(Resolution::Invalid),
            Err(e) => return Err(e.into()),
        },
    };
    if let Err(e) = usersession::find_active(repo, user_id, session_id).await {
        return match e {
            ApiError::Unauthorized => Ok(Resolution::Invalid),
            other => Err(other),
        };
    }
    let user = match repo.find_user_by_id(user_id).await {
        Ok(u) => u,
        Err(RepoError::NotFound) => return Ok(Resolution::Invalid),
        Err(e) => return Err(e.into()),
    };
    if user.system_account || user.banned || user.locked {
        tracing::warn!(user = %user.id, banned = user.banned, locked = user.locked, "session refused for user");
        return Ok(Resolution::Invalid);
    }
    Ok(Resolution::User(user, session_id))
}

fn state(req: &HttpRequest) -> Result<web::Data<AppState>, ApiError> {
    req.app_data::<web::Data<AppState>>().cloned().ok_or_else(|| {
        tracing::error!("application state missing");
        ApiError::Internal
    })
}

/// Any caller; bad credentials degrade to `Anonymous`.
impl FromRequest for Principal {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move {
            let st = state(&req)?;
            Ok(match resolve(st.repo.as_ref(), &req).await? {
                Resolution::User(user, _) => Principal::Authenticated { user, domain_user: None },
                _ => Principal::Anonymous,
            })
        })
    }
}

/// A logged-in, non-anonymous user together with the session they used.
#[derive(Debug, Clone)]
pub struct AuthUser {
    pub user: User,
    pub session_id: Id,
}

impl AuthUser {
    pub fn principal(&self) -> Principal {
        Principal::Authenticated { user: self.user.clone(), domain_user: None }
    }

    pub fn require_superuser(&self) -> Result<(), ApiError> {
        if self.user.is_superuser {
            Ok(())
        } else {
            Err(ApiError::NoSuperuser)
        }
    }
}

impl FromRequest for AuthUser {
    type Error = ApiError;
    type Future = LocalBoxFuture<'static, Result<Self, Self::Error>>;

    fn from_request(req: &HttpRequest, _: &mut Payload) -> Self::Future {
        let req = req.clone();
        Box::pin(async move {
            let st = state(&req)?;
            match resolve(st.repo.as_ref(), &req).await? {
                Resolution::User(user, session_id) => Ok(AuthUser { user, session_id }),
                Resolution::Missing | Resolution::Anonymous => Err(ApiError::Unauthenticated),
                Resolution::Invalid => Err(ApiError::Unauthorized),
            }
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use actix_web::test::TestRequest;

    #[test]
    fn header_wins_over_cookie() {
        let (u, s) = (Uuid::new_v4(), Uuid::new_v4());
        let req = TestRequest::default()
            .insert_header((SESSION_HEADER, usersession::encode(u, s)))
            .cookie(actix_web::cookie::Cookie::new(SESSION_COOKIE, "garbage"))
            .to_http_request();
        assert!(matches!(find_credential(&req), Some(Credential::Session(a, b)) if a == u && b == s));
    }

    #[test]
    fn commenter_token_forms() {
        let req = TestRequest::default().insert_header((COMMENTER_TOKEN_HEADER, "anonymous")).to_http_request();
        assert!(matches!(find_credential(&req), Some(Credential::Anonymous)));
        let id = Uuid::new_v4();
        let req = TestRequest::default()
            .insert_header(("Authorization", format!("Bearer {}", hex::encode(id.as_bytes()))))
            .to_http_request();
        assert!(matches!(find_credential(&req), Some(Credential::SessionId(x)) if x == id));
        let req = TestRequest::default().insert_header((COMMENTER_TOKEN_HEADER, "zz")).to_http_request();
        assert!(matches!(find_credential(&req), Some(Credential::Malformed)));
    }

    #[test]
    fn cookie_ignored_on_embed_paths() {
        let (u, s) = (Uuid::new_v4(), Uuid::new_v4());
        let cookie = actix_web::cookie::Cookie::new(SESSION_COOKIE, usersession::encode(u, s));
        let req = TestRequest::post().uri("/api/embed/comment/delete").cookie(cookie.clone()).to_http_request();
        assert!(find_credential(&req).is_none());
        let req = TestRequest::get().uri("/api/domains").cookie(cookie).to_http_request();
        assert!(matches!(find_credential(&req), Some(Credential::Session(a, b)) if a == u && b == s));
    }

    #[test]
    fn no_credentials() {
        assert!(find_credential(&TestRequest::default().to_http_request()).is_none());
    }
}
