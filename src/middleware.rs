//! Request middleware: XSRF double-submit protection and security headers.

use std::rc::Rc;

use actix_web::body::EitherBody;
use actix_web::cookie::{Cookie, SameSite};
use actix_web::dev::{Service, ServiceRequest, ServiceResponse, Transform};
use actix_web::http::{header, Method};
use actix_web::{Error, ResponseError};
use futures_util::future::{ready, LocalBoxFuture, Ready};
use hmac::{Hmac, Mac};
use jsonwebtoken::{decode, encode, Algorithm, DecodingKey, EncodingKey, Header, Validation};
use once_cell::sync::Lazy;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use sha2::Sha256;

use crate::error::ApiError;

pub const XSRF_COOKIE: &str = "XSRF-TOKEN";
pub const XSRF_HEADER: &str = "X-XSRF-TOKEN";
const XSRF_TTL_HOURS: i64 = 12;

/// Path prefixes exempt from the XSRF check. Embed endpoints are called
/// cross-origin by the widget; OAuth and mail links arrive by navigation.
static XSRF_SAFE_PREFIXES: Lazy<Vec<&'static str>> = Lazy::new(|| vec!["/api/embed/", "/api/auth/oauth/", "/api/mail/"]);

/// Pages that must stay frameable (the non-interactive SSO iframe).
static FRAMEABLE_PREFIXES: Lazy<Vec<&'static str>> = Lazy::new(|| vec!["/api/auth/oauth/"]);

pub fn is_xsrf_safe_path(path: &str) -> bool {
    XSRF_SAFE_PREFIXES.iter().any(|p| path.starts_with(p))
}

#[derive(Debug, Serialize, Deserialize)]
struct XsrfClaims {
    sid: String,
    exp: usize,
}

/// Signs cookie sessions and derives the header token that must accompany them.
#[derive(Clone)]
pub struct XsrfKeys {
    secret: Rc<Vec<u8>>,
}

impl XsrfKeys {
    pub fn new(secret: &[u8]) -> Self {
        Self { secret: Rc::new(secret.to_vec()) }
    }

    fn new_cookie_value(&self) -> Option<(String, String)> {
        let mut sid = [0u8; 16];
        rand::thread_rng().fill_bytes(&mut sid);
        let sid = hex::encode(sid);
        let exp = (chrono::Utc::now() + chrono::Duration::hours(XSRF_TTL_HOURS)).timestamp() as usize;
        let jwt = encode(&Header::new(Algorithm::HS256), &XsrfClaims { sid: sid.clone(), exp }, &EncodingKey::from_secret(&self.secret)).ok()?;
        Some((jwt, sid))
    }

    fn session_id(&self, cookie_value: &str) -> Option<String> {
        let mut validation = Validation::new(Algorithm::HS256);
        validation.validate_exp = true;
        validation.set_required_spec_claims(&["exp"]);
        decode::<XsrfClaims>(cookie_value, &DecodingKey::from_secret(&self.secret), &validation).ok().map(|d| d.claims.sid)
    }

    /// Token the client must echo in the XSRF header.
    pub fn header_token(&self, sid: &str) -> String {
        match Hmac::<Sha256>::new_from_slice(&self.secret) {
            Ok(mut m) => {
                m.update(sid.as_bytes());
                hex::encode(m.finalize().into_bytes())
            }
            Err(_) => String::new(),
        }
    }

    fn verify(&self, sid: &str, presented: &str) -> bool {
        let Ok(sig) = hex::decode(presented) else { return false };
        match Hmac::<Sha256>::new_from_slice(&self.secret) {
            Ok(mut m) => {
                m.update(sid.as_bytes());
                m.verify_slice(&sig).is_ok()
            }
            Err(_) => false,
        }
    }
}

/// Double-submit XSRF guard. Every response carries the header token for the
/// current cookie session; unsafe methods outside the safe paths must echo it.
#[derive(Clone)]
pub struct Xsrf {
    secret: Vec<u8>,
    https: bool,
}

impl Xsrf {
    pub fn new(secret: &[u8], https: bool) -> Self {
        Self { secret: secret.to_vec(), https }
    }
}

impl<S, B> Transform<S, ServiceRequest> for Xsrf
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type InitError = ();
    type Transform = XsrfMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(XsrfMiddleware { service: Rc::new(service), keys: XsrfKeys::new(&self.secret), https: self.https }))
    }
}

pub struct XsrfMiddleware<S> {
    service: Rc<S>,
    keys: XsrfKeys,
    https: bool,
}

fn is_unsafe(m: &Method) -> bool {
    !matches!(*m, Method::GET | Method::HEAD | Method::OPTIONS | Method::TRACE)
}

impl<S, B> Service<ServiceRequest> for XsrfMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<EitherBody<B>>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, ctx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let svc = self.service.clone();
        let keys = self.keys.clone();
        let https = self.https;
        let existing = req.cookie(XSRF_COOKIE).and_then(|c| keys.session_id(c.value()));

        if is_unsafe(req.method()) && !is_xsrf_safe_path(req.path()) {
            let presented = req.headers().get(XSRF_HEADER).and_then(|v| v.to_str().ok()).unwrap_or_default();
            let ok = existing.as_deref().map(|sid| keys.verify(sid, presented)).unwrap_or(false);
            if !ok {
                tracing::warn!(path = %req.path(), method = %req.method(), "XSRF check failed");
                let res = req.into_response(ApiError::XsrfTokenInvalid.error_response());
                return Box::pin(async move { Ok(res.map_into_right_body()) });
            }
        }

        Box::pin(async move {
            let mut res = svc.call(req).await?;
            let sid = match existing {
                Some(sid) => sid,
                None => match keys.new_cookie_value() {
                    Some((jwt, sid)) => {
                        let cookie = Cookie::build(XSRF_COOKIE, jwt)
                            .path("/")
                            .http_only(true)
                            .secure(https)
                            .same_site(if https { SameSite::None } else { SameSite::Lax })
                            .finish();
                        if let Err(e) = res.response_mut().add_cookie(&cookie) {
                            tracing::error!(error = %e, "failed to set XSRF cookie");
                        }
                        sid
                    }
                    None => return Ok(res.map_into_left_body()),
                },
            };
            if let Ok(v) = header::HeaderValue::from_str(&keys.header_token(&sid)) {
                res.headers_mut().insert(header::HeaderName::from_static("x-xsrf-token"), v);
            }
            Ok(res.map_into_left_body())
        })
    }
}

#[derive(Clone, Default)]
pub struct SecurityHeaders {
    pub enable_hsts: bool,
}

impl SecurityHeaders {
    pub fn with_hsts(mut self, enable: bool) -> Self {
        self.enable_hsts = enable;
        self
    }
}

impl<S, B> Transform<S, ServiceRequest> for SecurityHeaders
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type InitError = ();
    type Transform = SecurityHeadersMiddleware<S>;
    type Future = Ready<Result<Self::Transform, Self::InitError>>;

    fn new_transform(&self, service: S) -> Self::Future {
        ready(Ok(SecurityHeadersMiddleware { service: Rc::new(service), cfg: self.clone() }))
    }
}

pub struct SecurityHeadersMiddleware<S> {
    service: Rc<S>,
    cfg: SecurityHeaders,
}

impl<S, B> Service<ServiceRequest> for SecurityHeadersMiddleware<S>
where
    S: Service<ServiceRequest, Response = ServiceResponse<B>, Error = Error> + 'static,
    S::Future: 'static,
    B: 'static,
{
    type Response = ServiceResponse<B>;
    type Error = Error;
    type Future = LocalBoxFuture<'static, Result<Self::Response, Self::Error>>;

    fn poll_ready(&self, ctx: &mut std::task::Context<'_>) -> std::task::Poll<Result<(), Self::Error>> {
        self.service.poll_ready(ctx)
    }

    fn call(&self, req: ServiceRequest) -> Self::Future {
        let svc = self.service.clone();
        let cfg = self.cfg.clone();
        let frameable = FRAMEABLE_PREFIXES.iter().any(|p| req.path().starts_with(p));
        Box::pin(async move {
            let mut res = svc.call(req).await?;
            let headers = res.response_mut().headers_mut();
            if !headers.contains_key(header::REFERRER_POLICY) {
                headers.insert(header::REFERRER_POLICY, header::HeaderValue::from_static("strict-origin-when-cross-origin"));
            }
            if !headers.contains_key(header::X_CONTENT_TYPE_OPTIONS) {
                headers.insert(header::X_CONTENT_TYPE_OPTIONS, header::HeaderValue::from_static("nosniff"));
            }
            if !frameable && !headers.contains_key(header::X_FRAME_OPTIONS) {
                headers.insert(header::X_FRAME_OPTIONS, header::HeaderValue::from_static("DENY"));
            }
            if !headers.contains_key(header::X_XSS_PROTECTION) {
                headers.insert(header::X_XSS_PROTECTION, header::HeaderValue::from_static("0"));
            }
            if cfg.enable_hsts && !headers.contains_key(header::STRICT_TRANSPORT_SECURITY) {
                headers.insert(header::STRICT_TRANSPORT_SECURITY, header::HeaderValue::from_static("max-age=63072000; includeSubDomains"));
            }
            Ok(res)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cookie_session_roundtrip() {
        let k = XsrfKeys::new(b"0123456789abcdef0123456789abcdef");
        let (jwt, sid) = k.new_cookie_value().unwrap();
        assert_eq!(k.session_id(&jwt).as_deref(), Some(sid.as_str()));
        assert!(k.verify(&sid, &k.header_token(&sid)));
        assert!(!k.verify(&sid, &k.header_token("other")));
        assert!(!k.verify(&sid, "not-hex"));
        let other = XsrfKeys::new(b"ffffffffffffffffffffffffffffffff");
        assert!(other.session_id(&jwt).is_none());
    }

    #[test]
    fn safe_paths() {
        assert!(is_xsrf_safe_path("/api/embed/comment/new"));
        assert!(is_xsrf_safe_path("/api/auth/oauth/github/init"));
        assert!(!is_xsrf_safe_path("/api/auth/login"));
        assert!(!is_xsrf_safe_path("/api/domains"));
    }
}
