//! Long-lived login sessions and their wire encoding.

use actix_web::cookie::{time, Cookie, SameSite};
use actix_web::HttpRequest;
use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine as _;
use chrono::Utc;
use uuid::Uuid;

use crate::config::AppConfig;
use crate::error::ApiError;
use crate::models::{Id, UserSession};
use crate::repo::{Repo, RepoError};

pub const SESSION_HEADER: &str = "X-User-Session";
pub const SESSION_COOKIE: &str = "cm_session";

/// `base64url(userId || sessionId)` without padding.
pub fn encode(user_id: Id, session_id: Id) -> String {
    let mut b = [0u8; 32];
    b[..16].copy_from_slice(user_id.as_bytes());
    b[16..].copy_from_slice(session_id.as_bytes());
    URL_SAFE_NO_PAD.encode(b)
}

pub fn decode(s: &str) -> Option<(Id, Id)> {
    let b = URL_SAFE_NO_PAD.decode(s.trim()).ok()?;
    if b.len() != 32 {
        return None;
    }
    let user = Uuid::from_slice(&b[..16]).ok()?;
    let session = Uuid::from_slice(&b[16..]).ok()?;
    Some((user, session))
}

/// Connection facts recorded against a new session.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub ip: String,
    pub proto: String,
    pub user_agent: String,
}

impl ClientInfo {
    pub fn from_request(req: &HttpRequest) -> Self {
        let conn = req.connection_info();
        ClientInfo {
            ip: conn.realip_remote_addr().map(strip_port).unwrap_or_default(),
            proto: format!("{:?}", req.version()),
            user_agent: req
                .headers()
                .get(actix_web::http::header::USER_AGENT)
                .and_then(|v| v.to_str().ok())
                .unwrap_or_default()
                .to_string(),
        }
    }
}

fn strip_port(addr: &str) -> String {
    match addr.parse::<std::net::SocketAddr>() {
        Ok(sa) => sa.ip().to_string(),
        Err(_) => addr.to_string(),
    }
}

#[derive(Debug, Default, PartialEq, Eq)]
pub struct UserAgent {
    pub browser_name: String,
    pub browser_version: String,
    pub os_name: String,
    pub os_version: String,
    pub device: String,
}

fn version_after(ua: &str, marker: &str) -> String {
    ua.split(marker)
        .nth(1)
        .map(|rest| rest.chars().take_while(|c| c.is_ascii_digit() || *c == '.').collect())
        .unwrap_or_default()
}

/// Coarse user-agent classification; good enough for a session list.
pub fn parse_user_agent(ua: &str) -> UserAgent {
    let (browser_name, browser_version) = if ua.contains("Edg/") {
        ("Edge", version_after(ua, "Edg/"))
    } else if ua.contains("Firefox/") {
        ("Firefox", version_after(ua, "Firefox/"))
    } else if ua.contains("Chrome/") {
        ("Chrome", version_after(ua, "Chrome/"))
    } else if ua.contains("Safari/") {
        ("Safari", version_after(ua, "Version/"))
    } else {
        ("", String::new())
    };
    let (os_name, os_version) = if ua.contains("Windows NT") {
        ("Windows", version_after(ua, "Windows NT "))
    } else if ua.contains("Android") {
        ("Android", version_after(ua, "Android "))
    } else if ua.contains("iPhone OS") {
        ("iOS", version_after(ua, "iPhone OS ").replace('_', "."))
    } else if ua.contains("Mac OS X") {
        ("macOS", ua.split("Mac OS X ").nth(1).map(|r| r.chars().take_while(|c| c.is_ascii_digit() || *c == '_' || *c == '.').collect::<String>().replace('_', ".")).unwrap_or_default())
    } else if ua.contains("Linux") {
        ("Linux", String::new())
    } else {
        ("", String::new())
    };
    let device = if ua.contains("Mobile") || ua.contains("iPhone") {
        "mobile"
    } else if ua.contains("iPad") || ua.contains("Tablet") {
        "tablet"
    } else if ua.is_empty() {
        ""
    } else {
        "desktop"
    };
    UserAgent {
        browser_name: browser_name.into(),
        browser_version,
        os_name: os_name.into(),
        os_version,
        device: device.into(),
    }
}

pub async fn create(repo: &dyn Repo, cfg: &AppConfig, user_id: Id, host: &str, client: &ClientInfo) -> Result<UserSession, ApiError> {
    let now = Utc::now();
    let ua = parse_user_agent(&client.user_agent);
    let s = UserSession {
        id: Uuid::new_v4(),
        user_id,
        created_time: now,
        expires_time: now + cfg.session_ttl,
        host: host.to_string(),
        proto: client.proto.clone(),
        ip: cfg.mask_ip(&client.ip),
        country: String::new(),
        browser_name: ua.browser_name,
        browser_version: ua.browser_version,
        os_name: ua.os_name,
        os_version: ua.os_version,
        device: ua.device,
    };
    repo.create_user_session(&s).await?;
    tracing::debug!(user = %user_id, session = %s.id, host, "session created");
    Ok(s)
}

/// The session must exist, be owned by `user_id` and not have expired.
pub async fn find_active(repo: &dyn Repo, user_id: Id, session_id: Id) -> Result<UserSession, ApiError> {
    let s = match repo.find_user_session(session_id).await {
        Ok(s) => s,
        Err(RepoError::NotFound) => return Err(ApiError::Unauthorized),
        Err(e) => return Err(e.into()),
    };
    let now = Utc::now();
    if s.user_id != user_id || s.created_time > now || s.expires_time <= now {
        return Err(ApiError::Unauthorized);
    }
    Ok(s)
}

pub async fn expire_all_for(repo: &dyn Repo, user_id: Id) -> Result<u64, ApiError> {
    let n = repo.expire_user_sessions(user_id).await?;
    if n > 0 {
        tracing::info!(user = %user_id, sessions = n, "expired user sessions");
    }
    Ok(n)
}

pub async fn delete(repo: &dyn Repo, session_id: Id) -> Result<(), ApiError> {
    repo.delete_user_session(session_id).await?;
    Ok(())
}

/// Admin UI session cookie.
pub fn cookie(value: String, cfg: &AppConfig) -> Cookie<'static> {
    let mut c = Cookie::build(SESSION_COOKIE, value)
        .path("/")
        .http_only(true)
        .max_age(time::Duration::seconds(cfg.session_ttl.num_seconds()))
        .finish();
    if cfg.is_https() {
        c.set_secure(true);
        c.set_same_site(SameSite::None);
    } else {
        c.set_same_site(SameSite::Lax);
    }
    c
}

pub fn removal_cookie() -> Cookie<'static> {
    let mut c = Cookie::build(SESSION_COOKIE, "").path("/").http_only(true).finish();
    c.make_removal();
    c
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wire_form_round_trips() {
        let (u, s) = (Uuid::new_v4(), Uuid::new_v4());
        let enc = encode(u, s);
        assert_eq!(enc.len(), 43);
        assert!(!enc.contains('='));
        assert_eq!(decode(&enc), Some((u, s)));
    }

    #[test]
    fn malformed_values_do_not_decode() {
        assert_eq!(decode(""), None);
        assert_eq!(decode("not base64!"), None);
        assert_eq!(decode(&URL_SAFE_NO_PAD.encode([0u8; 31])), None);
    }

    #[test]
    fn recognises_common_agents() {
        let ua = parse_user_agent("Mozilla/5.0 (X11; Linux x86_64; rv:120.0) Gecko/20100101 Firefox/120.0");
        assert_eq!(ua.browser_name, "Firefox");
        assert_eq!(ua.browser_version, "120.0");
        assert_eq!(ua.os_name, "Linux");
        assert_eq!(ua.device, "desktop");
        let ua = parse_user_agent("Mozilla/5.0 (iPhone; CPU iPhone OS 17_1 like Mac OS X) AppleWebKit/605.1.15 Version/17.1 Mobile/15E148 Safari/604.1");
        assert_eq!(ua.browser_name, "Safari");
        assert_eq!(ua.os_name, "iOS");
        assert_eq!(ua.os_version, "17.1");
        assert_eq!(ua.device, "mobile");
    }
}
