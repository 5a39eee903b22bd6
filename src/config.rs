//! Startup configuration read from the environment.

use std::collections::BTreeMap;
use std::env;
use std::path::PathBuf;
use std::time::Duration;

use rand::RngCore;

/// Outgoing mail settings. When absent, new users are confirmed automatically.
#[derive(Debug, Clone)]
pub struct SmtpConfig {
    pub host: String,
    pub port: u16,
    pub from: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

/// Client credentials for one federated identity provider.
#[derive(Debug, Clone, Default)]
pub struct IdpCredentials {
    pub key: String,
    pub secret: String,
    /// Overrides the provider's auth and API base URLs.
    pub url: Option<String>,
}

impl IdpCredentials {
    pub fn is_configured(&self) -> bool {
        !self.key.is_empty() && !self.secret.is_empty()
    }
}

#[derive(Debug, Clone)]
pub struct AppConfig {
    pub base_url: String,
    pub cdn_url: String,
    pub static_path: Option<PathBuf>,
    pub data_dir: PathBuf,
    pub bind_addr: String,
    pub database_url: Option<String>,
    pub smtp: Option<SmtpConfig>,
    pub idps: BTreeMap<String, IdpCredentials>,
    pub xsrf_secret: Vec<u8>,
    pub allow_new_owners: bool,
    pub e2e: bool,
    pub mask_ips: bool,
    pub log_verbose: bool,
    pub session_ttl: chrono::Duration,
    pub wrong_auth_delay_min: Duration,
    pub wrong_auth_delay_max: Duration,
    pub password_hash_cost: u32,
    pub ui_languages: Vec<String>,
    pub default_language: String,
}

pub const IDP_IDS: &[&str] = &["github", "gitlab", "google", "twitter"];

fn var(name: &str) -> Option<String> {
    env::var(name).ok().map(|v| v.trim().to_string()).filter(|v| !v.is_empty())
}

fn flag(name: &str) -> bool {
    var(name).map(|v| v == "1" || v.eq_ignore_ascii_case("true")).unwrap_or(false)
}

fn num<T: std::str::FromStr>(name: &str, default: T) -> T {
    var(name).and_then(|v| v.parse().ok()).unwrap_or(default)
}

impl AppConfig {
    pub fn from_env() -> Self {
        let base_url = var("BASE_URL").unwrap_or_else(|| "http://localhost:8080".into());
        let base_url = base_url.trim_end_matches('/').to_string();
        let cdn_url = var("CDN_URL").map(|u| u.trim_end_matches('/').to_string()).unwrap_or_else(|| base_url.clone());
        let e2e = flag("E2E");

        let smtp = var("SMTP_HOST").map(|host| SmtpConfig {
            host,
            port: num("SMTP_PORT", 587),
            from: var("SMTP_FROM").unwrap_or_else(|| "noreply@localhost".into()),
            username: var("SMTP_USERNAME"),
            password: var("SMTP_PASSWORD"),
        });

        let idps = IDP_IDS
            .iter()
            .map(|id| {
                let prefix = id.to_uppercase();
                let creds = IdpCredentials {
                    key: var(&format!("{prefix}_KEY")).unwrap_or_default(),
                    secret: var(&format!("{prefix}_SECRET")).unwrap_or_default(),
                    url: var(&format!("{prefix}_URL")),
                };
                (id.to_string(), creds)
            })
            .collect();

        // Without a configured key every restart invalidates outstanding XSRF cookies
        let xsrf_secret = match var("XSRF_SECRET") {
            Some(s) => s.into_bytes(),
            None => {
                let mut b = vec![0u8; 32];
                rand::thread_rng().fill_bytes(&mut b);
                b
            }
        };

        let (delay_min, delay_max) = if e2e { (0, 0) } else { (num("WRONG_AUTH_DELAY_MIN_MS", 1000u64), num("WRONG_AUTH_DELAY_MAX_MS", 1500u64)) };

        let ui_languages: Vec<String> = var("UI_LANGUAGES")
            .unwrap_or_else(|| "en".into())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        Self {
            base_url,
            cdn_url,
            static_path: var("STATIC_PATH").map(PathBuf::from),
            data_dir: var("DATA_DIR").map(PathBuf::from).unwrap_or_else(|| PathBuf::from("data")),
            bind_addr: var("BIND_ADDR").unwrap_or_else(|| "0.0.0.0:8080".into()),
            database_url: var("DATABASE_URL"),
            smtp,
            idps,
            xsrf_secret,
            allow_new_owners: flag("ALLOW_NEW_OWNERS"),
            e2e,
            mask_ips: flag("MASK_IPS"),
            log_verbose: flag("LOG_VERBOSE"),
            session_ttl: chrono::Duration::hours(num("SESSION_TTL_HOURS", 720i64)),
            wrong_auth_delay_min: Duration::from_millis(delay_min),
            wrong_auth_delay_max: Duration::from_millis(delay_max.max(delay_min)),
            password_hash_cost: num("PASSWORD_HASH_COST", 14u32).clamp(3, 20),
            default_language: var("DEFAULT_LANGUAGE").unwrap_or_else(|| "en".into()),
            ui_languages,
        }
    }

    /// Configuration suitable for in-process tests: no delays, cheap hashing, mail enabled.
    pub fn for_tests() -> Self {
        Self {
            base_url: "http://localhost:8080".into(),
            cdn_url: "http://localhost:8080".into(),
            static_path: None,
            data_dir: env::temp_dir().join("comentario-test"),
            bind_addr: "127.0.0.1:0".into(),
            database_url: None,
            smtp: Some(SmtpConfig {
                host: "localhost".into(),
                port: 25,
                from: "noreply@localhost".into(),
                username: None,
                password: None,
            }),
            idps: BTreeMap::new(),
            xsrf_secret: b"test-xsrf-secret-must-be-32-bytes!!".to_vec(),
            allow_new_owners: true,
            e2e: true,
            mask_ips: false,
            log_verbose: false,
            session_ttl: chrono::Duration::hours(720),
            wrong_auth_delay_min: Duration::ZERO,
            wrong_auth_delay_max: Duration::ZERO,
            password_hash_cost: 3,
            ui_languages: vec!["en".into()],
            default_language: "en".into(),
        }
    }

    pub fn is_https(&self) -> bool {
        self.base_url.starts_with("https://")
    }

    pub fn mail_enabled(&self) -> bool {
        self.smtp.is_some()
    }

    pub fn idp(&self, id: &str) -> Option<&IdpCredentials> {
        self.idps.get(id)
    }

    /// Masks the host part of an IP address when configured to do so.
    pub fn mask_ip(&self, ip: &str) -> String {
        if !self.mask_ips {
            return ip.to_string();
        }
        if let Some((head, _)) = ip.rsplit_once('.') {
            format!("{head}.x")
        } else if let Some((head, _)) = ip.rsplit_once(':') {
            format!("{head}:x")
        } else {
            ip.to_string()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn masks_ipv4_and_ipv6() {
        let mut cfg = AppConfig::for_tests();
        assert_eq!(cfg.mask_ip("10.1.2.3"), "10.1.2.3");
        cfg.mask_ips = true;
        assert_eq!(cfg.mask_ip("10.1.2.3"), "10.1.2.x");
        assert_eq!(cfg.mask_ip("fe80::1"), "fe80::x");
    }

    #[test]
    fn https_is_derived_from_base_url() {
        let mut cfg = AppConfig::for_tests();
        assert!(!cfg.is_https());
        cfg.base_url = "https://comments.example.com".into();
        assert!(cfg.is_https());
    }
}
