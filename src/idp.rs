//! Federated OAuth2 identity providers.
//!
//! Each provider is a static descriptor: endpoint builder and profile parser
//! are plain function pointers. The registry pairs descriptors with the
//! credentials found at startup and never changes afterwards.

use std::collections::{BTreeMap, HashMap};

use base64::engine::general_purpose::URL_SAFE_NO_PAD;
use base64::Engine;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::config::{AppConfig, IdpCredentials};
use crate::error::ApiError;

#[derive(Debug, Error)]
pub enum IdpError {
    #[error("state mismatch")]
    StateMismatch,
    #[error("authorization denied: {0}")]
    Denied(String),
    #[error("bad auth session: {0}")]
    Session(String),
    #[error("request failed: {0}")]
    Http(String),
    #[error("unexpected response: {0}")]
    BadResponse(String),
}

impl From<IdpError> for ApiError {
    fn from(e: IdpError) -> Self {
        match e {
            IdpError::StateMismatch | IdpError::Session(_) => ApiError::BadToken,
            IdpError::Denied(_) => ApiError::Unauthorized,
            IdpError::Http(_) | IdpError::BadResponse(_) => ApiError::ResourceFetchFailed,
        }
    }
}

impl From<reqwest::Error> for IdpError {
    fn from(e: reqwest::Error) -> Self {
        IdpError::Http(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Endpoints {
    pub authorize: String,
    pub token: String,
    pub profile: String,
    /// Queried when the profile carries no email.
    pub emails: Option<String>,
}

/// The user as reported by a provider.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FederatedUser {
    pub id: String,
    pub email: String,
    pub name: String,
    pub avatar_url: String,
    pub website_url: String,
}

pub struct IdpDescriptor {
    pub id: &'static str,
    pub name: &'static str,
    pub scopes: &'static [&'static str],
    /// Sends client credentials as HTTP basic auth on the token request.
    pub token_basic_auth: bool,
    pub endpoints: fn(base: Option<&str>) -> Endpoints,
    pub parse_profile: fn(&Value) -> Result<FederatedUser, IdpError>,
}

fn str_field(v: &Value, key: &str) -> String {
    match v.get(key) {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => String::new(),
    }
}

fn require_id(u: FederatedUser) -> Result<FederatedUser, IdpError> {
    if u.id.is_empty() {
        Err(IdpError::BadResponse("profile has no id".into()))
    } else {
        Ok(u)
    }
}

fn github_endpoints(base: Option<&str>) -> Endpoints {
    let (web, api) = match base {
        Some(b) => (b.to_string(), format!("{b}/api/v3")),
        None => ("https://github.com".to_string(), "https://api.github.com".to_string()),
    };
    Endpoints {
        authorize: format!("{web}/login/oauth/authorize"),
        token: format!("{web}/login/oauth/access_token"),
        profile: format!("{api}/user"),
        emails: Some(format!("{api}/user/emails")),
    }
}

fn github_profile(v: &Value) -> Result<FederatedUser, IdpError> {
    let login = str_field(v, "login");
    let name = str_field(v, "name");
    require_id(FederatedUser {
        id: str_field(v, "id"),
        email: str_field(v, "email"),
        name: if name.is_empty() { login } else { name },
        avatar_url: str_field(v, "avatar_url"),
        website_url: str_field(v, "blog"),
    })
}

fn gitlab_endpoints(base: Option<&str>) -> Endpoints {
    let b = base.unwrap_or("https://gitlab.com");
    Endpoints {
        authorize: format!("{b}/oauth/authorize"),
        token: format!("{b}/oauth/token"),
        profile: format!("{b}/api/v4/user"),
        emails: None,
    }
}

fn gitlab_profile(v: &Value) -> Result<FederatedUser, IdpError> {
    require_id(FederatedUser {
        id: str_field(v, "id"),
        email: str_field(v, "email"),
        name: str_field(v, "name"),
        avatar_url: str_field(v, "avatar_url"),
        website_url: str_field(v, "website_url"),
    })
}

fn google_endpoints(base: Option<&str>) -> Endpoints {
    match base {
        Some(b) => Endpoints {
            authorize: format!("{b}/o/oauth2/v2/auth"),
            token: format!("{b}/token"),
            profile: format!("{b}/v1/userinfo"),
            emails: None,
        },
        None => Endpoints {
            authorize: "https://accounts.google.com/o/oauth2/v2/auth".into(),
            token: "https://oauth2.googleapis.com/token".into(),
            profile: "https://openidconnect.googleapis.com/v1/userinfo".into(),
            emails: None,
        },
    }
}

fn google_profile(v: &Value) -> Result<FederatedUser, IdpError> {
    require_id(FederatedUser {
        id: str_field(v, "sub"),
        email: str_field(v, "email"),
        name: str_field(v, "name"),
        avatar_url: str_field(v, "picture"),
        website_url: String::new(),
    })
}

fn twitter_endpoints(base: Option<&str>) -> Endpoints {
    let (web, api) = match base {
        Some(b) => (b.to_string(), b.to_string()),
        None => ("https://twitter.com".to_string(), "https://api.twitter.com".to_string()),
    };
    Endpoints {
        authorize: format!("{web}/i/oauth2/authorize"),
        token: format!("{api}/2/oauth2/token"),
        profile: format!("{api}/2/users/me?user.fields=profile_image_url,url"),
        emails: None,
    }
}

/// Twitter never discloses an email; a stable placeholder stands in for it.
fn twitter_profile(v: &Value) -> Result<FederatedUser, IdpError> {
    let data = v.get("data").ok_or_else(|| IdpError::BadResponse("missing data".into()))?;
    let id = str_field(data, "id");
    let name = str_field(data, "name");
    require_id(FederatedUser {
        email: format!("{id}@twitter.invalid"),
        name: if name.is_empty() { str_field(data, "username") } else { name },
        avatar_url: str_field(data, "profile_image_url"),
        website_url: str_field(data, "url"),
        id,
    })
}

pub static PROVIDERS: &[IdpDescriptor] = &[
    IdpDescriptor {
        id: "github",
        name: "GitHub",
        scopes: &["read:user", "user:email"],
        token_basic_auth: false,
        endpoints: github_endpoints,
        parse_profile: github_profile,
    },
    IdpDescriptor {
        id: "gitlab",
        name: "GitLab",
        scopes: &["read_user"],
        token_basic_auth: false,
        endpoints: gitlab_endpoints,
        parse_profile: gitlab_profile,
    },
    IdpDescriptor {
        id: "google",
        name: "Google",
        scopes: &["openid", "email", "profile"],
        token_basic_auth: false,
        endpoints: google_endpoints,
        parse_profile: google_profile,
    },
    IdpDescriptor {
        id: "twitter",
        name: "Twitter",
        scopes: &["users.read", "tweet.read"],
        token_basic_auth: true,
        endpoints: twitter_endpoints,
        parse_profile: twitter_profile,
    },
];

pub fn descriptor(id: &str) -> Option<&'static IdpDescriptor> {
    PROVIDERS.iter().find(|d| d.id == id)
}

/// In-flight handshake state, stored in the auth session.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct ProviderSession {
    pub provider: String,
    pub state: String,
    pub auth_url: String,
    pub code_verifier: String,
}

impl ProviderSession {
    pub fn marshal(&self) -> String {
        serde_json::to_string(self).unwrap_or_default()
    }

    pub fn unmarshal(blob: &str) -> Result<Self, IdpError> {
        serde_json::from_str(blob).map_err(|e| IdpError::Session(e.to_string()))
    }

    /// The `state` query parameter embedded in the stored authorization URL.
    fn embedded_state(&self) -> Option<String> {
        let url = url::Url::parse(&self.auth_url).ok()?;
        url.query_pairs().find(|(k, _)| k == "state").map(|(_, v)| v.into_owned())
    }
}

fn random_b64(n: usize) -> String {
    let mut b = vec![0u8; n];
    rand::thread_rng().fill_bytes(&mut b);
    URL_SAFE_NO_PAD.encode(b)
}

pub struct ConfiguredIdp {
    pub descriptor: &'static IdpDescriptor,
    pub credentials: IdpCredentials,
    pub endpoints: Endpoints,
}

#[derive(Deserialize)]
struct TokenResponse {
    access_token: Option<String>,
    error: Option<String>,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct EmailEntry {
    email: String,
    #[serde(default)]
    primary: bool,
    #[serde(default)]
    verified: bool,
}

impl ConfiguredIdp {
    pub fn id(&self) -> &'static str {
        self.descriptor.id
    }

    pub fn begin_auth(&self, redirect_uri: &str) -> Result<ProviderSession, IdpError> {
        let state = random_b64(64);
        let code_verifier = random_b64(64);
        let challenge = URL_SAFE_NO_PAD.encode(Sha256::digest(code_verifier.as_bytes()));
        let mut url = url::Url::parse(&self.endpoints.authorize).map_err(|e| IdpError::Session(e.to_string()))?;
        url.query_pairs_mut()
            .append_pair("client_id", &self.credentials.key)
            .append_pair("redirect_uri", redirect_uri)
            .append_pair("response_type", "code")
            .append_pair("scope", &self.descriptor.scopes.join(" "))
            .append_pair("state", &state)
            .append_pair("code_challenge", &challenge)
            .append_pair("code_challenge_method", "S256");
        Ok(ProviderSession { provider: self.id().to_string(), state, auth_url: url.into(), code_verifier })
    }

    /// Checks the callback against the session and swaps the code for an access token.
    pub async fn authorize(
        &self,
        http: &reqwest::Client,
        session: &ProviderSession,
        params: &HashMap<String, String>,
        redirect_uri: &str,
    ) -> Result<String, IdpError> {
        if let Some(err) = params.get("error") {
            return Err(IdpError::Denied(err.clone()));
        }
        let expected = session.embedded_state().ok_or(IdpError::StateMismatch)?;
        if session.provider != self.id() || params.get("state") != Some(&expected) || expected != session.state {
            return Err(IdpError::StateMismatch);
        }
        let code = params.get("code").filter(|c| !c.is_empty()).ok_or_else(|| IdpError::Denied("no code".into()))?;
        let form = [
            ("grant_type", "authorization_code"),
            ("code", code.as_str()),
            ("redirect_uri", redirect_uri),
            ("client_id", self.credentials.key.as_str()),
            ("client_secret", self.credentials.secret.as_str()),
            ("code_verifier", session.code_verifier.as_str()),
        ];
        let mut req = http.post(&self.endpoints.token).header(reqwest::header::ACCEPT, "application/json").form(&form);
        if self.descriptor.token_basic_auth {
            req = req.basic_auth(&self.credentials.key, Some(&self.credentials.secret));
        }
        let resp = req.send().await?;
        let status = resp.status();
        let body: TokenResponse = resp.json().await.map_err(|e| IdpError::BadResponse(e.to_string()))?;
        if let Some(err) = body.error {
            return Err(IdpError::Denied(format!("{err}: {}", body.error_description.unwrap_or_default())));
        }
        match body.access_token {
            Some(t) if status.is_success() && !t.is_empty() => Ok(t),
            _ => Err(IdpError::BadResponse(format!("token endpoint returned {status}"))),
        }
    }

    pub async fn fetch_user(&self, http: &reqwest::Client, access_token: &str) -> Result<FederatedUser, IdpError> {
        let resp = http
            .get(&self.endpoints.profile)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, "comentario")
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(IdpError::BadResponse(format!("profile endpoint returned {}", resp.status())));
        }
        let v: Value = resp.json().await.map_err(|e| IdpError::BadResponse(e.to_string()))?;
        let mut user = (self.descriptor.parse_profile)(&v)?;
        if user.email.is_empty() {
            if let Some(url) = &self.endpoints.emails {
                user.email = self.primary_email(http, url, access_token).await?;
            }
        }
        if user.email.is_empty() {
            return Err(IdpError::BadResponse("provider did not disclose an email".into()));
        }
        user.email = user.email.trim().to_lowercase();
        debug!(idp = self.id(), federated_id = %user.id, "federated profile fetched");
        Ok(user)
    }

    async fn primary_email(&self, http: &reqwest::Client, url: &str, access_token: &str) -> Result<String, IdpError> {
        let entries: Vec<EmailEntry> = http
            .get(url)
            .bearer_auth(access_token)
            .header(reqwest::header::USER_AGENT, "comentario")
            .send()
            .await?
            .json()
            .await
            .map_err(|e| IdpError::BadResponse(e.to_string()))?;
        Ok(entries
            .iter()
            .find(|e| e.primary && e.verified)
            .or_else(|| entries.iter().find(|e| e.verified))
            .map(|e| e.email.clone())
            .unwrap_or_default())
    }
}

/// Providers with usable credentials, keyed by id.
pub struct IdpRegistry {
    providers: BTreeMap<&'static str, ConfiguredIdp>,
}

impl IdpRegistry {
    pub fn from_config(cfg: &AppConfig) -> Self {
        let mut providers = BTreeMap::new();
        for d in PROVIDERS {
            match cfg.idp(d.id) {
                Some(creds) if creds.is_configured() => {
                    let endpoints = (d.endpoints)(creds.url.as_deref().map(|u| u.trim_end_matches('/')));
                    providers.insert(d.id, ConfiguredIdp { descriptor: d, credentials: creds.clone(), endpoints });
                }
                _ => debug!(idp = d.id, "identity provider not configured"),
            }
        }
        if providers.is_empty() {
            warn!("no federated identity providers configured");
        }
        Self { providers }
    }

    pub fn get(&self, id: &str) -> Result<&ConfiguredIdp, ApiError> {
        if descriptor(id).is_none() {
            return Err(ApiError::IdpUnknown);
        }
        self.providers.get(id).ok_or(ApiError::IdpUnconfigured)
    }

    pub fn is_configured(&self, id: &str) -> bool {
        self.providers.contains_key(id)
    }

    pub fn configured_ids(&self) -> Vec<String> {
        self.providers.keys().map(|k| k.to_string()).collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn registry() -> IdpRegistry {
        let mut cfg = AppConfig::for_tests();
        cfg.idps.insert("github".into(), IdpCredentials { key: "k".into(), secret: "s".into(), url: None });
        cfg.idps.insert("gitlab".into(), IdpCredentials { key: "".into(), secret: "s".into(), url: None });
        IdpRegistry::from_config(&cfg)
    }

    #[test]
    fn registry_distinguishes_unknown_and_unconfigured() {
        let r = registry();
        assert!(r.get("github").is_ok());
        assert_eq!(r.get("gitlab").err(), Some(ApiError::IdpUnconfigured));
        assert_eq!(r.get("myspace").err(), Some(ApiError::IdpUnknown));
        assert_eq!(r.configured_ids(), vec!["github".to_string()]);
    }

    #[test]
    fn begin_embeds_state_and_pkce() {
        let r = registry();
        let s = r.get("github").unwrap().begin_auth("http://localhost/cb").unwrap();
        assert_eq!(s.embedded_state().as_deref(), Some(s.state.as_str()));
        assert_eq!(URL_SAFE_NO_PAD.decode(&s.state).unwrap().len(), 64);
        assert!(s.auth_url.starts_with("https://github.com/login/oauth/authorize?"));
        assert!(s.auth_url.contains("code_challenge_method=S256"));
        let back = ProviderSession::unmarshal(&s.marshal()).unwrap();
        assert_eq!(back, s);
    }

    #[test]
    fn endpoint_overrides() {
        let e = gitlab_endpoints(Some("https://git.example.com"));
        assert_eq!(e.profile, "https://git.example.com/api/v4/user");
        assert_eq!(github_endpoints(None).profile, "https://api.github.com/user");
    }

    #[test]
    fn profiles_parse() {
        let gh = github_profile(&json!({"id": 42, "login": "octo", "name": null, "email": null})).unwrap();
        assert_eq!((gh.id.as_str(), gh.name.as_str(), gh.email.as_str()), ("42", "octo", ""));
        let tw = twitter_profile(&json!({"data": {"id": "7", "name": "T", "username": "t"}})).unwrap();
        assert_eq!(tw.email, "7@twitter.invalid");
        assert!(google_profile(&json!({"email": "x@y.z"})).is_err());
    }
}
