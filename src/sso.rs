//! Per-domain single sign-on. The domain's endpoint and this service share an
//! HMAC-SHA256 key; both directions carry `hex(hmac(bytes, key))`.

use hmac::{Hmac, Mac};
use rand::RngCore;
use serde::Deserialize;
use sha2::Sha256;
use subtle::ConstantTimeEq;
use thiserror::Error;

use crate::error::ApiError;
use crate::models::{Domain, DomainUser};

type HmacSha256 = Hmac<Sha256>;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum SsoError {
    #[error("SSO is misconfigured: {0}")]
    Misconfigured(String),
    #[error("signature mismatch")]
    BadSignature,
    #[error("malformed payload: {0}")]
    BadPayload(String),
    #[error("payload token does not match the session")]
    TokenMismatch,
}

impl From<SsoError> for ApiError {
    fn from(e: SsoError) -> Self {
        match e {
            SsoError::Misconfigured(d) => ApiError::SsoMisconfigured(Some(d)),
            SsoError::BadSignature => ApiError::Unauthorized,
            SsoError::BadPayload(d) => ApiError::invalid_input(d),
            SsoError::TokenMismatch => ApiError::BadToken,
        }
    }
}

/// New random domain secret, hex-encoded.
pub fn generate_secret() -> String {
    let mut b = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut b);
    hex::encode(b)
}

fn key_bytes(secret_hex: &str) -> Result<Vec<u8>, SsoError> {
    let key = hex::decode(secret_hex.trim()).map_err(|_| SsoError::Misconfigured("secret is not valid hex".into()))?;
    if key.is_empty() {
        return Err(SsoError::Misconfigured("secret is empty".into()));
    }
    Ok(key)
}

fn mac(key: &[u8]) -> Result<HmacSha256, SsoError> {
    HmacSha256::new_from_slice(key).map_err(|_| SsoError::Misconfigured("unusable secret".into()))
}

pub fn sign(data: &[u8], secret_hex: &str) -> Result<String, SsoError> {
    let mut m = mac(&key_bytes(secret_hex)?)?;
    m.update(data);
    Ok(hex::encode(m.finalize().into_bytes()))
}

/// Constant-time check of a hex signature.
pub fn verify(data: &[u8], signature_hex: &str, secret_hex: &str) -> Result<bool, SsoError> {
    let Ok(sig) = hex::decode(signature_hex.trim()) else { return Ok(false) };
    let mut m = mac(&key_bytes(secret_hex)?)?;
    m.update(data);
    Ok(m.verify_slice(&sig).is_ok())
}

/// Secret and URL of a domain with SSO turned on.
pub fn domain_settings(domain: &Domain) -> Result<(&str, &str), SsoError> {
    if !domain.auth_sso {
        return Err(SsoError::Misconfigured("SSO is not enabled for the domain".into()));
    }
    if domain.sso_url.is_empty() {
        return Err(SsoError::Misconfigured("SSO URL is not set".into()));
    }
    match domain.sso_secret.as_deref() {
        Some(s) if !s.is_empty() => Ok((domain.sso_url.as_str(), s)),
        _ => Err(SsoError::Misconfigured("SSO secret is not set".into())),
    }
}

/// `ssoUrl?token=T&hmac=H` where H signs the raw token bytes.
pub fn redirect_url(sso_url: &str, token: &str, secret_hex: &str) -> Result<String, SsoError> {
    let token_bytes = hex::decode(token).map_err(|_| SsoError::BadPayload("token is not hex".into()))?;
    let sig = sign(&token_bytes, secret_hex)?;
    let mut url = url::Url::parse(sso_url).map_err(|e| SsoError::Misconfigured(format!("bad SSO URL: {e}")))?;
    if !matches!(url.scheme(), "http" | "https") {
        return Err(SsoError::Misconfigured("SSO URL must be http(s)".into()));
    }
    url.query_pairs_mut().append_pair("token", token).append_pair("hmac", &sig);
    Ok(url.into())
}

#[derive(Debug, Clone, Deserialize, PartialEq, Eq)]
pub struct SsoPayload {
    pub token: String,
    pub email: String,
    pub name: String,
    #[serde(default)]
    pub photo: Option<String>,
    #[serde(default)]
    pub link: Option<String>,
    #[serde(default)]
    pub role: Option<String>,
}

/// Verifies and decodes the callback payload, insisting it answers `expected_token`.
pub fn open_payload(payload_hex: &str, hmac_hex: &str, secret_hex: &str, expected_token: &str) -> Result<SsoPayload, SsoError> {
    let bytes = hex::decode(payload_hex.trim()).map_err(|_| SsoError::BadPayload("payload is not hex".into()))?;
    if !verify(&bytes, hmac_hex, secret_hex)? {
        return Err(SsoError::BadSignature);
    }
    let p: SsoPayload = serde_json::from_slice(&bytes).map_err(|e| SsoError::BadPayload(e.to_string()))?;
    if !bool::from(p.token.as_bytes().ct_eq(expected_token.as_bytes())) {
        return Err(SsoError::TokenMismatch);
    }
    let email = p.email.trim();
    if email.is_empty() || !email.contains('@') {
        return Err(SsoError::BadPayload("email is missing or invalid".into()));
    }
    if p.name.trim().is_empty() {
        return Err(SsoError::BadPayload("name is missing".into()));
    }
    Ok(p)
}

/// Applies an SSO role claim to a membership row. Unknown roles leave it as is.
pub fn apply_role(du: &mut DomainUser, role: Option<&str>) {
    let Some(role) = role else { return };
    let (owner, moderator, commenter) = match role {
        "owner" => (true, true, true),
        "moderator" => (false, true, true),
        "commenter" => (false, false, true),
        "readonly" => (false, false, false),
        _ => return,
    };
    du.is_owner = owner;
    du.is_moderator = moderator;
    du.is_commenter = commenter;
}

#[cfg(test)]
mod tests {
    use super::*;
    use uuid::Uuid;

    const SECRET: &str = "000102030405060708090a0b0c0d0e0f";

    #[test]
    fn sign_verify_roundtrip_and_tamper() {
        let payload = br#"{"token":"ab","email":"u@x.test","name":"U"}"#;
        let sig = sign(payload, SECRET).unwrap();
        assert!(verify(payload, &sig, SECRET).unwrap());
        let mut tampered = payload.to_vec();
        tampered[3] ^= 0x01;
        assert!(!verify(&tampered, &sig, SECRET).unwrap());
        let mut bad_sig = hex::decode(&sig).unwrap();
        bad_sig[0] ^= 0x80;
        assert!(!verify(payload, &hex::encode(bad_sig), SECRET).unwrap());
        assert!(!verify(payload, "zz", SECRET).unwrap());
    }

    #[test]
    fn redirect_carries_token_and_signature() {
        let token = "ab".repeat(32);
        let u = redirect_url("https://sso.test/authz", &token, SECRET).unwrap();
        let parsed = url::Url::parse(&u).unwrap();
        let pairs: std::collections::HashMap<_, _> = parsed.query_pairs().into_owned().collect();
        assert_eq!(pairs["token"], token);
        assert_eq!(pairs["hmac"], sign(&hex::decode(&token).unwrap(), SECRET).unwrap());
        assert!(matches!(redirect_url("ftp://x", &token, SECRET), Err(SsoError::Misconfigured(_))));
    }

    #[test]
    fn payload_must_answer_the_token() {
        let json = br#"{"token":"aa","email":"u@x.test","name":"U","role":"moderator"}"#;
        let payload = hex::encode(json);
        let sig = sign(json, SECRET).unwrap();
        let p = open_payload(&payload, &sig, SECRET, "aa").unwrap();
        assert_eq!(p.role.as_deref(), Some("moderator"));
        assert_eq!(open_payload(&payload, &sig, SECRET, "bb"), Err(SsoError::TokenMismatch));
        // A prefix of the expected token is still a mismatch
        assert_eq!(open_payload(&payload, &sig, SECRET, "aaa"), Err(SsoError::TokenMismatch));
        assert_eq!(open_payload(&payload, &sig, SECRET, ""), Err(SsoError::TokenMismatch));
        assert_eq!(open_payload(&payload, &sig, "ff", "aa"), Err(SsoError::BadSignature));
    }

    #[test]
    fn misconfigured_domain() {
        let mut d = Domain::new("x.test", "X");
        assert!(domain_settings(&d).is_err());
        d.auth_sso = true;
        d.sso_url = "https://sso.test".into();
        assert!(matches!(domain_settings(&d), Err(SsoError::Misconfigured(_))));
        d.sso_secret = Some(SECRET.into());
        assert!(domain_settings(&d).is_ok());
    }

    #[test]
    fn roles() {
        let mut du = DomainUser::commenter(Uuid::nil(), Uuid::nil());
        apply_role(&mut du, Some("owner"));
        assert!(du.is_owner && du.is_moderator);
        apply_role(&mut du, Some("readonly"));
        assert!(du.is_readonly());
        apply_role(&mut du, Some("bogus"));
        assert!(du.is_readonly());
    }
}
