//! Typed runtime configuration stored in the database, with an instance layer
//! and a per-domain layer on top. Lookups resolve domain → instance → default.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::models::{ConfigRow, Id};
use crate::repo::{Repo, RepoError};

pub const AUTH_SIGNUP_ENABLED: &str = "auth.signup.enabled";
pub const AUTH_SIGNUP_CONFIRM_USER: &str = "auth.signup.confirm.user";
pub const AUTH_SIGNUP_CONFIRM_COMMENTER: &str = "auth.signup.confirm.commenter";
pub const AUTH_LOGIN_MAX_ATTEMPTS: &str = "auth.login.local.maxAttempts";
pub const SHOW_DELETED_COMMENTS: &str = "domain.defaults.comments.showDeleted";
pub const USE_GRAVATAR: &str = "domain.defaults.useGravatar";
pub const SPAM_CHECK_ENABLED: &str = "domain.defaults.comments.spamCheck.enabled";
pub const MODERATE_LINKS: &str = "domain.defaults.moderation.links";
pub const MODERATE_IMAGES: &str = "domain.defaults.moderation.images";
pub const MODERATE_MIN_NUM_COMMENTS: &str = "domain.defaults.moderation.minNumComments";
pub const MODERATE_MIN_USER_AGE_DAYS: &str = "domain.defaults.moderation.minUserAgeDays";
pub const MARKDOWN_IMAGES_ENABLED: &str = "markdown.images.enabled";
pub const MARKDOWN_LINKS_ENABLED: &str = "markdown.links.enabled";
pub const MARKDOWN_TABLES_ENABLED: &str = "markdown.tables.enabled";
pub const COMMENT_MAX_LENGTH: &str = "comments.text.maxLength";
pub const NEW_OWNER_ENABLED: &str = "operation.newOwner.enabled";
pub const GRAVATAR_ENABLED: &str = "integrations.gravatar.enabled";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum DataType {
    Boolean,
    Integer,
    String,
}

#[derive(Debug, Clone, Copy)]
pub struct KeyDef {
    pub key: &'static str,
    pub datatype: DataType,
    pub default: &'static str,
    pub min: Option<i64>,
    pub max: Option<i64>,
    pub domain_scoped: bool,
}

const fn bool_key(key: &'static str, default: &'static str, domain_scoped: bool) -> KeyDef {
    KeyDef { key, datatype: DataType::Boolean, default, min: None, max: None, domain_scoped }
}

const fn int_key(key: &'static str, default: &'static str, min: i64, max: i64, domain_scoped: bool) -> KeyDef {
    KeyDef { key, datatype: DataType::Integer, default, min: Some(min), max: Some(max), domain_scoped }
}

pub static KEYS: &[KeyDef] = &[
    bool_key(AUTH_SIGNUP_ENABLED, "true", true),
    bool_key(AUTH_SIGNUP_CONFIRM_USER, "true", false),
    bool_key(AUTH_SIGNUP_CONFIRM_COMMENTER, "true", false),
    int_key(AUTH_LOGIN_MAX_ATTEMPTS, "10", 1, 1000, false),
    bool_key(SHOW_DELETED_COMMENTS, "true", true),
    bool_key(USE_GRAVATAR, "true", true),
    bool_key(SPAM_CHECK_ENABLED, "false", true),
    bool_key(MODERATE_LINKS, "false", true),
    bool_key(MODERATE_IMAGES, "false", true),
    int_key(MODERATE_MIN_NUM_COMMENTS, "0", 0, 1000, true),
    int_key(MODERATE_MIN_USER_AGE_DAYS, "0", 0, 3650, true),
    bool_key(MARKDOWN_IMAGES_ENABLED, "true", true),
    bool_key(MARKDOWN_LINKS_ENABLED, "true", true),
    bool_key(MARKDOWN_TABLES_ENABLED, "true", true),
    int_key(COMMENT_MAX_LENGTH, "4096", 140, 1_048_576, true),
    bool_key(NEW_OWNER_ENABLED, "false", false),
    bool_key(GRAVATAR_ENABLED, "true", false),
];

pub fn key_def(key: &str) -> Option<&'static KeyDef> {
    KEYS.iter().find(|k| k.key == key)
}

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("unknown config key: {0}")]
    UnknownKey(String),
    #[error("key {0} cannot be set per domain")]
    NotDomainScoped(String),
    #[error("invalid value for {key}: {reason}")]
    InvalidValue { key: String, reason: String },
    #[error(transparent)]
    Repo(#[from] RepoError),
}

impl From<ConfigError> for ApiError {
    fn from(e: ConfigError) -> Self {
        match e {
            ConfigError::Repo(r) => r.into(),
            other => ApiError::invalid_prop(other.to_string()),
        }
    }
}

/// Normalises `value` for the key, enforcing datatype and bounds.
pub fn validate(def: &KeyDef, value: &str) -> Result<String, ConfigError> {
    let bad = |reason: String| ConfigError::InvalidValue { key: def.key.to_string(), reason };
    let v = value.trim();
    match def.datatype {
        DataType::Boolean => match v {
            "true" | "false" => Ok(v.to_string()),
            _ => Err(bad("expected true or false".into())),
        },
        DataType::Integer => {
            let n: i64 = v.parse().map_err(|_| bad("expected an integer".into()))?;
            if def.min.is_some_and(|m| n < m) || def.max.is_some_and(|m| n > m) {
                return Err(bad(format!("must be between {} and {}", def.min.unwrap_or(i64::MIN), def.max.unwrap_or(i64::MAX))));
            }
            Ok(n.to_string())
        }
        DataType::String => Ok(value.to_string()),
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DynConfigItem {
    pub key: String,
    pub value: String,
    pub datatype: DataType,
    pub default_value: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<i64>,
    pub updated_time: Option<DateTime<Utc>>,
    pub user_updated: Option<Id>,
}

impl DynConfigItem {
    fn new(def: &KeyDef, row: Option<&ConfigRow>) -> Self {
        DynConfigItem {
            key: def.key.to_string(),
            value: row.map(|r| r.value.clone()).unwrap_or_else(|| def.default.to_string()),
            datatype: def.datatype,
            default_value: def.default.to_string(),
            min: def.min,
            max: def.max,
            updated_time: row.map(|r| r.updated_time),
            user_updated: row.and_then(|r| r.user_updated),
        }
    }

    pub fn as_bool(&self) -> bool {
        self.value == "true"
    }

    pub fn as_int(&self) -> Option<i64> {
        self.value.parse().ok()
    }
}

type Rows = HashMap<String, ConfigRow>;

pub struct DynConfig {
    repo: Arc<dyn Repo>,
    instance: RwLock<Option<Rows>>,
    domains: DashMap<Id, Rows>,
    /// Bumped after every write that invalidates domain layers.
    epoch: AtomicU64,
}

impl DynConfig {
    pub fn new(repo: Arc<dyn Repo>) -> Self {
        Self { repo, instance: RwLock::new(None), domains: DashMap::new(), epoch: AtomicU64::new(0) }
    }

    async fn instance_rows(&self) -> Result<Rows, ConfigError> {
        if let Some(rows) = self.instance.read().await.as_ref() {
            return Ok(rows.clone());
        }
        let mut guard = self.instance.write().await;
        if let Some(rows) = guard.as_ref() {
            return Ok(rows.clone());
        }
        let rows: Rows = self.repo.load_instance_config().await?.into_iter().map(|r| (r.key.clone(), r)).collect();
        *guard = Some(rows.clone());
        Ok(rows)
    }

    async fn domain_rows(&self, domain_id: Id) -> Result<Rows, ConfigError> {
        if let Some(rows) = self.domains.get(&domain_id) {
            return Ok(rows.clone());
        }
        let epoch = self.epoch.load(Ordering::SeqCst);
        let rows: Rows = self.repo.load_domain_config(domain_id).await?.into_iter().map(|r| (r.key.clone(), r)).collect();
        self.cache_domain(domain_id, epoch, &rows);
        Ok(rows)
    }

    /// Caches rows loaded at `epoch` unless a write has landed since. The
    /// check runs under the entry lock, which writers take to evict.
    fn cache_domain(&self, domain_id: Id, epoch: u64, rows: &Rows) {
        if let Entry::Vacant(slot) = self.domains.entry(domain_id) {
            if self.epoch.load(Ordering::SeqCst) == epoch {
                slot.insert(rows.clone());
            }
        }
    }

    fn invalidate_domain(&self, domain_id: Id) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.domains.remove(&domain_id);
    }

    fn invalidate_all_domains(&self) {
        self.epoch.fetch_add(1, Ordering::SeqCst);
        self.domains.clear();
    }

    pub async fn get(&self, key: &str) -> Result<DynConfigItem, ConfigError> {
        let def = key_def(key).ok_or_else(|| ConfigError::UnknownKey(key.into()))?;
        let rows = self.instance_rows().await?;
        Ok(DynConfigItem::new(def, rows.get(key)))
    }

    /// Falls back to the built-in default on any failure.
    pub async fn get_bool(&self, key: &str) -> bool {
        match self.get(key).await {
            Ok(item) => item.as_bool(),
            Err(e) => {
                tracing::warn!(key, error = %e, "config lookup failed, using default");
                key_def(key).map(|d| d.default == "true").unwrap_or(false)
            }
        }
    }

    pub async fn get_int(&self, key: &str) -> i64 {
        match self.get(key).await {
            Ok(item) => item.as_int().unwrap_or_else(|| default_int(key)),
            Err(e) => {
                tracing::warn!(key, error = %e, "config lookup failed, using default");
                default_int(key)
            }
        }
    }

    pub async fn get_all(&self) -> Result<Vec<DynConfigItem>, ConfigError> {
        let rows = self.instance_rows().await?;
        Ok(KEYS.iter().map(|d| DynConfigItem::new(d, rows.get(d.key))).collect())
    }

    fn validate_all(values: &HashMap<String, String>, domain: bool) -> Result<Vec<(&'static KeyDef, String)>, ConfigError> {
        values
            .iter()
            .map(|(k, v)| {
                let def = key_def(k).ok_or_else(|| ConfigError::UnknownKey(k.clone()))?;
                if domain && !def.domain_scoped {
                    return Err(ConfigError::NotDomainScoped(k.clone()));
                }
                Ok((def, validate(def, v)?))
            })
            .collect()
    }

    /// Validates every value before writing any of them. The domain layer is
    /// dropped before the write lock is released.
    pub async fn update(&self, user_id: Option<Id>, values: &HashMap<String, String>) -> Result<(), ConfigError> {
        let checked = Self::validate_all(values, false)?;
        let now = Utc::now();
        let rows: Vec<ConfigRow> = checked
            .into_iter()
            .map(|(def, value)| ConfigRow { key: def.key.to_string(), value, updated_time: now, user_updated: user_id })
            .collect();
        let mut guard = self.instance.write().await;
        self.repo.save_instance_config(&rows).await?;
        // An unloaded cache stays unloaded; the next read picks up everything
        if let Some(cache) = guard.as_mut() {
            for r in rows {
                cache.insert(r.key.clone(), r);
            }
        }
        self.invalidate_all_domains();
        tracing::info!(keys = values.len(), "instance config updated");
        Ok(())
    }

    pub async fn reset(&self) -> Result<(), ConfigError> {
        let mut guard = self.instance.write().await;
        self.repo.delete_instance_config().await?;
        *guard = Some(HashMap::new());
        self.invalidate_all_domains();
        tracing::info!("instance config reset to defaults");
        Ok(())
    }

    pub async fn domain_get(&self, domain_id: Id, key: &str) -> Result<DynConfigItem, ConfigError> {
        let def = key_def(key).ok_or_else(|| ConfigError::UnknownKey(key.into()))?;
        let instance = self.instance_rows().await?;
        let domain = if def.domain_scoped { self.domain_rows(domain_id).await? } else { HashMap::new() };
        let mut item = DynConfigItem::new(def, instance.get(key));
        if let Some(row) = domain.get(key) {
            item.value = row.value.clone();
            item.updated_time = Some(row.updated_time);
            item.user_updated = row.user_updated;
        }
        // Domain rows report the instance value as their default
        item.default_value = instance.get(key).map(|r| r.value.clone()).unwrap_or_else(|| def.default.to_string());
        Ok(item)
    }

    pub async fn domain_get_bool(&self, domain_id: Id, key: &str) -> bool {
        match self.domain_get(domain_id, key).await {
            Ok(item) => item.as_bool(),
            Err(e) => {
                tracing::warn!(key, domain = %domain_id, error = %e, "domain config lookup failed, using default");
                key_def(key).map(|d| d.default == "true").unwrap_or(false)
            }
        }
    }

    pub async fn domain_get_int(&self, domain_id: Id, key: &str) -> i64 {
        match self.domain_get(domain_id, key).await {
            Ok(item) => item.as_int().unwrap_or_else(|| default_int(key)),
            Err(e) => {
                tracing::warn!(key, domain = %domain_id, error = %e, "domain config lookup failed, using default");
                default_int(key)
            }
        }
    }

    /// All domain-scoped keys as resolved for the domain.
    pub async fn domain_get_all(&self, domain_id: Id) -> Result<Vec<DynConfigItem>, ConfigError> {
        let mut out = Vec::new();
        for def in KEYS.iter().filter(|d| d.domain_scoped) {
            out.push(self.domain_get(domain_id, def.key).await?);
        }
        Ok(out)
    }

    pub async fn domain_update(&self, domain_id: Id, user_id: Option<Id>, values: &HashMap<String, String>) -> Result<(), ConfigError> {
        let checked = Self::validate_all(values, true)?;
        let now = Utc::now();
        let rows: Vec<ConfigRow> = checked
            .into_iter()
            .map(|(def, value)| ConfigRow { key: def.key.to_string(), value, updated_time: now, user_updated: user_id })
            .collect();
        self.repo.save_domain_config(domain_id, &rows).await?;
        self.invalidate_domain(domain_id);
        Ok(())
    }

    pub async fn domain_reset(&self, domain_id: Id) -> Result<(), ConfigError> {
        self.repo.delete_domain_config(domain_id).await?;
        self.invalidate_domain(domain_id);
        Ok(())
    }

    /// Forgets a domain's cached layer, e.g. after the domain is deleted.
    pub fn evict_domain(&self, domain_id: Id) {
        self.invalidate_domain(domain_id);
    }
}

fn default_int(key: &str) -> i64 {
    key_def(key).and_then(|d| d.default.parse().ok()).unwrap_or(0)
}

#[cfg(all(test, feature = "inmem-store"))]
mod tests {
    use super::*;
    use crate::repo::inmem::InMemRepo;
    use uuid::Uuid;

    fn store() -> DynConfig {
        DynConfig::new(Arc::new(InMemRepo::new()))
    }

    fn map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
        pairs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect()
    }

    #[tokio::test]
    async fn defaults_apply_without_rows() {
        let c = store();
        assert!(c.get_bool(AUTH_SIGNUP_ENABLED).await);
        assert!(!c.get_bool(NEW_OWNER_ENABLED).await);
        assert_eq!(c.get_int(AUTH_LOGIN_MAX_ATTEMPTS).await, 10);
    }

    #[tokio::test]
    async fn update_validates_type_and_bounds() {
        let c = store();
        assert!(matches!(
            c.update(None, &map(&[(COMMENT_MAX_LENGTH, "10")])).await,
            Err(ConfigError::InvalidValue { .. })
        ));
        assert!(matches!(c.update(None, &map(&[(USE_GRAVATAR, "yes")])).await, Err(ConfigError::InvalidValue { .. })));
        assert!(matches!(c.update(None, &map(&[("no.such.key", "1")])).await, Err(ConfigError::UnknownKey(_))));
        c.update(None, &map(&[(COMMENT_MAX_LENGTH, "500")])).await.unwrap();
        assert_eq!(c.get_int(COMMENT_MAX_LENGTH).await, 500);
    }

    #[tokio::test]
    async fn domain_layer_falls_back_to_instance_and_is_invalidated() {
        let c = store();
        let d = Uuid::new_v4();
        assert!(c.domain_get_bool(d, MARKDOWN_LINKS_ENABLED).await);
        c.update(None, &map(&[(MARKDOWN_LINKS_ENABLED, "false")])).await.unwrap();
        assert!(!c.domain_get_bool(d, MARKDOWN_LINKS_ENABLED).await);
        c.domain_update(d, None, &map(&[(MARKDOWN_LINKS_ENABLED, "true")])).await.unwrap();
        assert!(c.domain_get_bool(d, MARKDOWN_LINKS_ENABLED).await);
        c.domain_reset(d).await.unwrap();
        assert!(!c.domain_get_bool(d, MARKDOWN_LINKS_ENABLED).await);
    }

    #[tokio::test]
    async fn load_overtaken_by_a_write_is_not_cached() {
        let c = store();
        let d = Uuid::new_v4();
        // A reader loads the old rows, then a writer lands before it caches them
        let epoch = c.epoch.load(Ordering::SeqCst);
        let stale: Rows = HashMap::new();
        c.domain_update(d, None, &map(&[(MARKDOWN_LINKS_ENABLED, "false")])).await.unwrap();
        c.cache_domain(d, epoch, &stale);
        assert!(c.domains.get(&d).is_none());
        assert!(!c.domain_get_bool(d, MARKDOWN_LINKS_ENABLED).await);

        // Same for an instance-wide write
        let epoch = c.epoch.load(Ordering::SeqCst);
        c.update(None, &map(&[(USE_GRAVATAR, "false")])).await.unwrap();
        c.cache_domain(d, epoch, &stale);
        assert!(!c.domain_get_bool(d, MARKDOWN_LINKS_ENABLED).await);
    }

    #[tokio::test]
    async fn instance_only_keys_refused_per_domain() {
        let c = store();
        let err = c.domain_update(Uuid::new_v4(), None, &map(&[(NEW_OWNER_ENABLED, "true")])).await.unwrap_err();
        assert_eq!(err, ConfigError::NotDomainScoped(NEW_OWNER_ENABLED.into()));
    }

    #[tokio::test]
    async fn reset_restores_defaults() {
        let c = store();
        c.update(None, &map(&[(AUTH_SIGNUP_ENABLED, "false")])).await.unwrap();
        assert!(!c.get_bool(AUTH_SIGNUP_ENABLED).await);
        c.reset().await.unwrap();
        assert!(c.get_bool(AUTH_SIGNUP_ENABLED).await);
    }
}
