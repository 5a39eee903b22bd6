use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use uuid::Uuid;

pub type Id = Uuid;

/// Id of the system account that owns anonymous comments and unbound tokens.
pub const ANONYMOUS_USER_ID: Id = Uuid::nil();

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct User {
    pub id: Id,
    pub email: String,
    pub name: String,
    #[serde(skip_serializing, default)]
    pub password_hash: String,
    pub system_account: bool,
    pub is_superuser: bool,
    pub confirmed: bool,
    pub confirmed_time: Option<DateTime<Utc>>,
    pub created_time: DateTime<Utc>,
    pub signup_ip: String,
    pub signup_country: String,
    pub signup_host: String,
    pub banned: bool,
    pub banned_time: Option<DateTime<Utc>>,
    pub locked: bool,
    pub locked_time: Option<DateTime<Utc>>,
    /// Empty for local and SSO users.
    pub federated_idp: Option<String>,
    pub federated_sso: bool,
    pub federated_id: String,
    pub website_url: String,
    pub lang_id: String,
    #[serde(skip_serializing, default = "Uuid::new_v4")]
    pub secret_token: Uuid,
    pub failed_login_attempts: i32,
    pub last_login: Option<DateTime<Utc>>,
    pub has_avatar: bool,
}

/// How a user proves their identity. Exactly one applies to each account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum UserAuthKind {
    Local,
    Federated(String),
    Sso,
}

impl User {
    /// A fresh local, unconfirmed, non-privileged account.
    pub fn new(email: &str, name: &str) -> Self {
        User {
            id: Uuid::new_v4(),
            email: email.trim().to_lowercase(),
            name: name.trim().to_string(),
            password_hash: String::new(),
            system_account: false,
            is_superuser: false,
            confirmed: false,
            confirmed_time: None,
            created_time: Utc::now(),
            signup_ip: String::new(),
            signup_country: String::new(),
            signup_host: String::new(),
            banned: false,
            banned_time: None,
            locked: false,
            locked_time: None,
            federated_idp: None,
            federated_sso: false,
            federated_id: String::new(),
            website_url: String::new(),
            lang_id: "en".into(),
            secret_token: Uuid::new_v4(),
            failed_login_attempts: 0,
            last_login: None,
            has_avatar: false,
        }
    }

    pub fn anonymous() -> Self {
        let mut u = User::new("", "Anonymous");
        u.id = ANONYMOUS_USER_ID;
        u.system_account = true;
        u.confirmed = true;
        u
    }

    pub fn is_anonymous(&self) -> bool {
        self.id == ANONYMOUS_USER_ID
    }

    pub fn auth_kind(&self) -> UserAuthKind {
        match (&self.federated_idp, self.federated_sso) {
            (Some(idp), _) if !idp.is_empty() => UserAuthKind::Federated(idp.clone()),
            (_, true) => UserAuthKind::Sso,
            _ => UserAuthKind::Local,
        }
    }

    pub fn confirm(&mut self) {
        if !self.confirmed {
            self.confirmed = true;
            self.confirmed_time = Some(Utc::now());
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct UserSession {
    pub id: Id,
    pub user_id: Id,
    pub created_time: DateTime<Utc>,
    pub expires_time: DateTime<Utc>,
    /// Empty for admin UI sessions, the embedding domain host otherwise.
    pub host: String,
    pub proto: String,
    pub ip: String,
    pub country: String,
    pub browser_name: String,
    pub browser_version: String,
    pub os_name: String,
    pub os_version: String,
    pub device: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum TokenScope {
    ConfirmEmail,
    ResetPassword,
    LoginExchange,
}

impl TokenScope {
    pub fn as_str(&self) -> &'static str {
        match self {
            TokenScope::ConfirmEmail => "confirm-email",
            TokenScope::ResetPassword => "reset-password",
            TokenScope::LoginExchange => "login-exchange",
        }
    }
}

impl TryFrom<String> for TokenScope {
    type Error = UnknownVariant;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "confirm-email" => Ok(TokenScope::ConfirmEmail),
            "reset-password" => Ok(TokenScope::ResetPassword),
            "login-exchange" => Ok(TokenScope::LoginExchange),
            _ => Err(UnknownVariant(s)),
        }
    }
}

#[derive(Debug, thiserror::Error)]
#[error("unknown enum value: {0}")]
pub struct UnknownVariant(pub String);

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Token {
    /// 32 random bytes, lowercase hex.
    pub value: String,
    pub owner: Id,
    #[sqlx(try_from = "String")]
    pub scope: TokenScope,
    pub expires_time: DateTime<Utc>,
    pub multi_use: bool,
}

impl Token {
    pub fn is_expired(&self) -> bool {
        self.expires_time <= Utc::now()
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuthSession {
    pub id: Id,
    pub token_value: String,
    /// Empty for admin UI flows.
    pub host: String,
    pub session_data: String,
    pub created_time: DateTime<Utc>,
    pub expires_time: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub enum ModNotifyPolicy {
    None,
    PendingOnly,
    All,
}

impl ModNotifyPolicy {
    pub fn as_str(&self) -> &'static str {
        match self {
            ModNotifyPolicy::None => "none",
            ModNotifyPolicy::PendingOnly => "pendingOnly",
            ModNotifyPolicy::All => "all",
        }
    }
}

impl TryFrom<String> for ModNotifyPolicy {
    type Error = UnknownVariant;
    fn try_from(s: String) -> Result<Self, Self::Error> {
        match s.as_str() {
            "none" => Ok(ModNotifyPolicy::None),
            "pendingOnly" => Ok(ModNotifyPolicy::PendingOnly),
            "all" => Ok(ModNotifyPolicy::All),
            _ => Err(UnknownVariant(s)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct Domain {
    pub id: Id,
    pub host: String,
    pub name: String,
    pub is_https: bool,
    pub is_readonly: bool,
    pub created_time: DateTime<Utc>,
    pub auth_anonymous: bool,
    pub auth_local: bool,
    pub auth_sso: bool,
    pub sso_url: String,
    #[serde(skip_serializing, default)]
    pub sso_secret: Option<String>,
    pub sso_non_interactive: bool,
    pub mod_anonymous: bool,
    pub mod_authenticated: bool,
    /// `None` falls back to the domain config layer.
    pub mod_num_comments: Option<i32>,
    pub mod_user_age_days: Option<i32>,
    pub mod_links: Option<bool>,
    pub mod_images: Option<bool>,
    #[sqlx(try_from = "String")]
    pub mod_notify_policy: ModNotifyPolicy,
    pub default_sort: String,
    pub count_comments: i64,
    pub count_views: i64,
}

impl Domain {
    pub fn new(host: &str, name: &str) -> Self {
        Domain {
            id: Uuid::new_v4(),
            host: host.to_string(),
            name: name.to_string(),
            is_https: true,
            is_readonly: false,
            created_time: Utc::now(),
            auth_anonymous: false,
            auth_local: true,
            auth_sso: false,
            sso_url: String::new(),
            sso_secret: None,
            sso_non_interactive: false,
            mod_anonymous: true,
            mod_authenticated: false,
            mod_num_comments: None,
            mod_user_age_days: None,
            mod_links: None,
            mod_images: None,
            mod_notify_policy: ModNotifyPolicy::PendingOnly,
            default_sort: "td".into(),
            count_comments: 0,
            count_views: 0,
        }
    }

    /// Checks the row-level invariants: some auth method enabled (counting the
    /// domain's federated IdPs), SSO URL set iff SSO is on, well-formed sort.
    pub fn validate(&self, num_idps: usize) -> Result<(), String> {
        if self.host.is_empty() || self.host.contains('/') || self.host.chars().any(char::is_whitespace) {
            return Err("invalid host".into());
        }
        if !(self.auth_anonymous || self.auth_local || self.auth_sso) && num_idps == 0 {
            return Err("at least one authentication method must be enabled".into());
        }
        if self.auth_sso == self.sso_url.is_empty() {
            return Err("SSO URL must be set if and only if SSO is enabled".into());
        }
        let sort = self.default_sort.as_bytes();
        if sort.len() != 2 || !matches!(sort[0], b's' | b't') || !matches!(sort[1], b'a' | b'd') {
            return Err("invalid default sort".into());
        }
        Ok(())
    }

    pub fn root_url(&self) -> String {
        format!("{}://{}", if self.is_https { "https" } else { "http" }, self.host)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DomainUser {
    pub domain_id: Id,
    pub user_id: Id,
    pub is_owner: bool,
    pub is_moderator: bool,
    pub is_commenter: bool,
    pub notify_replies: bool,
    pub notify_moderator: bool,
    pub notify_comment_status: bool,
    pub created_time: DateTime<Utc>,
}

impl DomainUser {
    pub fn commenter(domain_id: Id, user_id: Id) -> Self {
        DomainUser {
            domain_id,
            user_id,
            is_owner: false,
            is_moderator: false,
            is_commenter: true,
            notify_replies: true,
            notify_moderator: true,
            notify_comment_status: true,
            created_time: Utc::now(),
        }
    }

    pub fn owner(domain_id: Id, user_id: Id) -> Self {
        DomainUser { is_owner: true, is_moderator: true, ..DomainUser::commenter(domain_id, user_id) }
    }

    pub fn is_moderator_plus(&self) -> bool {
        self.is_owner || self.is_moderator
    }

    pub fn is_readonly(&self) -> bool {
        !self.is_owner && !self.is_moderator && !self.is_commenter
    }

    /// Enforces owner ⇒ moderator ⇒ commenter.
    pub fn normalize(&mut self) {
        if self.is_owner {
            self.is_moderator = true;
        }
        if self.is_moderator {
            self.is_commenter = true;
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema, sqlx::FromRow)]
#[serde(rename_all = "camelCase")]
pub struct DomainPage {
    pub id: Id,
    pub domain_id: Id,
    pub path: String,
    pub title: String,
    pub is_readonly: bool,
    pub created_time: DateTime<Utc>,
    pub count_comments: i64,
    pub count_views: i64,
}

impl DomainPage {
    pub fn new(domain_id: Id, path: &str) -> Self {
        DomainPage {
            id: Uuid::new_v4(),
            domain_id,
            path: path.to_string(),
            title: String::new(),
            is_readonly: false,
            created_time: Utc::now(),
            count_comments: 0,
            count_views: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ToSchema)]
pub enum CommentState {
    Pending,
    Approved,
    Rejected,
    Spam,
    Deleted,
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Comment {
    pub id: Id,
    pub parent_id: Option<Id>,
    pub page_id: Id,
    pub markdown: String,
    pub html: String,
    pub score: i32,
    pub is_pending: bool,
    pub is_approved: bool,
    pub is_spam: bool,
    pub is_deleted: bool,
    pub pending_reason: String,
    pub created_time: DateTime<Utc>,
    pub moderated_time: Option<DateTime<Utc>>,
    pub deleted_time: Option<DateTime<Utc>>,
    pub edited_time: Option<DateTime<Utc>>,
    /// `None` once the author has been deleted.
    pub user_created: Option<Id>,
    pub user_moderated: Option<Id>,
    pub user_deleted: Option<Id>,
    pub user_edited: Option<Id>,
    pub author_name: String,
    pub author_ip: String,
}

impl Comment {
    pub fn state(&self) -> CommentState {
        if self.is_deleted {
            CommentState::Deleted
        } else if self.is_spam {
            CommentState::Spam
        } else if self.is_pending {
            CommentState::Pending
        } else if self.is_approved {
            CommentState::Approved
        } else {
            CommentState::Rejected
        }
    }

    /// Rewrites the moderation flags to represent `state` (never `Deleted`).
    pub fn set_moderation_state(&mut self, state: CommentState) {
        let (pending, approved, spam) = match state {
            CommentState::Pending => (true, false, false),
            CommentState::Approved => (false, true, false),
            CommentState::Rejected => (false, false, false),
            CommentState::Spam => (false, false, true),
            CommentState::Deleted => return,
        };
        self.is_pending = pending;
        self.is_approved = approved;
        self.is_spam = spam;
    }

    pub fn is_anonymous(&self) -> bool {
        self.user_created == Some(ANONYMOUS_USER_ID)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Vote {
    pub comment_id: Id,
    pub user_id: Id,
    pub direction: i16,
    pub updated_time: DateTime<Utc>,
}

/// A stored config value; instance rows carry no domain id.
#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct ConfigRow {
    pub key: String,
    pub value: String,
    pub updated_time: DateTime<Utc>,
    pub user_updated: Option<Id>,
}

// ---------------- Wire views -----------------------------------------

/// The authenticated user as shown to themselves; never carries credentials.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PrincipalView {
    pub id: Id,
    pub email: String,
    pub name: String,
    pub website_url: String,
    pub lang_id: String,
    pub is_superuser: bool,
    pub is_confirmed: bool,
    pub is_local: bool,
    pub is_sso: bool,
    pub federated_idp_id: Option<String>,
    pub has_avatar: bool,
    pub is_owner: bool,
    pub is_moderator: bool,
    pub is_commenter: bool,
    pub is_readonly: bool,
    pub notify_replies: bool,
    pub notify_moderator: bool,
    pub notify_comment_status: bool,
}

impl PrincipalView {
    pub fn new(u: &User, du: Option<&DomainUser>) -> Self {
        let kind = u.auth_kind();
        PrincipalView {
            id: u.id,
            email: u.email.clone(),
            name: u.name.clone(),
            website_url: u.website_url.clone(),
            lang_id: u.lang_id.clone(),
            is_superuser: u.is_superuser,
            is_confirmed: u.confirmed,
            is_local: kind == UserAuthKind::Local,
            is_sso: kind == UserAuthKind::Sso,
            federated_idp_id: u.federated_idp.clone().filter(|s| !s.is_empty()),
            has_avatar: u.has_avatar,
            is_owner: du.map(|d| d.is_owner).unwrap_or(false),
            is_moderator: du.map(|d| d.is_moderator).unwrap_or(false),
            is_commenter: du.map(|d| d.is_commenter).unwrap_or(true),
            is_readonly: du.map(|d| d.is_readonly()).unwrap_or(false),
            notify_replies: du.map(|d| d.notify_replies).unwrap_or(true),
            notify_moderator: du.map(|d| d.notify_moderator).unwrap_or(true),
            notify_comment_status: du.map(|d| d.notify_comment_status).unwrap_or(true),
        }
    }
}

/// Comment author as exposed to readers of a page. Email is only present for moderators.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Commenter {
    pub id: Id,
    pub name: String,
    pub website_url: String,
    pub has_avatar: bool,
    pub is_owner: bool,
    pub is_moderator: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct CommentView {
    pub id: Id,
    pub parent_id: Option<Id>,
    pub page_id: Id,
    pub markdown: String,
    pub html: String,
    pub score: i32,
    pub state: CommentState,
    pub is_pending: bool,
    pub is_approved: bool,
    pub is_spam: bool,
    pub is_deleted: bool,
    pub created_time: DateTime<Utc>,
    pub moderated_time: Option<DateTime<Utc>>,
    pub deleted_time: Option<DateTime<Utc>>,
    pub edited_time: Option<DateTime<Utc>>,
    pub user_created: Option<Id>,
    pub author_name: String,
    pub direction: i16,
    pub depth: usize,
}
