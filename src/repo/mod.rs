//! Persistence ports. Each entity family gets its own trait; `Repo` bundles them
//! so handlers can hold a single `Arc<dyn Repo>`.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use crate::models::*;

#[cfg(feature = "inmem-store")]
pub mod inmem;
#[cfg(feature = "postgres-store")]
pub mod pg;

#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum RepoError {
    #[error("not found")] NotFound,
    #[error("conflict")] Conflict,
    #[error("internal: {0}")] Internal(String),
}

pub type RepoResult<T> = Result<T, RepoError>;

/// Extension for turning `NotFound` into `None` where absence is a normal outcome.
pub trait OptionalExt<T> {
    fn optional(self) -> RepoResult<Option<T>>;
}

impl<T> OptionalExt<T> for RepoResult<T> {
    fn optional(self) -> RepoResult<Option<T>> {
        match self {
            Ok(v) => Ok(Some(v)),
            Err(RepoError::NotFound) => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
pub trait UserRepo: Send + Sync {
    async fn find_user_by_id(&self, id: Id) -> RepoResult<User>;
    /// Case-insensitive.
    async fn find_user_by_email(&self, email: &str) -> RepoResult<User>;
    async fn find_user_by_federated_id(&self, idp: &str, federated_id: &str) -> RepoResult<User>;
    async fn find_user_by_secret_token(&self, token: Uuid) -> RepoResult<User>;
    async fn find_users_by_ids(&self, ids: &[Id]) -> RepoResult<Vec<User>>;
    /// Non-system users whose email or name contains `filter`.
    async fn list_users(&self, filter: &str) -> RepoResult<Vec<User>>;
    /// Fails with `Conflict` when the email is taken.
    async fn create_user(&self, user: &User) -> RepoResult<()>;
    async fn update_user(&self, user: &User) -> RepoResult<()>;
    /// Removes the user with their sessions, tokens, memberships and votes
    /// (adjusting scores). Their comments survive with no author.
    async fn delete_user(&self, id: Id) -> RepoResult<()>;
    async fn count_superusers(&self) -> RepoResult<i64>;
}

#[async_trait]
pub trait SessionRepo: Send + Sync {
    async fn create_user_session(&self, session: &UserSession) -> RepoResult<()>;
    async fn find_user_session(&self, id: Id) -> RepoResult<UserSession>;
    async fn delete_user_session(&self, id: Id) -> RepoResult<()>;
    /// Expires every session of the user; returns the number affected.
    async fn expire_user_sessions(&self, user_id: Id) -> RepoResult<u64>;
}

#[async_trait]
pub trait TokenRepo: Send + Sync {
    async fn create_token(&self, token: &Token) -> RepoResult<()>;
    async fn find_token(&self, value: &str) -> RepoResult<Token>;
    async fn update_token(&self, token: &Token) -> RepoResult<()>;
    async fn delete_token(&self, value: &str) -> RepoResult<()>;
    /// Atomically reads a token of the given scope, deleting it unless it is
    /// multi-use. A token of another scope is reported missing and left alone.
    async fn take_token(&self, value: &str, scope: TokenScope) -> RepoResult<Token>;
}

#[async_trait]
pub trait AuthSessionRepo: Send + Sync {
    async fn create_auth_session(&self, session: &AuthSession) -> RepoResult<()>;
    /// Atomic read-and-delete.
    async fn take_auth_session(&self, id: Id) -> RepoResult<AuthSession>;
}

#[async_trait]
pub trait DomainRepo: Send + Sync {
    async fn list_domains(&self) -> RepoResult<Vec<Domain>>;
    async fn list_user_domains(&self, user_id: Id) -> RepoResult<Vec<(Domain, DomainUser)>>;
    async fn find_domain_by_id(&self, id: Id) -> RepoResult<Domain>;
    async fn find_domain_by_host(&self, host: &str) -> RepoResult<Domain>;
    /// Fails with `Conflict` when the host is taken.
    async fn create_domain(&self, domain: &Domain, owner: &DomainUser, idps: &[String]) -> RepoResult<()>;
    async fn update_domain(&self, domain: &Domain) -> RepoResult<()>;
    /// Cascades to pages, comments, votes, memberships, IdP links and config.
    async fn delete_domain(&self, id: Id) -> RepoResult<()>;
    /// Removes all pages, comments and votes and zeroes the counters.
    async fn clear_domain(&self, id: Id) -> RepoResult<()>;
    async fn domain_idps(&self, domain_id: Id) -> RepoResult<Vec<String>>;
    async fn set_domain_idps(&self, domain_id: Id, idps: &[String]) -> RepoResult<()>;
    async fn increment_view_counts(&self, domain_id: Id, page_id: Id) -> RepoResult<()>;
}

#[async_trait]
pub trait DomainUserRepo: Send + Sync {
    async fn find_domain_user(&self, domain_id: Id, user_id: Id) -> RepoResult<DomainUser>;
    async fn upsert_domain_user(&self, du: &DomainUser) -> RepoResult<()>;
    async fn delete_domain_user(&self, domain_id: Id, user_id: Id) -> RepoResult<()>;
    async fn list_domain_users(&self, domain_id: Id) -> RepoResult<Vec<DomainUser>>;
    async fn count_domain_owners(&self, domain_id: Id) -> RepoResult<i64>;
}

#[async_trait]
pub trait PageRepo: Send + Sync {
    async fn find_page(&self, id: Id) -> RepoResult<DomainPage>;
    async fn find_page_by_path(&self, domain_id: Id, path: &str) -> RepoResult<DomainPage>;
    /// Returns the existing page or inserts `page`.
    async fn get_or_create_page(&self, page: &DomainPage) -> RepoResult<DomainPage>;
    async fn update_page(&self, page: &DomainPage) -> RepoResult<()>;
    async fn list_pages(&self, domain_id: Id) -> RepoResult<Vec<DomainPage>>;
}

#[async_trait]
pub trait CommentRepo: Send + Sync {
    async fn find_comment(&self, id: Id) -> RepoResult<Comment>;
    async fn list_page_comments(&self, page_id: Id) -> RepoResult<Vec<Comment>>;
    async fn list_domain_comments(&self, domain_id: Id) -> RepoResult<Vec<Comment>>;
    /// Inserts the comment and bumps page and domain counters in one transaction.
    async fn insert_comment(&self, comment: &Comment) -> RepoResult<()>;
    /// Persists flags, text and audit fields; counters follow any change of
    /// `is_deleted` in the same transaction.
    async fn update_comment(&self, comment: &Comment) -> RepoResult<()>;
    async fn count_approved_comments(&self, domain_id: Id, user_id: Id) -> RepoResult<i64>;
    /// Soft-deletes every live comment by the user; returns the number affected.
    async fn delete_user_comments(&self, user_id: Id, deleted_by: Id, at: DateTime<Utc>) -> RepoResult<u64>;
    /// Physically removes deleted comments and/or comments of deleted authors.
    async fn purge_comments(&self, domain_id: Id, deleted: bool, user_deleted: bool) -> RepoResult<u64>;
}

#[async_trait]
pub trait VoteRepo: Send + Sync {
    async fn find_vote(&self, comment_id: Id, user_id: Id) -> RepoResult<Vote>;
    async fn list_page_votes(&self, page_id: Id, user_id: Id) -> RepoResult<Vec<Vote>>;
    /// Writes (or with `direction == 0` removes) the vote and applies the score
    /// delta atomically; returns the new score.
    async fn set_vote(&self, comment_id: Id, user_id: Id, direction: i16) -> RepoResult<i32>;
}

#[async_trait]
pub trait ConfigRepo: Send + Sync {
    async fn load_instance_config(&self) -> RepoResult<Vec<ConfigRow>>;
    async fn save_instance_config(&self, rows: &[ConfigRow]) -> RepoResult<()>;
    async fn delete_instance_config(&self) -> RepoResult<()>;
    async fn load_domain_config(&self, domain_id: Id) -> RepoResult<Vec<ConfigRow>>;
    async fn save_domain_config(&self, domain_id: Id, rows: &[ConfigRow]) -> RepoResult<()>;
    async fn delete_domain_config(&self, domain_id: Id) -> RepoResult<()>;
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct PruneStats {
    pub tokens: u64,
    pub auth_sessions: u64,
    pub user_sessions: u64,
}

#[async_trait]
pub trait MaintenanceRepo: Send + Sync {
    async fn prune_expired(&self, now: DateTime<Utc>) -> RepoResult<PruneStats>;
}

pub trait Repo:
    UserRepo + SessionRepo + TokenRepo + AuthSessionRepo + DomainRepo + DomainUserRepo + PageRepo + CommentRepo + VoteRepo + ConfigRepo + MaintenanceRepo
{
}

impl<T> Repo for T where
    T: UserRepo + SessionRepo + TokenRepo + AuthSessionRepo + DomainRepo + DomainUserRepo + PageRepo + CommentRepo + VoteRepo + ConfigRepo + MaintenanceRepo
{
}
