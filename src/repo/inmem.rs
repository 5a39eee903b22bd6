use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock, RwLockReadGuard, RwLockWriteGuard};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use uuid::Uuid;

use super::*;

#[derive(Default)]
struct State {
    users: HashMap<Id, User>,
    sessions: HashMap<Id, UserSession>,
    tokens: HashMap<String, Token>,
    auth_sessions: HashMap<Id, AuthSession>,
    domains: HashMap<Id, Domain>,
    domain_idps: HashMap<Id, Vec<String>>,
    domain_users: HashMap<(Id, Id), DomainUser>,
    pages: HashMap<Id, DomainPage>,
    comments: HashMap<Id, Comment>,
    votes: HashMap<(Id, Id), Vote>,
    config: HashMap<String, ConfigRow>,
    domain_config: HashMap<(Id, String), ConfigRow>,
}

impl State {
    fn seeded() -> Self {
        let mut s = State::default();
        let anon = User::anonymous();
        s.users.insert(anon.id, anon);
        s
    }

    fn page_domain(&self, page_id: Id) -> RepoResult<Id> {
        self.pages.get(&page_id).map(|p| p.domain_id).ok_or(RepoError::NotFound)
    }

    fn bump_comment_counters(&mut self, page_id: Id, delta: i64) -> RepoResult<()> {
        let domain_id = self.page_domain(page_id)?;
        if let Some(p) = self.pages.get_mut(&page_id) {
            p.count_comments += delta;
        }
        if let Some(d) = self.domains.get_mut(&domain_id) {
            d.count_comments += delta;
        }
        Ok(())
    }

    fn remove_comments(&mut self, ids: &HashSet<Id>) {
        for id in ids {
            if let Some(c) = self.comments.remove(id) {
                if !c.is_deleted {
                    let _ = self.bump_comment_counters(c.page_id, -1);
                }
            }
        }
        self.votes.retain(|(cid, _), _| !ids.contains(cid));
        // Children of purged rows become roots
        for c in self.comments.values_mut() {
            if c.parent_id.map(|p| ids.contains(&p)).unwrap_or(false) {
                c.parent_id = None;
            }
        }
    }

    fn remove_domain_content(&mut self, domain_id: Id) {
        let page_ids: HashSet<Id> = self.pages.values().filter(|p| p.domain_id == domain_id).map(|p| p.id).collect();
        let comment_ids: HashSet<Id> = self.comments.values().filter(|c| page_ids.contains(&c.page_id)).map(|c| c.id).collect();
        self.votes.retain(|(cid, _), _| !comment_ids.contains(cid));
        self.comments.retain(|id, _| !comment_ids.contains(id));
        self.pages.retain(|id, _| !page_ids.contains(id));
    }
}

/// Process-local repository used for development and tests.
#[derive(Clone)]
pub struct InMemRepo {
    state: Arc<RwLock<State>>,
}

impl InMemRepo {
    pub fn new() -> Self {
        Self { state: Arc::new(RwLock::new(State::seeded())) }
    }

    /// Drops all data, leaving only the anonymous system account.
    pub fn reset(&self) -> RepoResult<()> {
        *self.write()? = State::seeded();
        Ok(())
    }

    fn read(&self) -> RepoResult<RwLockReadGuard<'_, State>> {
        self.state.read().map_err(|e| RepoError::Internal(format!("lock poisoned: {e}")))
    }

    fn write(&self) -> RepoResult<RwLockWriteGuard<'_, State>> {
        self.state.write().map_err(|e| RepoError::Internal(format!("lock poisoned: {e}")))
    }
}

impl Default for InMemRepo {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl UserRepo for InMemRepo {
    async fn find_user_by_id(&self, id: Id) -> RepoResult<User> {
        self.read()?.users.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn find_user_by_email(&self, email: &str) -> RepoResult<User> {
        let email = email.trim().to_lowercase();
        let s = self.read()?;
        s.users.values().find(|u| !u.system_account && u.email == email).cloned().ok_or(RepoError::NotFound)
    }

    async fn find_user_by_federated_id(&self, idp: &str, federated_id: &str) -> RepoResult<User> {
        let s = self.read()?;
        s.users
            .values()
            .find(|u| u.federated_idp.as_deref() == Some(idp) && u.federated_id == federated_id)
            .cloned()
            .ok_or(RepoError::NotFound)
    }

    async fn find_user_by_secret_token(&self, token: Uuid) -> RepoResult<User> {
        let s = self.read()?;
        s.users.values().find(|u| !u.system_account && u.secret_token == token).cloned().ok_or(RepoError::NotFound)
    }

    async fn find_users_by_ids(&self, ids: &[Id]) -> RepoResult<Vec<User>> {
        let s = self.read()?;
        Ok(ids.iter().filter_map(|id| s.users.get(id).cloned()).collect())
    }

    async fn list_users(&self, filter: &str) -> RepoResult<Vec<User>> {
        let filter = filter.to_lowercase();
        let s = self.read()?;
        let mut v: Vec<User> = s
            .users
            .values()
            .filter(|u| !u.system_account)
            .filter(|u| filter.is_empty() || u.email.contains(&filter) || u.name.to_lowercase().contains(&filter))
            .cloned()
            .collect();
        v.sort_by(|a, b| a.email.cmp(&b.email));
        Ok(v)
    }

    async fn create_user(&self, user: &User) -> RepoResult<()> {
        let mut s = self.write()?;
        if s.users.contains_key(&user.id) || (!user.email.is_empty() && s.users.values().any(|u| u.email == user.email)) {
            return Err(RepoError::Conflict);
        }
        s.users.insert(user.id, user.clone());
        Ok(())
    }

    async fn update_user(&self, user: &User) -> RepoResult<()> {
        let mut s = self.write()?;
        if s.users.values().any(|u| u.id != user.id && !u.email.is_empty() && u.email == user.email) {
            return Err(RepoError::Conflict);
        }
        let slot = s.users.get_mut(&user.id).ok_or(RepoError::NotFound)?;
        *slot = user.clone();
        Ok(())
    }

    async fn delete_user(&self, id: Id) -> RepoResult<()> {
        let mut s = self.write()?;
        if s.users.remove(&id).is_none() {
            return Err(RepoError::NotFound);
        }
        s.sessions.retain(|_, v| v.user_id != id);
        s.tokens.retain(|_, t| t.owner != id);
        s.domain_users.retain(|(_, uid), _| *uid != id);
        let votes: Vec<Vote> = s.votes.values().filter(|v| v.user_id == id).cloned().collect();
        for v in votes {
            if let Some(c) = s.comments.get_mut(&v.comment_id) {
                c.score -= v.direction as i32;
            }
            s.votes.remove(&(v.comment_id, v.user_id));
        }
        for c in s.comments.values_mut() {
            if c.user_created == Some(id) {
                c.user_created = None;
            }
            if c.user_moderated == Some(id) {
                c.user_moderated = None;
            }
            if c.user_deleted == Some(id) {
                c.user_deleted = None;
            }
            if c.user_edited == Some(id) {
                c.user_edited = None;
            }
        }
        Ok(())
    }

    async fn count_superusers(&self) -> RepoResult<i64> {
        let s = self.read()?;
        Ok(s.users.values().filter(|u| u.is_superuser && !u.banned).count() as i64)
    }
}

#[async_trait]
impl SessionRepo for InMemRepo {
    async fn create_user_session(&self, session: &UserSession) -> RepoResult<()> {
        self.write()?.sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn find_user_session(&self, id: Id) -> RepoResult<UserSession> {
        self.read()?.sessions.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn delete_user_session(&self, id: Id) -> RepoResult<()> {
        self.write()?.sessions.remove(&id);
        Ok(())
    }

    async fn expire_user_sessions(&self, user_id: Id) -> RepoResult<u64> {
        let now = Utc::now();
        let mut s = self.write()?;
        let mut n = 0;
        for sess in s.sessions.values_mut().filter(|x| x.user_id == user_id && x.expires_time > now) {
            sess.expires_time = now;
            n += 1;
        }
        Ok(n)
    }
}

#[async_trait]
impl TokenRepo for InMemRepo {
    async fn create_token(&self, token: &Token) -> RepoResult<()> {
        let mut s = self.write()?;
        if s.tokens.contains_key(&token.value) {
            return Err(RepoError::Conflict);
        }
        s.tokens.insert(token.value.clone(), token.clone());
        Ok(())
    }

    async fn find_token(&self, value: &str) -> RepoResult<Token> {
        self.read()?.tokens.get(value).cloned().ok_or(RepoError::NotFound)
    }

    async fn update_token(&self, token: &Token) -> RepoResult<()> {
        let mut s = self.write()?;
        let slot = s.tokens.get_mut(&token.value).ok_or(RepoError::NotFound)?;
        *slot = token.clone();
        Ok(())
    }

    async fn delete_token(&self, value: &str) -> RepoResult<()> {
        self.write()?.tokens.remove(value);
        Ok(())
    }

    async fn take_token(&self, value: &str, scope: TokenScope) -> RepoResult<Token> {
        let mut s = self.write()?;
        let token = s.tokens.get(value).filter(|t| t.scope == scope).cloned().ok_or(RepoError::NotFound)?;
        if !token.multi_use {
            s.tokens.remove(value);
        }
        Ok(token)
    }
}

#[async_trait]
impl AuthSessionRepo for InMemRepo {
    async fn create_auth_session(&self, session: &AuthSession) -> RepoResult<()> {
        self.write()?.auth_sessions.insert(session.id, session.clone());
        Ok(())
    }

    async fn take_auth_session(&self, id: Id) -> RepoResult<AuthSession> {
        self.write()?.auth_sessions.remove(&id).ok_or(RepoError::NotFound)
    }
}

#[async_trait]
impl DomainRepo for InMemRepo {
    async fn list_domains(&self) -> RepoResult<Vec<Domain>> {
        let s = self.read()?;
        let mut v: Vec<Domain> = s.domains.values().cloned().collect();
        v.sort_by(|a, b| a.host.cmp(&b.host));
        Ok(v)
    }

    async fn list_user_domains(&self, user_id: Id) -> RepoResult<Vec<(Domain, DomainUser)>> {
        let s = self.read()?;
        let mut v: Vec<(Domain, DomainUser)> = s
            .domain_users
            .values()
            .filter(|du| du.user_id == user_id)
            .filter_map(|du| s.domains.get(&du.domain_id).map(|d| (d.clone(), du.clone())))
            .collect();
        v.sort_by(|a, b| a.0.host.cmp(&b.0.host));
        Ok(v)
    }

    async fn find_domain_by_id(&self, id: Id) -> RepoResult<Domain> {
        self.read()?.domains.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn find_domain_by_host(&self, host: &str) -> RepoResult<Domain> {
        let s = self.read()?;
        s.domains.values().find(|d| d.host == host).cloned().ok_or(RepoError::NotFound)
    }

    async fn create_domain(&self, domain: &Domain, owner: &DomainUser, idps: &[String]) -> RepoResult<()> {
        let mut s = self.write()?;
        if s.domains.values().any(|d| d.host == domain.host) {
            return Err(RepoError::Conflict);
        }
        s.domains.insert(domain.id, domain.clone());
        s.domain_users.insert((domain.id, owner.user_id), owner.clone());
        s.domain_idps.insert(domain.id, idps.to_vec());
        Ok(())
    }

    async fn update_domain(&self, domain: &Domain) -> RepoResult<()> {
        let mut s = self.write()?;
        if s.domains.values().any(|d| d.id != domain.id && d.host == domain.host) {
            return Err(RepoError::Conflict);
        }
        let slot = s.domains.get_mut(&domain.id).ok_or(RepoError::NotFound)?;
        // Counters are owned by the comment and view paths
        let (comments, views) = (slot.count_comments, slot.count_views);
        *slot = domain.clone();
        slot.count_comments = comments;
        slot.count_views = views;
        Ok(())
    }

    async fn delete_domain(&self, id: Id) -> RepoResult<()> {
        let mut s = self.write()?;
        if s.domains.remove(&id).is_none() {
            return Err(RepoError::NotFound);
        }
        s.remove_domain_content(id);
        s.domain_users.retain(|(did, _), _| *did != id);
        s.domain_idps.remove(&id);
        s.domain_config.retain(|(did, _), _| *did != id);
        Ok(())
    }

    async fn clear_domain(&self, id: Id) -> RepoResult<()> {
        let mut s = self.write()?;
        let d = s.domains.get_mut(&id).ok_or(RepoError::NotFound)?;
        d.count_comments = 0;
        d.count_views = 0;
        s.remove_domain_content(id);
        Ok(())
    }

    async fn domain_idps(&self, domain_id: Id) -> RepoResult<Vec<String>> {
        Ok(self.read()?.domain_idps.get(&domain_id).cloned().unwrap_or_default())
    }

    async fn set_domain_idps(&self, domain_id: Id, idps: &[String]) -> RepoResult<()> {
        self.write()?.domain_idps.insert(domain_id, idps.to_vec());
        Ok(())
    }

    async fn increment_view_counts(&self, domain_id: Id, page_id: Id) -> RepoResult<()> {
        let mut s = self.write()?;
        if let Some(p) = s.pages.get_mut(&page_id) {
            p.count_views += 1;
        }
        if let Some(d) = s.domains.get_mut(&domain_id) {
            d.count_views += 1;
        }
        Ok(())
    }
}

#[async_trait]
impl DomainUserRepo for InMemRepo {
    async fn find_domain_user(&self, domain_id: Id, user_id: Id) -> RepoResult<DomainUser> {
        self.read()?.domain_users.get(&(domain_id, user_id)).cloned().ok_or(RepoError::NotFound)
    }

    async fn upsert_domain_user(&self, du: &DomainUser) -> RepoResult<()> {
        let mut s = self.write()?;
        if !s.domains.contains_key(&du.domain_id) || !s.users.contains_key(&du.user_id) {
            return Err(RepoError::NotFound);
        }
        s.domain_users.insert((du.domain_id, du.user_id), du.clone());
        Ok(())
    }

    async fn delete_domain_user(&self, domain_id: Id, user_id: Id) -> RepoResult<()> {
        self.write()?.domain_users.remove(&(domain_id, user_id));
        Ok(())
    }

    async fn list_domain_users(&self, domain_id: Id) -> RepoResult<Vec<DomainUser>> {
        let s = self.read()?;
        let mut v: Vec<DomainUser> = s.domain_users.values().filter(|du| du.domain_id == domain_id).cloned().collect();
        v.sort_by(|a, b| a.created_time.cmp(&b.created_time));
        Ok(v)
    }

    async fn count_domain_owners(&self, domain_id: Id) -> RepoResult<i64> {
        let s = self.read()?;
        Ok(s.domain_users.values().filter(|du| du.domain_id == domain_id && du.is_owner).count() as i64)
    }
}

#[async_trait]
impl PageRepo for InMemRepo {
    async fn find_page(&self, id: Id) -> RepoResult<DomainPage> {
        self.read()?.pages.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn find_page_by_path(&self, domain_id: Id, path: &str) -> RepoResult<DomainPage> {
        let s = self.read()?;
        s.pages.values().find(|p| p.domain_id == domain_id && p.path == path).cloned().ok_or(RepoError::NotFound)
    }

    async fn get_or_create_page(&self, page: &DomainPage) -> RepoResult<DomainPage> {
        let mut s = self.write()?;
        if let Some(existing) = s.pages.values().find(|p| p.domain_id == page.domain_id && p.path == page.path) {
            return Ok(existing.clone());
        }
        if !s.domains.contains_key(&page.domain_id) {
            return Err(RepoError::NotFound);
        }
        s.pages.insert(page.id, page.clone());
        Ok(page.clone())
    }

    async fn update_page(&self, page: &DomainPage) -> RepoResult<()> {
        let mut s = self.write()?;
        let slot = s.pages.get_mut(&page.id).ok_or(RepoError::NotFound)?;
        slot.title = page.title.clone();
        slot.is_readonly = page.is_readonly;
        Ok(())
    }

    async fn list_pages(&self, domain_id: Id) -> RepoResult<Vec<DomainPage>> {
        let s = self.read()?;
        let mut v: Vec<DomainPage> = s.pages.values().filter(|p| p.domain_id == domain_id).cloned().collect();
        v.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(v)
    }
}

#[async_trait]
impl CommentRepo for InMemRepo {
    async fn find_comment(&self, id: Id) -> RepoResult<Comment> {
        self.read()?.comments.get(&id).cloned().ok_or(RepoError::NotFound)
    }

    async fn list_page_comments(&self, page_id: Id) -> RepoResult<Vec<Comment>> {
        let s = self.read()?;
        let mut v: Vec<Comment> = s.comments.values().filter(|c| c.page_id == page_id).cloned().collect();
        v.sort_by(|a, b| a.created_time.cmp(&b.created_time));
        Ok(v)
    }

    async fn list_domain_comments(&self, domain_id: Id) -> RepoResult<Vec<Comment>> {
        let s = self.read()?;
        let mut v: Vec<Comment> = s
            .comments
            .values()
            .filter(|c| s.pages.get(&c.page_id).map(|p| p.domain_id == domain_id).unwrap_or(false))
            .cloned()
            .collect();
        v.sort_by(|a, b| a.created_time.cmp(&b.created_time));
        Ok(v)
    }

    async fn insert_comment(&self, comment: &Comment) -> RepoResult<()> {
        let mut s = self.write()?;
        if s.comments.contains_key(&comment.id) {
            return Err(RepoError::Conflict);
        }
        s.page_domain(comment.page_id)?;
        if !comment.is_deleted {
            s.bump_comment_counters(comment.page_id, 1)?;
        }
        s.comments.insert(comment.id, comment.clone());
        Ok(())
    }

    async fn update_comment(&self, comment: &Comment) -> RepoResult<()> {
        let mut s = self.write()?;
        let prev = s.comments.get(&comment.id).cloned().ok_or(RepoError::NotFound)?;
        match (prev.is_deleted, comment.is_deleted) {
            (false, true) => s.bump_comment_counters(comment.page_id, -1)?,
            (true, false) => s.bump_comment_counters(comment.page_id, 1)?,
            _ => {}
        }
        // Score is owned by the vote path
        let mut next = comment.clone();
        next.score = prev.score;
        s.comments.insert(comment.id, next);
        Ok(())
    }

    async fn count_approved_comments(&self, domain_id: Id, user_id: Id) -> RepoResult<i64> {
        let s = self.read()?;
        Ok(s.comments
            .values()
            .filter(|c| c.user_created == Some(user_id) && c.is_approved && !c.is_deleted)
            .filter(|c| s.pages.get(&c.page_id).map(|p| p.domain_id == domain_id).unwrap_or(false))
            .count() as i64)
    }

    async fn delete_user_comments(&self, user_id: Id, deleted_by: Id, at: DateTime<Utc>) -> RepoResult<u64> {
        let mut s = self.write()?;
        let ids: Vec<(Id, Id)> = s
            .comments
            .values()
            .filter(|c| c.user_created == Some(user_id) && !c.is_deleted)
            .map(|c| (c.id, c.page_id))
            .collect();
        for (id, page_id) in &ids {
            if let Some(c) = s.comments.get_mut(id) {
                c.is_deleted = true;
                c.deleted_time = Some(at);
                c.user_deleted = Some(deleted_by);
            }
            s.bump_comment_counters(*page_id, -1)?;
        }
        Ok(ids.len() as u64)
    }

    async fn purge_comments(&self, domain_id: Id, deleted: bool, user_deleted: bool) -> RepoResult<u64> {
        let mut s = self.write()?;
        let ids: HashSet<Id> = s
            .comments
            .values()
            .filter(|c| s.pages.get(&c.page_id).map(|p| p.domain_id == domain_id).unwrap_or(false))
            .filter(|c| (deleted && c.is_deleted) || (user_deleted && c.user_created.is_none()))
            .map(|c| c.id)
            .collect();
        s.remove_comments(&ids);
        Ok(ids.len() as u64)
    }
}

#[async_trait]
impl VoteRepo for InMemRepo {
    async fn find_vote(&self, comment_id: Id, user_id: Id) -> RepoResult<Vote> {
        self.read()?.votes.get(&(comment_id, user_id)).cloned().ok_or(RepoError::NotFound)
    }

    async fn list_page_votes(&self, page_id: Id, user_id: Id) -> RepoResult<Vec<Vote>> {
        let s = self.read()?;
        Ok(s.votes
            .values()
            .filter(|v| v.user_id == user_id)
            .filter(|v| s.comments.get(&v.comment_id).map(|c| c.page_id == page_id).unwrap_or(false))
            .cloned()
            .collect())
    }

    async fn set_vote(&self, comment_id: Id, user_id: Id, direction: i16) -> RepoResult<i32> {
        let mut s = self.write()?;
        if !s.comments.contains_key(&comment_id) {
            return Err(RepoError::NotFound);
        }
        let old = s.votes.get(&(comment_id, user_id)).map(|v| v.direction).unwrap_or(0);
        if direction == 0 {
            s.votes.remove(&(comment_id, user_id));
        } else {
            s.votes.insert((comment_id, user_id), Vote { comment_id, user_id, direction, updated_time: Utc::now() });
        }
        let c = s.comments.get_mut(&comment_id).ok_or(RepoError::NotFound)?;
        c.score += (direction - old) as i32;
        Ok(c.score)
    }
}

#[async_trait]
impl ConfigRepo for InMemRepo {
    async fn load_instance_config(&self) -> RepoResult<Vec<ConfigRow>> {
        Ok(self.read()?.config.values().cloned().collect())
    }

    async fn save_instance_config(&self, rows: &[ConfigRow]) -> RepoResult<()> {
        let mut s = self.write()?;
        for r in rows {
            s.config.insert(r.key.clone(), r.clone());
        }
        Ok(())
    }

    async fn delete_instance_config(&self) -> RepoResult<()> {
        self.write()?.config.clear();
        Ok(())
    }

    async fn load_domain_config(&self, domain_id: Id) -> RepoResult<Vec<ConfigRow>> {
        let s = self.read()?;
        Ok(s.domain_config.iter().filter(|((did, _), _)| *did == domain_id).map(|(_, r)| r.clone()).collect())
    }

    async fn save_domain_config(&self, domain_id: Id, rows: &[ConfigRow]) -> RepoResult<()> {
        let mut s = self.write()?;
        for r in rows {
            s.domain_config.insert((domain_id, r.key.clone()), r.clone());
        }
        Ok(())
    }

    async fn delete_domain_config(&self, domain_id: Id) -> RepoResult<()> {
        self.write()?.domain_config.retain(|(did, _), _| *did != domain_id);
        Ok(())
    }
}

#[async_trait]
impl MaintenanceRepo for InMemRepo {
    async fn prune_expired(&self, now: DateTime<Utc>) -> RepoResult<PruneStats> {
        let mut s = self.write()?;
        let before = (s.tokens.len(), s.auth_sessions.len(), s.sessions.len());
        s.tokens.retain(|_, t| t.expires_time > now);
        s.auth_sessions.retain(|_, a| a.expires_time > now);
        s.sessions.retain(|_, x| x.expires_time > now);
        Ok(PruneStats {
            tokens: (before.0 - s.tokens.len()) as u64,
            auth_sessions: (before.1 - s.auth_sessions.len()) as u64,
            user_sessions: (before.2 - s.sessions.len()) as u64,
        })
    }
}
