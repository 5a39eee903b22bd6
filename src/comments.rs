//! Comment lifecycle: submission with initial-state evaluation, moderation,
//! deletion, editing and the threaded page listing.

use std::collections::{HashMap, HashSet};

use async_trait::async_trait;
use chrono::Utc;
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};
use utoipa::ToSchema;
use uuid::Uuid;

use crate::authz;
use crate::dynconfig::{self, DynConfig};
use crate::error::ApiError;
use crate::markdown::{self, MarkdownOptions};
use crate::models::{Comment, CommentState, CommentView, Commenter, Domain, DomainPage, DomainUser, Id, User, ANONYMOUS_USER_ID};
use crate::principal::Principal;
use crate::repo::{OptionalExt, Repo, RepoError};
use crate::routes::AppState;
use crate::usersession::ClientInfo;

// ---------------- Antispam ----------------

/// What an antispam service gets to look at.
#[derive(Debug, Clone)]
pub struct SpamInput<'a> {
    pub ip: &'a str,
    pub user_agent: &'a str,
    pub name: &'a str,
    pub email: &'a str,
    pub website: &'a str,
    pub body: &'a str,
    pub page_url: &'a str,
}

#[async_trait]
pub trait SpamChecker: Send + Sync {
    /// True when the content is spam.
    async fn check(&self, input: &SpamInput<'_>) -> anyhow::Result<bool>;
}

/// Accepts everything.
#[derive(Debug, Default, Clone)]
pub struct NoSpamChecker;

#[async_trait]
impl SpamChecker for NoSpamChecker {
    async fn check(&self, _: &SpamInput<'_>) -> anyhow::Result<bool> {
        Ok(false)
    }
}

// ---------------- Initial state ----------------

/// Moderation knobs of a domain with the nullable ones already resolved.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ModerationPolicy {
    pub spam_check: bool,
    pub anonymous: bool,
    pub authenticated: bool,
    pub min_num_comments: i64,
    pub min_user_age_days: i64,
    pub links: bool,
    pub images: bool,
}

impl ModerationPolicy {
    pub async fn resolve(domain: &Domain, cfg: &DynConfig) -> Self {
        let int_or = |v: Option<i32>| v.map(i64::from);
        ModerationPolicy {
            spam_check: cfg.domain_get_bool(domain.id, dynconfig::SPAM_CHECK_ENABLED).await,
            anonymous: domain.mod_anonymous,
            authenticated: domain.mod_authenticated,
            min_num_comments: match int_or(domain.mod_num_comments) {
                Some(v) => v,
                None => cfg.domain_get_int(domain.id, dynconfig::MODERATE_MIN_NUM_COMMENTS).await,
            },
            min_user_age_days: match int_or(domain.mod_user_age_days) {
                Some(v) => v,
                None => cfg.domain_get_int(domain.id, dynconfig::MODERATE_MIN_USER_AGE_DAYS).await,
            },
            links: match domain.mod_links {
                Some(v) => v,
                None => cfg.domain_get_bool(domain.id, dynconfig::MODERATE_LINKS).await,
            },
            images: match domain.mod_images {
                Some(v) => v,
                None => cfg.domain_get_bool(domain.id, dynconfig::MODERATE_IMAGES).await,
            },
        }
    }
}

/// Facts about the author that the rules look at.
#[derive(Debug, Clone, Copy, Default)]
pub struct AuthorFacts {
    pub is_moderator_plus: bool,
    pub is_anonymous: bool,
    pub approved_comments: i64,
    pub account_age_days: i64,
}

/// First matching rule wins. `is_spam` is only consulted when the policy has
/// spam checking on. Returns the state and, for `Pending`, the reason.
pub fn initial_state(policy: &ModerationPolicy, author: &AuthorFacts, markdown: &str, is_spam: bool) -> (CommentState, &'static str) {
    if author.is_moderator_plus {
        return (CommentState::Approved, "");
    }
    if policy.spam_check && is_spam {
        return (CommentState::Spam, "");
    }
    if author.is_anonymous && policy.anonymous {
        return (CommentState::Pending, "anonymous author");
    }
    if !author.is_anonymous && policy.authenticated {
        return (CommentState::Pending, "authenticated author");
    }
    if !author.is_anonymous && author.approved_comments < policy.min_num_comments {
        return (CommentState::Pending, "too few approved comments");
    }
    if !author.is_anonymous && author.account_age_days < policy.min_user_age_days {
        return (CommentState::Pending, "account too new");
    }
    if policy.links && markdown::has_links(markdown) {
        return (CommentState::Pending, "contains links");
    }
    if policy.images && markdown::has_images(markdown) {
        return (CommentState::Pending, "contains images");
    }
    (CommentState::Approved, "")
}

// ---------------- Tree ----------------

fn sort_key_cmp(sort: &str) -> impl Fn(&Comment, &Comment) -> std::cmp::Ordering + '_ {
    move |a, b| {
        let by_time = a.created_time.cmp(&b.created_time).then(a.id.cmp(&b.id));
        match sort {
            "ta" => by_time,
            "sa" => a.score.cmp(&b.score).then(by_time),
            "sd" => b.score.cmp(&a.score).then(by_time),
            _ => by_time.reverse(),
        }
    }
}

/// Orders comments depth-first with siblings sorted per `sort`, pairing each
/// with its depth. Comments whose parent is absent from the set are dropped.
pub fn thread(comments: Vec<Comment>, sort: &str) -> Vec<(Comment, usize)> {
    let mut children: HashMap<Option<Id>, Vec<Comment>> = HashMap::new();
    let present: HashSet<Id> = comments.iter().map(|c| c.id).collect();
    for c in comments {
        let key = c.parent_id.filter(|p| present.contains(p));
        // Only real roots go under `None`
        if c.parent_id.is_some() && key.is_none() {
            continue;
        }
        children.entry(key).or_default().push(c);
    }
    let cmp = sort_key_cmp(sort);
    for list in children.values_mut() {
        list.sort_by(&cmp);
    }
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    let mut stack: Vec<(Comment, usize)> = children.remove(&None).unwrap_or_default().into_iter().rev().map(|c| (c, 0)).collect();
    while let Some((c, depth)) = stack.pop() {
        if !visited.insert(c.id) {
            continue;
        }
        if let Some(kids) = children.remove(&Some(c.id)) {
            stack.extend(kids.into_iter().rev().map(|k| (k, depth + 1)));
        }
        out.push((c, depth));
    }
    out
}

pub fn view(c: &Comment, direction: i16, depth: usize, reveal_body: bool) -> CommentView {
    let blank = c.is_deleted && !reveal_body;
    CommentView {
        id: c.id,
        parent_id: c.parent_id,
        page_id: c.page_id,
        markdown: if blank { String::new() } else { c.markdown.clone() },
        html: if blank { String::new() } else { c.html.clone() },
        score: c.score,
        state: c.state(),
        is_pending: c.is_pending,
        is_approved: c.is_approved,
        is_spam: c.is_spam,
        is_deleted: c.is_deleted,
        created_time: c.created_time,
        moderated_time: c.moderated_time,
        deleted_time: c.deleted_time,
        edited_time: c.edited_time,
        user_created: c.user_created,
        author_name: if blank { String::new() } else { c.author_name.clone() },
        direction,
        depth,
    }
}

fn commenter(u: &User, du: Option<&DomainUser>, show_email: bool) -> Commenter {
    Commenter {
        id: u.id,
        name: u.name.clone(),
        website_url: u.website_url.clone(),
        has_avatar: u.has_avatar,
        is_owner: du.map(|d| d.is_owner).unwrap_or(false),
        is_moderator: du.map(|d| d.is_moderator).unwrap_or(false),
        email: if show_email { Some(u.email.clone()) } else { None },
    }
}

// ---------------- Operations ----------------

/// Page and domain settings the widget renders against.
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PageInfo {
    pub domain_id: Id,
    pub domain_name: String,
    pub page_id: Id,
    pub path: String,
    pub title: String,
    pub is_domain_readonly: bool,
    pub is_page_readonly: bool,
    pub auth_anonymous: bool,
    pub auth_local: bool,
    pub auth_sso: bool,
    pub sso_url: String,
    pub sso_non_interactive: bool,
    pub idps: Vec<String>,
    pub default_sort: String,
    pub count_comments: i64,
    pub show_deleted: bool,
    pub markdown_links: bool,
    pub markdown_images: bool,
    pub markdown_tables: bool,
    pub max_comment_length: i64,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PageComments {
    pub comments: Vec<CommentView>,
    pub commenters: Vec<Commenter>,
    pub page_info: PageInfo,
}

#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct Submitted {
    pub comment: CommentView,
    pub commenter: Option<Commenter>,
    pub state: CommentState,
}

pub struct NewComment {
    pub host: String,
    pub path: String,
    pub parent_id: Option<Id>,
    pub markdown: String,
    pub author_name: Option<String>,
    pub page_title: Option<String>,
}

/// Loads a domain by host, mapping absence to `unknown-host`.
pub async fn domain_by_host(repo: &dyn Repo, host: &str) -> Result<Domain, ApiError> {
    match repo.find_domain_by_host(host.trim()).await {
        Ok(d) => Ok(d),
        Err(RepoError::NotFound) => Err(ApiError::UnknownHost),
        Err(e) => Err(e.into()),
    }
}

pub fn validate_path(path: &str) -> Result<String, ApiError> {
    let p = path.trim();
    if !p.starts_with('/') || p.len() > 2083 || p.chars().any(char::is_whitespace) {
        return Err(ApiError::invalid_input("invalid page path"));
    }
    Ok(p.to_string())
}

pub async fn markdown_options(cfg: &DynConfig, domain_id: Id) -> MarkdownOptions {
    MarkdownOptions {
        links: cfg.domain_get_bool(domain_id, dynconfig::MARKDOWN_LINKS_ENABLED).await,
        images: cfg.domain_get_bool(domain_id, dynconfig::MARKDOWN_IMAGES_ENABLED).await,
        tables: cfg.domain_get_bool(domain_id, dynconfig::MARKDOWN_TABLES_ENABLED).await,
    }
}

async fn validate_markdown(cfg: &DynConfig, domain_id: Id, markdown: &str) -> Result<String, ApiError> {
    let md = markdown.trim();
    if md.is_empty() {
        return Err(ApiError::invalid_input("comment text is empty"));
    }
    let max = cfg.domain_get_int(domain_id, dynconfig::COMMENT_MAX_LENGTH).await;
    if md.chars().count() as i64 > max {
        return Err(ApiError::invalid_input(format!("comment text is longer than {max} characters")));
    }
    Ok(md.to_string())
}

/// Renders a preview without storing anything.
pub async fn preview(st: &AppState, host: &str, markdown: &str) -> Result<String, ApiError> {
    let domain = domain_by_host(st.repo.as_ref(), host).await?;
    let md = validate_markdown(&st.dyn_config, domain.id, markdown).await?;
    Ok(markdown::render(&md, markdown_options(&st.dyn_config, domain.id).await))
}

pub async fn submit(st: &AppState, principal: Principal, req: NewComment, client: &ClientInfo) -> Result<Submitted, ApiError> {
    let repo = st.repo.as_ref();
    let domain = domain_by_host(repo, &req.host).await?;
    let principal = principal.for_domain(repo, domain.id).await?;
    let path = validate_path(&req.path)?;
    let mut page = repo.get_or_create_page(&DomainPage::new(domain.id, &path)).await?;
    let idps = repo.domain_idps(domain.id).await?;
    authz::check_post_comment(&principal, &domain, &idps, &page)?;
    let md = validate_markdown(&st.dyn_config, domain.id, &req.markdown).await?;

    if let Some(parent_id) = req.parent_id {
        let parent = repo.find_comment(parent_id).await.optional()?;
        if parent.map(|p| p.page_id != page.id).unwrap_or(true) {
            return Err(ApiError::NoRootComment);
        }
    }

    if let Some(title) = req.page_title.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        if page.title.is_empty() {
            page.title = title.chars().take(255).collect();
            repo.update_page(&page).await?;
        }
    }

    // Commenters get a membership row on first post so their preferences stick
    if let Principal::Authenticated { user, domain_user: None } = &principal {
        repo.upsert_domain_user(&DomainUser::commenter(domain.id, user.id)).await?;
    }

    let policy = ModerationPolicy::resolve(&domain, &st.dyn_config).await;
    let facts = match principal.user() {
        None => AuthorFacts { is_anonymous: true, ..Default::default() },
        Some(u) => AuthorFacts {
            is_moderator_plus: principal.is_superuser() || principal.is_moderator_plus(),
            is_anonymous: false,
            approved_comments: if policy.min_num_comments > 0 { repo.count_approved_comments(domain.id, u.id).await? } else { 0 },
            account_age_days: (Utc::now() - u.created_time).num_days(),
        },
    };
    let author_name = match principal.user() {
        Some(u) => u.name.clone(),
        None => req.author_name.as_deref().map(str::trim).filter(|n| !n.is_empty()).unwrap_or("Anonymous").chars().take(63).collect(),
    };

    let is_spam = if policy.spam_check && !facts.is_moderator_plus {
        let page_url = format!("{}{}", domain.root_url(), page.path);
        let input = SpamInput {
            ip: &client.ip,
            user_agent: &client.user_agent,
            name: &author_name,
            email: principal.user().map(|u| u.email.as_str()).unwrap_or(""),
            website: principal.user().map(|u| u.website_url.as_str()).unwrap_or(""),
            body: &md,
            page_url: &page_url,
        };
        st.spam.check(&input).await.unwrap_or_else(|e| {
            warn!(domain = %domain.id, error = %e, "spam check failed; accepting comment");
            false
        })
    } else {
        false
    };

    let (state, reason) = initial_state(&policy, &facts, &md, is_spam);
    let now = Utc::now();
    let mut comment = Comment {
        id: Uuid::new_v4(),
        parent_id: req.parent_id,
        page_id: page.id,
        html: markdown::render(&md, markdown_options(&st.dyn_config, domain.id).await),
        markdown: md,
        score: 0,
        is_pending: false,
        is_approved: false,
        is_spam: false,
        is_deleted: false,
        pending_reason: reason.to_string(),
        created_time: now,
        moderated_time: None,
        deleted_time: None,
        edited_time: None,
        user_created: Some(principal.user_id()),
        user_moderated: None,
        user_deleted: None,
        user_edited: None,
        author_name,
        author_ip: st.cfg.mask_ip(&client.ip),
    };
    comment.set_moderation_state(state);
    if state == CommentState::Approved && facts.is_moderator_plus {
        comment.moderated_time = Some(now);
        comment.user_moderated = Some(principal.user_id());
    }
    repo.insert_comment(&comment).await?;
    info!(comment = %comment.id, domain = %domain.id, page = %page.id, state = ?state, "comment submitted");

    st.notifier.comment_submitted(comment.clone(), page, domain);

    let commenter = principal.user().map(|u| commenter(u, principal.domain_user(), false));
    Ok(Submitted { comment: view(&comment, 0, 0, true), commenter, state })
}

pub struct ListQuery {
    pub host: String,
    pub path: String,
    pub sort: Option<String>,
}

pub async fn list(st: &AppState, principal: Principal, q: ListQuery) -> Result<PageComments, ApiError> {
    let repo = st.repo.as_ref();
    let domain = domain_by_host(repo, &q.host).await?;
    let principal = principal.for_domain(repo, domain.id).await?;
    let path = validate_path(&q.path)?;
    let page = repo.get_or_create_page(&DomainPage::new(domain.id, &path)).await?;
    if let Err(e) = repo.increment_view_counts(domain.id, page.id).await {
        warn!(page = %page.id, error = %e, "view count update failed");
    }

    let show_deleted = st.dyn_config.domain_get_bool(domain.id, dynconfig::SHOW_DELETED_COMMENTS).await;
    let privileged = principal.is_superuser() || principal.is_moderator_plus();
    let visible: Vec<Comment> = repo
        .list_page_comments(page.id)
        .await?
        .into_iter()
        .filter(|c| if c.is_deleted { show_deleted || privileged } else { authz::can_see_comment(&principal, c) })
        .collect();

    let directions: HashMap<Id, i16> = if principal.is_anonymous() {
        HashMap::new()
    } else {
        repo.list_page_votes(page.id, principal.user_id()).await?.into_iter().map(|v| (v.comment_id, v.direction)).collect()
    };

    let sort = q.sort.filter(|s| matches!(s.as_str(), "ta" | "td" | "sa" | "sd")).unwrap_or_else(|| domain.default_sort.clone());
    let threaded = thread(visible, &sort);

    let author_ids: Vec<Id> = threaded
        .iter()
        .filter_map(|(c, _)| c.user_created)
        .filter(|id| *id != ANONYMOUS_USER_ID)
        .collect::<HashSet<_>>()
        .into_iter()
        .collect();
    let users = repo.find_users_by_ids(&author_ids).await?;
    let members: HashMap<Id, DomainUser> = repo.list_domain_users(domain.id).await?.into_iter().map(|du| (du.user_id, du)).collect();
    let show_email = authz::can_see_emails(&principal);
    let commenters = users.iter().map(|u| commenter(u, members.get(&u.id), show_email)).collect();

    let comments = threaded
        .iter()
        .map(|(c, depth)| view(c, directions.get(&c.id).copied().unwrap_or(0), *depth, authz::can_see_deleted_body(&principal, c)))
        .collect();

    let opts = markdown_options(&st.dyn_config, domain.id).await;
    let page_info = PageInfo {
        domain_id: domain.id,
        domain_name: domain.name.clone(),
        page_id: page.id,
        path: page.path.clone(),
        title: page.title.clone(),
        is_domain_readonly: domain.is_readonly,
        is_page_readonly: page.is_readonly,
        auth_anonymous: domain.auth_anonymous,
        auth_local: domain.auth_local,
        auth_sso: domain.auth_sso,
        sso_url: domain.sso_url.clone(),
        sso_non_interactive: domain.sso_non_interactive,
        idps: repo.domain_idps(domain.id).await?.into_iter().filter(|i| st.idps.is_configured(i)).collect(),
        default_sort: domain.default_sort.clone(),
        count_comments: page.count_comments,
        show_deleted,
        markdown_links: opts.links,
        markdown_images: opts.images,
        markdown_tables: opts.tables,
        max_comment_length: st.dyn_config.domain_get_int(domain.id, dynconfig::COMMENT_MAX_LENGTH).await,
    };
    debug!(page = %page.id, count = threaded.len(), "comments listed");
    Ok(PageComments { comments, commenters, page_info })
}

/// A comment with its page and domain, and the principal scoped to that domain.
pub struct Loaded {
    pub comment: Comment,
    pub page: DomainPage,
    pub domain: Domain,
    pub principal: Principal,
}

pub async fn load(repo: &dyn Repo, principal: Principal, comment_id: Id) -> Result<Loaded, ApiError> {
    let comment = repo.find_comment(comment_id).await?;
    let page = repo.find_page(comment.page_id).await?;
    let domain = repo.find_domain_by_id(page.domain_id).await?;
    let principal = principal.for_domain(repo, domain.id).await?;
    Ok(Loaded { comment, page, domain, principal })
}

pub async fn moderate(st: &AppState, principal: Principal, comment_id: Id, approve: bool) -> Result<(), ApiError> {
    let Loaded { mut comment, page, domain, principal } = load(st.repo.as_ref(), principal, comment_id).await?;
    authz::check_moderate(&principal)?;
    let from = comment.state();
    let to = if approve { CommentState::Approved } else { CommentState::Rejected };
    match from {
        CommentState::Deleted => return Err(ApiError::invalid_input("comment is deleted")),
        s if s == to => return Ok(()),
        _ => {}
    }
    comment.set_moderation_state(to);
    comment.pending_reason.clear();
    comment.moderated_time = Some(Utc::now());
    comment.user_moderated = Some(principal.user_id());
    st.repo.update_comment(&comment).await?;
    info!(comment = %comment.id, from = ?from, to = ?to, by = %principal.user_id(), "comment moderated");
    if from == CommentState::Pending {
        st.notifier.comment_moderated(comment, page, domain);
    }
    Ok(())
}

pub async fn delete(st: &AppState, principal: Principal, comment_id: Id) -> Result<(), ApiError> {
    let Loaded { mut comment, principal, .. } = load(st.repo.as_ref(), principal, comment_id).await?;
    authz::check_delete_comment(&principal, &comment)?;
    if comment.is_deleted {
        return Ok(());
    }
    comment.is_deleted = true;
    comment.deleted_time = Some(Utc::now());
    comment.user_deleted = Some(principal.user_id());
    st.repo.update_comment(&comment).await?;
    info!(comment = %comment.id, by = %principal.user_id(), "comment deleted");
    Ok(())
}

pub async fn edit(st: &AppState, principal: Principal, comment_id: Id, markdown: &str) -> Result<CommentView, ApiError> {
    let Loaded { mut comment, domain, principal, .. } = load(st.repo.as_ref(), principal, comment_id).await?;
    authz::check_edit_comment(&principal, &domain, &comment)?;
    if comment.is_deleted {
        return Err(ApiError::invalid_input("comment is deleted"));
    }
    let md = validate_markdown(&st.dyn_config, domain.id, markdown).await?;
    comment.html = markdown::render(&md, markdown_options(&st.dyn_config, domain.id).await);
    comment.markdown = md;
    comment.edited_time = Some(Utc::now());
    comment.user_edited = Some(principal.user_id());
    st.repo.update_comment(&comment).await?;
    let direction = st.repo.find_vote(comment.id, principal.user_id()).await.optional()?.map(|v| v.direction).unwrap_or(0);
    Ok(view(&comment, direction, 0, true))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn c(id: u128, parent: Option<u128>, secs: i64, score: i32) -> Comment {
        Comment {
            id: Uuid::from_u128(id),
            parent_id: parent.map(Uuid::from_u128),
            page_id: Uuid::nil(),
            markdown: String::new(),
            html: String::new(),
            score,
            is_pending: false,
            is_approved: true,
            is_spam: false,
            is_deleted: false,
            pending_reason: String::new(),
            created_time: chrono::DateTime::from_timestamp(1_700_000_000 + secs, 0).unwrap_or_default(),
            moderated_time: None,
            deleted_time: None,
            edited_time: None,
            user_created: None,
            user_moderated: None,
            user_deleted: None,
            user_edited: None,
            author_name: String::new(),
            author_ip: String::new(),
        }
    }

    fn ids(t: &[(Comment, usize)]) -> Vec<(u128, usize)> {
        t.iter().map(|(c, d)| (c.id.as_u128(), *d)).collect()
    }

    #[test]
    fn thread_is_depth_first_with_sorted_siblings() {
        let all = vec![c(1, None, 0, 0), c(2, None, 10, 5), c(3, Some(1), 20, 0), c(4, Some(3), 30, 0), c(5, Some(1), 5, 0)];
        assert_eq!(ids(&thread(all.clone(), "ta")), vec![(1, 0), (5, 1), (3, 1), (4, 2), (2, 0)]);
        assert_eq!(ids(&thread(all.clone(), "td")), vec![(2, 0), (1, 0), (3, 1), (4, 2), (5, 1)]);
        assert_eq!(ids(&thread(all, "sd"))[0], (2, 0));
    }

    #[test]
    fn orphans_are_dropped() {
        let t = thread(vec![c(1, None, 0, 0), c(2, Some(99), 0, 0), c(3, Some(2), 0, 0)], "ta");
        assert_eq!(ids(&t), vec![(1, 0)]);
    }

    #[test]
    fn deep_threads_do_not_recurse() {
        let mut all = vec![c(0, None, 0, 0)];
        for i in 1..20_000u128 {
            all.push(c(i, Some(i - 1), i as i64, 0));
        }
        let t = thread(all, "ta");
        assert_eq!(t.len(), 20_000);
        assert_eq!(t.last().map(|(_, d)| *d), Some(19_999));
    }

    #[test]
    fn tombstones_hide_body() {
        let mut x = c(1, None, 0, 0);
        x.markdown = "secret".into();
        x.is_deleted = true;
        assert_eq!(view(&x, 0, 0, false).markdown, "");
        assert_eq!(view(&x, 0, 0, true).markdown, "secret");
    }

    #[test]
    fn initial_state_rules_in_order() {
        let p = ModerationPolicy { anonymous: true, spam_check: true, ..Default::default() };
        let anon = AuthorFacts { is_anonymous: true, ..Default::default() };
        let moder = AuthorFacts { is_moderator_plus: true, ..Default::default() };
        assert_eq!(initial_state(&p, &moder, "x", true).0, CommentState::Approved);
        assert_eq!(initial_state(&p, &anon, "x", true).0, CommentState::Spam);
        assert_eq!(initial_state(&p, &anon, "x", false).0, CommentState::Pending);
        let user = AuthorFacts { account_age_days: 1, ..Default::default() };
        assert_eq!(initial_state(&p, &user, "x", false).0, CommentState::Approved);

        let p = ModerationPolicy { min_num_comments: 2, ..Default::default() };
        assert_eq!(initial_state(&p, &user, "x", false), (CommentState::Pending, "too few approved comments"));
        let veteran = AuthorFacts { approved_comments: 2, ..user };
        assert_eq!(initial_state(&p, &veteran, "x", false).0, CommentState::Approved);

        let p = ModerationPolicy { min_user_age_days: 7, ..Default::default() };
        assert_eq!(initial_state(&p, &user, "x", false).1, "account too new");

        let p = ModerationPolicy { links: true, images: true, ..Default::default() };
        assert_eq!(initial_state(&p, &user, "see https://x.test", false).1, "contains links");
        assert_eq!(initial_state(&p, &user, "![i](a.png)", false).1, "contains images");
        assert_eq!(initial_state(&p, &user, "plain", false).0, CommentState::Approved);
        // Spam is ignored when the check is off
        assert_eq!(initial_state(&ModerationPolicy::default(), &user, "x", true).0, CommentState::Approved);
    }

    #[test]
    fn path_validation() {
        assert_eq!(validate_path(" /a/b ").unwrap(), "/a/b");
        assert!(validate_path("a").is_err());
        assert!(validate_path("/a b").is_err());
    }
}
