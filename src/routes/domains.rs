//! Domain management for owners, moderators and superusers.

use std::collections::{HashMap, HashSet};

use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::authz;
use crate::comments::markdown_options;
use crate::dynconfig::{self, DynConfigItem};
use crate::error::ApiError;
use crate::markdown;
use crate::models::{Comment, CommentState, Domain, DomainPage, DomainUser, Id, ModNotifyPolicy, ANONYMOUS_USER_ID};
use crate::principal::{AuthUser, Principal};
use crate::repo::{OptionalExt, RepoError};
use crate::routes::{no_content, parse_id, AppState};
use crate::sso;

const EXPORT_VERSION: u32 = 1;

async fn find_domain(st: &AppState, id: &str) -> Result<Domain, ApiError> {
    Ok(st.repo.find_domain_by_id(parse_id(id)?).await?)
}

async fn principal_on(st: &AppState, auth: &AuthUser, domain: &Domain) -> Result<Principal, ApiError> {
    auth.principal().for_domain(st.repo.as_ref(), domain.id).await
}

/// Loads the domain and insists the caller owns it (or is a superuser).
async fn managed(st: &AppState, auth: &AuthUser, id: &str) -> Result<Domain, ApiError> {
    let domain = find_domain(st, id).await?;
    authz::check_manage_domain(&principal_on(st, auth, &domain).await?)?;
    Ok(domain)
}

async fn moderated(st: &AppState, auth: &AuthUser, id: &str) -> Result<Domain, ApiError> {
    let domain = find_domain(st, id).await?;
    authz::check_moderate(&principal_on(st, auth, &domain).await?)?;
    Ok(domain)
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainItem {
    pub domain: Domain,
    pub idps: Vec<String>,
    pub is_owner: bool,
    pub is_moderator: bool,
    pub is_commenter: bool,
}

#[utoipa::path(
    get,
    path = "/api/domains",
    responses((status = 200, description = "Domains the caller has a role on; all of them for superusers", body = [DomainItem]))
)]
pub async fn list(auth: AuthUser, st: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let repo = st.repo.as_ref();
    let mine: HashMap<Id, DomainUser> = repo.list_user_domains(auth.user.id).await?.into_iter().map(|(d, du)| (d.id, du)).collect();
    let domains = if auth.user.is_superuser {
        repo.list_domains().await?
    } else {
        let mut v = Vec::with_capacity(mine.len());
        for id in mine.keys() {
            v.push(repo.find_domain_by_id(*id).await?);
        }
        v.sort_by(|a, b| a.host.cmp(&b.host));
        v
    };
    let mut items = Vec::with_capacity(domains.len());
    for d in domains {
        let du = mine.get(&d.id);
        items.push(DomainItem {
            idps: repo.domain_idps(d.id).await?,
            is_owner: du.map(|x| x.is_owner).unwrap_or(false),
            is_moderator: du.map(|x| x.is_moderator).unwrap_or(false),
            is_commenter: du.map(|x| x.is_commenter).unwrap_or(false),
            domain: d,
        });
    }
    Ok(HttpResponse::Ok().json(items))
}

/// Editable domain properties. Omitted fields keep their value.
#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct DomainPayload {
    pub host: Option<String>,
    pub name: Option<String>,
    pub is_https: Option<bool>,
    pub auth_anonymous: Option<bool>,
    pub auth_local: Option<bool>,
    pub auth_sso: Option<bool>,
    pub sso_url: Option<String>,
    pub sso_non_interactive: Option<bool>,
    pub mod_anonymous: Option<bool>,
    pub mod_authenticated: Option<bool>,
    pub mod_num_comments: Option<i32>,
    pub mod_user_age_days: Option<i32>,
    pub mod_links: Option<bool>,
    pub mod_images: Option<bool>,
    pub mod_notify_policy: Option<ModNotifyPolicy>,
    pub default_sort: Option<String>,
    pub idps: Option<Vec<String>>,
}

impl DomainPayload {
    fn apply(&self, d: &mut Domain) {
        if let Some(v) = self.name.as_deref() {
            d.name = v.trim().to_string();
        }
        macro_rules! set {
            ($($f:ident),*) => { $(if let Some(v) = self.$f { d.$f = v; })* };
        }
        set!(is_https, auth_anonymous, auth_local, auth_sso, sso_non_interactive, mod_anonymous, mod_authenticated);
        if let Some(v) = self.sso_url.as_deref() {
            d.sso_url = v.trim().to_string();
        }
        if self.mod_num_comments.is_some() {
            d.mod_num_comments = self.mod_num_comments;
        }
        if self.mod_user_age_days.is_some() {
            d.mod_user_age_days = self.mod_user_age_days;
        }
        if self.mod_links.is_some() {
            d.mod_links = self.mod_links;
        }
        if self.mod_images.is_some() {
            d.mod_images = self.mod_images;
        }
        if let Some(p) = self.mod_notify_policy {
            d.mod_notify_policy = p;
        }
        if let Some(s) = self.default_sort.as_deref() {
            d.default_sort = s.to_string();
        }
    }
}

fn normalize_host(host: &str) -> String {
    host.trim().to_lowercase()
}

fn check_idps(st: &AppState, idps: &[String]) -> Result<(), ApiError> {
    for id in idps {
        st.idps.get(id)?;
    }
    Ok(())
}

fn validate_domain(d: &Domain, num_idps: usize) -> Result<(), ApiError> {
    if d.name.is_empty() || d.name.chars().count() > 255 {
        return Err(ApiError::invalid_prop("name must be 1 to 255 characters"));
    }
    if d.mod_num_comments.is_some_and(|n| n < 0) || d.mod_user_age_days.is_some_and(|n| n < 0) {
        return Err(ApiError::invalid_prop("moderation thresholds cannot be negative"));
    }
    d.validate(num_idps).map_err(ApiError::invalid_prop)
}

#[utoipa::path(
    post,
    path = "/api/domains",
    request_body = DomainPayload,
    responses(
        (status = 200, description = "Domain created with the caller as owner", body = Domain),
        (status = 403, description = "new-owners-forbidden"),
        (status = 409, description = "host-already-exists")
    )
)]
pub async fn create(auth: AuthUser, st: web::Data<AppState>, body: web::Json<DomainPayload>) -> Result<HttpResponse, ApiError> {
    let repo = st.repo.as_ref();
    let user = &auth.user;
    if !user.is_superuser && !st.cfg.allow_new_owners && !st.dyn_config.get_bool(dynconfig::NEW_OWNER_ENABLED).await {
        let owns_any = repo.list_user_domains(user.id).await?.iter().any(|(_, du)| du.is_owner);
        if !owns_any {
            return Err(ApiError::NewOwnersForbidden);
        }
    }
    let host = normalize_host(body.host.as_deref().unwrap_or_default());
    let mut d = Domain::new(&host, body.name.as_deref().unwrap_or(&host));
    body.apply(&mut d);
    let idps = body.idps.clone().unwrap_or_default();
    check_idps(&st, &idps)?;
    validate_domain(&d, idps.len())?;
    match repo.create_domain(&d, &DomainUser::owner(d.id, user.id), &idps).await {
        Ok(()) => {}
        Err(RepoError::Conflict) => return Err(ApiError::HostAlreadyExists),
        Err(e) => return Err(e.into()),
    }
    info!(domain = %d.id, host = %d.host, owner = %user.id, "domain created");
    Ok(HttpResponse::Ok().json(d))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainDetail {
    pub domain: Domain,
    pub idps: Vec<String>,
}

pub async fn get(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let domain = moderated(&st, &auth, &path).await?;
    let idps = st.repo.domain_idps(domain.id).await?;
    Ok(HttpResponse::Ok().json(DomainDetail { domain, idps }))
}

pub async fn update(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>, body: web::Json<DomainPayload>) -> Result<HttpResponse, ApiError> {
    let mut domain = managed(&st, &auth, &path).await?;
    if let Some(h) = body.host.as_deref() {
        if normalize_host(h) != domain.host {
            return Err(ApiError::ImmutableProperty);
        }
    }
    body.apply(&mut domain);
    let repo = st.repo.as_ref();
    let idps = match body.idps.clone() {
        Some(v) => {
            check_idps(&st, &v)?;
            v
        }
        None => repo.domain_idps(domain.id).await?,
    };
    validate_domain(&domain, idps.len())?;
    repo.update_domain(&domain).await?;
    repo.set_domain_idps(domain.id, &idps).await?;
    info!(domain = %domain.id, user = %auth.user.id, "domain updated");
    Ok(HttpResponse::Ok().json(DomainDetail { domain, idps }))
}

pub async fn delete(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let domain = managed(&st, &auth, &path).await?;
    st.repo.delete_domain(domain.id).await?;
    st.dyn_config.evict_domain(domain.id);
    info!(domain = %domain.id, host = %domain.host, user = %auth.user.id, "domain deleted");
    Ok(no_content())
}

pub async fn clear(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let domain = managed(&st, &auth, &path).await?;
    st.repo.clear_domain(domain.id).await?;
    info!(domain = %domain.id, user = %auth.user.id, "domain cleared");
    Ok(no_content())
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct ReadonlyRequest {
    pub readonly: bool,
}

pub async fn set_readonly(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>, body: web::Json<ReadonlyRequest>) -> Result<HttpResponse, ApiError> {
    let mut domain = managed(&st, &auth, &path).await?;
    domain.is_readonly = body.readonly;
    st.repo.update_domain(&domain).await?;
    info!(domain = %domain.id, readonly = domain.is_readonly, "domain readonly flag changed");
    Ok(no_content())
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SsoSecretResponse {
    pub sso_secret: String,
}

/// Rotates the SSO secret. The only time the secret is ever returned.
pub async fn new_sso_secret(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let mut domain = managed(&st, &auth, &path).await?;
    let secret = sso::generate_secret();
    domain.sso_secret = Some(secret.clone());
    st.repo.update_domain(&domain).await?;
    info!(domain = %domain.id, "SSO secret rotated");
    Ok(HttpResponse::Ok().json(SsoSecretResponse { sso_secret: secret }))
}

#[derive(Debug, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainStatistics {
    pub count_comments: i64,
    pub count_views: i64,
    pub count_pages: usize,
    pub count_users: usize,
    pub pending: usize,
    pub approved: usize,
    pub rejected: usize,
    pub spam: usize,
    pub deleted: usize,
}

pub async fn statistics(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let domain = moderated(&st, &auth, &path).await?;
    let repo = st.repo.as_ref();
    let mut s = DomainStatistics {
        count_comments: domain.count_comments,
        count_views: domain.count_views,
        count_pages: repo.list_pages(domain.id).await?.len(),
        count_users: repo.list_domain_users(domain.id).await?.len(),
        ..Default::default()
    };
    for c in repo.list_domain_comments(domain.id).await? {
        match c.state() {
            CommentState::Pending => s.pending += 1,
            CommentState::Approved => s.approved += 1,
            CommentState::Rejected => s.rejected += 1,
            CommentState::Spam => s.spam += 1,
            CommentState::Deleted => s.deleted += 1,
        }
    }
    Ok(HttpResponse::Ok().json(s))
}

pub async fn list_pages(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let domain = moderated(&st, &auth, &path).await?;
    let mut pages = st.repo.list_pages(domain.id).await?;
    pages.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(HttpResponse::Ok().json(pages))
}

#[derive(Debug, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct PageUpdate {
    pub is_readonly: Option<bool>,
    pub title: Option<String>,
}

pub async fn update_page(
    auth: AuthUser,
    st: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<PageUpdate>,
) -> Result<HttpResponse, ApiError> {
    let (domain_id, page_id) = path.into_inner();
    let domain = moderated(&st, &auth, &domain_id).await?;
    let mut page = st.repo.find_page(parse_id(&page_id)?).await?;
    if page.domain_id != domain.id {
        return Err(ApiError::NotFound);
    }
    if let Some(ro) = body.is_readonly {
        page.is_readonly = ro;
    }
    if let Some(t) = body.title.as_deref() {
        page.title = t.trim().to_string();
    }
    st.repo.update_page(&page).await?;
    Ok(HttpResponse::Ok().json(page))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct DomainMember {
    pub user_id: Id,
    pub email: String,
    pub name: String,
    pub is_owner: bool,
    pub is_moderator: bool,
    pub is_commenter: bool,
    pub notify_replies: bool,
    pub notify_moderator: bool,
    pub notify_comment_status: bool,
    pub created_time: DateTime<Utc>,
}

pub async fn list_users(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let domain = managed(&st, &auth, &path).await?;
    let repo = st.repo.as_ref();
    let dus = repo.list_domain_users(domain.id).await?;
    let ids: Vec<Id> = dus.iter().map(|du| du.user_id).collect();
    let users: HashMap<Id, _> = repo.find_users_by_ids(&ids).await?.into_iter().map(|u| (u.id, u)).collect();
    let members: Vec<DomainMember> = dus
        .into_iter()
        .filter_map(|du| {
            let u = users.get(&du.user_id)?;
            Some(DomainMember {
                user_id: du.user_id,
                email: u.email.clone(),
                name: u.name.clone(),
                is_owner: du.is_owner,
                is_moderator: du.is_moderator,
                is_commenter: du.is_commenter,
                notify_replies: du.notify_replies,
                notify_moderator: du.notify_moderator,
                notify_comment_status: du.notify_comment_status,
                created_time: du.created_time,
            })
        })
        .collect();
    Ok(HttpResponse::Ok().json(members))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct MemberUpdate {
    pub is_owner: Option<bool>,
    pub is_moderator: Option<bool>,
    pub is_commenter: Option<bool>,
    pub notify_replies: Option<bool>,
    pub notify_moderator: Option<bool>,
    pub notify_comment_status: Option<bool>,
}

async fn guard_last_owner(st: &AppState, du: &DomainUser) -> Result<(), ApiError> {
    if du.is_owner && st.repo.count_domain_owners(du.domain_id).await? <= 1 {
        return Err(ApiError::DeletingLastOwner);
    }
    Ok(())
}

pub async fn update_user(
    auth: AuthUser,
    st: web::Data<AppState>,
    path: web::Path<(String, String)>,
    body: web::Json<MemberUpdate>,
) -> Result<HttpResponse, ApiError> {
    let (domain_id, user_id) = path.into_inner();
    let domain = managed(&st, &auth, &domain_id).await?;
    let repo = st.repo.as_ref();
    let mut du = repo.find_domain_user(domain.id, parse_id(&user_id)?).await?;
    let was_owner = du.is_owner;
    // Demotion is explicit: clearing a flag also clears the ones above it
    if let Some(v) = body.is_commenter {
        du.is_commenter = v;
        if !v {
            du.is_moderator = false;
            du.is_owner = false;
        }
    }
    if let Some(v) = body.is_moderator {
        du.is_moderator = v;
        if !v {
            du.is_owner = false;
        }
    }
    if let Some(v) = body.is_owner {
        du.is_owner = v;
    }
    du.notify_replies = body.notify_replies.unwrap_or(du.notify_replies);
    du.notify_moderator = body.notify_moderator.unwrap_or(du.notify_moderator);
    du.notify_comment_status = body.notify_comment_status.unwrap_or(du.notify_comment_status);
    du.normalize();
    if was_owner && !du.is_owner {
        guard_last_owner(&st, &DomainUser { is_owner: true, ..du.clone() }).await?;
    }
    repo.upsert_domain_user(&du).await?;
    info!(domain = %domain.id, user = %du.user_id, owner = du.is_owner, moderator = du.is_moderator, "domain user updated");
    Ok(HttpResponse::Ok().json(du))
}

pub async fn remove_user(auth: AuthUser, st: web::Data<AppState>, path: web::Path<(String, String)>) -> Result<HttpResponse, ApiError> {
    let (domain_id, user_id) = path.into_inner();
    let domain = managed(&st, &auth, &domain_id).await?;
    let du = st.repo.find_domain_user(domain.id, parse_id(&user_id)?).await?;
    guard_last_owner(&st, &du).await?;
    st.repo.delete_domain_user(domain.id, du.user_id).await?;
    info!(domain = %domain.id, user = %du.user_id, "domain user removed");
    Ok(no_content())
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct AddModeratorRequest {
    pub email: String,
}

pub async fn add_moderator(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>, body: web::Json<AddModeratorRequest>) -> Result<HttpResponse, ApiError> {
    let domain = managed(&st, &auth, &path).await?;
    let repo = st.repo.as_ref();
    let user = repo.find_user_by_email(&body.email.trim().to_lowercase()).await?;
    if user.system_account {
        return Err(ApiError::ImmutableAccount);
    }
    let mut du = repo.find_domain_user(domain.id, user.id).await.optional()?.unwrap_or_else(|| DomainUser::commenter(domain.id, user.id));
    du.is_moderator = true;
    du.normalize();
    repo.upsert_domain_user(&du).await?;
    info!(domain = %domain.id, user = %user.id, "moderator added");
    Ok(no_content())
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct PurgeRequest {
    pub deleted: bool,
    pub user_deleted: bool,
}

#[derive(Debug, Serialize, ToSchema)]
pub struct CountResponse {
    pub count: u64,
}

pub async fn purge(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>, body: web::Json<PurgeRequest>) -> Result<HttpResponse, ApiError> {
    let domain = managed(&st, &auth, &path).await?;
    let count = st.repo.purge_comments(domain.id, body.deleted, body.user_deleted).await?;
    info!(domain = %domain.id, count, "comments purged");
    Ok(HttpResponse::Ok().json(CountResponse { count }))
}

// ---------------- Export / import ----------------

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportDoc {
    pub version: u32,
    pub host: String,
    pub name: String,
    pub pages: Vec<ExportPage>,
    pub comments: Vec<ExportComment>,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportPage {
    pub id: Id,
    pub path: String,
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub is_readonly: bool,
}

#[derive(Debug, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ExportComment {
    pub id: Id,
    #[serde(default)]
    pub parent_id: Option<Id>,
    pub page_id: Id,
    pub markdown: String,
    #[serde(default)]
    pub author_email: Option<String>,
    #[serde(default)]
    pub author_name: String,
    #[serde(default)]
    pub is_pending: bool,
    #[serde(default)]
    pub is_approved: bool,
    #[serde(default)]
    pub is_spam: bool,
    #[serde(default)]
    pub is_deleted: bool,
    pub created_time: DateTime<Utc>,
}

#[utoipa::path(
    get,
    path = "/api/domains/{id}/export",
    params(("id" = String, Path, description = "Domain id")),
    responses((status = 200, description = "Pages and comments of the domain", body = ExportDoc))
)]
pub async fn export(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let domain = managed(&st, &auth, &path).await?;
    let repo = st.repo.as_ref();
    let pages = repo.list_pages(domain.id).await?;
    let comments = repo.list_domain_comments(domain.id).await?;
    let author_ids: Vec<Id> = comments.iter().filter_map(|c| c.user_created).collect::<HashSet<_>>().into_iter().collect();
    let emails: HashMap<Id, String> = repo
        .find_users_by_ids(&author_ids)
        .await?
        .into_iter()
        .filter(|u| !u.system_account)
        .map(|u| (u.id, u.email))
        .collect();
    let doc = ExportDoc {
        version: EXPORT_VERSION,
        host: domain.host.clone(),
        name: domain.name.clone(),
        pages: pages.into_iter().map(|p| ExportPage { id: p.id, path: p.path, title: p.title, is_readonly: p.is_readonly }).collect(),
        comments: comments
            .into_iter()
            .map(|c| ExportComment {
                id: c.id,
                parent_id: c.parent_id,
                page_id: c.page_id,
                author_email: c.user_created.and_then(|id| emails.get(&id).cloned()),
                author_name: c.author_name,
                markdown: c.markdown,
                is_pending: c.is_pending,
                is_approved: c.is_approved,
                is_spam: c.is_spam,
                is_deleted: c.is_deleted,
                created_time: c.created_time,
            })
            .collect(),
    };
    info!(domain = %domain.id, pages = doc.pages.len(), comments = doc.comments.len(), "domain exported");
    Ok(HttpResponse::Ok().json(doc))
}

#[derive(Debug, Default, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct ImportResult {
    pub pages_added: usize,
    pub comments_imported: usize,
    pub comments_skipped: usize,
}

/// Nearest live ancestor of `id`, skipping deleted and unknown comments.
fn live_parent(id: Option<Id>, by_id: &HashMap<Id, &ExportComment>) -> Option<Id> {
    let mut cur = id;
    let mut hops = 0;
    while let Some(pid) = cur {
        match by_id.get(&pid) {
            Some(c) if !c.is_deleted => return Some(pid),
            Some(c) if hops < by_id.len() => {
                cur = c.parent_id;
                hops += 1;
            }
            _ => return None,
        }
    }
    None
}

/// Orders comments so each parent precedes its children.
fn parents_first(doc: &ExportDoc) -> Vec<(&ExportComment, Option<Id>)> {
    let by_id: HashMap<Id, &ExportComment> = doc.comments.iter().map(|c| (c.id, c)).collect();
    let live: Vec<(&ExportComment, Option<Id>)> = doc.comments.iter().filter(|c| !c.is_deleted).map(|c| (c, live_parent(c.parent_id, &by_id))).collect();
    let mut children: HashMap<Option<Id>, Vec<usize>> = HashMap::new();
    for (i, (_, parent)) in live.iter().enumerate() {
        children.entry(*parent).or_default().push(i);
    }
    let mut out = Vec::with_capacity(live.len());
    let mut stack: Vec<usize> = children.get(&None).cloned().unwrap_or_default();
    while let Some(i) = stack.pop() {
        out.push(live[i]);
        if let Some(kids) = children.get(&Some(live[i].0.id)) {
            stack.extend(kids);
        }
    }
    out
}

#[utoipa::path(
    post,
    path = "/api/domains/{id}/import",
    params(("id" = String, Path, description = "Domain id")),
    request_body = ExportDoc,
    responses((status = 200, description = "Import counts", body = ImportResult))
)]
pub async fn import(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>, body: web::Json<ExportDoc>) -> Result<HttpResponse, ApiError> {
    let domain = managed(&st, &auth, &path).await?;
    let doc = body.into_inner();
    if doc.version != EXPORT_VERSION {
        return Err(ApiError::invalid_input(format!("unsupported export version {}", doc.version)));
    }
    let repo = st.repo.as_ref();
    let mut result = ImportResult::default();

    let existing: HashSet<String> = repo.list_pages(domain.id).await?.into_iter().map(|p| p.path).collect();
    let mut page_ids: HashMap<Id, Id> = HashMap::new();
    for p in &doc.pages {
        let mut page = DomainPage::new(domain.id, &crate::comments::validate_path(&p.path)?);
        page.title = p.title.clone();
        page.is_readonly = p.is_readonly;
        let stored = repo.get_or_create_page(&page).await?;
        if !existing.contains(&stored.path) {
            result.pages_added += 1;
        }
        page_ids.insert(p.id, stored.id);
    }

    let opts = markdown_options(&st.dyn_config, domain.id).await;
    let mut authors: HashMap<String, Id> = HashMap::new();
    let mut new_ids: HashMap<Id, Id> = HashMap::new();
    let ordered = parents_first(&doc);
    result.comments_skipped = doc.comments.len() - ordered.len();
    for (c, parent) in ordered {
        let Some(page_id) = page_ids.get(&c.page_id).copied() else {
            result.comments_skipped += 1;
            continue;
        };
        let author = match c.author_email.as_deref().map(|e| e.trim().to_lowercase()).filter(|e| !e.is_empty()) {
            Some(email) => match authors.get(&email) {
                Some(id) => *id,
                None => {
                    let id = repo.find_user_by_email(&email).await.optional()?.map(|u| u.id).unwrap_or(ANONYMOUS_USER_ID);
                    authors.insert(email, id);
                    id
                }
            },
            None => ANONYMOUS_USER_ID,
        };
        let id = Uuid::new_v4();
        let mut comment = Comment {
            id,
            parent_id: parent.and_then(|p| new_ids.get(&p).copied()),
            page_id,
            html: markdown::render(&c.markdown, opts),
            markdown: c.markdown.clone(),
            score: 0,
            is_pending: false,
            is_approved: false,
            is_spam: false,
            is_deleted: false,
            pending_reason: String::new(),
            created_time: c.created_time,
            moderated_time: None,
            deleted_time: None,
            edited_time: None,
            user_created: Some(author),
            user_moderated: None,
            user_deleted: None,
            user_edited: None,
            author_name: c.author_name.clone(),
            author_ip: String::new(),
        };
        let state = if c.is_spam {
            CommentState::Spam
        } else if c.is_pending {
            CommentState::Pending
        } else if c.is_approved {
            CommentState::Approved
        } else {
            CommentState::Rejected
        };
        comment.set_moderation_state(state);
        repo.insert_comment(&comment).await?;
        new_ids.insert(c.id, id);
        result.comments_imported += 1;
    }
    info!(
        domain = %domain.id,
        pages = result.pages_added,
        imported = result.comments_imported,
        skipped = result.comments_skipped,
        "domain imported"
    );
    Ok(HttpResponse::Ok().json(result))
}

// ---------------- Per-domain config ----------------

pub async fn get_config(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let domain = managed(&st, &auth, &path).await?;
    let items: Vec<DynConfigItem> = st.dyn_config.domain_get_all(domain.id).await?;
    Ok(HttpResponse::Ok().json(items))
}

pub async fn update_config(
    auth: AuthUser,
    st: web::Data<AppState>,
    path: web::Path<String>,
    body: web::Json<HashMap<String, String>>,
) -> Result<HttpResponse, ApiError> {
    let domain = managed(&st, &auth, &path).await?;
    st.dyn_config.domain_update(domain.id, Some(auth.user.id), &body).await?;
    info!(domain = %domain.id, keys = body.len(), "domain config updated");
    Ok(no_content())
}

pub async fn reset_config(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let domain = managed(&st, &auth, &path).await?;
    st.dyn_config.domain_reset(domain.id).await?;
    info!(domain = %domain.id, "domain config reset");
    Ok(no_content())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ec(id: Id, parent: Option<Id>, deleted: bool) -> ExportComment {
        ExportComment {
            id,
            parent_id: parent,
            page_id: Uuid::nil(),
            markdown: "x".into(),
            author_email: None,
            author_name: String::new(),
            is_pending: false,
            is_approved: true,
            is_spam: false,
            is_deleted: deleted,
            created_time: Utc::now(),
        }
    }

    #[test]
    fn deleted_comments_are_skipped_and_children_reparented() {
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        let doc = ExportDoc {
            version: EXPORT_VERSION,
            host: "x.test".into(),
            name: "X".into(),
            pages: vec![],
            comments: vec![ec(c, Some(b), false), ec(b, Some(a), true), ec(a, None, false)],
        };
        let order: Vec<(Id, Option<Id>)> = parents_first(&doc).into_iter().map(|(c, p)| (c.id, p)).collect();
        assert_eq!(order, vec![(a, None), (c, Some(a))]);
    }

    #[test]
    fn orphans_become_roots() {
        let (a, missing) = (Uuid::new_v4(), Uuid::new_v4());
        let doc = ExportDoc { version: 1, host: String::new(), name: String::new(), pages: vec![], comments: vec![ec(a, Some(missing), false)] };
        assert_eq!(parents_first(&doc)[0].1, None);
    }
}
