//! Instance user administration (superusers only) and avatar endpoints.

use actix_web::http::header;
use actix_web::{web, HttpResponse};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use utoipa::ToSchema;

use crate::error::ApiError;
use crate::models::{Id, User, UserAuthKind};
use crate::password::{self, validate_password};
use crate::principal::AuthUser;
use crate::routes::auth::{validate_email, validate_name, validate_website};
use crate::routes::{no_content, parse_id, AppState};
use crate::storage::{self, AvatarStoreError};
use crate::usersession;

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserView {
    pub id: Id,
    pub email: String,
    pub name: String,
    pub website_url: String,
    pub lang_id: String,
    pub is_superuser: bool,
    pub is_confirmed: bool,
    pub is_banned: bool,
    pub is_locked: bool,
    pub is_local: bool,
    pub is_sso: bool,
    pub federated_idp_id: Option<String>,
    pub has_avatar: bool,
    pub signup_host: String,
    pub created_time: DateTime<Utc>,
    pub last_login: Option<DateTime<Utc>>,
    pub failed_login_attempts: i32,
}

impl From<&User> for UserView {
    fn from(u: &User) -> Self {
        let kind = u.auth_kind();
        UserView {
            id: u.id,
            email: u.email.clone(),
            name: u.name.clone(),
            website_url: u.website_url.clone(),
            lang_id: u.lang_id.clone(),
            is_superuser: u.is_superuser,
            is_confirmed: u.confirmed,
            is_banned: u.banned,
            is_locked: u.locked,
            is_local: kind == UserAuthKind::Local,
            is_sso: kind == UserAuthKind::Sso,
            federated_idp_id: match kind {
                UserAuthKind::Federated(idp) => Some(idp),
                _ => None,
            },
            has_avatar: u.has_avatar,
            signup_host: u.signup_host.clone(),
            created_time: u.created_time,
            last_login: u.last_login,
            failed_login_attempts: u.failed_login_attempts,
        }
    }
}

/// Loads a user other than the caller that may be administered at all.
async fn target(st: &AppState, auth: &AuthUser, id: &str) -> Result<User, ApiError> {
    auth.require_superuser()?;
    let user = st.repo.find_user_by_id(parse_id(id)?).await?;
    if user.system_account {
        return Err(ApiError::ImmutableAccount);
    }
    Ok(user)
}

fn not_self(auth: &AuthUser, user: &User) -> Result<(), ApiError> {
    if auth.user.id == user.id {
        Err(ApiError::SelfOperation)
    } else {
        Ok(())
    }
}

async fn guard_last_superuser(st: &AppState, user: &User) -> Result<(), ApiError> {
    if user.is_superuser && st.repo.count_superusers().await? <= 1 {
        return Err(ApiError::DeletingLastSuperuser);
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    #[serde(default)]
    pub filter: String,
}

#[utoipa::path(
    get,
    path = "/api/users",
    params(("filter" = Option<String>, Query, description = "Substring of email or name")),
    responses(
        (status = 200, description = "Users of the instance", body = [UserView]),
        (status = 403, description = "no-superuser")
    )
)]
pub async fn list(auth: AuthUser, st: web::Data<AppState>, q: web::Query<ListQuery>) -> Result<HttpResponse, ApiError> {
    auth.require_superuser()?;
    let users = st.repo.list_users(q.filter.trim()).await?;
    Ok(HttpResponse::Ok().json(users.iter().map(UserView::from).collect::<Vec<_>>()))
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserDomain {
    pub domain_id: Id,
    pub host: String,
    pub is_owner: bool,
    pub is_moderator: bool,
    pub is_commenter: bool,
}

#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct UserDetail {
    pub user: UserView,
    pub domains: Vec<UserDomain>,
}

pub async fn get(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let user = target(&st, &auth, &path).await?;
    let domains = st
        .repo
        .list_user_domains(user.id)
        .await?
        .into_iter()
        .map(|(d, du)| UserDomain { domain_id: d.id, host: d.host, is_owner: du.is_owner, is_moderator: du.is_moderator, is_commenter: du.is_commenter })
        .collect();
    Ok(HttpResponse::Ok().json(UserDetail { user: UserView::from(&user), domains }))
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct UserUpdate {
    pub name: Option<String>,
    pub email: Option<String>,
    pub website_url: Option<String>,
    pub lang_id: Option<String>,
    pub password: Option<String>,
    pub is_superuser: Option<bool>,
    pub is_confirmed: Option<bool>,
}

pub async fn update(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>, body: web::Json<UserUpdate>) -> Result<HttpResponse, ApiError> {
    let mut user = target(&st, &auth, &path).await?;
    let repo = st.repo.as_ref();
    let local = user.auth_kind() == UserAuthKind::Local;

    if let Some(su) = body.is_superuser.filter(|v| *v != user.is_superuser) {
        if !su {
            not_self(&auth, &user)?;
            guard_last_superuser(&st, &user).await?;
        }
        user.is_superuser = su;
    }
    if let Some(email) = body.email.as_deref() {
        let email = validate_email(email)?;
        if email != user.email {
            if !local {
                return Err(ApiError::ImmutableProperty);
            }
            if repo.find_user_by_email(&email).await.is_ok() {
                return Err(ApiError::EmailAlreadyExists);
            }
            user.email = email;
        }
    }
    if let Some(name) = body.name.as_deref() {
        user.name = validate_name(name)?;
    }
    if let Some(url) = body.website_url.as_deref() {
        user.website_url = validate_website(Some(url))?;
    }
    if let Some(lang) = body.lang_id.as_deref() {
        if !st.cfg.ui_languages.iter().any(|l| l == lang) {
            return Err(ApiError::invalid_prop("unsupported language"));
        }
        user.lang_id = lang.to_string();
    }
    if let Some(pwd) = body.password.as_deref().filter(|p| !p.is_empty()) {
        if !local {
            return Err(ApiError::NoLocalUser);
        }
        validate_password(pwd)?;
        user.password_hash = st.hasher.hash_async(pwd.to_string()).await?;
    }
    if body.is_confirmed == Some(true) {
        user.confirm();
    }
    repo.update_user(&user).await?;
    info!(user = %user.id, by = %auth.user.id, "user updated");
    Ok(HttpResponse::Ok().json(UserView::from(&user)))
}

#[derive(Debug, Deserialize, ToSchema)]
pub struct BanRequest {
    pub ban: bool,
}

/// Banning also ends every session of the user.
pub async fn ban(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>, body: web::Json<BanRequest>) -> Result<HttpResponse, ApiError> {
    let mut user = target(&st, &auth, &path).await?;
    not_self(&auth, &user)?;
    if user.banned != body.ban {
        user.banned = body.ban;
        user.banned_time = body.ban.then(Utc::now);
        st.repo.update_user(&user).await?;
    }
    if body.ban {
        usersession::expire_all_for(st.repo.as_ref(), user.id).await?;
    }
    info!(user = %user.id, banned = user.banned, by = %auth.user.id, "user ban changed");
    Ok(no_content())
}

#[derive(Debug, Default, Deserialize, ToSchema)]
#[serde(rename_all = "camelCase", default)]
pub struct DeleteUserRequest {
    pub delete_comments: bool,
    pub purge_comments: bool,
}

pub async fn delete(
    auth: AuthUser,
    st: web::Data<AppState>,
    path: web::Path<String>,
    body: Option<web::Json<DeleteUserRequest>>,
) -> Result<HttpResponse, ApiError> {
    let user = target(&st, &auth, &path).await?;
    not_self(&auth, &user)?;
    guard_last_superuser(&st, &user).await?;
    let repo = st.repo.as_ref();
    let memberships = repo.list_user_domains(user.id).await?;
    for (d, du) in &memberships {
        if du.is_owner && repo.count_domain_owners(d.id).await? <= 1 {
            return Err(ApiError::DeletingLastOwner);
        }
    }
    let opts = body.map(web::Json::into_inner).unwrap_or_default();

    if opts.delete_comments {
        let n = repo.delete_user_comments(user.id, auth.user.id, Utc::now()).await?;
        info!(user = %user.id, comments = n, "user comments deleted");
    }
    repo.delete_user(user.id).await?;
    if opts.purge_comments {
        for (d, _) in &memberships {
            repo.purge_comments(d.id, false, true).await?;
        }
    }
    if let Err(e) = st.avatars.delete(user.id).await {
        warn!(user = %user.id, error = %e, "avatar removal failed");
    }
    info!(user = %user.id, by = %auth.user.id, "user deleted");
    Ok(no_content())
}

pub async fn unlock(auth: AuthUser, st: web::Data<AppState>, path: web::Path<String>) -> Result<HttpResponse, ApiError> {
    let mut user = target(&st, &auth, &path).await?;
    password::unlock(&mut user);
    st.repo.update_user(&user).await?;
    info!(user = %user.id, by = %auth.user.id, "user unlocked");
    Ok(no_content())
}

// ---------------- Avatars ----------------

#[utoipa::path(
    put,
    path = "/api/user/avatar",
    request_body(content = String, content_type = "application/octet-stream", description = "Raw PNG, JPEG, GIF or WebP image"),
    responses(
        (status = 204, description = "Avatar stored"),
        (status = 400, description = "Not a supported image or too large")
    )
)]
pub async fn upload_avatar(auth: AuthUser, st: web::Data<AppState>, body: web::Bytes) -> Result<HttpResponse, ApiError> {
    storage::validate_image(&body)?;
    st.avatars.save(auth.user.id, &body).await?;
    let mut user = auth.user;
    if !user.has_avatar {
        user.has_avatar = true;
        st.repo.update_user(&user).await?;
    }
    info!(user = %user.id, bytes = body.len(), "avatar uploaded");
    Ok(no_content())
}

pub async fn delete_avatar(auth: AuthUser, st: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    st.avatars.delete(auth.user.id).await?;
    let mut user = auth.user;
    if user.has_avatar {
        user.has_avatar = false;
        st.repo.update_user(&user).await?;
    }
    Ok(no_content())
}

#[derive(Debug, Deserialize)]
pub struct AvatarQuery {
    #[serde(default)]
    pub size: Option<String>,
}

/// One stored size serves every `size` value.
pub async fn get_avatar(st: web::Data<AppState>, path: web::Path<String>, q: web::Query<AvatarQuery>) -> Result<HttpResponse, ApiError> {
    if q.size.as_deref().is_some_and(|s| !matches!(s, "S" | "M" | "L")) {
        return Err(ApiError::invalid_input("size must be S, M or L"));
    }
    let id = parse_id(&path)?;
    match st.avatars.load(id).await {
        Ok((bytes, mime)) => Ok(HttpResponse::Ok()
            .content_type(mime)
            .insert_header((header::CACHE_CONTROL, "public, max-age=3600"))
            .body(bytes)),
        Err(AvatarStoreError::NotFound) => Ok(no_content()),
        Err(e) => Err(e.into()),
    }
}
