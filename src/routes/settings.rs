//! Instance configuration: public startup settings and the superuser-managed
//! dynamic config.

use std::collections::HashMap;

use actix_web::{web, HttpResponse};
use serde::Serialize;
use tracing::info;
use utoipa::ToSchema;

use crate::dynconfig;
use crate::error::ApiError;
use crate::idp;
use crate::principal::AuthUser;
use crate::routes::{no_content, AppState};

#[derive(Debug, Serialize, ToSchema)]
pub struct IdpInfo {
    pub id: String,
    pub name: String,
}

/// Settings the frontend needs before anyone logs in.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct StaticConfig {
    pub base_url: String,
    pub cdn_url: String,
    pub default_lang_id: String,
    pub ui_languages: Vec<String>,
    pub federated_idps: Vec<IdpInfo>,
    pub new_owners_allowed: bool,
    pub signup_enabled: bool,
    pub version: String,
}

#[utoipa::path(
    get,
    path = "/api/config",
    responses((status = 200, description = "Public instance settings", body = StaticConfig))
)]
pub async fn get_static(st: web::Data<AppState>) -> HttpResponse {
    let federated_idps = st
        .idps
        .configured_ids()
        .into_iter()
        .filter_map(|id| idp::descriptor(&id).map(|d| IdpInfo { name: d.name.to_string(), id }))
        .collect();
    HttpResponse::Ok().json(StaticConfig {
        base_url: st.cfg.base_url.clone(),
        cdn_url: st.cfg.cdn_url.clone(),
        default_lang_id: st.cfg.default_language.clone(),
        ui_languages: st.cfg.ui_languages.clone(),
        federated_idps,
        new_owners_allowed: st.cfg.allow_new_owners || st.dyn_config.get_bool(dynconfig::NEW_OWNER_ENABLED).await,
        signup_enabled: st.dyn_config.get_bool(dynconfig::AUTH_SIGNUP_ENABLED).await,
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

#[utoipa::path(
    get,
    path = "/api/config/dynamic",
    responses(
        (status = 200, description = "Every instance config item with its current value", body = [dynconfig::DynConfigItem]),
        (status = 403, description = "no-superuser")
    )
)]
pub async fn get_dynamic(auth: AuthUser, st: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    auth.require_superuser()?;
    Ok(HttpResponse::Ok().json(st.dyn_config.get_all().await?))
}

/// Applies all values or none.
pub async fn update_dynamic(auth: AuthUser, st: web::Data<AppState>, body: web::Json<HashMap<String, String>>) -> Result<HttpResponse, ApiError> {
    auth.require_superuser()?;
    st.dyn_config.update(Some(auth.user.id), &body).await?;
    info!(user = %auth.user.id, keys = body.len(), "instance config updated");
    Ok(no_content())
}

pub async fn reset(auth: AuthUser, st: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    auth.require_superuser()?;
    st.dyn_config.reset().await?;
    info!(user = %auth.user.id, "instance config reset");
    Ok(no_content())
}
