//! The admin frontend: language redirect at `/` and static files elsewhere.

use actix_web::http::{header, Method};
use actix_web::{web, HttpRequest, HttpResponse};

use crate::error::ApiError;
use crate::routes::AppState;
use crate::web::best_language;

pub async fn root(req: HttpRequest, st: web::Data<AppState>) -> HttpResponse {
    let accept = req.headers().get(header::ACCEPT_LANGUAGE).and_then(|v| v.to_str().ok());
    let lang = best_language(accept, &st.cfg.ui_languages, &st.cfg.default_language);
    HttpResponse::Found().insert_header((header::LOCATION, format!("/{lang}/"))).finish()
}

/// Serves static files; bare language roots get their trailing slash.
pub async fn fallback(req: HttpRequest, st: web::Data<AppState>) -> Result<HttpResponse, ApiError> {
    let path = req.path();
    if !matches!(*req.method(), Method::GET | Method::HEAD) || path.starts_with("/api/") {
        return Err(ApiError::NotFound);
    }
    let bare = path.trim_start_matches('/');
    if st.cfg.ui_languages.iter().any(|l| l == bare) {
        return Ok(HttpResponse::MovedPermanently().insert_header((header::LOCATION, format!("/{bare}/"))).finish());
    }
    let lookup = if path.ends_with('/') { format!("{path}index.html") } else { path.to_string() };
    match st.assets.resolve(&lookup, &st.cfg.ui_languages) {
        Some(asset) => Ok(HttpResponse::Ok().content_type(asset.mime.clone()).body(asset.bytes.clone())),
        None => Err(ApiError::NotFound),
    }
}
