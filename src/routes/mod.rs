//! HTTP surface: shared application state and the route table.

use std::sync::Arc;
use std::time::Duration;

use actix_web::{web, HttpResponse};
use serde::Serialize;
use utoipa::ToSchema;
use uuid::Uuid;

use crate::comments::{NoSpamChecker, SpamChecker};
use crate::config::AppConfig;
use crate::dynconfig::DynConfig;
use crate::error::ApiError;
use crate::idp::IdpRegistry;
use crate::models::{Id, PrincipalView};
use crate::notify::{LogMailer, Mailer, Notifier};
use crate::password::PasswordHasher;
use crate::rate_limit::RateLimiterFacade;
use crate::repo::Repo;
use crate::storage::{AvatarStore, MemoryAvatarStore, MAX_AVATAR_BYTES};
use crate::web::StaticAssets;

pub mod auth;
pub mod domains;
pub mod embed;
pub mod frontend;
pub mod oauth;
pub mod settings;
pub mod users;

const OUTBOUND_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct AppState {
    pub repo: Arc<dyn Repo>,
    pub cfg: Arc<AppConfig>,
    pub dyn_config: Arc<DynConfig>,
    pub idps: Arc<IdpRegistry>,
    pub notifier: Notifier,
    pub spam: Arc<dyn SpamChecker>,
    pub avatars: Arc<dyn AvatarStore>,
    pub hasher: PasswordHasher,
    pub http: reqwest::Client,
    pub rate_limiter: RateLimiterFacade,
    pub assets: Arc<StaticAssets>,
}

impl AppState {
    /// State with in-process collaborators: log-only mailer, memory avatar
    /// store, no antispam, rate limiting off.
    pub fn new(repo: Arc<dyn Repo>, cfg: AppConfig) -> anyhow::Result<Self> {
        let cfg = Arc::new(cfg);
        let hasher = PasswordHasher::new(cfg.password_hash_cost).map_err(|e| anyhow::anyhow!("password hasher: {e}"))?;
        let http = reqwest::Client::builder().timeout(OUTBOUND_TIMEOUT).build()?;
        Ok(Self {
            dyn_config: Arc::new(DynConfig::new(repo.clone())),
            idps: Arc::new(IdpRegistry::from_config(&cfg)),
            notifier: Notifier::new(repo.clone(), cfg.clone(), Arc::new(LogMailer)),
            spam: Arc::new(NoSpamChecker),
            avatars: Arc::new(MemoryAvatarStore::new()),
            hasher,
            http,
            rate_limiter: RateLimiterFacade::disabled(),
            assets: Arc::new(StaticAssets::empty()),
            repo,
            cfg,
        })
    }

    pub fn with_mailer(mut self, mailer: Arc<dyn Mailer>) -> Self {
        self.notifier = Notifier::new(self.repo.clone(), self.cfg.clone(), mailer);
        self
    }

    pub fn with_spam_checker(mut self, spam: Arc<dyn SpamChecker>) -> Self {
        self.spam = spam;
        self
    }

    pub fn with_avatar_store(mut self, store: Arc<dyn AvatarStore>) -> Self {
        self.avatars = store;
        self
    }

    pub fn with_rate_limiter(mut self, limiter: RateLimiterFacade) -> Self {
        self.rate_limiter = limiter;
        self
    }

    pub fn with_assets(mut self, assets: StaticAssets) -> Self {
        self.assets = Arc::new(assets);
        self
    }
}

/// Issued by every successful embed login.
#[derive(Debug, Serialize, ToSchema)]
#[serde(rename_all = "camelCase")]
pub struct SessionResponse {
    pub session_token: String,
    pub principal: PrincipalView,
}

pub(crate) fn parse_id(s: &str) -> Result<Id, ApiError> {
    Uuid::parse_str(s.trim()).map_err(|_| ApiError::InvalidUuid)
}

pub(crate) fn no_content() -> HttpResponse {
    HttpResponse::NoContent().finish()
}

fn json_config() -> web::JsonConfig {
    web::JsonConfig::default()
        .limit(256 * 1024)
        .error_handler(|err, _| ApiError::invalid_input(err.to_string()).into())
}

fn query_config() -> web::QueryConfig {
    web::QueryConfig::default().error_handler(|err, _| ApiError::invalid_input(err.to_string()).into())
}

pub fn config(cfg: &mut web::ServiceConfig) {
    cfg.app_data(json_config()).app_data(query_config());
    cfg.service(
        web::scope("/api/embed")
            .service(web::resource("/auth/login").route(web::post().to(embed::login)))
            .service(web::resource("/auth/logout").route(web::post().to(embed::logout)))
            .service(web::resource("/auth/signup").route(web::post().to(embed::signup)))
            .service(web::resource("/auth/curUser").route(web::get().to(embed::cur_user)))
            .service(web::resource("/auth/user/update").route(web::post().to(embed::update_user)))
            .service(web::resource("/auth/login/token/new").route(web::post().to(embed::login_token_new)))
            .service(web::resource("/auth/login/token/redeem").route(web::post().to(embed::login_token_redeem)))
            .service(web::resource("/comment/list").route(web::post().to(embed::comment_list)))
            .service(web::resource("/comment/new").route(web::post().to(embed::comment_new)))
            .service(web::resource("/comment/moderate").route(web::post().to(embed::comment_moderate)))
            .service(web::resource("/comment/delete").route(web::post().to(embed::comment_delete)))
            .service(web::resource("/comment/vote").route(web::post().to(embed::comment_vote)))
            .service(web::resource("/comment/edit").route(web::post().to(embed::comment_edit)))
            .service(web::resource("/comment/preview").route(web::post().to(embed::comment_preview)))
            .service(web::resource("/i18n/{lang}/messages").route(web::get().to(embed::i18n_messages))),
    );
    cfg.service(
        web::scope("/api/auth")
            .service(web::resource("/login").route(web::post().to(auth::login)))
            .service(web::resource("/logout").route(web::post().to(auth::logout)))
            .service(web::resource("/signup").route(web::post().to(auth::signup)))
            .service(web::resource("/curUser").route(web::get().to(auth::cur_user)))
            .service(web::resource("/confirm").route(web::get().to(auth::confirm)))
            .service(web::resource("/pwdReset/sendEmail").route(web::post().to(auth::pwd_reset_send)))
            .service(web::resource("/pwdReset/change").route(web::post().to(auth::pwd_reset_change)))
            .service(web::resource("/oauth/{provider}/init").route(web::get().to(oauth::init)))
            .service(web::resource("/oauth/{provider}/callback").route(web::get().to(oauth::callback))),
    );
    cfg.route("/api/mail/unsubscribe", web::get().to(auth::unsubscribe));
    cfg.service(
        web::resource("/api/user/avatar")
            .app_data(web::PayloadConfig::new(MAX_AVATAR_BYTES * 2))
            .route(web::put().to(users::upload_avatar))
            .route(web::delete().to(users::delete_avatar)),
    );
    cfg.route("/api/user/{id}/avatar", web::get().to(users::get_avatar));
    cfg.service(
        web::scope("/api/domains")
            .service(web::resource("").route(web::get().to(domains::list)).route(web::post().to(domains::create)))
            .service(
                web::resource("/{id}")
                    .route(web::get().to(domains::get))
                    .route(web::put().to(domains::update))
                    .route(web::delete().to(domains::delete)),
            )
            .service(web::resource("/{id}/clear").route(web::post().to(domains::clear)))
            .service(web::resource("/{id}/readonly").route(web::put().to(domains::set_readonly)))
            .service(web::resource("/{id}/sso/secret").route(web::post().to(domains::new_sso_secret)))
            .service(web::resource("/{id}/statistics").route(web::get().to(domains::statistics)))
            .service(web::resource("/{id}/pages").route(web::get().to(domains::list_pages)))
            .service(web::resource("/{id}/pages/{pageId}").route(web::put().to(domains::update_page)))
            .service(web::resource("/{id}/users").route(web::get().to(domains::list_users)))
            .service(
                web::resource("/{id}/users/{userId}")
                    .route(web::put().to(domains::update_user))
                    .route(web::delete().to(domains::remove_user)),
            )
            .service(web::resource("/{id}/moderators").route(web::post().to(domains::add_moderator)))
            .service(web::resource("/{id}/purge").route(web::post().to(domains::purge)))
            .service(web::resource("/{id}/export").route(web::get().to(domains::export)))
            .service(
                web::resource("/{id}/import")
                    .app_data(web::JsonConfig::default().limit(32 * 1024 * 1024))
                    .route(web::post().to(domains::import)),
            )
            .service(web::resource("/{id}/config").route(web::get().to(domains::get_config)).route(web::put().to(domains::update_config)))
            .service(web::resource("/{id}/config/reset").route(web::post().to(domains::reset_config))),
    );
    cfg.service(
        web::scope("/api/users")
            .service(web::resource("").route(web::get().to(users::list)))
            .service(
                web::resource("/{id}")
                    .route(web::get().to(users::get))
                    .route(web::put().to(users::update))
                    .route(web::delete().to(users::delete)),
            )
            .service(web::resource("/{id}/ban").route(web::post().to(users::ban)))
            .service(web::resource("/{id}/unlock").route(web::post().to(users::unlock))),
    );
    cfg.service(
        web::scope("/api/config")
            .service(web::resource("").route(web::get().to(settings::get_static)))
            .service(web::resource("/dynamic").route(web::get().to(settings::get_dynamic)).route(web::put().to(settings::update_dynamic)))
            .service(web::resource("/reset").route(web::post().to(settings::reset))),
    );
    cfg.route("/", web::get().to(frontend::root));
    cfg.default_service(web::route().to(frontend::fallback));
}
