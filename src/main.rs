use std::sync::Arc;
use std::time::Duration;

use actix_cors::Cors;
use actix_web::http::header;
use actix_web::{middleware::Compress, App, HttpServer};
use tracing::{error, info, warn, Level};
use tracing_actix_web::TracingLogger;
use tracing_subscriber::EnvFilter;
use utoipa::OpenApi;
use utoipa_swagger_ui::SwaggerUi;

use comentario::config::AppConfig;
use comentario::openapi::ApiDoc;
use comentario::rate_limit::{RateLimitConfig, RateLimiterFacade};
use comentario::repo::Repo;
use comentario::storage::FsAvatarStore;
use comentario::web::StaticAssets;
use comentario::{config, AppState, SecurityHeaders, Xsrf};

const PRUNE_INTERVAL: Duration = Duration::from_secs(3600);

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // .env is a development convenience; deployments set the environment themselves
    if cfg!(debug_assertions) {
        let _ = dotenv::dotenv();
    }
    let cfg = AppConfig::from_env();

    let default_level = if cfg.log_verbose { Level::DEBUG } else { Level::INFO };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::builder().with_default_directive(default_level.into()).from_env_lossy())
        .init();

    info!(base_url = %cfg.base_url, e2e = cfg.e2e, "bootstrapping comentario");
    if cfg.smtp.is_none() {
        warn!("SMTP is not configured: mail is logged, not sent, and new users are confirmed automatically");
    }

    let repo = build_repo(&cfg).await?;
    let avatars = FsAvatarStore::new(cfg.data_dir.join("avatars")).await?;
    let assets = match cfg.static_path.as_deref() {
        Some(dir) => StaticAssets::load(dir, &cfg)?,
        None => {
            warn!("STATIC_PATH is not set; the admin frontend is not served");
            StaticAssets::empty()
        }
    };
    let limiter = RateLimiterFacade::new(RateLimitConfig::from_env());
    let bind_addr = cfg.bind_addr.clone();
    let xsrf_secret = cfg.xsrf_secret.clone();
    let https = cfg.is_https();

    let state = AppState::new(repo, cfg)?
        .with_avatar_store(Arc::new(avatars))
        .with_rate_limiter(limiter)
        .with_assets(assets);
    spawn_pruner(state.clone());

    let openapi = ApiDoc::openapi();
    info!("OpenAPI spec generated");

    let server = HttpServer::new(move || {
        // The widget is embedded on arbitrary sites, so any origin is echoed back
        let cors = Cors::default()
            .allowed_origin_fn(|_, _| true)
            .allow_any_header()
            .allowed_methods(["GET", "POST", "PUT", "DELETE", "OPTIONS"])
            .expose_headers([header::HeaderName::from_static("x-xsrf-token")])
            .supports_credentials()
            .max_age(3600);

        App::new()
            .app_data(actix_web::web::Data::new(state.clone()))
            .wrap(Xsrf::new(&xsrf_secret, https))
            .wrap(SecurityHeaders::default().with_hsts(https))
            .wrap(cors)
            .wrap(Compress::default())
            .wrap(TracingLogger::default())
            .service(SwaggerUi::new("/docs/{_:.*}").url("/docs/openapi.json", openapi.clone()))
            .configure(config)
    })
    .bind(&bind_addr)?;

    info!("listening on http://{bind_addr}");
    server.run().await?;
    Ok(())
}

#[cfg(feature = "postgres-store")]
async fn build_repo(cfg: &AppConfig) -> anyhow::Result<Arc<dyn Repo>> {
    use sqlx::postgres::PgPoolOptions;
    let db_url = cfg.database_url.as_deref().ok_or_else(|| anyhow::anyhow!("DATABASE_URL must be set for postgres-store"))?;
    let pool = PgPoolOptions::new().max_connections(10).connect(db_url).await?;
    let repo = comentario::repo::pg::PgRepo::new(pool);
    repo.migrate().await?;
    info!("using Postgres repository backend");
    Ok(Arc::new(repo))
}

#[cfg(all(feature = "inmem-store", not(feature = "postgres-store")))]
async fn build_repo(_cfg: &AppConfig) -> anyhow::Result<Arc<dyn Repo>> {
    warn!("using in-memory repository backend; data is lost on restart");
    Ok(Arc::new(comentario::repo::inmem::InMemRepo::new()))
}

/// Hourly removal of expired tokens, auth sessions and user sessions, plus
/// rate limiter housekeeping.
fn spawn_pruner(state: AppState) {
    actix_web::rt::spawn(async move {
        let mut tick = tokio::time::interval(PRUNE_INTERVAL);
        loop {
            tick.tick().await;
            match state.repo.prune_expired(chrono::Utc::now()).await {
                Ok(s) => info!(tokens = s.tokens, auth_sessions = s.auth_sessions, user_sessions = s.user_sessions, "expired records pruned"),
                Err(e) => error!(error = %e, "pruning failed"),
            }
            state.rate_limiter.sweep();
        }
    });
}
