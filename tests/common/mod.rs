#![allow(dead_code, unused_macros)]

use std::sync::Arc;

use actix_web::body::MessageBody;
use actix_web::dev::{Service, ServiceResponse};
use actix_web::http::StatusCode;
use actix_web::test;
use serde_json::Value;

use comentario::config::AppConfig;
use comentario::models::{Domain, DomainUser, User};
use comentario::notify::MemoryMailer;
use comentario::repo::inmem::InMemRepo;
use comentario::repo::Repo;
use comentario::usersession::{self, ClientInfo};
use comentario::AppState;

pub const PASSWORD: &str = "Secret-pass-123";

/// Fresh in-memory instance with captured mail.
pub struct World {
    pub repo: Arc<dyn Repo>,
    pub mailer: MemoryMailer,
    pub state: AppState,
}

pub fn world() -> World {
    world_with(AppConfig::for_tests())
}

pub fn world_with(cfg: AppConfig) -> World {
    let repo: Arc<dyn Repo> = Arc::new(InMemRepo::new());
    let mailer = MemoryMailer::new();
    let state = AppState::new(repo.clone(), cfg).unwrap().with_mailer(Arc::new(mailer.clone()));
    World { repo, mailer, state }
}

macro_rules! app {
    ($state:expr) => {
        actix_web::test::init_service(
            actix_web::App::new().app_data(actix_web::web::Data::new($state.clone())).configure(comentario::config),
        )
    };
}

impl World {
    /// Confirmed local user with [`PASSWORD`].
    pub async fn user(&self, email: &str, name: &str) -> User {
        let mut u = User::new(email, name);
        u.password_hash = self.state.hasher.hash_async(PASSWORD.to_string()).await.unwrap();
        u.confirm();
        self.repo.create_user(&u).await.unwrap();
        u
    }

    pub async fn superuser(&self, email: &str) -> User {
        let mut u = self.user(email, "Root").await;
        u.is_superuser = true;
        self.repo.update_user(&u).await.unwrap();
        u
    }

    /// Domain owned by `owner`, with `tweak` applied before it is stored.
    pub async fn domain(&self, host: &str, owner: &User, tweak: impl FnOnce(&mut Domain)) -> Domain {
        let mut d = Domain::new(host, host);
        tweak(&mut d);
        self.repo.create_domain(&d, &DomainUser::owner(d.id, owner.id), &[]).await.unwrap();
        d
    }

    pub async fn join(&self, domain: &Domain, user: &User) {
        self.repo.upsert_domain_user(&DomainUser::commenter(domain.id, user.id)).await.unwrap();
    }

    /// Value for the `X-User-Session` header.
    pub async fn session(&self, user: &User, host: &str) -> String {
        let s = usersession::create(self.repo.as_ref(), &self.state.cfg, user.id, host, &ClientInfo::default()).await.unwrap();
        usersession::encode(user.id, s.id)
    }
}

/// Runs the request and decodes a JSON body, `Null` when there is none.
pub async fn send<S, R, B>(app: &S, req: R) -> (StatusCode, Value)
where
    S: Service<R, Response = ServiceResponse<B>, Error = actix_web::Error>,
    B: MessageBody,
{
    let resp = test::call_service(app, req).await;
    let status = resp.status();
    let body = test::read_body(resp).await;
    let v = if body.is_empty() { Value::Null } else { serde_json::from_slice(&body).unwrap_or(Value::Null) };
    (status, v)
}

/// Pulls the token query parameter out of a mailed link.
pub fn token_from_mail(body: &str) -> String {
    body.split("token=").nth(1).and_then(|rest| rest.split_whitespace().next()).unwrap().to_string()
}
