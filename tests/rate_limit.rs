#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use std::net::SocketAddr;
use std::time::Duration;

use actix_web::http::StatusCode;
use actix_web::test;
use serde_json::json;
use serial_test::serial;

use comentario::rate_limit::{RateLimitConfig, RateLimiterFacade};
use comentario::usersession::SESSION_HEADER;
use common::{send, world};

fn strict() -> RateLimitConfig {
    RateLimitConfig {
        enabled: true,
        login_limit: 2,
        login_window: Duration::from_secs(60),
        signup_limit: 1,
        signup_window: Duration::from_secs(60),
        comment_limit: 1,
        comment_window: Duration::from_secs(60),
    }
}

fn addr(s: &str) -> SocketAddr {
    s.parse().unwrap()
}

#[actix_web::test]
async fn login_attempts_are_limited_per_address() {
    let w = world();
    let state = w.state.clone().with_rate_limiter(RateLimiterFacade::new(strict()));
    let app = app!(state).await;
    let attempt = |ip: &str| {
        test::TestRequest::post()
            .uri("/api/auth/login")
            .peer_addr(addr(ip))
            .set_json(json!({"email": "nobody@example.com", "password": "Whatever-123"}))
            .to_request()
    };

    for _ in 0..2 {
        let (status, body) = send(&app, attempt("10.0.0.1:5000")).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["id"], "invalid-credentials");
    }
    let (status, body) = send(&app, attempt("10.0.0.1:5001")).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    assert_eq!(body["id"], "too-many-requests");

    // Another client is unaffected
    let (status, _) = send(&app, attempt("10.0.0.2:5000")).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn comment_flood_is_refused() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    w.domain("blog.example.com", &owner, |_| {}).await;
    let s = w.session(&owner, "blog.example.com").await;
    let state = w.state.clone().with_rate_limiter(RateLimiterFacade::new(strict()));
    let app = app!(state).await;
    let post = || {
        test::TestRequest::post()
            .uri("/api/embed/comment/new")
            .peer_addr(addr("10.0.0.9:4000"))
            .insert_header((SESSION_HEADER, s.clone()))
            .set_json(json!({"host": "blog.example.com", "path": "/", "markdown": "again"}))
            .to_request()
    };

    assert_eq!(send(&app, post()).await.0, StatusCode::OK);
    assert_eq!(send(&app, post()).await.0, StatusCode::TOO_MANY_REQUESTS);
}

#[actix_web::test]
async fn disabled_limiter_lets_everything_through() {
    let w = world();
    let app = app!(w.state).await;
    for _ in 0..20 {
        let req = test::TestRequest::post()
            .uri("/api/auth/login")
            .peer_addr(addr("10.0.0.1:5000"))
            .set_json(json!({"email": "nobody@example.com", "password": "Whatever-123"}))
            .to_request();
        assert_eq!(send(&app, req).await.0, StatusCode::UNAUTHORIZED);
    }
}

#[std::prelude::v1::test]
#[serial]
fn limits_come_from_the_environment() {
    std::env::set_var("RL_ENABLED", "true");
    std::env::set_var("RL_LOGIN_LIMIT", "3");
    std::env::set_var("RL_COMMENT_WINDOW", "5");
    std::env::set_var("RL_SIGNUP_LIMIT", "lots");
    let cfg = RateLimitConfig::from_env();
    for k in ["RL_ENABLED", "RL_LOGIN_LIMIT", "RL_COMMENT_WINDOW", "RL_SIGNUP_LIMIT"] {
        std::env::remove_var(k);
    }

    assert!(cfg.enabled);
    assert_eq!(cfg.login_limit, 3);
    assert_eq!(cfg.comment_window, Duration::from_secs(5));
    // Unparseable values keep the default
    assert_eq!(cfg.signup_limit, RateLimitConfig::default().signup_limit);
}

#[std::prelude::v1::test]
#[serial]
fn limiter_is_off_unless_enabled() {
    std::env::remove_var("RL_ENABLED");
    assert!(!RateLimitConfig::from_env().enabled);
}
