#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use actix_web::http::StatusCode;
use actix_web::test;
use chrono::{Duration, Utc};
use serde_json::json;

use comentario::authsession;
use comentario::models::{TokenScope, ANONYMOUS_USER_ID};
use comentario::repo::PruneStats;
use comentario::tokens;
use comentario::usersession::{self, ClientInfo, SESSION_HEADER};
use common::{send, world};

#[actix_web::test]
async fn prune_drops_only_what_has_expired() {
    let w = world();
    let ann = w.user("ann@example.com", "Ann").await;
    let repo = w.repo.as_ref();

    let live = tokens::create(repo, ann.id, TokenScope::ResetPassword, Duration::hours(1), false).await.unwrap();
    tokens::create(repo, ANONYMOUS_USER_ID, TokenScope::LoginExchange, Duration::minutes(-1), false).await.unwrap();
    authsession::create(repo, "{}".into(), "", &live.value).await.unwrap();
    usersession::create(repo, &w.state.cfg, ann.id, "", &ClientInfo::default()).await.unwrap();

    let stats = repo.prune_expired(Utc::now()).await.unwrap();
    assert_eq!(stats, PruneStats { tokens: 1, auth_sessions: 0, user_sessions: 0 });
    assert!(tokens::find(repo, &live.value, false).await.is_ok());

    // Far enough ahead everything is stale
    let stats = repo.prune_expired(Utc::now() + Duration::days(3650)).await.unwrap();
    assert_eq!(stats, PruneStats { tokens: 1, auth_sessions: 1, user_sessions: 1 });
    assert!(repo.prune_expired(Utc::now()).await.unwrap() == PruneStats::default());
}

#[actix_web::test]
async fn wrong_scope_does_not_burn_a_token() {
    let w = world();
    let repo = w.repo.as_ref();
    let t = tokens::create(repo, ANONYMOUS_USER_ID, TokenScope::LoginExchange, Duration::minutes(5), false).await.unwrap();

    assert!(tokens::consume(repo, &t.value, TokenScope::ConfirmEmail).await.is_err());
    assert!(tokens::consume(repo, &t.value, TokenScope::ResetPassword).await.is_err());
    let taken = tokens::consume(repo, &t.value, TokenScope::LoginExchange).await.unwrap();
    assert_eq!(taken.value, t.value);
    // Once consumed it is gone for every scope
    assert!(tokens::consume(repo, &t.value, TokenScope::LoginExchange).await.is_err());
    assert!(tokens::consume(repo, "zz", TokenScope::LoginExchange).await.is_err());
}

#[actix_web::test]
async fn deleted_authors_leave_purgeable_comments_behind() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    let ann = w.user("ann@example.com", "Ann").await;
    let domain = w.domain("blog.example.com", &owner, |_| {}).await;
    let owner_s = w.session(&owner, "blog.example.com").await;
    let ann_s = w.session(&ann, "blog.example.com").await;
    let app = app!(w.state).await;

    let mut ids = Vec::new();
    for (s, text) in [(&owner_s, "kept"), (&ann_s, "orphaned")] {
        let req = test::TestRequest::post()
            .uri("/api/embed/comment/new")
            .insert_header((SESSION_HEADER, s.clone()))
            .set_json(json!({"host": "blog.example.com", "path": "/", "markdown": text}))
            .to_request();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::OK);
        ids.push(uuid::Uuid::parse_str(body["comment"]["id"].as_str().unwrap()).unwrap());
    }
    w.repo.set_vote(ids[0], ann.id, 1).await.unwrap();

    w.repo.delete_user(ann.id).await.unwrap();
    assert!(w.repo.find_domain_user(domain.id, ann.id).await.is_err());
    assert_eq!(w.repo.find_comment(ids[0]).await.unwrap().score, 0);
    assert!(w.repo.find_comment(ids[1]).await.unwrap().user_created.is_none());

    assert_eq!(w.repo.purge_comments(domain.id, false, true).await.unwrap(), 1);
    assert!(w.repo.find_comment(ids[1]).await.is_err());
    assert!(w.repo.find_comment(ids[0]).await.is_ok());
}
