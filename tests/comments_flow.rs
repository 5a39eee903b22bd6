#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use actix_web::http::StatusCode;
use actix_web::test::{self, TestRequest};
use serde_json::{json, Value};

use comentario::usersession::SESSION_HEADER;
use common::{send, world};

const HOST: &str = "blog.example.com";

fn post(uri: &str, session: Option<&str>, body: Value) -> TestRequest {
    let mut r = TestRequest::post().uri(uri).set_json(body);
    if let Some(s) = session {
        r = r.insert_header((SESSION_HEADER, s.to_string()));
    }
    r
}

fn list(session: Option<&str>, path: &str) -> TestRequest {
    post("/api/embed/comment/list", session, json!({"host": HOST, "path": path}))
}

fn ids(page: &Value) -> Vec<String> {
    page["comments"].as_array().unwrap().iter().map(|c| c["id"].as_str().unwrap().to_string()).collect()
}

#[actix_web::test]
async fn anonymous_comment_waits_for_moderation() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    w.domain(HOST, &owner, |d| d.auth_anonymous = true).await;
    let owner_s = w.session(&owner, HOST).await;
    let app = app!(w.state).await;

    let (status, body) = send(
        &app,
        post("/api/embed/comment/new", None, json!({"host": HOST, "path": "/p/1", "markdown": "Hello *there*", "authorName": "Guest"})).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "Pending");
    assert!(body["commenter"].is_null());
    let id = body["comment"]["id"].as_str().unwrap().to_string();

    // Other readers do not see it; the owner does
    let (_, page) = send(&app, list(None, "/p/1").to_request()).await;
    assert!(ids(&page).is_empty());
    let (_, page) = send(&app, list(Some(&owner_s), "/p/1").to_request()).await;
    assert_eq!(ids(&page), vec![id.clone()]);
    assert_eq!(page["comments"][0]["authorName"], "Guest");

    let (status, _) = send(&app, post("/api/embed/comment/moderate", None, json!({"commentId": id, "approve": true})).to_request()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, _) = send(&app, post("/api/embed/comment/moderate", Some(&owner_s), json!({"commentId": id, "approve": true})).to_request()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, page) = send(&app, list(None, "/p/1").to_request()).await;
    assert_eq!(ids(&page), vec![id]);
    assert_eq!(page["comments"][0]["state"], "Approved");
    assert!(page["comments"][0]["html"].as_str().unwrap().contains("<em>there</em>"));
}

#[actix_web::test]
async fn anonymous_comments_need_the_domain_switch() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    w.domain(HOST, &owner, |_| {}).await;
    let app = app!(w.state).await;

    let (status, _) = send(&app, post("/api/embed/comment/new", None, json!({"host": HOST, "path": "/", "markdown": "hi"})).to_request()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn owner_comments_are_approved_and_replies_stay_on_their_page() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    w.domain(HOST, &owner, |_| {}).await;
    let s = w.session(&owner, HOST).await;
    let app = app!(w.state).await;

    let (status, body) = send(
        &app,
        post("/api/embed/comment/new", Some(&s), json!({"host": HOST, "path": "/a", "markdown": "root", "pageTitle": "Page A"})).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "Approved");
    assert_eq!(body["commenter"]["isOwner"], true);
    let root = body["comment"]["id"].as_str().unwrap().to_string();

    let (status, body) = send(&app, post("/api/embed/comment/new", Some(&s), json!({"host": HOST, "path": "/b", "parentId": root, "markdown": "x"})).to_request()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], "no-root-comment");

    let (status, _) = send(&app, post("/api/embed/comment/new", Some(&s), json!({"host": HOST, "path": "/a", "parentId": root, "markdown": "reply"})).to_request()).await;
    assert_eq!(status, StatusCode::OK);

    let (_, page) = send(&app, list(None, "/a").to_request()).await;
    assert_eq!(page["pageInfo"]["title"], "Page A");
    let comments = page["comments"].as_array().unwrap();
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[0]["depth"], 0);
    assert_eq!(comments[1]["depth"], 1);
    assert_eq!(comments[1]["parentId"], root.as_str());
}

#[actix_web::test]
async fn votes_move_the_score_once_per_user() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    let reader = w.user("reader@example.com", "Reader").await;
    let domain = w.domain(HOST, &owner, |_| {}).await;
    w.join(&domain, &reader).await;
    let owner_s = w.session(&owner, HOST).await;
    let reader_s = w.session(&reader, HOST).await;
    let app = app!(w.state).await;

    let (_, body) = send(&app, post("/api/embed/comment/new", Some(&owner_s), json!({"host": HOST, "path": "/v", "markdown": "vote me"})).to_request()).await;
    let id = body["comment"]["id"].as_str().unwrap().to_string();
    let vote = |s: Option<&str>, d: i64| post("/api/embed/comment/vote", s, json!({"commentId": id, "direction": d})).to_request();

    let (status, body) = send(&app, vote(Some(&owner_s), 1)).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["id"], "self-vote");

    let (status, _) = send(&app, vote(None, 1)).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let (status, body) = send(&app, vote(Some(&reader_s), 2)).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], "invalid-input-data");

    for _ in 0..2 {
        let (status, _) = send(&app, vote(Some(&reader_s), 1)).await;
        assert_eq!(status, StatusCode::NO_CONTENT);
    }
    let (_, page) = send(&app, list(Some(&reader_s), "/v").to_request()).await;
    assert_eq!(page["comments"][0]["score"], 1);
    assert_eq!(page["comments"][0]["direction"], 1);

    send(&app, vote(Some(&reader_s), -1)).await;
    let (_, page) = send(&app, list(Some(&reader_s), "/v").to_request()).await;
    assert_eq!(page["comments"][0]["score"], -1);
    assert_eq!(page["comments"][0]["direction"], -1);

    send(&app, vote(Some(&reader_s), 0)).await;
    let (_, page) = send(&app, list(None, "/v").to_request()).await;
    assert_eq!(page["comments"][0]["score"], 0);
    assert_eq!(page["comments"][0]["direction"], 0);
}

#[actix_web::test]
async fn readonly_domain_freezes_writes_but_not_reads() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    let reader = w.user("reader@example.com", "Reader").await;
    let domain = w.domain(HOST, &owner, |_| {}).await;
    let owner_s = w.session(&owner, HOST).await;
    let reader_s = w.session(&reader, HOST).await;
    let app = app!(w.state).await;

    let (_, body) = send(&app, post("/api/embed/comment/new", Some(&owner_s), json!({"host": HOST, "path": "/r", "markdown": "before"})).to_request()).await;
    let id = body["comment"]["id"].as_str().unwrap().to_string();

    let req = test::TestRequest::put()
        .uri(&format!("/api/domains/{}/readonly", domain.id))
        .insert_header((SESSION_HEADER, owner_s.clone()))
        .set_json(json!({"readonly": true}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

    let (status, body) = send(&app, post("/api/embed/comment/new", Some(&reader_s), json!({"host": HOST, "path": "/r", "markdown": "after"})).to_request()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], "domain-readonly");

    let (status, body) = send(&app, post("/api/embed/comment/vote", Some(&reader_s), json!({"commentId": id, "direction": 1})).to_request()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], "domain-readonly");

    let (status, page) = send(&app, list(None, "/r").to_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page["pageInfo"]["isDomainReadonly"], true);
    assert_eq!(ids(&page), vec![id]);
}

#[actix_web::test]
async fn authors_edit_and_delete_their_own_comments() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    let reader = w.user("reader@example.com", "Reader").await;
    let other = w.user("other@example.com", "Other").await;
    w.domain(HOST, &owner, |_| {}).await;
    let reader_s = w.session(&reader, HOST).await;
    let other_s = w.session(&other, HOST).await;
    let app = app!(w.state).await;

    let (status, body) = send(&app, post("/api/embed/comment/new", Some(&reader_s), json!({"host": HOST, "path": "/e", "markdown": "first"})).to_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["state"], "Approved");
    let id = body["comment"]["id"].as_str().unwrap().to_string();

    let (status, _) = send(&app, post("/api/embed/comment/edit", Some(&other_s), json!({"commentId": id, "markdown": "hijack"})).to_request()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);

    let (status, body) = send(&app, post("/api/embed/comment/edit", Some(&reader_s), json!({"commentId": id, "markdown": "**second**"})).to_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert!(body["html"].as_str().unwrap().contains("<strong>second</strong>"));
    assert!(!body["editedTime"].is_null());

    let (status, _) = send(&app, post("/api/embed/comment/delete", Some(&reader_s), json!({"commentId": id})).to_request()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    // Deleting again changes nothing
    let (status, _) = send(&app, post("/api/embed/comment/delete", Some(&reader_s), json!({"commentId": id})).to_request()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);

    let (_, page) = send(&app, list(None, "/e").to_request()).await;
    assert_eq!(page["comments"][0]["isDeleted"], true);
    assert_eq!(page["comments"][0]["markdown"], "");
}

#[actix_web::test]
async fn preview_renders_without_storing() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    let domain = w.domain(HOST, &owner, |_| {}).await;
    let app = app!(w.state).await;

    let (status, body) = send(
        &app,
        post("/api/embed/comment/preview", None, json!({"host": HOST, "markdown": "**bold** <script>alert(1)</script>"})).to_request(),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    let html = body["html"].as_str().unwrap();
    assert!(html.contains("<strong>bold</strong>"));
    assert!(!html.contains("<script>"));
    assert!(w.repo.list_domain_comments(domain.id).await.unwrap().is_empty());
}
