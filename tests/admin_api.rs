#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use actix_web::http::StatusCode;
use actix_web::test::{self, TestRequest};
use serde_json::{json, Value};

use comentario::usersession::SESSION_HEADER;
use common::{send, world, PASSWORD};

fn as_user(req: TestRequest, session: &str) -> TestRequest {
    req.insert_header((SESSION_HEADER, session.to_string()))
}

fn hosts(list: &Value) -> Vec<String> {
    let mut v: Vec<String> = list.as_array().unwrap().iter().map(|i| i["domain"]["host"].as_str().unwrap().to_string()).collect();
    v.sort();
    v
}

#[actix_web::test]
async fn domain_lifecycle() {
    let w = world();
    let ann = w.user("ann@example.com", "Ann").await;
    let bob = w.user("bob@example.com", "Bob").await;
    let ann_s = w.session(&ann, "").await;
    let bob_s = w.session(&bob, "").await;
    let app = app!(w.state).await;

    let req = as_user(TestRequest::post().uri("/api/domains"), &ann_s)
        .set_json(json!({"host": "Blog.Example.com", "name": "Ann's blog", "authAnonymous": true}))
        .to_request();
    let (status, domain) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(domain["host"], "blog.example.com");
    assert_eq!(domain["authAnonymous"], true);
    assert!(domain.get("ssoSecret").is_none());
    let id = domain["id"].as_str().unwrap().to_string();

    let req = as_user(TestRequest::post().uri("/api/domains"), &bob_s).set_json(json!({"host": "blog.example.com"})).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["id"], "host-already-exists");

    // Nothing enabled is not a valid domain
    let req = as_user(TestRequest::post().uri("/api/domains"), &bob_s)
        .set_json(json!({"host": "empty.example.com", "authLocal": false}))
        .to_request();
    let (status, _) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (_, list) = send(&app, as_user(TestRequest::get().uri("/api/domains"), &ann_s).to_request()).await;
    assert_eq!(hosts(&list), vec!["blog.example.com"]);
    assert_eq!(list[0]["isOwner"], true);
    let (_, list) = send(&app, as_user(TestRequest::get().uri("/api/domains"), &bob_s).to_request()).await;
    assert!(hosts(&list).is_empty());

    let (status, body) = send(&app, as_user(TestRequest::get().uri(&format!("/api/domains/{id}")), &bob_s).to_request()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["id"], "not-moderator");

    let req = as_user(TestRequest::put().uri(&format!("/api/domains/{id}")), &ann_s).set_json(json!({"host": "other.example.com"})).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], "immutable-property");

    let req = as_user(TestRequest::put().uri(&format!("/api/domains/{id}")), &ann_s).set_json(json!({"name": "Renamed"})).to_request();
    let (status, _) = send(&app, req).await;
    assert!(status.is_success());
    assert_eq!(w.repo.find_domain_by_host("blog.example.com").await.unwrap().name, "Renamed");

    let (status, body) = send(&app, as_user(TestRequest::post().uri(&format!("/api/domains/{id}/sso/secret")), &ann_s).to_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["ssoSecret"].as_str().unwrap().len(), 64);

    let (status, _) = send(&app, as_user(TestRequest::delete().uri(&format!("/api/domains/{id}")), &bob_s).to_request()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (status, _) = send(&app, as_user(TestRequest::delete().uri(&format!("/api/domains/{id}")), &ann_s).to_request()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(w.repo.find_domain_by_host("blog.example.com").await.is_err());
}

#[actix_web::test]
async fn members_moderators_and_the_last_owner() {
    let w = world();
    let ann = w.user("ann@example.com", "Ann").await;
    let bob = w.user("bob@example.com", "Bob").await;
    let domain = w.domain("blog.example.com", &ann, |_| {}).await;
    let ann_s = w.session(&ann, "").await;
    let app = app!(w.state).await;
    let base = format!("/api/domains/{}", domain.id);

    let req = as_user(TestRequest::post().uri(&format!("{base}/moderators")), &ann_s).set_json(json!({"email": "bob@example.com"})).to_request();
    assert!(send(&app, req).await.0.is_success());
    let du = w.repo.find_domain_user(domain.id, bob.id).await.unwrap();
    assert!(du.is_moderator && du.is_commenter && !du.is_owner);

    let (_, members) = send(&app, as_user(TestRequest::get().uri(&format!("{base}/users")), &ann_s).to_request()).await;
    assert_eq!(members.as_array().unwrap().len(), 2);

    // Clearing the commenter flag demotes all the way down
    let req = as_user(TestRequest::put().uri(&format!("{base}/users/{}", bob.id)), &ann_s).set_json(json!({"isCommenter": false})).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isModerator"], false);
    assert_eq!(body["isCommenter"], false);

    let req = as_user(TestRequest::put().uri(&format!("{base}/users/{}", ann.id)), &ann_s).set_json(json!({"isOwner": false})).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], "deleting-last-owner");

    let (status, _) = send(&app, as_user(TestRequest::delete().uri(&format!("{base}/users/{}", ann.id)), &ann_s).to_request()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, _) = send(&app, as_user(TestRequest::delete().uri(&format!("{base}/users/{}", bob.id)), &ann_s).to_request()).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    assert!(w.repo.find_domain_user(domain.id, bob.id).await.is_err());
}

#[actix_web::test]
async fn export_then_import_into_another_domain() {
    let w = world();
    let ann = w.user("ann@example.com", "Ann").await;
    let src = w.domain("old.example.com", &ann, |_| {}).await;
    let dst = w.domain("new.example.com", &ann, |_| {}).await;
    let s = w.session(&ann, "old.example.com").await;
    let app = app!(w.state).await;

    let new_comment = |body: Value| as_user(TestRequest::post().uri("/api/embed/comment/new"), &s).set_json(body).to_request();
    let (_, root) = send(&app, new_comment(json!({"host": "old.example.com", "path": "/post", "markdown": "root"}))).await;
    let root_id = root["comment"]["id"].as_str().unwrap().to_string();
    let (_, mid) = send(&app, new_comment(json!({"host": "old.example.com", "path": "/post", "parentId": root_id, "markdown": "middle"}))).await;
    let mid_id = mid["comment"]["id"].as_str().unwrap().to_string();
    send(&app, new_comment(json!({"host": "old.example.com", "path": "/post", "parentId": mid_id, "markdown": "leaf"}))).await;
    let req = as_user(TestRequest::post().uri("/api/embed/comment/delete"), &s).set_json(json!({"commentId": mid_id})).to_request();
    send(&app, req).await;

    let (status, doc) = send(&app, as_user(TestRequest::get().uri(&format!("/api/domains/{}/export", src.id)), &s).to_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(doc["version"], 1);
    assert_eq!(doc["comments"].as_array().unwrap().len(), 3);
    assert_eq!(doc["comments"][0]["authorEmail"], "ann@example.com");

    let req = as_user(TestRequest::post().uri(&format!("/api/domains/{}/import", dst.id)), &s).set_json(&doc).to_request();
    let (status, result) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(result["pagesAdded"], 1);
    assert_eq!(result["commentsImported"], 2);
    assert_eq!(result["commentsSkipped"], 1);

    // The leaf now hangs off the root
    let req = TestRequest::post().uri("/api/embed/comment/list").set_json(json!({"host": "new.example.com", "path": "/post"})).to_request();
    let (_, page) = send(&app, req).await;
    let comments = page["comments"].as_array().unwrap();
    assert_eq!(comments.len(), 2);
    assert_eq!(comments[1]["parentId"], comments[0]["id"]);
    assert_eq!(comments[1]["markdown"], "leaf");
}

#[actix_web::test]
async fn banning_a_user_ends_their_sessions() {
    let w = world();
    let root = w.superuser("root@example.com").await;
    let bob = w.user("bob@example.com", "Bob").await;
    let root_s = w.session(&root, "").await;
    let bob_s = w.session(&bob, "").await;
    let app = app!(w.state).await;

    let (status, _) = send(&app, as_user(TestRequest::get().uri("/api/domains"), &bob_s).to_request()).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = send(&app, as_user(TestRequest::get().uri("/api/users"), &bob_s).to_request()).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["id"], "no-superuser");

    let req = as_user(TestRequest::post().uri(&format!("/api/users/{}/ban", root.id)), &root_s).set_json(json!({"ban": true})).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["id"], "self-operation");

    let req = as_user(TestRequest::post().uri(&format!("/api/users/{}/ban", bob.id)), &root_s).set_json(json!({"ban": true})).to_request();
    assert_eq!(send(&app, req).await.0, StatusCode::NO_CONTENT);

    let (status, _) = send(&app, as_user(TestRequest::get().uri("/api/domains"), &bob_s).to_request()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);

    let req = TestRequest::post().uri("/api/auth/login").set_json(json!({"email": "bob@example.com", "password": PASSWORD})).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["id"], "user-banned");
}

#[actix_web::test]
async fn superuser_guards_and_user_deletion() {
    let w = world();
    let root = w.superuser("root@example.com").await;
    let bob = w.user("bob@example.com", "Bob").await;
    let carol = w.user("carol@example.com", "Carol").await;
    let domain = w.domain("carol.example.com", &carol, |_| {}).await;
    w.join(&domain, &bob).await;
    let root_s = w.session(&root, "").await;
    let bob_s = w.session(&bob, "carol.example.com").await;
    let app = app!(w.state).await;

    let req = as_user(TestRequest::put().uri(&format!("/api/users/{}", root.id)), &root_s).set_json(json!({"isSuperuser": false})).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["id"], "self-operation");

    let req = as_user(TestRequest::put().uri(&format!("/api/users/{}", bob.id)), &root_s).set_json(json!({"email": "carol@example.com"})).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::CONFLICT);
    assert_eq!(body["id"], "email-already-exists");

    // Carol is the only owner of her domain
    let (status, body) = send(&app, as_user(TestRequest::delete().uri(&format!("/api/users/{}", carol.id)), &root_s).to_request()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], "deleting-last-owner");

    let req = as_user(TestRequest::post().uri("/api/embed/comment/new"), &bob_s)
        .set_json(json!({"host": "carol.example.com", "path": "/", "markdown": "bye"}))
        .to_request();
    let (_, c) = send(&app, req).await;
    let comment_id = uuid::Uuid::parse_str(c["comment"]["id"].as_str().unwrap()).unwrap();

    let req = as_user(TestRequest::delete().uri(&format!("/api/users/{}", bob.id)), &root_s)
        .set_json(json!({"deleteComments": true, "purgeComments": true}))
        .to_request();
    assert_eq!(send(&app, req).await.0, StatusCode::NO_CONTENT);
    assert!(w.repo.find_user_by_id(bob.id).await.is_err());
    assert!(w.repo.find_comment(comment_id).await.is_err());
}

#[actix_web::test]
async fn instance_config_switches_signup() {
    let w = world();
    let root = w.superuser("root@example.com").await;
    let bob = w.user("bob@example.com", "Bob").await;
    let root_s = w.session(&root, "").await;
    let bob_s = w.session(&bob, "").await;
    let app = app!(w.state).await;

    let (status, body) = send(&app, TestRequest::get().uri("/api/config").to_request()).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["signupEnabled"], true);
    assert_eq!(body["defaultLangId"], "en");

    let req = as_user(TestRequest::put().uri("/api/config/dynamic"), &bob_s).set_json(json!({"auth.signup.enabled": "false"})).to_request();
    assert_eq!(send(&app, req).await.0, StatusCode::FORBIDDEN);

    let req = as_user(TestRequest::put().uri("/api/config/dynamic"), &root_s).set_json(json!({"auth.signup.enabled": "maybe"})).to_request();
    assert_eq!(send(&app, req).await.0, StatusCode::BAD_REQUEST);

    let req = as_user(TestRequest::put().uri("/api/config/dynamic"), &root_s).set_json(json!({"auth.signup.enabled": "false"})).to_request();
    assert_eq!(send(&app, req).await.0, StatusCode::NO_CONTENT);

    let req = TestRequest::post().uri("/api/auth/signup").set_json(json!({"email": "new@example.com", "name": "New", "password": PASSWORD})).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert_eq!(body["id"], "signups-forbidden");

    let (_, items) = send(&app, as_user(TestRequest::get().uri("/api/config/dynamic"), &root_s).to_request()).await;
    let item = items.as_array().unwrap().iter().find(|i| i["key"] == "auth.signup.enabled").unwrap().clone();
    assert_eq!(item["value"], "false");

    assert_eq!(send(&app, as_user(TestRequest::post().uri("/api/config/reset"), &root_s).to_request()).await.0, StatusCode::NO_CONTENT);
    let (_, body) = send(&app, test::TestRequest::get().uri("/api/config").to_request()).await;
    assert_eq!(body["signupEnabled"], true);
}
