#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use actix_web::cookie::Cookie;
use actix_web::http::{header, StatusCode};
use actix_web::test;
use serde_json::json;

use comentario::notify::MailKind;
use comentario::usersession::{SESSION_COOKIE, SESSION_HEADER};
use common::{send, token_from_mail, world, PASSWORD};

#[actix_web::test]
async fn first_signup_becomes_confirmed_superuser() {
    let w = world();
    let app = app!(w.state).await;

    let req = test::TestRequest::post()
        .uri("/api/auth/signup")
        .set_json(json!({"email": "Root@Example.com", "name": "Root", "password": PASSWORD}))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isConfirmed"], true);

    let root = w.repo.find_user_by_email("root@example.com").await.unwrap();
    assert!(root.is_superuser);
    assert!(w.mailer.messages().is_empty());
}

#[actix_web::test]
async fn signup_confirm_then_login() {
    let w = world();
    w.superuser("root@example.com").await;
    let app = app!(w.state).await;

    let req = test::TestRequest::post()
        .uri("/api/auth/signup")
        .set_json(json!({"email": "ann@example.com", "name": "Ann", "password": PASSWORD}))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isConfirmed"], false);

    // Unconfirmed accounts cannot log in yet
    let login = || {
        test::TestRequest::post()
            .uri("/api/auth/login")
            .set_json(json!({"email": "ann@example.com", "password": PASSWORD}))
            .to_request()
    };
    let (status, body) = send(&app, login()).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["id"], "email-not-confirmed");

    let mails = w.mailer.messages();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].kind, MailKind::ConfirmEmail);
    let token = token_from_mail(&mails[0].body);

    let req = test::TestRequest::get().uri(&format!("/api/auth/confirm?token={token}")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    let location = resp.headers().get(header::LOCATION).unwrap().to_str().unwrap();
    assert!(location.ends_with("/en/auth/login?confirmed=true"));

    // The token is single use
    let req = test::TestRequest::get().uri(&format!("/api/auth/confirm?token={token}")).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(body["id"], "bad-token");

    let resp = test::call_service(&app, login()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let cookie = resp.response().cookies().find(|c| c.name() == SESSION_COOKIE).unwrap().into_owned();
    assert!(cookie.http_only().unwrap_or(false));

    let req = test::TestRequest::get()
        .uri("/api/auth/curUser")
        .cookie(Cookie::new(SESSION_COOKIE, cookie.value().to_string()))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "ann@example.com");
    assert_eq!(body["isSuperuser"], false);

    // Logging out ends the session
    let req = test::TestRequest::post()
        .uri("/api/auth/logout")
        .cookie(Cookie::new(SESSION_COOKIE, cookie.value().to_string()))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);
    let req = test::TestRequest::get().uri("/api/domains").cookie(Cookie::new(SESSION_COOKIE, cookie.value().to_string())).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);
}

#[actix_web::test]
async fn wrong_password_and_unknown_email_look_the_same() {
    let w = world();
    w.user("bob@example.com", "Bob").await;
    let app = app!(w.state).await;

    for (email, pwd) in [("bob@example.com", "Wrong-pass-1"), ("nobody@example.com", PASSWORD)] {
        let req = test::TestRequest::post().uri("/api/auth/login").set_json(json!({"email": email, "password": pwd})).to_request();
        let (status, body) = send(&app, req).await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(body["id"], "invalid-credentials");
    }
    let bob = w.repo.find_user_by_email("bob@example.com").await.unwrap();
    assert_eq!(bob.failed_login_attempts, 1);
}

#[actix_web::test]
async fn password_reset_replaces_password_and_ends_sessions() {
    let w = world();
    let bob = w.user("bob@example.com", "Bob").await;
    let old_session = w.session(&bob, "").await;
    let app = app!(w.state).await;

    // Unknown addresses are not disclosed
    let req = test::TestRequest::post().uri("/api/auth/pwdReset/sendEmail").set_json(json!({"email": "ghost@example.com"})).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);
    assert!(w.mailer.messages().is_empty());

    let req = test::TestRequest::post().uri("/api/auth/pwdReset/sendEmail").set_json(json!({"email": "bob@example.com"})).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);
    let mails = w.mailer.messages();
    assert_eq!(mails.len(), 1);
    assert_eq!(mails[0].kind, MailKind::ResetPassword);
    let token = token_from_mail(&mails[0].body);

    // A weak password is refused without burning the token
    let req = test::TestRequest::post().uri("/api/auth/pwdReset/change").set_json(json!({"token": token, "password": "weak"})).to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], "invalid-prop-value");

    let req = test::TestRequest::post()
        .uri("/api/auth/pwdReset/change")
        .set_json(json!({"token": token, "password": "Brand-new-456"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

    let req = test::TestRequest::get().uri("/api/domains").insert_header((SESSION_HEADER, old_session)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::post()
        .uri("/api/auth/login")
        .set_json(json!({"email": "bob@example.com", "password": "Brand-new-456"}))
        .to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::OK);
}

#[actix_web::test]
async fn embed_login_scopes_principal_to_domain() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    w.user("reader@example.com", "Reader").await;
    let domain = w.domain("blog.example.com", &owner, |_| {}).await;
    let app = app!(w.state).await;

    let req = test::TestRequest::post()
        .uri("/api/embed/auth/login")
        .set_json(json!({"email": "reader@example.com", "password": PASSWORD, "host": "blog.example.com"}))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["principal"]["isCommenter"], true);
    assert_eq!(body["principal"]["isOwner"], false);
    let token = body["sessionToken"].as_str().unwrap().to_string();

    let req = test::TestRequest::get()
        .uri("/api/embed/auth/curUser?host=blog.example.com")
        .insert_header((SESSION_HEADER, token.clone()))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["email"], "reader@example.com");

    let reader = w.repo.find_user_by_email("reader@example.com").await.unwrap();
    assert!(w.repo.find_domain_user(domain.id, reader.id).await.is_ok());

    // No credentials at all is simply nobody
    let req = test::TestRequest::get().uri("/api/embed/auth/curUser").to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);

    // Garbage credentials degrade to anonymous for reads
    let req = test::TestRequest::get().uri("/api/embed/auth/curUser").insert_header((SESSION_HEADER, "not-a-session")).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);
}

#[actix_web::test]
async fn embed_login_refused_when_local_auth_disabled() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    w.user("reader@example.com", "Reader").await;
    let domain = w
        .domain("sso-only.example.com", &owner, |d| {
            d.auth_local = false;
            d.auth_sso = true;
            d.sso_url = "https://idp.example.com/sso".into();
        })
        .await;
    let app = app!(w.state).await;

    let req = test::TestRequest::post()
        .uri("/api/embed/auth/login")
        .set_json(json!({"email": "reader@example.com", "password": PASSWORD, "host": "sso-only.example.com"}))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], "feature-disabled");

    let reader = w.repo.find_user_by_email("reader@example.com").await.unwrap();
    assert!(w.repo.find_domain_user(domain.id, reader.id).await.is_err());
}

#[actix_web::test]
async fn embed_signup_honours_domain_switches() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    w.domain("blog.example.com", &owner, |_| {}).await;
    let app = app!(w.state).await;

    let req = test::TestRequest::post()
        .uri("/api/embed/auth/signup")
        .set_json(json!({
            "email": "new@example.com",
            "name": "Newcomer",
            "password": PASSWORD,
            "host": "blog.example.com",
            "url": "https://blog.example.com/posts/1"
        }))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["isConfirmed"], false);

    let user = w.repo.find_user_by_email("new@example.com").await.unwrap();
    assert_eq!(user.signup_host, "https://blog.example.com/posts/1");
    assert!(!user.is_superuser);

    // Confirmation sends the reader back to the page they signed up on
    let token = token_from_mail(&w.mailer.messages()[0].body);
    let req = test::TestRequest::get().uri(&format!("/api/auth/confirm?token={token}")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "https://blog.example.com/posts/1");

    let req = test::TestRequest::post()
        .uri("/api/embed/auth/signup")
        .set_json(json!({"email": "x@example.com", "name": "X", "password": PASSWORD, "host": "unknown.example.com", "url": ""}))
        .to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], "unknown-host");
}

#[actix_web::test]
async fn confirmation_never_redirects_off_the_domain() {
    let w = world();
    let owner = w.user("owner@example.com", "Owner").await;
    w.domain("example.com", &owner, |_| {}).await;
    let app = app!(w.state).await;

    for (email, url) in [("a@example.org", "https://example.co/phish"), ("b@example.org", "https://example.com.evil.net/x")] {
        let req = test::TestRequest::post()
            .uri("/api/embed/auth/signup")
            .set_json(json!({"email": email, "name": "Reader", "password": PASSWORD, "host": "example.com", "url": url}))
            .to_request();
        assert_eq!(send(&app, req).await.0, StatusCode::OK);
        assert_eq!(w.repo.find_user_by_email(email).await.unwrap().signup_host, "https://example.com");
    }

    let mails = w.mailer.messages();
    assert_eq!(mails.len(), 2);
    let token = token_from_mail(&mails[0].body);
    let req = test::TestRequest::get().uri(&format!("/api/auth/confirm?token={token}")).to_request();
    let resp = test::call_service(&app, req).await;
    assert_eq!(resp.status(), StatusCode::FOUND);
    assert_eq!(resp.headers().get(header::LOCATION).unwrap(), "https://example.com");
}
