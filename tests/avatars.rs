#![cfg(feature = "inmem-store")]

#[macro_use]
mod common;

use std::sync::Arc;

use actix_web::http::{header, StatusCode};
use actix_web::test;

use comentario::storage::{AvatarStore, FsAvatarStore};
use comentario::usersession::SESSION_HEADER;
use common::{send, world};

const PNG: &[u8] = &[0x89, b'P', b'N', b'G', 0x0D, 0x0A, 0x1A, 0x0A, 0, 0, 0, 0x0D, b'I', b'H', b'D', b'R', 0, 0, 0, 1, 0, 0, 0, 1];
const GIF: &[u8] = b"GIF89a\x01\x00\x01\x00\x00\x00\x00;";

#[actix_web::test]
async fn upload_serve_and_remove_on_disk() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsAvatarStore::new(dir.path().join("avatars")).await.unwrap();
    let w = world();
    let ann = w.user("ann@example.com", "Ann").await;
    let s = w.session(&ann, "").await;
    let state = w.state.clone().with_avatar_store(Arc::new(store));
    let app = app!(state).await;
    let avatar_uri = format!("/api/user/{}/avatar", ann.id);

    let resp = test::call_service(&app, test::TestRequest::get().uri(&avatar_uri).to_request()).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);

    let req = test::TestRequest::put().uri("/api/user/avatar").insert_header((SESSION_HEADER, s.clone())).set_payload(PNG).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);
    assert!(w.repo.find_user_by_id(ann.id).await.unwrap().has_avatar);
    assert_eq!(std::fs::read_dir(dir.path().join("avatars")).unwrap().count(), 1);

    let resp = test::call_service(&app, test::TestRequest::get().uri(&format!("{avatar_uri}?size=L")).to_request()).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "image/png");
    assert!(resp.headers().contains_key(header::CACHE_CONTROL));
    assert_eq!(test::read_body(resp).await.as_ref(), PNG);

    let (status, body) = send(&app, test::TestRequest::get().uri(&format!("{avatar_uri}?size=XL")).to_request()).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], "invalid-input-data");

    // Replacing keeps a single file
    let req = test::TestRequest::put().uri("/api/user/avatar").insert_header((SESSION_HEADER, s.clone())).set_payload(GIF).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);
    let resp = test::call_service(&app, test::TestRequest::get().uri(&avatar_uri).to_request()).await;
    assert_eq!(resp.headers().get(header::CONTENT_TYPE).unwrap(), "image/gif");

    let req = test::TestRequest::delete().uri("/api/user/avatar").insert_header((SESSION_HEADER, s)).to_request();
    assert_eq!(test::call_service(&app, req).await.status(), StatusCode::NO_CONTENT);
    let resp = test::call_service(&app, test::TestRequest::get().uri(&avatar_uri).to_request()).await;
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    assert!(!w.repo.find_user_by_id(ann.id).await.unwrap().has_avatar);
}

#[actix_web::test]
async fn uploads_must_be_images_from_a_logged_in_user() {
    let w = world();
    let ann = w.user("ann@example.com", "Ann").await;
    let s = w.session(&ann, "").await;
    let app = app!(w.state).await;

    let req = test::TestRequest::put().uri("/api/user/avatar").set_payload(PNG).to_request();
    assert_eq!(send(&app, req).await.0, StatusCode::UNAUTHORIZED);

    let req = test::TestRequest::put().uri("/api/user/avatar").insert_header((SESSION_HEADER, s.clone())).set_payload("plain text").to_request();
    let (status, body) = send(&app, req).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(body["id"], "invalid-input-data");

    let mut huge = PNG.to_vec();
    huge.resize(1024 * 1024 + 1, 0);
    let req = test::TestRequest::put().uri("/api/user/avatar").insert_header((SESSION_HEADER, s)).set_payload(huge).to_request();
    assert_eq!(send(&app, req).await.0, StatusCode::BAD_REQUEST);
    assert!(!w.repo.find_user_by_id(ann.id).await.unwrap().has_avatar);
}

#[actix_web::test]
async fn fs_store_treats_missing_files_as_absent() {
    let dir = tempfile::tempdir().unwrap();
    let store = FsAvatarStore::new(dir.path()).await.unwrap();
    let id = uuid::Uuid::new_v4();
    assert!(store.load(id).await.is_err());
    store.delete(id).await.unwrap();
    assert!(store.save(id, b"not an image").await.is_err());
    store.save(id, PNG).await.unwrap();
    let (bytes, mime) = store.load(id).await.unwrap();
    assert_eq!(bytes, PNG);
    assert_eq!(mime, "image/png");
}
