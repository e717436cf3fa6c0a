use std::sync::Arc;

use axum::body::Body;
use axum::http::header::{AUTHORIZATION, CONTENT_TYPE, WWW_AUTHENTICATE};
use axum::http::{Request, StatusCode};
use axum::Router;
use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use gallery_core::{Backend, FileBackend, Gallery, GalleryConfig, MemoryBackend};
use http_body_util::BodyExt;
use serde_json::{json, Value};
use tempfile::tempdir;
use tower::ServiceExt;

const ADMIN: (&str, &str) = ("admin", "secret");
const ERIKA: (&str, &str) = ("erika", "pw");

fn manual() -> GalleryConfig {
    GalleryConfig { auto_regenerate: false, ..GalleryConfig::default() }
}

fn app() -> Router {
    let backend = Arc::new(MemoryBackend::new());
    backend.insert_user(ADMIN.0, ADMIN.1, true).unwrap();
    backend.insert_user(ERIKA.0, ERIKA.1, false).unwrap();
    let store: Arc<dyn Backend> = backend;
    gallery_server::build_app(Arc::new(Gallery::open(store, manual()).unwrap()))
}

async fn call(app: &Router, method: &str, uri: &str, auth: Option<(&str, &str)>, body: Option<Value>) -> (StatusCode, Value) {
    let mut req = Request::builder().method(method).uri(uri);
    if let Some((name, password)) = auth {
        req = req.header(AUTHORIZATION, format!("Basic {}", STANDARD.encode(format!("{name}:{password}"))));
    }
    let body = match body {
        Some(v) => {
            req = req.header(CONTENT_TYPE, "application/json");
            Body::from(v.to_string())
        }
        None => Body::empty(),
    };
    let resp = app.clone().oneshot(req.body(body).unwrap()).await.unwrap();
    let status = resp.status();
    let bytes = resp.into_body().collect().await.unwrap().to_bytes();
    let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
    (status, json)
}

async fn seed(app: &Router) -> (u64, u64) {
    let (status, teacher) = call(app, "POST", "/api/teachers", Some(ADMIN), Some(json!({"name": "Schmidt"}))).await;
    assert_eq!(status, StatusCode::CREATED);
    let tid = teacher["id"].as_u64().unwrap();
    let (status, quote) = call(
        app,
        "POST",
        "/api/quotes",
        Some(ADMIN),
        Some(json!({"teacher_id": tid, "context": "Physik", "text": "Die Katze und der Hund"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    (tid, quote["id"].as_u64().unwrap())
}

#[tokio::test]
async fn health_needs_no_credentials() {
    let app = app();
    let resp = app.clone().oneshot(Request::get("/health").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn credentials_are_checked() {
    let app = app();
    let resp = app.clone().oneshot(Request::get("/api/teachers").body(Body::empty()).unwrap()).await.unwrap();
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert!(resp.headers().contains_key(WWW_AUTHENTICATE));

    let (status, _) = call(&app, "GET", "/api/teachers", Some(("erika", "wrong")), None).await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    let (status, _) = call(&app, "GET", "/api/teachers", Some(("ERIKA", "pw")), None).await;
    assert_eq!(status, StatusCode::OK);

    let (status, body) = call(&app, "POST", "/api/teachers", Some(ERIKA), Some(json!({"name": "X"}))).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    assert!(body["error"].is_string());
    let (status, _) = call(&app, "POST", "/api/admin/regenerate", Some(ERIKA), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
}

#[tokio::test]
async fn vote_search_and_sorted_listing() {
    let app = app();
    let (_tid, qid) = seed(&app).await;

    let (status, voted) = call(&app, "PUT", &format!("/api/quotes/{qid}/vote/5"), Some(ERIKA), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(voted["stats"]["votes"], 1);
    assert_eq!(voted["own_vote"], json!({"rated": 5}));

    let (_, seen_by_admin) = call(&app, "GET", &format!("/api/quotes/{qid}"), Some(ADMIN), None).await;
    assert_eq!(seen_by_admin["own_vote"], "none");

    let (status, hits) = call(&app, "GET", "/api/quotes/search?q=katze", Some(ERIKA), None).await;
    assert_eq!(status, StatusCode::OK);
    let hits = hits.as_array().unwrap();
    assert_eq!(hits.len(), 1);
    assert_eq!(hits[0]["relevance"], 1.0);
    assert_eq!(hits[0]["highlighted"], "Die <em>Katze</em> und der Hund");

    let (status, _) = call(&app, "POST", "/api/admin/regenerate", Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::NO_CONTENT);
    let (status, page) = call(&app, "GET", "/api/quotes?order=popularity_desc&count=5", Some(ERIKA), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(page.as_array().unwrap().len(), 1);
    assert_eq!(page[0]["id"].as_u64(), Some(qid));

    let (status, _) = call(&app, "GET", "/api/quotes?order=sideways", Some(ERIKA), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (_, unordered) = call(&app, "GET", "/api/quotes", Some(ERIKA), None).await;
    assert_eq!(unordered.as_array().unwrap().len(), 1);
}

#[tokio::test]
async fn error_kinds_map_to_status_codes() {
    let app = app();
    let (tid, qid) = seed(&app).await;

    let (status, _) = call(&app, "PUT", &format!("/api/quotes/{qid}/vote/9"), Some(ERIKA), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = call(&app, "PUT", "/api/quotes/999/vote/3", Some(ERIKA), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(&app, "GET", "/api/teachers/999", Some(ERIKA), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = call(
        &app,
        "PUT",
        &format!("/api/quotes/{qid}"),
        Some(ADMIN),
        Some(json!({"teacher_id": tid, "text": ""})),
    )
    .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    let (status, removal) = call(&app, "DELETE", &format!("/api/teachers/{tid}"), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(removal["removed_quotes"], json!([qid]));
    let (status, _) = call(&app, "GET", &format!("/api/quotes/{qid}"), Some(ERIKA), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
}

#[tokio::test]
async fn file_backed_gallery_survives_reload() {
    let dir = tempdir().unwrap();
    let backend = FileBackend::open(dir.path()).unwrap();
    backend.insert_user(ADMIN.0, ADMIN.1, true).unwrap();
    let store: Arc<dyn Backend> = Arc::new(backend);
    let app = gallery_server::build_app(Arc::new(Gallery::open(store, manual()).unwrap()));

    let (tid, _qid) = seed(&app).await;
    let (status, renamed) =
        call(&app, "PUT", &format!("/api/teachers/{tid}"), Some(ADMIN), Some(json!({"name": "Schmitt"}))).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(renamed["name"], "Schmitt");

    let (status, report) = call(&app, "POST", "/api/admin/reload", Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report, json!({"quotes": 1, "teachers": 1}));

    let reopened: Arc<dyn Backend> = Arc::new(FileBackend::open(dir.path()).unwrap());
    let rows = reopened.load().unwrap();
    assert_eq!(rows.teachers[0].name, "Schmitt");
    assert_eq!(rows.quotes[0].context, "Physik");
}

#[tokio::test]
async fn submissions_wait_for_an_admin() {
    let app = app();
    let (tid, _qid) = seed(&app).await;

    let (status, by_name) = call(
        &app,
        "POST",
        "/api/quotes/submit",
        Some(ERIKA),
        Some(json!({"teacher": "Frau Schmidt", "context": "Flur", "text": "Nicht rennen!"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(by_name["teacher_id"], 0);
    assert_eq!(by_name["teacher_name"], "Frau Schmidt");
    let sid = by_name["id"].as_u64().unwrap();

    let (status, by_id) = call(
        &app,
        "POST",
        "/api/quotes/submit",
        Some(ERIKA),
        Some(json!({"teacher": tid, "text": "Wo ist die Hausaufgabe?"})),
    )
    .await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(by_id["teacher_id"], tid);

    // moderation is for admins only, and nothing is public yet
    let (status, _) = call(&app, "GET", "/api/unverifiedquotes", Some(ERIKA), None).await;
    assert_eq!(status, StatusCode::FORBIDDEN);
    let (_, hits) = call(&app, "GET", "/api/quotes/search?q=rennen", Some(ERIKA), None).await;
    assert_eq!(hits, json!([]));
    let (status, pending) = call(&app, "GET", "/api/unverifiedquotes", Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(pending.as_array().unwrap().len(), 2);

    let (status, edited) = call(
        &app,
        "PUT",
        &format!("/api/unverifiedquotes/{sid}"),
        Some(ADMIN),
        Some(json!({"teacher": "Frau Schmidt", "context": "Flur", "text": "Nicht im Flur rennen!"})),
    )
    .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(edited["text"], "Nicht im Flur rennen!");

    let (status, _) = call(&app, "PUT", &format!("/api/unverifiedquotes/{sid}/confirm"), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, assigned) =
        call(&app, "PUT", &format!("/api/unverifiedquotes/{sid}/assignteacher/{tid}"), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(assigned["teacher_id"], tid);

    let (status, quote) = call(&app, "PUT", &format!("/api/unverifiedquotes/{sid}/confirm"), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::CREATED);
    assert_eq!(quote["text"], "Nicht im Flur rennen!");
    let (_, hits) = call(&app, "GET", "/api/quotes/search?q=rennen", Some(ERIKA), None).await;
    assert_eq!(hits[0]["id"], quote["id"]);

    let other = by_id["id"].as_u64().unwrap();
    let (status, _) = call(&app, "DELETE", &format!("/api/unverifiedquotes/{other}"), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::OK);
    let (status, _) = call(&app, "DELETE", &format!("/api/unverifiedquotes/{other}"), Some(ADMIN), None).await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (_, pending) = call(&app, "GET", "/api/unverifiedquotes", Some(ADMIN), None).await;
    assert_eq!(pending, json!([]));
}
