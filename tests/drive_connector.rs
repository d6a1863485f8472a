//! Drive connector against a local mock of the Drive and token endpoints.

use axum::extract::{Form, Path as UrlPath, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Json, Router};
use chrono::{Duration as ChronoDuration, Utc};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tempfile::TempDir;

use pdf_relay::config::{DriveSourceConfig, DRIVE_READONLY_SCOPE};
use pdf_relay::connector_drive::{AuthOptions, DriveConnector};
use pdf_relay::error::AuthError;
use pdf_relay::oauth::OAuthCredential;
use pdf_relay::traits::Connector;

const GOOD_TOKEN: &str = "fresh-token";

#[derive(Default)]
struct Calls {
    refreshes: usize,
    queries: Vec<String>,
    reject_everything: bool,
}

type Shared = Arc<Mutex<Calls>>;

fn authorized(headers: &HeaderMap, calls: &Shared) -> bool {
    if calls.lock().unwrap().reject_everything {
        return false;
    }
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v == format!("Bearer {}", GOOD_TOKEN))
}

async fn list_files(
    State(calls): State<Shared>,
    headers: HeaderMap,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers, &calls) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    calls
        .lock()
        .unwrap()
        .queries
        .push(params.get("q").cloned().unwrap_or_default());

    let body = match params.get("pageToken").map(String::as_str) {
        None => serde_json::json!({
            "nextPageToken": "page-2",
            "files": [
                {"id": "f1", "name": "Invoice March.pdf", "size": "1024", "modifiedTime": "2024-03-01T09:00:00Z"},
                {"id": "f2", "name": "Lease.pdf", "size": "2048", "modifiedTime": "2024-03-02T09:00:00Z"}
            ]
        }),
        Some("page-2") => serde_json::json!({
            "files": [
                {"id": "f3", "name": "Receipt.pdf", "modifiedTime": "2024-03-03T09:00:00.123Z"}
            ]
        }),
        Some(_) => return StatusCode::BAD_REQUEST.into_response(),
    };
    Json(body).into_response()
}

async fn download(
    State(calls): State<Shared>,
    headers: HeaderMap,
    UrlPath(id): UrlPath<String>,
    Query(params): Query<HashMap<String, String>>,
) -> Response {
    if !authorized(&headers, &calls) {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    if params.get("alt").map(String::as_str) != Some("media") {
        return StatusCode::BAD_REQUEST.into_response();
    }
    match id.as_str() {
        "f1" => b"%PDF-1.4 invoice".to_vec().into_response(),
        _ => StatusCode::NOT_FOUND.into_response(),
    }
}

async fn token(State(calls): State<Shared>, Form(form): Form<HashMap<String, String>>) -> Response {
    let valid = form.get("grant_type").map(String::as_str) == Some("refresh_token")
        && form.get("refresh_token").map(String::as_str) == Some("refresh-1")
        && form.get("client_id").map(String::as_str) == Some("client-id");
    if !valid {
        return (StatusCode::BAD_REQUEST, "invalid_grant").into_response();
    }
    calls.lock().unwrap().refreshes += 1;
    Json(serde_json::json!({
        "access_token": GOOD_TOKEN,
        "expires_in": 3600,
        "token_type": "Bearer"
    }))
    .into_response()
}

struct MockDrive {
    _tmp: TempDir,
    calls: Shared,
    config: DriveSourceConfig,
    cache: PathBuf,
}

async fn mock_drive(cached: OAuthCredential) -> MockDrive {
    let calls: Shared = Arc::default();
    let app = Router::new()
        .route("/drive/v3/files", get(list_files))
        .route("/drive/v3/files/{id}", get(download))
        .route("/token", post(token))
        .with_state(calls.clone());

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });

    let tmp = TempDir::new().unwrap();
    let secrets = tmp.path().join("client_secret.json");
    std::fs::write(
        &secrets,
        serde_json::json!({
            "installed": {
                "client_id": "client-id",
                "client_secret": "client-secret",
                "token_uri": format!("http://{}/token", addr),
                "redirect_uris": ["http://localhost"]
            }
        })
        .to_string(),
    )
    .unwrap();
    let cache = tmp.path().join("client_secret_token.json");
    write_cache(&cache, &cached);

    let config = DriveSourceConfig {
        folder_id: "folder-123".into(),
        client_secrets: secrets,
        token_cache: None,
        page_size: 2,
        scopes: vec![DRIVE_READONLY_SCOPE.to_string()],
        mime_type: "application/pdf".into(),
        api_base: format!("http://{}/drive/v3/", addr),
        timeout_secs: 10,
    };

    MockDrive {
        _tmp: tmp,
        calls,
        config,
        cache,
    }
}

fn write_cache(path: &Path, credential: &OAuthCredential) {
    std::fs::write(path, serde_json::to_vec(credential).unwrap()).unwrap();
}

fn credential(access_token: &str, expires_in_secs: i64) -> OAuthCredential {
    OAuthCredential {
        access_token: access_token.into(),
        refresh_token: Some("refresh-1".into()),
        expiry: Some(Utc::now() + ChronoDuration::seconds(expires_in_secs)),
        scopes: vec![DRIVE_READONLY_SCOPE.to_string()],
        token_type: "Bearer".into(),
    }
}

fn headless() -> AuthOptions {
    AuthOptions {
        headless: true,
        force_reauth: false,
    }
}

#[tokio::test]
async fn expired_token_is_refreshed_and_cache_rewritten() {
    let drive = mock_drive(credential("stale-token", -600)).await;
    let connector = DriveConnector::from_config(&drive.config, headless()).unwrap();

    connector.authenticate().await.unwrap();

    assert_eq!(drive.calls.lock().unwrap().refreshes, 1);
    let cached: OAuthCredential =
        serde_json::from_slice(&std::fs::read(&drive.cache).unwrap()).unwrap();
    assert_eq!(cached.access_token, GOOD_TOKEN);
    assert_eq!(cached.refresh_token.as_deref(), Some("refresh-1"));
    assert!(!cached.is_expired(Utc::now()));
}

#[tokio::test]
async fn listing_follows_every_page() {
    let drive = mock_drive(credential(GOOD_TOKEN, 3600)).await;
    let connector = DriveConnector::from_config(&drive.config, headless()).unwrap();

    let documents = connector.list_pending().await.unwrap();

    let ids: Vec<&str> = documents.iter().map(|d| d.id.as_str()).collect();
    assert_eq!(ids, ["f1", "f2", "f3"]);
    assert_eq!(documents[0].title, "Invoice March.pdf");
    assert_eq!(documents[0].size, Some(1024));
    assert_eq!(documents[2].size, None);
    assert!(documents[2].modified_time.is_some());

    let calls = drive.calls.lock().unwrap();
    assert_eq!(calls.refreshes, 0);
    assert_eq!(calls.queries.len(), 2);
    assert_eq!(
        calls.queries[0],
        "'folder-123' in parents and mimeType='application/pdf' and trashed = false"
    );
}

#[tokio::test]
async fn fetch_downloads_media() {
    let drive = mock_drive(credential(GOOD_TOKEN, 3600)).await;
    let connector = DriveConnector::from_config(&drive.config, headless()).unwrap();

    let documents = connector.list_pending().await.unwrap();
    let bytes = connector.fetch(&documents[0]).await.unwrap();
    assert_eq!(bytes, b"%PDF-1.4 invoice");

    let err = connector.fetch(&documents[1]).await.unwrap_err();
    assert!(err.downcast_ref::<AuthError>().is_none());
    assert!(err.to_string().contains("404"));
}

#[tokio::test]
async fn unauthorized_response_triggers_one_refresh() {
    // Looks valid locally, but the server no longer accepts it.
    let drive = mock_drive(credential("revoked-token", 3600)).await;
    let connector = DriveConnector::from_config(&drive.config, headless()).unwrap();

    let documents = connector.list_pending().await.unwrap();

    assert_eq!(documents.len(), 3);
    assert_eq!(drive.calls.lock().unwrap().refreshes, 1);
}

#[tokio::test]
async fn repeated_unauthorized_is_an_auth_error() {
    let drive = mock_drive(credential(GOOD_TOKEN, 3600)).await;
    drive.calls.lock().unwrap().reject_everything = true;
    let connector = DriveConnector::from_config(&drive.config, headless()).unwrap();

    let err = connector.list_pending().await.unwrap_err();

    match err.downcast_ref::<AuthError>() {
        Some(AuthError::Rejected { status }) => assert_eq!(*status, 401),
        other => panic!("expected AuthError::Rejected, got {:?}", other),
    }
    assert_eq!(drive.calls.lock().unwrap().refreshes, 1);
}

#[tokio::test]
async fn missing_client_secrets_is_reported() {
    let drive = mock_drive(credential(GOOD_TOKEN, 3600)).await;
    let mut config = drive.config.clone();
    config.client_secrets = PathBuf::from("/nonexistent/client_secret.json");

    let err = DriveConnector::from_config(&config, headless())
        .err()
        .expect("missing secrets must fail");
    assert!(matches!(
        err.downcast_ref::<AuthError>(),
        Some(AuthError::Secrets { .. })
    ));
}
