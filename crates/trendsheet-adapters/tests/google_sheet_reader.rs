//! Reader behaviour against a local stand-in for the token and Sheets endpoints.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use axum::{
    extract::{Form, Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use tempfile::TempDir;
use tokio::net::TcpListener;
use trendsheet_adapters::{FetchError, GoogleSheetReader, SheetConfig, SheetReader};

const TEST_KEY_PEM: &str = include_str!("fixtures/test_service_account_key.pem");
const SHEET_ID: &str = "sheet-123";

#[derive(Clone)]
struct Stub {
    token_status: StatusCode,
    values_status: StatusCode,
    values: serde_json::Value,
    seen_auth: Arc<Mutex<Vec<String>>>,
}

impl Stub {
    fn ok(values: serde_json::Value) -> Self {
        Self {
            token_status: StatusCode::OK,
            values_status: StatusCode::OK,
            values,
            seen_auth: Arc::default(),
        }
    }
}

async fn token_handler(State(stub): State<Stub>, Form(form): Form<HashMap<String, String>>) -> Response {
    if stub.token_status != StatusCode::OK {
        return (stub.token_status, Json(json!({"error": "invalid_grant"}))).into_response();
    }
    let grant_ok = form.get("grant_type").map(String::as_str)
        == Some("urn:ietf:params:oauth:grant-type:jwt-bearer");
    let assertion_parts = form
        .get("assertion")
        .map(|a| a.split('.').count())
        .unwrap_or(0);
    if !grant_ok || assertion_parts != 3 {
        return (StatusCode::BAD_REQUEST, "malformed grant").into_response();
    }
    Json(json!({"access_token": "test-token", "expires_in": 3600, "token_type": "Bearer"}))
        .into_response()
}

async fn values_handler(
    State(stub): State<Stub>,
    Path((sheet_id, range)): Path<(String, String)>,
    headers: HeaderMap,
) -> Response {
    if let Some(auth) = headers.get("authorization").and_then(|v| v.to_str().ok()) {
        stub.seen_auth.lock().unwrap().push(auth.to_string());
    }
    if sheet_id != SHEET_ID || range != "A:Z" {
        return (StatusCode::NOT_FOUND, "no such sheet").into_response();
    }
    (stub.values_status, Json(stub.values.clone())).into_response()
}

async fn spawn_stub(stub: Stub) -> String {
    let app = Router::new()
        .route("/token", post(token_handler))
        .route("/v4/spreadsheets/{sheet_id}/values/{range}", get(values_handler))
        .with_state(stub);
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let addr = listener.local_addr().expect("addr");
    tokio::spawn(async move {
        axum::serve(listener, app).await.expect("serve");
    });
    format!("http://{addr}")
}

fn write_credentials(dir: &TempDir, token_uri: &str) -> std::path::PathBuf {
    let path = dir.path().join("service_account.json");
    let key = json!({
        "type": "service_account",
        "client_email": "ingest@example.iam.gserviceaccount.com",
        "private_key": TEST_KEY_PEM,
        "token_uri": token_uri,
    });
    std::fs::write(&path, serde_json::to_vec_pretty(&key).unwrap()).expect("write key");
    path
}

fn reader(base: &str, dir: &TempDir, sheet_id: &str) -> GoogleSheetReader {
    GoogleSheetReader::new(SheetConfig {
        credentials_path: Some(write_credentials(dir, &format!("{base}/token"))),
        sheet_url: Some(format!(
            "https://docs.google.com/spreadsheets/d/{sheet_id}/edit?gid=0"
        )),
        api_base: base.to_string(),
        ..Default::default()
    })
    .expect("reader")
}

#[tokio::test]
async fn reads_and_shapes_sheet_rows() {
    let stub = Stub::ok(json!({
        "range": "Sheet1!A1:Z4",
        "majorDimension": "ROWS",
        "values": [
            ["Symbols", "Multi_Months_View", "Multi_Weeks_View", "Weekly_View", "Day_View"],
            ["AAPL", "Bullish"],
            ["", "x", "x", "x", "x"],
            ["MSFT", "Bearish", "Bullish", "", "Bearish Sideways", "note"],
            [7203, "Bullish", "Bullish", "Bullish", "Bullish"]
        ]
    }));
    let seen_auth = stub.seen_auth.clone();
    let base = spawn_stub(stub).await;
    let dir = tempfile::tempdir().unwrap();

    let rows = reader(&base, &dir, SHEET_ID).read_rows().await.expect("rows");

    assert_eq!(
        rows,
        vec![
            vec!["AAPL", "Bullish", "", "", ""],
            vec!["MSFT", "Bearish", "Bullish", "", "Bearish Sideways"],
            vec!["7203", "Bullish", "Bullish", "Bullish", "Bullish"],
        ]
    );
    assert_eq!(seen_auth.lock().unwrap().as_slice(), ["Bearer test-token"]);
}

#[tokio::test]
async fn empty_sheet_yields_no_rows() {
    let base = spawn_stub(Stub::ok(json!({"range": "Sheet1!A1:Z1000"}))).await;
    let dir = tempfile::tempdir().unwrap();

    let rows = reader(&base, &dir, SHEET_ID).read_rows().await.expect("rows");
    assert!(rows.is_empty());
}

#[tokio::test]
async fn unknown_sheet_is_not_found() {
    let base = spawn_stub(Stub::ok(json!({"values": []}))).await;
    let dir = tempfile::tempdir().unwrap();

    let err = reader(&base, &dir, "some-other-sheet")
        .read_rows()
        .await
        .expect_err("missing sheet");
    assert!(matches!(err, FetchError::NotFound(_)), "{err}");
}

#[tokio::test]
async fn rejected_grant_is_auth_error() {
    let stub = Stub {
        token_status: StatusCode::BAD_REQUEST,
        ..Stub::ok(json!({"values": []}))
    };
    let base = spawn_stub(stub).await;
    let dir = tempfile::tempdir().unwrap();

    let err = reader(&base, &dir, SHEET_ID)
        .read_rows()
        .await
        .expect_err("grant rejected");
    assert!(matches!(err, FetchError::Auth(_)), "{err}");
}

#[tokio::test]
async fn forbidden_sheet_is_auth_error() {
    let stub = Stub {
        values_status: StatusCode::FORBIDDEN,
        ..Stub::ok(json!({"error": {"code": 403}}))
    };
    let base = spawn_stub(stub).await;
    let dir = tempfile::tempdir().unwrap();

    let err = reader(&base, &dir, SHEET_ID)
        .read_rows()
        .await
        .expect_err("forbidden");
    assert_eq!(err.kind(), "auth");
}

#[tokio::test]
async fn upstream_outage_is_transient() {
    let stub = Stub {
        values_status: StatusCode::SERVICE_UNAVAILABLE,
        ..Stub::ok(json!({"error": {"code": 503}}))
    };
    let base = spawn_stub(stub).await;
    let dir = tempfile::tempdir().unwrap();

    let err = reader(&base, &dir, SHEET_ID)
        .read_rows()
        .await
        .expect_err("outage");
    assert_eq!(err.kind(), "transient");
}

#[tokio::test]
async fn unreachable_endpoint_is_transient() {
    let listener = TcpListener::bind("127.0.0.1:0").await.expect("bind");
    let base = format!("http://{}", listener.local_addr().unwrap());
    drop(listener);
    let dir = tempfile::tempdir().unwrap();

    let err = reader(&base, &dir, SHEET_ID)
        .read_rows()
        .await
        .expect_err("connection refused");
    assert_eq!(err.kind(), "transient");
}

#[tokio::test]
async fn missing_configuration_is_auth_error() {
    let unconfigured = GoogleSheetReader::new(SheetConfig::default()).expect("reader");
    let err = unconfigured.read_rows().await.expect_err("no sheet url");
    assert_eq!(err.kind(), "auth");

    let dir = tempfile::tempdir().unwrap();
    let no_key_file = GoogleSheetReader::new(SheetConfig {
        credentials_path: Some(dir.path().join("absent.json")),
        sheet_url: Some(format!("https://docs.google.com/spreadsheets/d/{SHEET_ID}/edit")),
        ..Default::default()
    })
    .expect("reader");
    let err = no_key_file.read_rows().await.expect_err("no key file");
    assert_eq!(err.kind(), "auth");
}
