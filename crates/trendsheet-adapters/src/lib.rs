//! Sheet reader contract + the Google Sheets service-account reader.

use std::fmt;
use std::path::{Path, PathBuf};

use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use jsonwebtoken::{encode, Algorithm, EncodingKey, Header};
use reqwest::{StatusCode, Url};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;
use tracing::{debug, info};
use trendsheet_core::{fit_row_width, RawRow};
use trendsheet_storage::{build_http_client, classify_status, FailureClass, HttpClientConfig};

pub const CRATE_NAME: &str = "trendsheet-adapters";

pub const DEFAULT_TOKEN_URI: &str = "https://oauth2.googleapis.com/token";
pub const DEFAULT_SHEETS_API_BASE: &str = "https://sheets.googleapis.com";

const JWT_BEARER_GRANT: &str = "urn:ietf:params:oauth:grant-type:jwt-bearer";
const SCOPES: [&str; 2] = [
    "https://www.googleapis.com/auth/spreadsheets.readonly",
    "https://www.googleapis.com/auth/drive.readonly",
];
const ASSERTION_LIFETIME_SECS: i64 = 3600;

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("sheet authentication failed: {0}")]
    Auth(String),
    #[error("sheet not found: {0}")]
    NotFound(String),
    #[error("transient sheet fetch failure: {0}")]
    Transient(String),
}

impl FetchError {
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Auth(_) => "auth",
            Self::NotFound(_) => "not_found",
            Self::Transient(_) => "transient",
        }
    }

    fn from_status(status: StatusCode, what: &str) -> Self {
        let message = format!("{what} returned http {}", status.as_u16());
        match classify_status(status) {
            FailureClass::Auth => Self::Auth(message),
            FailureClass::NotFound => Self::NotFound(message),
            FailureClass::Transient => Self::Transient(message),
        }
    }

    fn transport(err: reqwest::Error) -> Self {
        Self::Transient(err.to_string())
    }
}

/// Source of the raw sheet rows for one cycle. Implementations do not cache or retry.
#[async_trait]
pub trait SheetReader: Send + Sync {
    /// Data rows only: header skipped, blank-identifier rows dropped, width fitted.
    async fn read_rows(&self) -> Result<Vec<RawRow>, FetchError>;
}

/// Drop the header row and rows without an identifying cell, then fit every row to the
/// source width.
pub fn shape_rows(values: Vec<RawRow>) -> Vec<RawRow> {
    values
        .into_iter()
        .skip(1)
        .filter(|row| row.first().is_some_and(|cell| !cell.trim().is_empty()))
        .map(|row| fit_row_width(&row).to_vec())
        .collect()
}

/// Extract the spreadsheet id from a `.../spreadsheets/d/<id>/...` URL.
pub fn parse_spreadsheet_id(locator: &str) -> Result<String, FetchError> {
    let url = Url::parse(locator.trim())
        .map_err(|err| FetchError::NotFound(format!("invalid sheet url {locator:?}: {err}")))?;
    let segments: Vec<&str> = url.path_segments().map(|s| s.collect()).unwrap_or_default();
    segments
        .windows(3)
        .find(|w| w[0] == "spreadsheets" && w[1] == "d" && !w[2].is_empty())
        .map(|w| w[2].to_string())
        .ok_or_else(|| FetchError::NotFound(format!("no spreadsheet id in {locator:?}")))
}

#[derive(Clone, Deserialize)]
pub struct ServiceAccountKey {
    pub client_email: String,
    pub private_key: String,
    #[serde(default = "default_token_uri")]
    pub token_uri: String,
}

fn default_token_uri() -> String {
    DEFAULT_TOKEN_URI.to_string()
}

impl fmt::Debug for ServiceAccountKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceAccountKey")
            .field("client_email", &self.client_email)
            .field("private_key", &"<redacted>")
            .field("token_uri", &self.token_uri)
            .finish()
    }
}

impl ServiceAccountKey {
    pub async fn from_file(path: &Path) -> Result<Self, FetchError> {
        let text = tokio::fs::read_to_string(path).await.map_err(|err| {
            FetchError::Auth(format!(
                "service account file {} unreadable: {err}",
                path.display()
            ))
        })?;
        serde_json::from_str(&text).map_err(|err| {
            FetchError::Auth(format!(
                "service account file {} is not a valid key: {err}",
                path.display()
            ))
        })
    }

    fn signed_assertion(&self, issued_at: i64) -> Result<String, FetchError> {
        let claims = AssertionClaims {
            iss: &self.client_email,
            scope: SCOPES.join(" "),
            aud: &self.token_uri,
            iat: issued_at,
            exp: issued_at + ASSERTION_LIFETIME_SECS,
        };
        let key = EncodingKey::from_rsa_pem(self.private_key.as_bytes())
            .map_err(|err| FetchError::Auth(format!("invalid service account private key: {err}")))?;
        encode(&Header::new(Algorithm::RS256), &claims, &key)
            .map_err(|err| FetchError::Auth(format!("signing token assertion: {err}")))
    }
}

#[derive(Debug, Serialize)]
struct AssertionClaims<'a> {
    iss: &'a str,
    scope: String,
    aud: &'a str,
    iat: i64,
    exp: i64,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct ValueRange {
    #[serde(default)]
    values: Vec<Vec<JsonValue>>,
}

fn cell_to_string(value: JsonValue) -> String {
    match value {
        JsonValue::String(s) => s,
        JsonValue::Null => String::new(),
        other => other.to_string(),
    }
}

/// Already-resolved connection parameters for the sheet source.
#[derive(Debug, Clone)]
pub struct SheetConfig {
    pub credentials_path: Option<PathBuf>,
    pub sheet_url: Option<String>,
    /// A1 range read from the first worksheet.
    pub range: String,
    pub api_base: String,
    pub http: HttpClientConfig,
}

impl Default for SheetConfig {
    fn default() -> Self {
        Self {
            credentials_path: None,
            sheet_url: None,
            range: "A:Z".to_string(),
            api_base: DEFAULT_SHEETS_API_BASE.to_string(),
            http: HttpClientConfig {
                user_agent: Some(format!("trendsheet/{}", env!("CARGO_PKG_VERSION"))),
                ..Default::default()
            },
        }
    }
}

#[derive(Debug)]
pub struct GoogleSheetReader {
    config: SheetConfig,
    client: reqwest::Client,
}

impl GoogleSheetReader {
    pub fn new(config: SheetConfig) -> Result<Self> {
        let client = build_http_client(&config.http)?;
        Ok(Self { config, client })
    }

    async fn load_credentials(&self) -> Result<ServiceAccountKey, FetchError> {
        let path = self
            .config
            .credentials_path
            .as_deref()
            .ok_or_else(|| {
                FetchError::Auth("GOOGLE_SERVICE_ACCOUNT_FILE_PATH is not set".to_string())
            })?;
        ServiceAccountKey::from_file(path).await
    }

    async fn access_token(&self, key: &ServiceAccountKey) -> Result<String, FetchError> {
        let assertion = key.signed_assertion(Utc::now().timestamp())?;
        let resp = self
            .client
            .post(&key.token_uri)
            .form(&[("grant_type", JWT_BEARER_GRANT), ("assertion", assertion.as_str())])
            .send()
            .await
            .map_err(FetchError::transport)?;

        let status = resp.status();
        if !status.is_success() {
            // The token endpoint answers rejected grants with 400.
            return Err(if status == StatusCode::BAD_REQUEST {
                FetchError::Auth(format!("token endpoint rejected grant for {}", key.client_email))
            } else {
                FetchError::from_status(status, "token endpoint")
            });
        }

        let token: TokenResponse = resp
            .json()
            .await
            .map_err(|err| FetchError::Transient(format!("decoding token response: {err}")))?;
        debug!(client_email = %key.client_email, "access token issued");
        Ok(token.access_token)
    }

    fn values_url(&self, spreadsheet_id: &str) -> Result<Url, FetchError> {
        let mut url = Url::parse(&self.config.api_base).map_err(|err| {
            FetchError::NotFound(format!("invalid sheets api base {:?}: {err}", self.config.api_base))
        })?;
        url.path_segments_mut()
            .map_err(|_| FetchError::NotFound(format!("unusable sheets api base {}", self.config.api_base)))?
            .pop_if_empty()
            .extend(["v4", "spreadsheets", spreadsheet_id, "values", self.config.range.as_str()]);
        Ok(url)
    }
}

#[async_trait]
impl SheetReader for GoogleSheetReader {
    async fn read_rows(&self) -> Result<Vec<RawRow>, FetchError> {
        let locator = self
            .config
            .sheet_url
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| FetchError::Auth("SHEET_URL is not set".to_string()))?;
        let spreadsheet_id = parse_spreadsheet_id(locator)?;
        let key = self.load_credentials().await?;
        let token = self.access_token(&key).await?;

        let resp = self
            .client
            .get(self.values_url(&spreadsheet_id)?)
            .bearer_auth(token)
            .query(&[("majorDimension", "ROWS")])
            .send()
            .await
            .map_err(FetchError::transport)?;

        let status = resp.status();
        if !status.is_success() {
            return Err(FetchError::from_status(status, "sheets values endpoint"));
        }

        let body: ValueRange = resp
            .json()
            .await
            .map_err(|err| FetchError::Transient(format!("decoding sheet values: {err}")))?;
        let values = body
            .values
            .into_iter()
            .map(|row| row.into_iter().map(cell_to_string).collect())
            .collect::<Vec<RawRow>>();
        let fetched = values.len();
        let rows = shape_rows(values);

        info!(%spreadsheet_id, fetched, rows = rows.len(), "sheet rows read");
        Ok(rows)
    }
}
