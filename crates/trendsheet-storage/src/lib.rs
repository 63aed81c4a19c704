//! Snapshot archive, relational store loader + HTTP client utilities for the trend sheet ingest.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use anyhow::Context;
use async_trait::async_trait;
use reqwest::{StatusCode, Url};
use sha2::{Digest, Sha256};
use sqlx::any::install_default_drivers;
use sqlx::{Any, AnyConnection, Connection, QueryBuilder};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};
use trendsheet_core::{Batch, IngestStamp, Record, RECORD_COLUMNS};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trendsheet-storage";

pub const SNAPSHOT_PREFIX: &str = "stock_data_backup_";

pub const STOCK_DATA_TABLE: &str = "stock_data";

pub const STOCK_DATA_DDL: &str = r#"
CREATE TABLE IF NOT EXISTS stock_data (
    Symbols VARCHAR(64) NOT NULL,
    Multi_Months_View VARCHAR(64) NOT NULL,
    Multi_Weeks_View VARCHAR(64) NOT NULL,
    Weekly_View VARCHAR(64) NOT NULL,
    Day_View VARCHAR(64) NOT NULL,
    date DATE NOT NULL,
    time TIME NOT NULL
)
"#;

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot io error at {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl SnapshotError {
    fn io(path: impl Into<PathBuf>, source: impl Into<std::io::Error>) -> Self {
        Self::Io {
            path: path.into(),
            source: source.into(),
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Io { .. } => "io",
        }
    }
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub path: PathBuf,
    pub file_name: String,
    pub rows: usize,
    pub sha256: String,
    pub byte_size: usize,
}

/// Durable, append-only sink for one batch.
#[async_trait]
pub trait SnapshotWriter: Send + Sync {
    async fn write(&self, batch: &Batch) -> Result<StoredSnapshot, SnapshotError>;
}

#[derive(Debug, Clone)]
pub struct CsvSnapshotWriter {
    dir: PathBuf,
}

impl CsvSnapshotWriter {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

#[async_trait]
impl SnapshotWriter for CsvSnapshotWriter {
    async fn write(&self, batch: &Batch) -> Result<StoredSnapshot, SnapshotError> {
        write_snapshot(&self.dir, batch).await
    }
}

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// `stock_data_backup_<DD-MM-YY>_<HH>`: same-hour cycles share a base name.
pub fn snapshot_base_name(stamp: IngestStamp) -> String {
    format!(
        "{SNAPSHOT_PREFIX}{}_{}",
        stamp.date.format("%d-%m-%y"),
        stamp.time.format("%H")
    )
}

pub fn snapshot_file_name(base: &str, suffix: u32) -> String {
    if suffix == 0 {
        format!("{base}.csv")
    } else {
        format!("{base}_{suffix}.csv")
    }
}

pub fn encode_csv(records: &[Record]) -> Result<Vec<u8>, csv::Error> {
    let mut writer = csv::WriterBuilder::new()
        .has_headers(false)
        .from_writer(Vec::new());
    writer.write_record(RECORD_COLUMNS)?;
    for record in records {
        writer.serialize(record)?;
    }
    writer
        .into_inner()
        .map_err(|err| csv::Error::from(err.into_error()))
}

/// Write the batch as a new CSV file in `dir`, never replacing an existing snapshot.
///
/// The bytes land in a synced temp file first; the final name is then claimed with a hard
/// link, which fails on an existing path, so concurrent writers cannot clobber each other.
pub async fn write_snapshot(dir: &Path, batch: &Batch) -> Result<StoredSnapshot, SnapshotError> {
    fs::create_dir_all(dir)
        .await
        .map_err(|err| SnapshotError::io(dir, err))?;

    let bytes = encode_csv(batch.records()).map_err(|err| SnapshotError::io(dir, err))?;
    let sha256 = sha256_hex(&bytes);

    let temp_path = dir.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
    write_synced(&temp_path, &bytes).await?;

    let claimed = claim_free_name(&temp_path, dir, &snapshot_base_name(batch.stamp())).await;
    if let Err(err) = fs::remove_file(&temp_path).await {
        warn!(path = %temp_path.display(), error = %err, "removing snapshot temp file failed");
    }
    let (path, file_name) = claimed?;

    info!(path = %path.display(), rows = batch.len(), "snapshot written");
    Ok(StoredSnapshot {
        path,
        file_name,
        rows: batch.len(),
        sha256,
        byte_size: bytes.len(),
    })
}

async fn write_synced(path: &Path, bytes: &[u8]) -> Result<(), SnapshotError> {
    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(path)
        .await
        .map_err(|err| SnapshotError::io(path, err))?;
    file.write_all(bytes)
        .await
        .map_err(|err| SnapshotError::io(path, err))?;
    file.flush()
        .await
        .map_err(|err| SnapshotError::io(path, err))?;
    file.sync_all()
        .await
        .map_err(|err| SnapshotError::io(path, err))?;
    Ok(())
}

async fn claim_free_name(
    temp_path: &Path,
    dir: &Path,
    base: &str,
) -> Result<(PathBuf, String), SnapshotError> {
    let mut suffix = 0u32;
    loop {
        let file_name = snapshot_file_name(base, suffix);
        let candidate = dir.join(&file_name);
        match fs::hard_link(temp_path, &candidate).await {
            Ok(()) => return Ok((candidate, file_name)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(%file_name, "snapshot name taken");
                suffix = suffix
                    .checked_add(1)
                    .ok_or_else(|| SnapshotError::io(&candidate, std::io::ErrorKind::AlreadyExists))?;
            }
            Err(err) => return Err(SnapshotError::io(candidate, err)),
        }
    }
}

/// Snapshot files in `dir`, most recently written first.
pub fn list_snapshots(dir: &Path) -> Result<Vec<PathBuf>, SnapshotError> {
    let mut entries = std::fs::read_dir(dir)
        .map_err(|err| SnapshotError::io(dir, err))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_file()).unwrap_or(false))
        .filter(|entry| {
            let name = entry.file_name().to_string_lossy().to_string();
            name.starts_with(SNAPSHOT_PREFIX) && name.ends_with(".csv")
        })
        .map(|entry| {
            let modified = entry
                .metadata()
                .and_then(|m| m.modified())
                .unwrap_or(SystemTime::UNIX_EPOCH);
            (modified, entry.path())
        })
        .collect::<Vec<_>>();
    entries.sort();
    entries.reverse();
    Ok(entries.into_iter().map(|(_, path)| path).collect())
}

pub fn latest_snapshot(dir: &Path) -> Result<Option<PathBuf>, SnapshotError> {
    Ok(list_snapshots(dir)?.into_iter().next())
}

pub fn read_snapshot(path: &Path) -> Result<Vec<Record>, SnapshotError> {
    let mut reader = csv::Reader::from_path(path).map_err(|err| SnapshotError::io(path, err))?;
    reader
        .deserialize()
        .collect::<Result<Vec<Record>, _>>()
        .map_err(|err| SnapshotError::io(path, err))
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("store connection error: {0}")]
    Connection(String),
    #[error("store insert error: {0}")]
    Insert(#[source] sqlx::Error),
}

impl StoreError {
    fn connection(err: impl fmt::Display) -> Self {
        Self::Connection(err.to_string())
    }

    pub fn kind(&self) -> &'static str {
        match self {
            Self::Connection(_) => "connection",
            Self::Insert(_) => "insert",
        }
    }
}

/// Resolved store connection parameters.
#[derive(Clone)]
pub struct StoreConfig {
    /// Full connection URL; takes precedence over the individual parts.
    pub database_url: Option<String>,
    pub host: String,
    pub port: u16,
    pub user: Option<String>,
    pub password: Option<String>,
    pub database: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            database_url: None,
            host: "localhost".to_string(),
            port: 3306,
            user: None,
            password: None,
            database: "stock_data_d1".to_string(),
        }
    }
}

impl fmt::Debug for StoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("StoreConfig")
            .field("database_url", &self.database_url.as_ref().map(|_| "<set>"))
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("database", &self.database)
            .finish()
    }
}

impl StoreConfig {
    pub fn with_url(database_url: impl Into<String>) -> Self {
        Self {
            database_url: Some(database_url.into()),
            ..Default::default()
        }
    }

    pub fn connection_url(&self) -> Result<String, StoreError> {
        if let Some(url) = self.database_url.as_deref().filter(|u| !u.trim().is_empty()) {
            return Ok(url.to_string());
        }
        let user = self
            .user
            .as_deref()
            .filter(|u| !u.trim().is_empty())
            .ok_or_else(|| StoreError::Connection("DB_USER is not set".to_string()))?;

        let mut url = Url::parse(&format!("mysql://{}", self.host))
            .map_err(|err| StoreError::Connection(format!("invalid DB_HOST {:?}: {err}", self.host)))?;
        let invalid = |part: &str| StoreError::Connection(format!("cannot apply {part} to store url"));
        url.set_port(Some(self.port)).map_err(|_| invalid("port"))?;
        url.set_username(user).map_err(|_| invalid("user"))?;
        url.set_password(self.password.as_deref())
            .map_err(|_| invalid("password"))?;
        url.set_path(&self.database);
        Ok(url.to_string())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LoadReceipt {
    pub rows_inserted: u64,
}

/// All-or-nothing sink for one batch.
#[async_trait]
pub trait StoreLoader: Send + Sync {
    async fn load(&self, batch: &Batch) -> Result<LoadReceipt, StoreError>;
}

#[derive(Debug, Clone)]
pub struct SqlStoreLoader {
    config: StoreConfig,
    chunk_rows: usize,
    timeout: Duration,
}

impl SqlStoreLoader {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            chunk_rows: 500,
            timeout: Duration::from_secs(60),
        }
    }

    /// Rows per `INSERT` statement; every statement still shares the one transaction.
    pub fn with_chunk_rows(mut self, chunk_rows: usize) -> Self {
        self.chunk_rows = chunk_rows.max(1);
        self
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

#[async_trait]
impl StoreLoader for SqlStoreLoader {
    async fn load(&self, batch: &Batch) -> Result<LoadReceipt, StoreError> {
        if batch.is_empty() {
            return Ok(LoadReceipt { rows_inserted: 0 });
        }
        let url = self.config.connection_url()?;
        let rows_inserted = with_timeout(
            self.timeout,
            insert_batch(&url, batch.records(), self.chunk_rows),
        )
        .await??;
        info!(rows = rows_inserted, "batch committed to store");
        Ok(LoadReceipt { rows_inserted })
    }
}

async fn with_timeout<F: std::future::Future>(
    limit: Duration,
    fut: F,
) -> Result<F::Output, StoreError> {
    tokio::time::timeout(limit, fut)
        .await
        .map_err(|_| StoreError::Connection(format!("store call timed out after {limit:?}")))
}

/// Open a connection, insert every record inside one transaction, close the connection.
pub async fn insert_batch(url: &str, records: &[Record], chunk_rows: usize) -> Result<u64, StoreError> {
    install_default_drivers();
    let mut conn = AnyConnection::connect(url)
        .await
        .map_err(StoreError::connection)?;

    let outcome = insert_in_transaction(&mut conn, records, chunk_rows).await;

    if let Err(err) = conn.close().await {
        warn!(error = %err, "closing store connection failed");
    }
    outcome
}

async fn insert_in_transaction(
    conn: &mut AnyConnection,
    records: &[Record],
    chunk_rows: usize,
) -> Result<u64, StoreError> {
    let mut tx = conn.begin().await.map_err(StoreError::connection)?;
    let mut inserted = 0u64;

    for chunk in records.chunks(chunk_rows.max(1)) {
        let mut query = insert_query(chunk);
        let executed = query.build().execute(&mut *tx).await;
        match executed {
            Ok(done) => inserted += done.rows_affected(),
            Err(err) => {
                if let Err(rollback_err) = tx.rollback().await {
                    warn!(error = %rollback_err, "rollback after failed insert also failed");
                }
                return Err(StoreError::Insert(err));
            }
        }
    }

    tx.commit().await.map_err(StoreError::Insert)?;
    Ok(inserted)
}

fn insert_query(records: &[Record]) -> QueryBuilder<'static, Any> {
    let mut query = QueryBuilder::<Any>::new(format!(
        "INSERT INTO {STOCK_DATA_TABLE} ({}) ",
        RECORD_COLUMNS.join(", ")
    ));
    query.push_values(records, |mut row, record| {
        row.push_bind(record.symbol.clone())
            .push_bind(record.multi_months_view.clone())
            .push_bind(record.multi_weeks_view.clone())
            .push_bind(record.weekly_view.clone())
            .push_bind(record.day_view.clone())
            .push_bind(record.observed_date.format("%Y-%m-%d").to_string())
            .push_bind(record.observed_time.format("%H:%M:%S").to_string());
    });
    query
}

/// Create `stock_data` if it does not exist yet.
pub async fn ensure_schema(config: &StoreConfig, limit: Duration) -> Result<(), StoreError> {
    let url = config.connection_url()?;
    with_timeout(limit, async {
        install_default_drivers();
        let mut conn = AnyConnection::connect(&url)
            .await
            .map_err(StoreError::connection)?;
        let outcome = sqlx::query(STOCK_DATA_DDL)
            .execute(&mut conn)
            .await
            .map(|_| ())
            .map_err(StoreError::Insert);
        if let Err(err) = conn.close().await {
            warn!(error = %err, "closing store connection failed");
        }
        outcome
    })
    .await?
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureClass {
    Auth,
    NotFound,
    Transient,
}

pub fn classify_status(status: StatusCode) -> FailureClass {
    match status {
        StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN => FailureClass::Auth,
        StatusCode::NOT_FOUND => FailureClass::NotFound,
        _ => FailureClass::Transient,
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(30),
            user_agent: None,
        }
    }
}

pub fn build_http_client(config: &HttpClientConfig) -> anyhow::Result<reqwest::Client> {
    let mut builder = reqwest::Client::builder()
        .gzip(true)
        .brotli(true)
        .timeout(config.timeout);

    if let Some(user_agent) = &config.user_agent {
        builder = builder.user_agent(user_agent.clone());
    }

    builder.build().context("building reqwest client")
}
