//! Ingest cycle orchestration: fetch, normalize, snapshot, load, on a fixed interval.

use std::collections::{BTreeMap, BTreeSet};
use std::convert::Infallible;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use async_trait::async_trait;
use chrono::{Local, NaiveDate, NaiveDateTime};
use serde::Serialize;
use tracing::{error, info, info_span, warn, Instrument};
use trendsheet_adapters::{FetchError, GoogleSheetReader, SheetConfig, SheetReader};
use trendsheet_core::{normalize_rows, Horizon, IngestStamp, RawRow, Record};
use trendsheet_storage::{
    list_snapshots, read_snapshot, CsvSnapshotWriter, SnapshotWriter, SqlStoreLoader, StoreConfig,
    StoreLoader,
};
use uuid::Uuid;

pub const CRATE_NAME: &str = "trendsheet-sync";

pub const DEFAULT_INTERVAL: Duration = Duration::from_secs(3600);

#[derive(Debug, Clone)]
pub struct IngestConfig {
    pub sheet: SheetConfig,
    pub store: StoreConfig,
    pub snapshot_dir: PathBuf,
    pub interval: Duration,
    pub fetch_timeout: Duration,
    pub store_timeout: Duration,
    pub store_chunk_rows: usize,
}

impl IngestConfig {
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Resolve every setting through `lookup`; blank values count as unset.
    pub fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let get = |name: &str| lookup(name).filter(|v| !v.trim().is_empty());
        let secs = |name: &str, default: u64| {
            let value = match get(name).and_then(|v| v.trim().parse::<u64>().ok()) {
                Some(0) => {
                    warn!(variable = name, default_secs = default, "zero duration rejected; using default");
                    default
                }
                Some(value) => value,
                None => default,
            };
            Duration::from_secs(value)
        };

        let mut sheet = SheetConfig {
            credentials_path: get("GOOGLE_SERVICE_ACCOUNT_FILE_PATH").map(PathBuf::from),
            sheet_url: get("SHEET_URL"),
            ..Default::default()
        };
        if let Some(range) = get("SHEET_RANGE") {
            sheet.range = range;
        }
        if let Some(api_base) = get("SHEETS_API_BASE") {
            sheet.api_base = api_base;
        }
        let fetch_timeout = secs("FETCH_TIMEOUT_SECS", 60);
        sheet.http.timeout = fetch_timeout;

        let defaults = StoreConfig::default();
        let store = StoreConfig {
            database_url: get("DATABASE_URL"),
            host: get("DB_HOST").unwrap_or(defaults.host),
            port: get("DB_PORT")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(defaults.port),
            user: get("DB_USER"),
            password: get("DB_PASSWORD"),
            database: get("DB_NAME").unwrap_or(defaults.database),
        };

        Self {
            sheet,
            store,
            snapshot_dir: get("SNAPSHOT_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./dat")),
            interval: secs("INGEST_INTERVAL_SECS", DEFAULT_INTERVAL.as_secs()),
            fetch_timeout,
            store_timeout: secs("STORE_TIMEOUT_SECS", 60),
            store_chunk_rows: get("STORE_CHUNK_ROWS")
                .and_then(|v| v.trim().parse().ok())
                .unwrap_or(500),
        }
    }
}

/// Source of wall-clock time, monotonic time and the wait between ticks.
#[async_trait]
pub trait Clock: Send + Sync {
    /// Local wall-clock time, used only for stamps.
    fn now(&self) -> NaiveDateTime;
    /// Monotonic reading used to measure the interval; unaffected by DST or clock changes.
    fn instant(&self) -> Instant;
    async fn sleep(&self, duration: Duration);
}

#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

#[async_trait]
impl Clock for SystemClock {
    fn now(&self) -> NaiveDateTime {
        Local::now().naive_local()
    }

    fn instant(&self) -> Instant {
        Instant::now()
    }

    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum StageOutcome {
    Skipped,
    Succeeded { detail: String },
    Failed { kind: String, message: String },
}

impl StageOutcome {
    fn succeeded(detail: impl Into<String>) -> Self {
        Self::Succeeded {
            detail: detail.into(),
        }
    }

    fn failed(kind: &str, err: impl std::fmt::Display) -> Self {
        Self::Failed {
            kind: kind.to_string(),
            message: err.to_string(),
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, Self::Succeeded { .. })
    }

    pub fn failure_kind(&self) -> Option<&str> {
        match self {
            Self::Failed { kind, .. } => Some(kind),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CycleReport {
    pub run_id: Uuid,
    pub stamp: IngestStamp,
    pub fetched_rows: usize,
    pub records: usize,
    pub fetch: StageOutcome,
    pub snapshot: StageOutcome,
    pub store: StageOutcome,
}

impl CycleReport {
    fn new(run_id: Uuid, stamp: IngestStamp) -> Self {
        Self {
            run_id,
            stamp,
            fetched_rows: 0,
            records: 0,
            fetch: StageOutcome::Skipped,
            snapshot: StageOutcome::Skipped,
            store: StageOutcome::Skipped,
        }
    }
}

/// One fetch -> normalize -> snapshot -> load pass. Each stage reports its own failure.
pub struct IngestPipeline {
    reader: Box<dyn SheetReader>,
    snapshots: Box<dyn SnapshotWriter>,
    store: Box<dyn StoreLoader>,
    fetch_timeout: Duration,
}

impl IngestPipeline {
    pub fn new(
        reader: Box<dyn SheetReader>,
        snapshots: Box<dyn SnapshotWriter>,
        store: Box<dyn StoreLoader>,
    ) -> Self {
        Self {
            reader,
            snapshots,
            store,
            fetch_timeout: Duration::from_secs(60),
        }
    }

    pub fn with_fetch_timeout(mut self, fetch_timeout: Duration) -> Self {
        self.fetch_timeout = fetch_timeout;
        self
    }

    pub fn from_config(config: &IngestConfig) -> Result<Self> {
        let reader = GoogleSheetReader::new(config.sheet.clone()).context("building sheet reader")?;
        let snapshots = CsvSnapshotWriter::new(config.snapshot_dir.clone());
        let store = SqlStoreLoader::new(config.store.clone())
            .with_chunk_rows(config.store_chunk_rows)
            .with_timeout(config.store_timeout);
        Ok(Self::new(Box::new(reader), Box::new(snapshots), Box::new(store))
            .with_fetch_timeout(config.fetch_timeout))
    }

    async fn fetch(&self) -> Result<Vec<RawRow>, FetchError> {
        tokio::time::timeout(self.fetch_timeout, self.reader.read_rows())
            .await
            .map_err(|_| {
                FetchError::Transient(format!("sheet fetch timed out after {:?}", self.fetch_timeout))
            })?
    }

    pub async fn run_cycle(&self, run_id: Uuid, stamp: IngestStamp) -> CycleReport {
        let mut report = CycleReport::new(run_id, stamp);

        let rows = match self.fetch().await {
            Ok(rows) => rows,
            Err(err) => {
                warn!(kind = err.kind(), error = %err, "sheet fetch failed; skipping cycle");
                report.fetch = StageOutcome::failed(err.kind(), err);
                return report;
            }
        };
        report.fetched_rows = rows.len();
        report.fetch = StageOutcome::succeeded(format!("{} rows", rows.len()));

        let batch = normalize_rows(&rows, stamp);
        report.records = batch.len();
        if batch.is_empty() {
            info!(fetched = rows.len(), "no records this cycle; nothing to persist");
            return report;
        }

        report.snapshot = match self.snapshots.write(&batch).await {
            Ok(stored) => StageOutcome::succeeded(stored.path.display().to_string()),
            Err(err) => {
                error!(kind = err.kind(), error = %err, "snapshot write failed");
                StageOutcome::failed(err.kind(), err)
            }
        };

        report.store = match self.store.load(&batch).await {
            Ok(receipt) => StageOutcome::succeeded(format!("{} rows", receipt.rows_inserted)),
            Err(err) => {
                error!(kind = err.kind(), error = %err, "store load failed; batch not requeued");
                StageOutcome::failed(err.kind(), err)
            }
        };

        if !report.snapshot.is_success() && !report.store.is_success() {
            error!(records = batch.len(), "both sinks failed; cycle data lost");
        }
        report
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum SchedulerState {
    Idle,
    Running,
}

/// Fixed-interval driver. Cycles never overlap and no cycle outcome stops the loop.
pub struct Scheduler<C: Clock> {
    pipeline: Arc<IngestPipeline>,
    clock: C,
    interval: Duration,
    state: SchedulerState,
    last_tick: Option<Instant>,
    cycles_completed: u64,
}

impl<C: Clock> Scheduler<C> {
    pub fn new(pipeline: IngestPipeline, clock: C, interval: Duration) -> Self {
        Self {
            pipeline: Arc::new(pipeline),
            clock,
            interval,
            state: SchedulerState::Idle,
            last_tick: None,
            cycles_completed: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    pub fn cycles_completed(&self) -> u64 {
        self.cycles_completed
    }

    /// Idle -> Running -> Idle. The stamp is captured once, at the start of the cycle.
    pub async fn run_cycle(&mut self) -> CycleReport {
        let stamp = IngestStamp::from_datetime(self.clock.now());
        let run_id = Uuid::new_v4();
        self.last_tick = Some(self.clock.instant());
        self.state = SchedulerState::Running;

        let pipeline = Arc::clone(&self.pipeline);
        let span = info_span!("ingest_cycle", %run_id, %stamp);
        let handle = tokio::spawn(async move { pipeline.run_cycle(run_id, stamp).await }.instrument(span));
        let report = match handle.await {
            Ok(report) => report,
            Err(err) => {
                error!(%run_id, error = %err, "ingest cycle aborted");
                let mut report = CycleReport::new(run_id, stamp);
                report.fetch = StageOutcome::failed("aborted", err);
                report
            }
        };

        self.state = SchedulerState::Idle;
        self.cycles_completed += 1;
        report
    }

    /// Time left until `last cycle start + interval`; zero when the cycle overran.
    pub fn next_tick_delay(&self) -> Duration {
        let Some(last_tick) = self.last_tick else {
            return Duration::ZERO;
        };
        let elapsed = self.clock.instant().saturating_duration_since(last_tick);
        self.interval.saturating_sub(elapsed)
    }

    pub async fn wait_for_next_tick(&self) {
        let delay = self.next_tick_delay();
        info!(delay_secs = delay.as_secs(), "waiting for next tick");
        self.clock.sleep(delay).await;
    }

    /// Runs until the process is shut down from outside.
    pub async fn run_forever(&mut self) -> Infallible {
        loop {
            let report = self.run_cycle().await;
            info!(
                run_id = %report.run_id,
                records = report.records,
                fetch = ?report.fetch,
                snapshot = ?report.snapshot,
                store = ?report.store,
                "ingest cycle finished"
            );
            self.wait_for_next_tick().await;
        }
    }
}

pub async fn run_once_from_env() -> Result<CycleReport> {
    let config = IngestConfig::from_env();
    let pipeline = IngestPipeline::from_config(&config)?;
    let mut scheduler = Scheduler::new(pipeline, SystemClock, config.interval);
    Ok(scheduler.run_cycle().await)
}

pub async fn run_forever_from_env() -> Result<Infallible> {
    let config = IngestConfig::from_env();
    info!(
        interval_secs = config.interval.as_secs(),
        snapshot_dir = %config.snapshot_dir.display(),
        "starting ingest scheduler"
    );
    let pipeline = IngestPipeline::from_config(&config)?;
    let mut scheduler = Scheduler::new(pipeline, SystemClock, config.interval);
    Ok(scheduler.run_forever().await)
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SnapshotInsights {
    pub total_entries: usize,
    pub unique_symbols: usize,
    pub first_date: Option<NaiveDate>,
    pub last_date: Option<NaiveDate>,
    /// Column name -> cell value -> count.
    pub view_counts: BTreeMap<&'static str, BTreeMap<String, usize>>,
}

pub fn summarize_records(records: &[Record]) -> SnapshotInsights {
    let symbols: BTreeSet<&str> = records.iter().map(|r| r.symbol.as_str()).collect();
    let mut view_counts: BTreeMap<&'static str, BTreeMap<String, usize>> = BTreeMap::new();
    for record in records {
        for horizon in Horizon::ALL {
            *view_counts
                .entry(horizon.column_name())
                .or_default()
                .entry(record.view(horizon).to_string())
                .or_default() += 1;
        }
    }
    SnapshotInsights {
        total_entries: records.len(),
        unique_symbols: symbols.len(),
        first_date: records.iter().map(|r| r.observed_date).min(),
        last_date: records.iter().map(|r| r.observed_date).max(),
        view_counts,
    }
}

/// Markdown digest of the `runs` most recent snapshots in `snapshot_dir`.
pub fn report_snapshots_markdown(snapshot_dir: &Path, runs: usize) -> Result<String> {
    let snapshots = list_snapshots(snapshot_dir)
        .with_context(|| format!("listing snapshots in {}", snapshot_dir.display()))?;

    let mut lines = vec!["# Trend Sheet Snapshots".to_string(), String::new()];
    if snapshots.is_empty() {
        lines.push(format!("No snapshots in `{}`.", snapshot_dir.display()));
        return Ok(lines.join("\n"));
    }

    for path in snapshots.into_iter().take(runs.max(1)) {
        let records = read_snapshot(&path)
            .with_context(|| format!("reading snapshot {}", path.display()))?;
        let insights = summarize_records(&records);
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_default();

        lines.push(format!("## `{name}`"));
        lines.push(format!("- total entries: {}", insights.total_entries));
        lines.push(format!("- unique symbols: {}", insights.unique_symbols));
        if let (Some(first), Some(last)) = (insights.first_date, insights.last_date) {
            lines.push(format!("- date range: {first} to {last}"));
        }
        for (column, counts) in &insights.view_counts {
            let parts = counts
                .iter()
                .map(|(value, n)| {
                    let label = if value.is_empty() { "(blank)" } else { value.as_str() };
                    format!("{label}: {n}")
                })
                .collect::<Vec<_>>()
                .join(", ");
            lines.push(format!("- {column}: {parts}"));
        }
        lines.push(String::new());
    }

    Ok(lines.join("\n"))
}
