//! Core record model and row normalization for the trend sheet ingest.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveDateTime, NaiveTime, Timelike};
use serde::{Deserialize, Serialize};

pub const CRATE_NAME: &str = "trendsheet-core";

/// Column order expected from the source sheet.
pub const SOURCE_COLUMNS: [&str; 5] = [
    "Symbols",
    "Multi_Months_View",
    "Multi_Weeks_View",
    "Weekly_View",
    "Day_View",
];

/// Column order of persisted records (source columns plus the ingestion stamp).
pub const RECORD_COLUMNS: [&str; 7] = [
    "Symbols",
    "Multi_Months_View",
    "Multi_Weeks_View",
    "Weekly_View",
    "Day_View",
    "date",
    "time",
];

/// One row as read from the sheet, before normalization.
pub type RawRow = Vec<String>;

/// Single date + time captured once per cycle and shared by every row of that cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct IngestStamp {
    pub date: NaiveDate,
    pub time: NaiveTime,
}

impl IngestStamp {
    pub fn new(date: NaiveDate, time: NaiveTime) -> Self {
        Self {
            date,
            time: truncate_subsec(time),
        }
    }

    pub fn from_datetime(at: NaiveDateTime) -> Self {
        Self::new(at.date(), at.time())
    }

    pub fn as_datetime(&self) -> NaiveDateTime {
        self.date.and_time(self.time)
    }
}

impl fmt::Display for IngestStamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} {}", self.date.format("%Y-%m-%d"), self.time.format("%H:%M:%S"))
    }
}

fn truncate_subsec(time: NaiveTime) -> NaiveTime {
    time.with_nanosecond(0).unwrap_or(time)
}

/// Trend classification a sheet cell is expected to carry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum TrendView {
    Bullish,
    Bearish,
    #[serde(rename = "Bullish Sideways")]
    BullishSideways,
    #[serde(rename = "Bearish Sideways")]
    BearishSideways,
    #[serde(rename = "")]
    Unset,
}

impl TrendView {
    pub const ALL: [TrendView; 5] = [
        TrendView::Bullish,
        TrendView::Bearish,
        TrendView::BullishSideways,
        TrendView::BearishSideways,
        TrendView::Unset,
    ];

    /// Returns `None` for values outside the known vocabulary.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim() {
            "Bullish" => Some(Self::Bullish),
            "Bearish" => Some(Self::Bearish),
            "Bullish Sideways" => Some(Self::BullishSideways),
            "Bearish Sideways" => Some(Self::BearishSideways),
            "" => Some(Self::Unset),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Bullish => "Bullish",
            Self::Bearish => "Bearish",
            Self::BullishSideways => "Bullish Sideways",
            Self::BearishSideways => "Bearish Sideways",
            Self::Unset => "",
        }
    }
}

impl FromStr for TrendView {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s).ok_or_else(|| format!("unknown trend view {s:?}"))
    }
}

impl fmt::Display for TrendView {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Time horizon of one of the four trend columns.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Horizon {
    MultiMonths,
    MultiWeeks,
    Weekly,
    Day,
}

impl Horizon {
    pub const ALL: [Horizon; 4] = [
        Horizon::MultiMonths,
        Horizon::MultiWeeks,
        Horizon::Weekly,
        Horizon::Day,
    ];

    pub fn column_name(&self) -> &'static str {
        match self {
            Self::MultiMonths => "Multi_Months_View",
            Self::MultiWeeks => "Multi_Weeks_View",
            Self::Weekly => "Weekly_View",
            Self::Day => "Day_View",
        }
    }
}

/// Canonical observation row. Field names on the wire match the `stock_data` columns.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Record {
    #[serde(rename = "Symbols")]
    pub symbol: String,
    #[serde(rename = "Multi_Months_View")]
    pub multi_months_view: String,
    #[serde(rename = "Multi_Weeks_View")]
    pub multi_weeks_view: String,
    #[serde(rename = "Weekly_View")]
    pub weekly_view: String,
    #[serde(rename = "Day_View")]
    pub day_view: String,
    #[serde(rename = "date")]
    pub observed_date: NaiveDate,
    #[serde(rename = "time")]
    pub observed_time: NaiveTime,
}

impl Record {
    /// Raw cell for the given horizon, exactly as received.
    pub fn view(&self, horizon: Horizon) -> &str {
        match horizon {
            Horizon::MultiMonths => &self.multi_months_view,
            Horizon::MultiWeeks => &self.multi_weeks_view,
            Horizon::Weekly => &self.weekly_view,
            Horizon::Day => &self.day_view,
        }
    }

    pub fn stamp(&self) -> IngestStamp {
        IngestStamp::new(self.observed_date, self.observed_time)
    }
}

/// Records produced by one ingestion cycle, all carrying the same stamp.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Batch {
    stamp: IngestStamp,
    records: Vec<Record>,
}

impl Batch {
    pub fn stamp(&self) -> IngestStamp {
        self.stamp
    }

    pub fn records(&self) -> &[Record] {
        &self.records
    }

    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }

    pub fn into_records(self) -> Vec<Record> {
        self.records
    }
}

/// A leading cell identifies an instrument when it is non-blank and is not a repeated header.
pub fn is_identifying_cell(cell: &str) -> bool {
    let trimmed = cell.trim();
    !trimmed.is_empty() && !trimmed.eq_ignore_ascii_case(SOURCE_COLUMNS[0])
}

/// Pads short rows with empty cells and truncates long rows to the source width.
pub fn fit_row_width(row: &[String]) -> [String; 5] {
    let mut cells: [String; 5] = Default::default();
    for (slot, value) in cells.iter_mut().zip(row.iter()) {
        slot.clone_from(value);
    }
    cells
}

/// Builds the canonical batch for one cycle. Pure: identical input yields identical output.
pub fn normalize_rows(rows: &[RawRow], stamp: IngestStamp) -> Batch {
    let records = rows
        .iter()
        .filter(|row| row.first().is_some_and(|cell| is_identifying_cell(cell)))
        .map(|row| {
            let [symbol, multi_months_view, multi_weeks_view, weekly_view, day_view] =
                fit_row_width(row);
            Record {
                symbol: symbol.trim().to_string(),
                multi_months_view,
                multi_weeks_view,
                weekly_view,
                day_view,
                observed_date: stamp.date,
                observed_time: stamp.time,
            }
        })
        .collect();

    Batch { stamp, records }
}
