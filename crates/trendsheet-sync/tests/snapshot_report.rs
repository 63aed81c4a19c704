use chrono::NaiveDate;
use tempfile::tempdir;
use trendsheet_core::{normalize_rows, IngestStamp, RawRow};
use trendsheet_storage::write_snapshot;
use trendsheet_sync::report_snapshots_markdown;

fn row(cells: &[&str]) -> RawRow {
    cells.iter().map(|c| c.to_string()).collect()
}

#[tokio::test]
async fn report_summarizes_latest_snapshot() {
    let dir = tempdir().unwrap();
    let stamp = IngestStamp::from_datetime(
        NaiveDate::from_ymd_opt(2024, 6, 1)
            .unwrap()
            .and_hms_opt(9, 0, 0)
            .unwrap(),
    );
    let batch = normalize_rows(
        &[
            row(&["AAPL", "Bullish", "", "", "Bullish"]),
            row(&["MSFT", "Bearish", "Bullish", "", "Bearish Sideways"]),
        ],
        stamp,
    );
    write_snapshot(dir.path(), &batch).await.unwrap();

    let markdown = report_snapshots_markdown(dir.path(), 3).unwrap();
    assert!(markdown.starts_with("# Trend Sheet Snapshots"));
    assert!(markdown.contains("## `stock_data_backup_01-06-24_09.csv`"));
    assert!(markdown.contains("- total entries: 2"));
    assert!(markdown.contains("- unique symbols: 2"));
    assert!(markdown.contains("- date range: 2024-06-01 to 2024-06-01"));
    assert!(markdown.contains("- Day_View: Bearish Sideways: 1, Bullish: 1"));
    assert!(markdown.contains("- Weekly_View: (blank): 2"));
}

#[test]
fn report_on_empty_directory_says_so() {
    let dir = tempdir().unwrap();
    let markdown = report_snapshots_markdown(dir.path(), 3).unwrap();
    assert!(markdown.contains("No snapshots in"));
}
