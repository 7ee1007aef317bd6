//! Directory of CSV files as a forecast store.
//!
//! Inputs are read from `attendance.csv`, `calendar.csv`, `holds.csv` and
//! `capacity.csv`; forecasts are merged into `<forecast_table>.csv` in the
//! same directory.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{NaiveDate, NaiveTime};
use serde::de::DeserializeOwned;
use tracing::{info, warn};

use crate::models::{AttendanceEvent, CalendarDay, CapacityRule, ForecastRow, MemberHold};
use crate::pipeline::PipelineInputs;
use crate::traits::ForecastStore;

pub const ATTENDANCE_FILE: &str = "attendance.csv";
pub const CALENDAR_FILE: &str = "calendar.csv";
pub const HOLDS_FILE: &str = "holds.csv";
pub const CAPACITY_FILE: &str = "capacity.csv";

#[derive(Clone, Debug)]
pub struct CsvStore {
    dir: PathBuf,
    forecast_table: String,
}

impl CsvStore {
    pub fn new(dir: impl Into<PathBuf>, forecast_table: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            forecast_table: forecast_table.into(),
        }
    }

    /// Path forecasts are written to.
    pub fn forecast_path(&self) -> PathBuf {
        self.dir.join(format!("{}.csv", self.forecast_table))
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

/// Deserialize every record of a CSV file with a header row.
pub fn read_csv<T: DeserializeOwned>(path: &Path) -> Result<Vec<T>> {
    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .from_path(path)
        .with_context(|| format!("Failed to open {}", path.display()))?;

    let mut rows = Vec::new();
    for (i, record) in reader.deserialize().enumerate() {
        let row: T = record
            .with_context(|| format!("Failed to parse record {} of {}", i + 1, path.display()))?;
        rows.push(row);
    }
    Ok(rows)
}

async fn read_csv_async<T>(path: PathBuf, required: bool) -> Result<Vec<T>>
where
    T: DeserializeOwned + Send + 'static,
{
    if !path.exists() {
        if required {
            anyhow::bail!("Required input file {} does not exist", path.display());
        }
        warn!("{} not found; treating as empty", path.display());
        return Ok(Vec::new());
    }

    let rows = tokio::task::spawn_blocking(move || read_csv::<T>(&path))
        .await
        .context("CSV read task failed")??;
    Ok(rows)
}

/// Write forecast rows to a CSV file, replacing it.
pub fn write_forecasts_csv(path: &Path, rows: &[ForecastRow]) -> Result<()> {
    let mut wtr = csv::Writer::from_path(path)
        .with_context(|| format!("Failed to create CSV writer for {}", path.display()))?;

    for row in rows {
        wtr.serialize(row)
            .context("Failed to serialize forecast row")?;
    }

    wtr.flush().context("Failed to flush CSV writer")?;
    Ok(())
}

/// Merge `rows` into whatever `path` already holds, replacing rows with the
/// same key, and rewrite the file sorted by key.
pub fn merge_forecasts_csv(path: &Path, rows: &[ForecastRow]) -> Result<usize> {
    let existing: Vec<ForecastRow> = if path.exists() {
        read_csv(path)?
    } else {
        Vec::new()
    };

    let mut by_key: BTreeMap<(NaiveDate, String, NaiveTime), ForecastRow> = BTreeMap::new();
    for row in existing.into_iter().chain(rows.iter().cloned()) {
        by_key.insert(
            (row.session_date, row.session_name.clone(), row.session_start),
            row,
        );
    }

    let merged: Vec<ForecastRow> = by_key.into_values().collect();
    write_forecasts_csv(path, &merged)?;
    Ok(merged.len())
}

impl ForecastStore for CsvStore {
    async fn load_inputs(&self) -> Result<PipelineInputs> {
        let attendance: Vec<AttendanceEvent> =
            read_csv_async(self.dir.join(ATTENDANCE_FILE), true).await?;
        let calendar: Vec<CalendarDay> = read_csv_async(self.dir.join(CALENDAR_FILE), false).await?;
        let holds: Vec<MemberHold> = read_csv_async(self.dir.join(HOLDS_FILE), false).await?;
        let capacity_rules: Vec<CapacityRule> =
            read_csv_async(self.dir.join(CAPACITY_FILE), false).await?;

        info!(
            "Loaded CSV inputs from {}: {} attendance, {} calendar, {} holds, {} capacity rules",
            self.dir.display(),
            attendance.len(),
            calendar.len(),
            holds.len(),
            capacity_rules.len()
        );

        Ok(PipelineInputs {
            attendance,
            calendar,
            holds,
            capacity_rules,
        })
    }

    async fn upsert_forecasts(&self, rows: &[ForecastRow]) -> Result<usize> {
        let path = self.forecast_path();
        let rows = rows.to_vec();
        let written = rows.len();

        let (target, total) = tokio::task::spawn_blocking(move || -> Result<(PathBuf, usize)> {
            let total = merge_forecasts_csv(&path, &rows)?;
            Ok((path, total))
        })
        .await
        .context("CSV write task failed")??;

        info!(
            "Upserted {} rows into {} ({} rows total)",
            written,
            target.display(),
            total
        );
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::RiskFlag;
    use tempfile::TempDir;

    fn row(day: u32, predicted: f64, flag: RiskFlag) -> ForecastRow {
        ForecastRow {
            session_date: NaiveDate::from_ymd_opt(2024, 4, day).unwrap(),
            session_name: "BOX".to_string(),
            session_start: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            session_end: NaiveTime::from_hms_opt(7, 0, 0),
            predicted_attendance: predicted,
            predicted_utilisation: None,
            risk_flag: flag,
        }
    }

    #[test]
    fn test_write_and_read_forecasts() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");
        let rows = vec![row(1, 3.5, RiskFlag::Black)];

        write_forecasts_csv(&path, &rows).unwrap();
        let content = std::fs::read_to_string(&path).unwrap();
        assert!(content.starts_with("session_date,session_name,session_start,session_end"));
        assert!(content.contains("2024-04-01,BOX,06:00:00,07:00:00,3.5,,black"));

        let back: Vec<ForecastRow> = read_csv(&path).unwrap();
        assert_eq!(back, rows);
    }

    #[test]
    fn test_merge_replaces_matching_keys() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("out.csv");

        merge_forecasts_csv(&path, &[row(1, 3.0, RiskFlag::Black), row(2, 4.0, RiskFlag::Black)])
            .unwrap();
        let total = merge_forecasts_csv(&path, &[row(2, 9.0, RiskFlag::Red)]).unwrap();

        let back: Vec<ForecastRow> = read_csv(&path).unwrap();
        assert_eq!(total, 2);
        assert_eq!(back[0].predicted_attendance, 3.0);
        assert_eq!(back[1].predicted_attendance, 9.0);
        assert_eq!(back[1].risk_flag, RiskFlag::Red);
    }

    #[test]
    fn test_read_reports_bad_record() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("holds.csv");
        std::fs::write(&path, "member_id,hold_start,hold_end\n1,not-a-date,\n").unwrap();

        let err = read_csv::<MemberHold>(&path).unwrap_err();
        assert!(format!("{:#}", err).contains("record 1"));
    }
}
