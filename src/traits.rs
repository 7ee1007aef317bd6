//! Abstractions for time and data access to enable testing.
//!
//! This module provides traits for:
//! - `Clock`: Abstracting time access for deterministic testing
//! - `ForecastStore`: Abstracting where pipeline inputs come from and where
//!   forecasts are written

use std::future::Future;
use std::sync::{Arc, Mutex};

use anyhow::Result;
use chrono::{DateTime, Local, Utc};

use crate::models::ForecastRow;
use crate::pipeline::PipelineInputs;

// ==================== Clock Trait ====================

/// Trait for abstracting time access.
///
/// This allows injecting mock clocks during testing to create
/// deterministic, reproducible tests for time-dependent logic.
pub trait Clock: Send + Sync {
    /// Get the current time in UTC.
    fn now_utc(&self) -> DateTime<Utc>;

    /// Get the current time in the local timezone.
    fn now_local(&self) -> DateTime<Local>;
}

/// System clock implementation using real time.
#[derive(Debug, Clone, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now_utc(&self) -> DateTime<Utc> {
        Utc::now()
    }

    fn now_local(&self) -> DateTime<Local> {
        Local::now()
    }
}

/// Mock clock for testing with controllable time.
#[derive(Debug, Clone)]
pub struct MockClock {
    utc_time: Arc<Mutex<DateTime<Utc>>>,
}

impl MockClock {
    /// Create a new mock clock set to the given UTC time.
    pub fn new(time: DateTime<Utc>) -> Self {
        Self {
            utc_time: Arc::new(Mutex::new(time)),
        }
    }

    /// Advance the clock by a duration.
    pub fn advance(&self, duration: chrono::Duration) {
        let mut time = self.utc_time.lock().unwrap();
        *time = *time + duration;
    }
}

impl Clock for MockClock {
    fn now_utc(&self) -> DateTime<Utc> {
        *self.utc_time.lock().unwrap()
    }

    fn now_local(&self) -> DateTime<Local> {
        self.now_utc().with_timezone(&Local)
    }
}

// ==================== ForecastStore Trait ====================

/// Source of pipeline inputs and sink for forecast rows.
pub trait ForecastStore: Send + Sync {
    /// Read attendance, calendar, holds and capacity rules.
    fn load_inputs(&self) -> impl Future<Output = Result<PipelineInputs>> + Send;

    /// Insert or replace rows keyed on (session_date, session_name, session_start).
    /// Returns the number of rows written.
    fn upsert_forecasts(&self, rows: &[ForecastRow]) -> impl Future<Output = Result<usize>> + Send;
}

/// In-memory store for testing that records every upsert.
#[derive(Debug, Clone, Default)]
pub struct MockStore {
    inputs: PipelineInputs,
    written: Arc<Mutex<Vec<Vec<ForecastRow>>>>,
}

impl MockStore {
    /// Create a store that serves the given inputs.
    pub fn new(inputs: PipelineInputs) -> Self {
        Self {
            inputs,
            written: Arc::default(),
        }
    }

    /// Every batch passed to `upsert_forecasts`, in call order.
    pub fn upserts(&self) -> Vec<Vec<ForecastRow>> {
        self.written.lock().unwrap().clone()
    }

    /// Get the count of upsert calls.
    pub fn upsert_count(&self) -> usize {
        self.written.lock().unwrap().len()
    }
}

impl ForecastStore for MockStore {
    async fn load_inputs(&self) -> Result<PipelineInputs> {
        Ok(self.inputs.clone())
    }

    async fn upsert_forecasts(&self, rows: &[ForecastRow]) -> Result<usize> {
        self.written.lock().unwrap().push(rows.to_vec());
        Ok(rows.len())
    }
}

#[cfg(test)]
mod tests {
    use chrono::{NaiveDate, NaiveTime, TimeZone};

    use super::*;
    use crate::models::RiskFlag;

    #[test]
    fn test_system_clock_returns_current_time() {
        let clock = SystemClock;
        let before = Utc::now();
        let clock_time = clock.now_utc();
        let after = Utc::now();

        assert!(clock_time >= before);
        assert!(clock_time <= after);
    }

    #[test]
    fn test_mock_clock_returns_set_time() {
        let fixed_time = Utc.with_ymd_and_hms(2024, 6, 15, 14, 30, 0).unwrap();
        let clock = MockClock::new(fixed_time);

        assert_eq!(clock.now_utc(), fixed_time);
    }

    #[test]
    fn test_mock_clock_advance() {
        let start = Utc.with_ymd_and_hms(2024, 6, 15, 10, 0, 0).unwrap();
        let clock = MockClock::new(start);

        clock.advance(chrono::Duration::hours(2));

        let expected = Utc.with_ymd_and_hms(2024, 6, 15, 12, 0, 0).unwrap();
        assert_eq!(clock.now_utc(), expected);
    }

    #[tokio::test]
    async fn test_mock_store_records_upserts() {
        let store = MockStore::default();
        let row = ForecastRow {
            session_date: NaiveDate::from_ymd_opt(2024, 6, 17).unwrap(),
            session_name: "BOX".to_string(),
            session_start: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            session_end: None,
            predicted_attendance: 4.0,
            predicted_utilisation: None,
            risk_flag: RiskFlag::Black,
        };

        assert_eq!(store.upsert_count(), 0);
        let written = store.upsert_forecasts(&[row.clone()]).await.unwrap();

        assert_eq!(written, 1);
        assert_eq!(store.upsert_count(), 1);
        assert_eq!(store.upserts()[0], vec![row]);
    }

    #[tokio::test]
    async fn test_mock_store_serves_inputs() {
        let store = MockStore::new(PipelineInputs::default());
        let inputs = store.load_inputs().await.unwrap();
        assert!(inputs.attendance.is_empty());
    }
}
