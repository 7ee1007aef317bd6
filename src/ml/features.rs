//! Feature construction for the attendance model
//!
//! Every lag and rolling feature is read from a [`SlotHistory`] that only ever
//! holds attendance dated before the row being described. Training rows and
//! forecast rows go through the same history type and the same vectorisation,
//! so the model sees identical feature semantics in both phases.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::info;

use crate::calendar::{WorkCalendar, day_of_week, week_of_year};
use crate::config::ForecastConfig;
use crate::models::{SessionOccurrence, SlotKey};

/// Shape of the feature vector: which rolling windows exist and how missing
/// history is filled in.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureSpec {
    rolling_windows: Vec<usize>,
    missing_value: f64,
}

impl FeatureSpec {
    pub fn new(rolling_windows: &[usize], missing_value: f64) -> Self {
        let mut windows: Vec<usize> = Vec::with_capacity(rolling_windows.len());
        for &w in rolling_windows {
            if w > 0 && !windows.contains(&w) {
                windows.push(w);
            }
        }
        Self {
            rolling_windows: windows,
            missing_value,
        }
    }

    pub fn from_config(config: &ForecastConfig) -> Self {
        Self::new(&config.rolling_window_sizes, config.missing_feature_value)
    }

    pub fn rolling_windows(&self) -> &[usize] {
        &self.rolling_windows
    }

    pub fn missing_value(&self) -> f64 {
        self.missing_value
    }

    /// Temporal features plus lag_1 plus one rolling average per window.
    pub fn num_features(&self) -> usize {
        4 + self.rolling_windows.len()
    }

    /// Feature names in vector order.
    pub fn feature_names(&self) -> Vec<String> {
        let mut names = vec![
            "day_of_week".to_string(),
            "week_of_year".to_string(),
            "is_holiday".to_string(),
            "lag_1".to_string(),
        ];
        names.extend(
            self.rolling_windows
                .iter()
                .map(|w| format!("rolling_avg_{}", w)),
        );
        names
    }
}

impl Default for FeatureSpec {
    fn default() -> Self {
        Self::new(&[4, 8], 0.0)
    }
}

/// Ordered attendance values of one slot, oldest first.
///
/// During training it holds real attendance; while forecasting it is seeded
/// with real attendance and then extended with the model's own predictions.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct SlotHistory {
    values: Vec<f64>,
}

impl SlotHistory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_values(values: Vec<f64>) -> Self {
        Self { values }
    }

    pub fn push(&mut self, value: f64) {
        self.values.push(value);
    }

    pub fn len(&self) -> usize {
        self.values.len()
    }

    pub fn is_empty(&self) -> bool {
        self.values.is_empty()
    }

    pub fn values(&self) -> &[f64] {
        &self.values
    }

    /// Most recent value.
    pub fn lag_1(&self) -> Option<f64> {
        self.values.last().copied()
    }

    /// Mean of the last `window` values, or of all of them when fewer exist.
    pub fn rolling_avg(&self, window: usize) -> Option<f64> {
        if self.values.is_empty() || window == 0 {
            return None;
        }
        let start = self.values.len().saturating_sub(window);
        let tail = &self.values[start..];
        Some(tail.iter().sum::<f64>() / tail.len() as f64)
    }
}

/// Features describing one (slot, date).
#[derive(Debug, Clone, PartialEq)]
pub struct PredictionFeatures {
    pub day_of_week: u32,
    pub week_of_year: u32,
    pub is_holiday: bool,
    pub lag_1: Option<f64>,
    /// Aligned with [`FeatureSpec::rolling_windows`].
    pub rolling_avgs: Vec<Option<f64>>,
}

impl PredictionFeatures {
    /// Build features for `date` from everything `history` knows so far.
    pub fn extract(
        date: NaiveDate,
        history: &SlotHistory,
        calendar: &WorkCalendar,
        spec: &FeatureSpec,
    ) -> Self {
        Self {
            day_of_week: day_of_week(date),
            week_of_year: week_of_year(date),
            is_holiday: calendar.is_holiday(date),
            lag_1: history.lag_1(),
            rolling_avgs: spec
                .rolling_windows
                .iter()
                .map(|&w| history.rolling_avg(w))
                .collect(),
        }
    }

    /// Rolling average for a configured window.
    pub fn rolling_avg(&self, spec: &FeatureSpec, window: usize) -> Option<f64> {
        spec.rolling_windows
            .iter()
            .position(|&w| w == window)
            .and_then(|i| self.rolling_avgs.get(i).copied().flatten())
    }

    /// Convert features to a vector for the model
    pub fn to_vec(&self, spec: &FeatureSpec) -> Vec<f64> {
        let missing = spec.missing_value;
        let mut vec = Vec::with_capacity(spec.num_features());
        vec.push(self.day_of_week as f64);
        vec.push(self.week_of_year as f64);
        vec.push(if self.is_holiday { 1.0 } else { 0.0 });
        vec.push(self.lag_1.unwrap_or(missing));
        vec.extend(self.rolling_avgs.iter().map(|v| v.unwrap_or(missing)));
        vec
    }
}

/// A historical occurrence with its features; the attendance count is the
/// training target.
#[derive(Debug, Clone, PartialEq)]
pub struct FeatureRow {
    pub occurrence: SessionOccurrence,
    pub features: PredictionFeatures,
}

impl FeatureRow {
    pub fn session_date(&self) -> NaiveDate {
        self.occurrence.session_date
    }

    pub fn target(&self) -> f64 {
        self.occurrence.attendance_count as f64
    }
}

/// Build feature rows for every occurrence.
///
/// Rows come back sorted by (session_date, session_name, session_start).
pub fn build_features(
    occurrences: &[SessionOccurrence],
    calendar: &WorkCalendar,
    spec: &FeatureSpec,
) -> Vec<FeatureRow> {
    let mut by_slot: BTreeMap<SlotKey, Vec<&SessionOccurrence>> = BTreeMap::new();
    for occurrence in occurrences {
        by_slot
            .entry(occurrence.slot_key())
            .or_default()
            .push(occurrence);
    }

    let mut rows = Vec::with_capacity(occurrences.len());
    for (_, mut slot_occurrences) in by_slot {
        slot_occurrences.sort_by_key(|o| o.session_date);

        let mut history = SlotHistory::new();
        for occurrence in slot_occurrences {
            let features =
                PredictionFeatures::extract(occurrence.session_date, &history, calendar, spec);
            rows.push(FeatureRow {
                occurrence: occurrence.clone(),
                features,
            });
            history.push(occurrence.attendance_count as f64);
        }
    }

    rows.sort_by(|a, b| {
        (
            a.occurrence.session_date,
            &a.occurrence.session_name,
            a.occurrence.session_start,
        )
            .cmp(&(
                b.occurrence.session_date,
                &b.occurrence.session_name,
                b.occurrence.session_start,
            ))
    });

    let with_lag = rows.iter().filter(|r| r.features.lag_1.is_some()).count();
    let holidays = rows.iter().filter(|r| r.features.is_holiday).count();
    info!(
        "Built {} feature rows ({} features: {}); lag_1 coverage {}/{}, {} on holidays",
        rows.len(),
        spec.num_features(),
        spec.feature_names().join(", "),
        with_lag,
        rows.len(),
        holidays
    );

    rows
}

/// Real attendance per slot, oldest first, dated strictly before `before`.
pub fn slot_histories(rows: &[FeatureRow], before: NaiveDate) -> BTreeMap<SlotKey, SlotHistory> {
    let mut histories: BTreeMap<SlotKey, Vec<(NaiveDate, f64)>> = BTreeMap::new();
    for row in rows.iter().filter(|r| r.session_date() < before) {
        histories
            .entry(row.occurrence.slot_key())
            .or_default()
            .push((row.session_date(), row.target()));
    }

    histories
        .into_iter()
        .map(|(key, mut dated)| {
            dated.sort_by_key(|(date, _)| *date);
            let values = dated.into_iter().map(|(_, v)| v).collect();
            (key, SlotHistory::from_values(values))
        })
        .collect()
}
