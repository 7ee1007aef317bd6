//! One complete forecasting run over in-memory inputs.
//!
//! Aggregate, build features, train, forecast recursively, apply holds and
//! classify risk. Nothing here performs I/O; the stores feed [`PipelineInputs`]
//! in and write [`PipelineOutput::rows`] back out.

use std::collections::BTreeMap;

use chrono::{NaiveDate, NaiveTime};
use tracing::{info, warn};

use crate::aggregate::{AggregationDiagnostics, aggregate};
use crate::calendar::WorkCalendar;
use crate::config::ForecastConfig;
use crate::error::ForecastError;
use crate::forecast::{Forecaster, forecast_dates};
use crate::holds::{HoldsSummary, MemberSlotAffinity, apply_holds, held_members};
use crate::ml::{FeatureSpec, TrainedModel, build_features, slot_histories, train_and_evaluate};
use crate::models::{AttendanceEvent, CalendarDay, CapacityRule, ForecastRow, MemberHold, RiskFlag};
use crate::risk::{CapacityMatcher, CoachCounts, RiskClassifier};
use crate::traits::ForecastStore;

/// Everything a run reads from the data store.
#[derive(Debug, Clone, Default)]
pub struct PipelineInputs {
    pub attendance: Vec<AttendanceEvent>,
    pub calendar: Vec<CalendarDay>,
    pub holds: Vec<MemberHold>,
    pub capacity_rules: Vec<CapacityRule>,
}

/// Aggregate figures for the end-of-run log line.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RunSummary {
    pub total_rows: usize,
    pub rows_with_capacity: usize,
    pub flag_counts: BTreeMap<RiskFlag, usize>,
    pub total_hold_adjustment: f64,
    pub window: Option<(NaiveDate, NaiveDate)>,
    pub duplicate_rows_collapsed: usize,
}

impl RunSummary {
    pub fn count(&self, flag: RiskFlag) -> usize {
        self.flag_counts.get(&flag).copied().unwrap_or(0)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineOutput {
    /// Sorted by (session_date, session_name, session_start), unique per key.
    pub rows: Vec<ForecastRow>,
    pub model: TrainedModel,
    pub aggregation: AggregationDiagnostics,
    pub holds: HoldsSummary,
    pub summary: RunSummary,
}

/// Collapse rows sharing an upsert key, keeping the last, and sort by key.
///
/// Returns the rows and how many were dropped.
pub fn dedupe_by_key(rows: Vec<ForecastRow>) -> (Vec<ForecastRow>, usize) {
    let before = rows.len();
    let mut by_key: BTreeMap<(NaiveDate, String, NaiveTime), ForecastRow> = BTreeMap::new();
    for row in rows {
        by_key.insert(
            (row.session_date, row.session_name.clone(), row.session_start),
            row,
        );
    }
    let rows: Vec<ForecastRow> = by_key.into_values().collect();
    let dropped = before - rows.len();
    (rows, dropped)
}

/// Run the forecast with `start_date` as the first candidate date.
pub fn run(
    inputs: &PipelineInputs,
    config: &ForecastConfig,
    start_date: NaiveDate,
) -> Result<PipelineOutput, ForecastError> {
    info!(
        "Inputs: {} attendance events, {} calendar days, {} holds, {} capacity rules",
        inputs.attendance.len(),
        inputs.calendar.len(),
        inputs.holds.len(),
        inputs.capacity_rules.len()
    );

    if inputs.attendance.is_empty() {
        return Err(ForecastError::InsufficientData(
            "no attendance events".to_string(),
        ));
    }

    // Step 1: aggregate
    let aggregation = aggregate(&inputs.attendance);
    if aggregation.is_empty() {
        return Err(ForecastError::InsufficientData(format!(
            "none of the {} attendance events were usable",
            aggregation.diagnostics.events_seen
        )));
    }

    // Step 2: features
    let calendar = WorkCalendar::new(&inputs.calendar);
    let spec = FeatureSpec::from_config(config);
    let feature_rows = build_features(&aggregation.occurrences, &calendar, &spec);

    // Step 3: train and evaluate
    let model = train_and_evaluate(&feature_rows, &spec, config)?;
    info!("{}", model.info());

    // Step 4: recursive forecast
    let dates = forecast_dates(start_date, config.forecast_horizon_days, &calendar);
    if dates.is_empty() {
        warn!(
            "No business days in the {}-day window starting {}",
            config.forecast_horizon_days, start_date
        );
    }
    let history_cutoff = dates.first().copied().unwrap_or(start_date);
    let histories = slot_histories(&feature_rows, history_cutoff);
    let mut candidates =
        Forecaster::new(&model, &spec, &calendar).forecast(&aggregation.slots, &histories, &dates);

    // Step 5: holds
    let held = held_members(&inputs.holds);
    let affinity = MemberSlotAffinity::from_events(&inputs.attendance, &held);
    let holds = apply_holds(
        &mut candidates,
        &inputs.holds,
        &affinity,
        config.hold_contribution,
    );

    // Step 6: capacity and risk
    let matcher = CapacityMatcher::new(&inputs.capacity_rules, config.capacity_tie_break);
    let coach_counts = config
        .scale_capacity_by_coaches
        .then(|| CoachCounts::from_events(&inputs.attendance));
    let mut classifier = RiskClassifier::new(&matcher, config.risk_thresholds);
    if let Some(counts) = coach_counts.as_ref() {
        classifier = classifier.with_coach_counts(counts);
    }
    let (rows, duplicate_rows_collapsed) = dedupe_by_key(classifier.classify(&candidates));

    let summary = summarize(&rows, &holds, duplicate_rows_collapsed);
    log_summary(&summary);

    Ok(PipelineOutput {
        rows,
        model,
        aggregation: aggregation.diagnostics,
        holds,
        summary,
    })
}

/// Load inputs from `store`, run the forecast and, unless `dry_run`, upsert
/// the rows back. Nothing is written when the run fails.
pub async fn run_with_store<S: ForecastStore>(
    store: &S,
    config: &ForecastConfig,
    start_date: NaiveDate,
    dry_run: bool,
) -> anyhow::Result<PipelineOutput> {
    use anyhow::Context;

    let inputs = store
        .load_inputs()
        .await
        .context("Failed to load forecast inputs")?;

    let output = run(&inputs, config, start_date)?;

    if dry_run {
        info!("Dry run: skipping upsert of {} rows", output.rows.len());
    } else {
        let written = store
            .upsert_forecasts(&output.rows)
            .await
            .context("Failed to upsert forecasts")?;
        info!("Wrote {} forecast rows", written);
    }

    Ok(output)
}

fn summarize(rows: &[ForecastRow], holds: &HoldsSummary, duplicates: usize) -> RunSummary {
    let mut flag_counts = BTreeMap::new();
    for row in rows {
        *flag_counts.entry(row.risk_flag).or_insert(0) += 1;
    }

    let window = rows
        .first()
        .zip(rows.last())
        .map(|(first, last)| (first.session_date, last.session_date));

    RunSummary {
        total_rows: rows.len(),
        rows_with_capacity: rows
            .iter()
            .filter(|r| r.predicted_utilisation.is_some())
            .count(),
        flag_counts,
        total_hold_adjustment: holds.total_adjustment,
        window,
        duplicate_rows_collapsed: duplicates,
    }
}

fn log_summary(summary: &RunSummary) {
    match summary.window {
        Some((first, last)) => info!(
            "Forecast {} rows from {} to {}",
            summary.total_rows, first, last
        ),
        None => info!("Forecast produced no rows"),
    }
    info!(
        "Risk flags: green={} amber={} red={} black={}",
        summary.count(RiskFlag::Green),
        summary.count(RiskFlag::Amber),
        summary.count(RiskFlag::Red),
        summary.count(RiskFlag::Black)
    );
    info!(
        "Rows with capacity: {}/{}, hold adjustment: {:.2}",
        summary.rows_with_capacity, summary.total_rows, summary.total_hold_adjustment
    );
    if summary.duplicate_rows_collapsed > 0 {
        warn!(
            "Collapsed {} rows with duplicate keys",
            summary.duplicate_rows_collapsed
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(day: u32, name: &str, predicted: f64) -> ForecastRow {
        ForecastRow {
            session_date: NaiveDate::from_ymd_opt(2024, 2, day).unwrap(),
            session_name: name.to_string(),
            session_start: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
            session_end: None,
            predicted_attendance: predicted,
            predicted_utilisation: None,
            risk_flag: RiskFlag::Black,
        }
    }

    #[test]
    fn test_dedupe_keeps_last_and_sorts() {
        let rows = vec![row(2, "B", 1.0), row(1, "A", 2.0), row(2, "B", 3.0)];

        let (rows, dropped) = dedupe_by_key(rows);

        assert_eq!(dropped, 1);
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].session_name, "A");
        assert_eq!(rows[1].predicted_attendance, 3.0);
    }

    #[test]
    fn test_empty_attendance_is_insufficient() {
        let result = run(
            &PipelineInputs::default(),
            &ForecastConfig::default(),
            NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
        );
        assert!(matches!(result, Err(ForecastError::InsufficientData(_))));
    }

    #[test]
    fn test_only_malformed_events_is_insufficient() {
        let inputs = PipelineInputs {
            attendance: vec![AttendanceEvent {
                session_date: NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                session_start: NaiveTime::from_hms_opt(6, 0, 0).unwrap(),
                session_end: None,
                session_name: " ".to_string(),
                member_id: "1".to_string(),
                coach_name: None,
            }],
            ..Default::default()
        };

        let result = run(
            &inputs,
            &ForecastConfig::default(),
            NaiveDate::from_ymd_opt(2024, 3, 1).unwrap(),
        );
        assert!(matches!(result, Err(ForecastError::InsufficientData(_))));
    }

    #[test]
    fn test_summary_counts_flags() {
        let mut rows = vec![row(1, "A", 1.0), row(2, "A", 1.0)];
        rows[1].risk_flag = RiskFlag::Green;
        rows[1].predicted_utilisation = Some(0.1);

        let summary = summarize(&rows, &HoldsSummary::default(), 0);

        assert_eq!(summary.count(RiskFlag::Black), 1);
        assert_eq!(summary.count(RiskFlag::Green), 1);
        assert_eq!(summary.count(RiskFlag::Red), 0);
        assert_eq!(summary.rows_with_capacity, 1);
        assert_eq!(
            summary.window,
            Some((
                NaiveDate::from_ymd_opt(2024, 2, 1).unwrap(),
                NaiveDate::from_ymd_opt(2024, 2, 2).unwrap()
            ))
        );
    }
}
