//! Recursive multi-step attendance forecasting.

use std::collections::BTreeMap;

use chrono::{Duration, NaiveDate};
use tracing::{debug, info};

use crate::calendar::WorkCalendar;
use crate::ml::{FeatureSpec, PredictionFeatures, SlotHistory, TrainedModel};
use crate::models::{ForecastCandidate, SessionSlot, SlotKey};
use crate::traits::Clock;

/// First forecast date when none is given: the day after today.
pub fn default_start_date(clock: &dyn Clock) -> NaiveDate {
    clock.now_local().date_naive() + Duration::days(1)
}

/// Business days in `[start, start + horizon_days)`.
pub fn forecast_dates(start: NaiveDate, horizon_days: i64, calendar: &WorkCalendar) -> Vec<NaiveDate> {
    calendar.business_days(start, horizon_days)
}

/// Produces one prediction per (slot, date), feeding each prediction back
/// into the slot's lag buffer before moving to the next date.
pub struct Forecaster<'a> {
    model: &'a TrainedModel,
    spec: &'a FeatureSpec,
    calendar: &'a WorkCalendar,
}

impl<'a> Forecaster<'a> {
    pub fn new(model: &'a TrainedModel, spec: &'a FeatureSpec, calendar: &'a WorkCalendar) -> Self {
        Self {
            model,
            spec,
            calendar,
        }
    }

    /// Forecast every slot over `dates`.
    ///
    /// `histories` must only contain attendance dated before the first entry
    /// of `dates`; slots without history start from an empty buffer.
    /// Output is sorted by (session_date, session_name, session_start).
    pub fn forecast(
        &self,
        slots: &[SessionSlot],
        histories: &BTreeMap<SlotKey, SlotHistory>,
        dates: &[NaiveDate],
    ) -> Vec<ForecastCandidate> {
        let mut dates = dates.to_vec();
        dates.sort();
        dates.dedup();

        let mut candidates = Vec::with_capacity(slots.len() * dates.len());

        for slot in slots {
            let key = slot.key();
            let mut buffer = histories.get(&key).cloned().unwrap_or_default();
            debug!("Forecasting {} from {} observed values", key, buffer.len());

            for &date in &dates {
                let predicted = self.predict_next(date, &buffer);
                buffer.push(predicted);
                candidates.push(ForecastCandidate {
                    session_date: date,
                    session_name: slot.session_name.clone(),
                    session_start: slot.session_start,
                    session_end: slot.session_end,
                    predicted_attendance: predicted,
                });
            }
        }

        candidates.sort_by(|a, b| {
            (a.session_date, &a.session_name, a.session_start).cmp(&(
                b.session_date,
                &b.session_name,
                b.session_start,
            ))
        });

        info!(
            "Forecast {} rows for {} slots over {} dates",
            candidates.len(),
            slots.len(),
            dates.len()
        );

        candidates
    }

    /// Clamped prediction for `date` given everything in `history`.
    pub fn predict_next(&self, date: NaiveDate, history: &SlotHistory) -> f64 {
        let features = PredictionFeatures::extract(date, history, self.calendar, self.spec);
        let raw = self.model.predict(&features.to_vec(self.spec));
        if raw.is_finite() { raw.max(0.0) } else { 0.0 }
    }
}
