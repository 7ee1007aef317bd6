use std::collections::HashMap;

use chrono::{Datelike, NaiveDate};

use crate::models::CalendarDay;

/// Business-day calendar keyed by date.
///
/// Dates the calendar does not know about are treated as ordinary business
/// days without a holiday.
#[derive(Debug, Clone, Default)]
pub struct WorkCalendar {
    days: HashMap<NaiveDate, DayKind>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct DayKind {
    is_business_day: bool,
    is_named_holiday: bool,
}

impl WorkCalendar {
    pub fn new(days: &[CalendarDay]) -> Self {
        let days = days
            .iter()
            .map(|day| {
                let is_named_holiday = day
                    .holiday_name
                    .as_deref()
                    .is_some_and(|name| !name.trim().is_empty());
                (
                    day.the_date,
                    DayKind {
                        is_business_day: day.is_business_day,
                        is_named_holiday,
                    },
                )
            })
            .collect();

        Self { days }
    }

    /// Number of dates the calendar has an entry for.
    pub fn len(&self) -> usize {
        self.days.len()
    }

    pub fn is_empty(&self) -> bool {
        self.days.is_empty()
    }

    /// Check whether sessions run on this date.
    pub fn is_business_day(&self, date: NaiveDate) -> bool {
        self.days
            .get(&date)
            .map(|kind| kind.is_business_day)
            .unwrap_or(true)
    }

    /// A date is a holiday when it is not a business day or carries a holiday name.
    pub fn is_holiday(&self, date: NaiveDate) -> bool {
        self.days
            .get(&date)
            .map(|kind| !kind.is_business_day || kind.is_named_holiday)
            .unwrap_or(false)
    }

    /// Business days in `[start, start + horizon_days)`.
    ///
    /// Stops early at the last representable date.
    pub fn business_days(&self, start: NaiveDate, horizon_days: i64) -> Vec<NaiveDate> {
        start
            .iter_days()
            .take(usize::try_from(horizon_days).unwrap_or(0))
            .filter(|date| self.is_business_day(*date))
            .collect()
    }
}

/// Day of week with Monday = 0.
pub fn day_of_week(date: NaiveDate) -> u32 {
    date.weekday().num_days_from_monday()
}

/// ISO week number (1-53).
pub fn week_of_year(date: NaiveDate) -> u32 {
    date.iso_week().week()
}
