//! Records exchanged between the forecasting engine and its data-store
//! collaborators, plus the intermediate series the engine derives from them.

use std::fmt;
use std::str::FromStr;

use chrono::{NaiveDate, NaiveTime};
use serde::{Deserialize, Deserializer, Serialize};
use sqlx::FromRow;

// ==================== Source Records ====================

/// A single member's attendance at one session occurrence.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Deserialize, Serialize)]
pub struct AttendanceEvent {
    pub session_date: NaiveDate,
    pub session_start: NaiveTime,
    #[serde(default)]
    pub session_end: Option<NaiveTime>,
    pub session_name: String,
    #[serde(deserialize_with = "text_or_integer")]
    pub member_id: String,
    /// Comma-separated when a session is co-coached.
    #[serde(default)]
    pub coach_name: Option<String>,
}

/// One row of the business calendar.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Deserialize, Serialize)]
pub struct CalendarDay {
    pub the_date: NaiveDate,
    pub is_business_day: bool,
    #[serde(default)]
    pub holiday_name: Option<String>,
}

/// A period during which a member is expected to skip their usual sessions.
///
/// Holds without an end date are open-ended and never adjust a forecast.
#[derive(Debug, Clone, PartialEq, Eq, FromRow, Deserialize, Serialize)]
pub struct MemberHold {
    #[serde(deserialize_with = "text_or_integer")]
    pub member_id: String,
    pub hold_start: NaiveDate,
    #[serde(default)]
    pub hold_end: Option<NaiveDate>,
}

/// Capacity for every session whose name contains `match_pattern`.
#[derive(Debug, Clone, PartialEq, FromRow, Deserialize, Serialize)]
pub struct CapacityRule {
    #[serde(default)]
    pub config_key: Option<String>,
    #[serde(default)]
    pub match_pattern: Option<String>,
    #[serde(default)]
    pub capacity: Option<f64>,
}

// ==================== Derived Series ====================

/// Grouping identity of a recurring session.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct SlotKey {
    pub session_name: String,
    pub session_start: NaiveTime,
}

impl SlotKey {
    pub fn new(session_name: impl Into<String>, session_start: NaiveTime) -> Self {
        Self {
            session_name: session_name.into(),
            session_start,
        }
    }
}

impl fmt::Display for SlotKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} @ {}", self.session_name, self.session_start.format("%H:%M"))
    }
}

/// A recurring session as observed in history.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSlot {
    pub session_name: String,
    pub session_start: NaiveTime,
    pub session_end: Option<NaiveTime>,
}

impl SessionSlot {
    pub fn key(&self) -> SlotKey {
        SlotKey::new(self.session_name.clone(), self.session_start)
    }
}

/// Attendance at one concrete instance of a slot.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionOccurrence {
    pub session_date: NaiveDate,
    pub session_name: String,
    pub session_start: NaiveTime,
    pub session_end: Option<NaiveTime>,
    pub attendance_count: u32,
}

impl SessionOccurrence {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.session_name.clone(), self.session_start)
    }
}

// ==================== Forecast Output ====================

/// A prediction for one (slot, date) before capacity is applied.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastCandidate {
    pub session_date: NaiveDate,
    pub session_name: String,
    pub session_start: NaiveTime,
    pub session_end: Option<NaiveTime>,
    pub predicted_attendance: f64,
}

impl ForecastCandidate {
    pub fn slot_key(&self) -> SlotKey {
        SlotKey::new(self.session_name.clone(), self.session_start)
    }
}

/// Capacity risk tier of a forecast row.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RiskFlag {
    Green,
    Amber,
    Red,
    /// No capacity could be matched.
    Black,
}

impl RiskFlag {
    pub fn as_str(&self) -> &'static str {
        match self {
            RiskFlag::Green => "green",
            RiskFlag::Amber => "amber",
            RiskFlag::Red => "red",
            RiskFlag::Black => "black",
        }
    }
}

impl FromStr for RiskFlag {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "green" => Ok(RiskFlag::Green),
            "amber" => Ok(RiskFlag::Amber),
            "red" => Ok(RiskFlag::Red),
            "black" => Ok(RiskFlag::Black),
            other => Err(format!("unknown risk flag: {}", other)),
        }
    }
}

impl fmt::Display for RiskFlag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Final, risk-annotated forecast. Upserted on
/// `(session_date, session_name, session_start)`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastRow {
    pub session_date: NaiveDate,
    pub session_name: String,
    pub session_start: NaiveTime,
    pub session_end: Option<NaiveTime>,
    pub predicted_attendance: f64,
    pub predicted_utilisation: Option<f64>,
    pub risk_flag: RiskFlag,
}

impl ForecastRow {
    pub fn upsert_key(&self) -> (NaiveDate, &str, NaiveTime) {
        (self.session_date, self.session_name.as_str(), self.session_start)
    }
}

/// Member ids arrive as text from some stores and as integers from others.
fn text_or_integer<'de, D>(deserializer: D) -> Result<String, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Id {
        Integer(i64),
        Text(String),
    }

    Ok(match Id::deserialize(deserializer)? {
        Id::Integer(n) => n.to_string(),
        Id::Text(s) => s,
    })
}
