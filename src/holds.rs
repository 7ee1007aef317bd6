//! Reduces forecasts for members who are on hold.
//!
//! A member only counts against the slots they have actually attended in the
//! past. Holds without an end date never adjust anything.

use std::collections::{BTreeMap, BTreeSet, HashMap, HashSet};

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::aggregate::validate_event;
use crate::config::HoldContribution;
use crate::models::{AttendanceEvent, ForecastCandidate, MemberHold, SlotKey};

/// How often each member attends each slot, relative to how often it ran.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MemberSlotAffinity {
    rates: BTreeMap<String, BTreeMap<SlotKey, f64>>,
}

impl MemberSlotAffinity {
    /// Build affinities for `members` from historical attendance.
    ///
    /// Rate = distinct dates the member attended the slot / distinct dates the
    /// slot ran, capped at 1. Slots the member never attended are absent.
    pub fn from_events(events: &[AttendanceEvent], members: &BTreeSet<String>) -> Self {
        let mut slot_dates: HashMap<SlotKey, HashSet<NaiveDate>> = HashMap::new();
        let mut member_dates: BTreeMap<(String, SlotKey), HashSet<NaiveDate>> = BTreeMap::new();

        for event in events.iter().filter(|e| validate_event(e).is_ok()) {
            let key = SlotKey::new(event.session_name.trim(), event.session_start);
            slot_dates
                .entry(key.clone())
                .or_default()
                .insert(event.session_date);

            let member = event.member_id.trim();
            if members.contains(member) {
                member_dates
                    .entry((member.to_string(), key))
                    .or_default()
                    .insert(event.session_date);
            }
        }

        let mut rates: BTreeMap<String, BTreeMap<SlotKey, f64>> = BTreeMap::new();
        for ((member, key), dates) in member_dates {
            let ran = slot_dates.get(&key).map(HashSet::len).unwrap_or(0);
            if ran == 0 {
                continue;
            }
            let rate = (dates.len() as f64 / ran as f64).min(1.0);
            rates.entry(member).or_default().insert(key, rate);
        }

        Self { rates }
    }

    /// Slots the member attends, with their attendance rate.
    pub fn slots_for(&self, member_id: &str) -> Option<&BTreeMap<SlotKey, f64>> {
        self.rates.get(member_id)
    }

    pub fn rate(&self, member_id: &str, slot: &SlotKey) -> Option<f64> {
        self.rates.get(member_id)?.get(slot).copied()
    }

    /// Number of members with at least one attended slot.
    pub fn member_count(&self) -> usize {
        self.rates.len()
    }
}

/// What the adjuster did.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct HoldsSummary {
    pub holds_seen: usize,
    pub skipped_open_ended: usize,
    pub skipped_inverted: usize,
    /// Members on a bounded hold with no attendance history.
    pub members_without_history: usize,
    pub rows_adjusted: usize,
    /// Attendance removed across all rows, after clamping.
    pub total_adjustment: f64,
}

/// Member ids of every hold that can affect a forecast.
pub fn held_members(holds: &[MemberHold]) -> BTreeSet<String> {
    holds
        .iter()
        .filter(|h| h.hold_end.is_some_and(|end| end >= h.hold_start))
        .map(|h| h.member_id.trim().to_string())
        .collect()
}

/// Subtract held members' expected attendance from forecast candidates.
///
/// A member on several overlapping holds counts once per date. Predictions are
/// clamped at zero.
pub fn apply_holds(
    candidates: &mut [ForecastCandidate],
    holds: &[MemberHold],
    affinity: &MemberSlotAffinity,
    contribution: HoldContribution,
) -> HoldsSummary {
    let mut summary = HoldsSummary {
        holds_seen: holds.len(),
        ..Default::default()
    };

    let forecast_dates: BTreeSet<NaiveDate> = candidates.iter().map(|c| c.session_date).collect();

    // member -> forecast dates they are on hold
    let mut held_dates: BTreeMap<&str, BTreeSet<NaiveDate>> = BTreeMap::new();
    for hold in holds {
        let Some(end) = hold.hold_end else {
            summary.skipped_open_ended += 1;
            continue;
        };
        if end < hold.hold_start {
            warn!(
                "Skipping hold for member {}: ends {} before it starts {}",
                hold.member_id, end, hold.hold_start
            );
            summary.skipped_inverted += 1;
            continue;
        }
        held_dates
            .entry(hold.member_id.trim())
            .or_default()
            .extend(forecast_dates.range(hold.hold_start..=end).copied());
    }

    debug!(
        "{} of {} held members have attendance history",
        affinity.member_count(),
        held_dates.len()
    );

    let mut deductions: HashMap<(NaiveDate, SlotKey), f64> = HashMap::new();
    for (member, dates) in &held_dates {
        let Some(slots) = affinity.slots_for(member) else {
            debug!("Member {} is on hold but has no attendance history", member);
            summary.members_without_history += 1;
            continue;
        };
        for date in dates {
            for (slot, rate) in slots {
                let amount = match contribution {
                    HoldContribution::FullOccurrence => 1.0,
                    HoldContribution::AttendanceRate => *rate,
                };
                *deductions.entry((*date, slot.clone())).or_default() += amount;
            }
        }
    }

    for candidate in candidates.iter_mut() {
        let key = (candidate.session_date, candidate.slot_key());
        let Some(&deduction) = deductions.get(&key) else {
            continue;
        };
        let adjusted = (candidate.predicted_attendance - deduction).max(0.0);
        let removed = candidate.predicted_attendance - adjusted;
        if removed > 0.0 {
            summary.rows_adjusted += 1;
            summary.total_adjustment += removed;
        }
        candidate.predicted_attendance = adjusted;
    }

    if summary.skipped_open_ended > 0 {
        info!(
            "Ignored {} open-ended holds without an end date",
            summary.skipped_open_ended
        );
    }
    info!(
        "Applied holds for {} members: {:.2} expected attendance removed across {} rows",
        held_dates.len(),
        summary.total_adjustment,
        summary.rows_adjusted
    );

    summary
}
