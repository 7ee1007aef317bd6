//! Collapses member-level attendance events into per-occurrence counts.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{NaiveDate, NaiveTime};
use tracing::{info, warn};

use crate::models::{AttendanceEvent, SessionOccurrence, SessionSlot, SlotKey};

/// Why an event was rejected at the aggregation boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RejectReason {
    BlankSessionName,
    BlankMemberId,
    EndsBeforeStart,
}

impl RejectReason {
    pub fn description(&self) -> &'static str {
        match self {
            RejectReason::BlankSessionName => "blank session name",
            RejectReason::BlankMemberId => "blank member id",
            RejectReason::EndsBeforeStart => "session ends before it starts",
        }
    }
}

/// An input event that was dropped, identified by its position in the input.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RejectedEvent {
    pub index: usize,
    pub reason: RejectReason,
}

/// What the aggregator saw and discarded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AggregationDiagnostics {
    pub events_seen: usize,
    pub rejected: Vec<RejectedEvent>,
    /// Events repeating a member already counted for the same occurrence.
    pub duplicate_events: usize,
}

/// Output of [`aggregate`].
#[derive(Debug, Clone, Default)]
pub struct Aggregation {
    /// Sorted by (session_date, session_name, session_start).
    pub occurrences: Vec<SessionOccurrence>,
    /// Every slot seen at least once, sorted by key.
    pub slots: Vec<SessionSlot>,
    pub diagnostics: AggregationDiagnostics,
}

impl Aggregation {
    pub fn is_empty(&self) -> bool {
        self.occurrences.is_empty()
    }
}

/// Check an event before it can reach any aggregate.
pub fn validate_event(event: &AttendanceEvent) -> Result<(), RejectReason> {
    if event.session_name.trim().is_empty() {
        return Err(RejectReason::BlankSessionName);
    }
    if event.member_id.trim().is_empty() {
        return Err(RejectReason::BlankMemberId);
    }
    if let Some(end) = event.session_end {
        if end < event.session_start {
            return Err(RejectReason::EndsBeforeStart);
        }
    }
    Ok(())
}

#[derive(Default)]
struct OccurrenceAccumulator<'a> {
    members: BTreeSet<&'a str>,
    session_end: Option<NaiveTime>,
}

/// Aggregate events into one occurrence per (date, slot) that had attendees.
///
/// Counts distinct members; dates without events produce no occurrence.
pub fn aggregate(events: &[AttendanceEvent]) -> Aggregation {
    let mut diagnostics = AggregationDiagnostics {
        events_seen: events.len(),
        ..Default::default()
    };

    let mut groups: BTreeMap<(NaiveDate, SlotKey), OccurrenceAccumulator<'_>> = BTreeMap::new();

    for (index, event) in events.iter().enumerate() {
        if let Err(reason) = validate_event(event) {
            warn!(
                "Dropping attendance event #{}: {} ({} on {})",
                index,
                reason.description(),
                event.session_name,
                event.session_date
            );
            diagnostics.rejected.push(RejectedEvent { index, reason });
            continue;
        }

        let key = (
            event.session_date,
            SlotKey::new(event.session_name.trim(), event.session_start),
        );
        let acc = groups.entry(key).or_default();

        if !acc.members.insert(event.member_id.trim()) {
            diagnostics.duplicate_events += 1;
        }
        // Conflicting end times resolve to the latest one.
        acc.session_end = acc.session_end.max(event.session_end);
    }

    let mut slot_ends: BTreeMap<SlotKey, (NaiveDate, Option<NaiveTime>)> = BTreeMap::new();
    let mut occurrences = Vec::with_capacity(groups.len());

    for ((session_date, key), acc) in groups {
        // Slots carry the end time of their most recent occurrence.
        slot_ends
            .entry(key.clone())
            .and_modify(|(last_date, end)| {
                if session_date >= *last_date {
                    *last_date = session_date;
                    *end = acc.session_end;
                }
            })
            .or_insert((session_date, acc.session_end));

        occurrences.push(SessionOccurrence {
            session_date,
            session_name: key.session_name,
            session_start: key.session_start,
            session_end: acc.session_end,
            attendance_count: acc.members.len() as u32,
        });
    }

    let slots = slot_ends
        .into_iter()
        .map(|(key, (_, session_end))| SessionSlot {
            session_name: key.session_name,
            session_start: key.session_start,
            session_end,
        })
        .collect::<Vec<_>>();

    let total: u64 = occurrences.iter().map(|o| o.attendance_count as u64).sum();
    info!(
        "Aggregated {} events into {} session occurrences across {} slots ({} attendances, {} rejected, {} duplicates)",
        diagnostics.events_seen,
        occurrences.len(),
        slots.len(),
        total,
        diagnostics.rejected.len(),
        diagnostics.duplicate_events
    );

    Aggregation {
        occurrences,
        slots,
        diagnostics,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn date(d: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(2024, 1, d).unwrap()
    }

    fn time(h: u32) -> NaiveTime {
        NaiveTime::from_hms_opt(h, 0, 0).unwrap()
    }

    fn event(day: u32, name: &str, start: u32, member: &str) -> AttendanceEvent {
        AttendanceEvent {
            session_date: date(day),
            session_start: time(start),
            session_end: Some(time(start + 1)),
            session_name: name.to_string(),
            member_id: member.to_string(),
            coach_name: None,
        }
    }

    #[test]
    fn test_empty_input_yields_empty_output() {
        let result = aggregate(&[]);
        assert!(result.is_empty());
        assert!(result.slots.is_empty());
        assert_eq!(result.diagnostics, AggregationDiagnostics::default());
    }

    #[test]
    fn test_counts_distinct_members() {
        let events = vec![
            event(1, "BOX", 6, "a"),
            event(1, "BOX", 6, "b"),
            event(1, "BOX", 6, "a"),
            event(1, "BOX", 6, "c"),
        ];

        let result = aggregate(&events);

        assert_eq!(result.occurrences.len(), 1);
        assert_eq!(result.occurrences[0].attendance_count, 3);
        assert_eq!(result.diagnostics.duplicate_events, 1);
    }

    #[test]
    fn test_groups_by_date_name_and_start() {
        let events = vec![
            event(1, "BOX", 6, "a"),
            event(1, "BOX", 7, "a"),
            event(1, "PERFORM", 6, "a"),
            event(2, "BOX", 6, "a"),
            event(2, "BOX", 6, "b"),
        ];

        let result = aggregate(&events);

        assert_eq!(result.occurrences.len(), 4);
        assert_eq!(result.slots.len(), 3);

        let jan2 = result
            .occurrences
            .iter()
            .find(|o| o.session_date == date(2))
            .unwrap();
        assert_eq!(jan2.attendance_count, 2);
    }

    #[test]
    fn test_occurrences_sorted_by_date() {
        let events = vec![
            event(5, "BOX", 6, "a"),
            event(1, "BOX", 6, "a"),
            event(3, "BOX", 6, "a"),
        ];

        let result = aggregate(&events);
        let dates: Vec<_> = result.occurrences.iter().map(|o| o.session_date).collect();

        assert_eq!(dates, vec![date(1), date(3), date(5)]);
    }

    #[test]
    fn test_malformed_events_are_dropped_and_reported() {
        let mut reversed = event(1, "BOX", 9, "d");
        reversed.session_end = Some(time(8));

        let events = vec![
            event(1, "BOX", 6, "a"),
            event(1, "  ", 6, "b"),
            event(1, "BOX", 6, ""),
            reversed,
        ];

        let result = aggregate(&events);

        assert_eq!(result.occurrences.len(), 1);
        assert_eq!(result.occurrences[0].attendance_count, 1);
        assert_eq!(
            result.diagnostics.rejected,
            vec![
                RejectedEvent {
                    index: 1,
                    reason: RejectReason::BlankSessionName
                },
                RejectedEvent {
                    index: 2,
                    reason: RejectReason::BlankMemberId
                },
                RejectedEvent {
                    index: 3,
                    reason: RejectReason::EndsBeforeStart
                },
            ]
        );
    }

    #[test]
    fn test_slot_end_comes_from_latest_occurrence() {
        let mut early = event(1, "BOX", 6, "a");
        early.session_end = Some(time(7));
        let mut late = event(8, "BOX", 6, "a");
        late.session_end = NaiveTime::from_hms_opt(7, 30, 0);

        let result = aggregate(&[late, early]);

        assert_eq!(result.slots.len(), 1);
        assert_eq!(result.slots[0].session_end, NaiveTime::from_hms_opt(7, 30, 0));
    }

    #[test]
    fn test_missing_end_time_is_kept() {
        let mut e = event(1, "OPEN GYM", 10, "a");
        e.session_end = None;

        let result = aggregate(&[e]);

        assert_eq!(result.occurrences[0].session_end, None);
        assert_eq!(result.slots[0].session_end, None);
    }
}
