//! Capacity lookup and risk-flag classification.

use std::collections::BTreeMap;

use chrono::NaiveDate;
use tracing::{debug, info, warn};

use crate::aggregate::validate_event;
use crate::config::{CapacityTieBreak, RiskThresholds};
use crate::models::{AttendanceEvent, CapacityRule, ForecastCandidate, ForecastRow, RiskFlag, SlotKey};

/// A capacity rule that can actually match something.
#[derive(Debug, Clone, PartialEq)]
struct UsableRule {
    pattern: String,
    capacity: f64,
    config_key: Option<String>,
}

/// Resolves a session name to its base capacity.
///
/// Matching is a case-insensitive substring test of the rule's pattern
/// against the session name.
#[derive(Debug, Clone, Default)]
pub struct CapacityMatcher {
    rules: Vec<UsableRule>,
}

impl CapacityMatcher {
    pub fn new(rules: &[CapacityRule], tie_break: CapacityTieBreak) -> Self {
        let mut usable = Vec::with_capacity(rules.len());
        for rule in rules {
            let pattern = rule
                .match_pattern
                .as_deref()
                .map(str::trim)
                .unwrap_or_default();
            if pattern.is_empty() {
                debug!("Ignoring capacity rule {:?}: blank pattern", rule.config_key);
                continue;
            }
            let Some(capacity) = rule.capacity.filter(|c| c.is_finite() && *c > 0.0) else {
                warn!(
                    "Ignoring capacity rule {:?} ('{}'): capacity missing or not positive",
                    rule.config_key, pattern
                );
                continue;
            };
            usable.push(UsableRule {
                pattern: pattern.to_uppercase(),
                capacity,
                config_key: rule.config_key.clone(),
            });
        }

        if tie_break == CapacityTieBreak::LongestPattern {
            // Stable: equal lengths keep configuration order.
            usable.sort_by(|a, b| b.pattern.chars().count().cmp(&a.pattern.chars().count()));
        }

        Self { rules: usable }
    }

    pub fn len(&self) -> usize {
        self.rules.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rules.is_empty()
    }

    /// Base capacity for a session, if any rule matches.
    pub fn base_capacity(&self, session_name: &str) -> Option<f64> {
        let name = session_name.to_uppercase();
        let rule = self.rules.iter().find(|r| name.contains(&r.pattern))?;
        debug!(
            "Matched '{}' to pattern '{}' ({:?}): base capacity {}",
            session_name, rule.pattern, rule.config_key, rule.capacity
        );
        Some(rule.capacity)
    }
}

/// Number of coaches named in a comma-separated coach field; at least 1.
pub fn count_coaches(coach_name: Option<&str>) -> u32 {
    let count = coach_name
        .map(|names| names.split(',').filter(|n| !n.trim().is_empty()).count())
        .unwrap_or(0);
    count.max(1) as u32
}

/// Typical coach count per slot.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CoachCounts {
    counts: BTreeMap<SlotKey, u32>,
}

impl CoachCounts {
    /// Median coach count over each slot's occurrences, rounded half to even,
    /// never below 1.
    pub fn from_events(events: &[AttendanceEvent]) -> Self {
        let mut per_occurrence: BTreeMap<(SlotKey, NaiveDate), u32> = BTreeMap::new();
        for event in events.iter().filter(|e| validate_event(e).is_ok()) {
            let key = SlotKey::new(event.session_name.trim(), event.session_start);
            let coaches = count_coaches(event.coach_name.as_deref());
            let entry = per_occurrence.entry((key, event.session_date)).or_insert(coaches);
            *entry = (*entry).max(coaches);
        }

        let mut by_slot: BTreeMap<SlotKey, Vec<u32>> = BTreeMap::new();
        for ((key, _), coaches) in per_occurrence {
            by_slot.entry(key).or_default().push(coaches);
        }

        let counts: BTreeMap<SlotKey, u32> = by_slot
            .into_iter()
            .map(|(key, mut values)| {
                values.sort_unstable();
                let mid = values.len() / 2;
                let median = if values.len() % 2 == 0 {
                    (values[mid - 1] + values[mid]) as f64 / 2.0
                } else {
                    values[mid] as f64
                };
                (key, (median.round_ties_even() as u32).max(1))
            })
            .collect();

        if let (Some(min), Some(max)) = (counts.values().min(), counts.values().max()) {
            info!(
                "Coach counts for {} slots range from {} to {}",
                counts.len(),
                min,
                max
            );
        }

        Self { counts }
    }

    /// Coaches for a slot, defaulting to 1 when unknown.
    pub fn get(&self, slot: &SlotKey) -> u32 {
        self.counts.get(slot).copied().unwrap_or(1)
    }
}

/// Map a utilisation to its risk tier. `None` means no capacity.
pub fn classify_utilisation(utilisation: Option<f64>, thresholds: &RiskThresholds) -> RiskFlag {
    match utilisation {
        None => RiskFlag::Black,
        Some(u) if u < thresholds.amber_from => RiskFlag::Green,
        Some(u) if u <= thresholds.red_above => RiskFlag::Amber,
        Some(_) => RiskFlag::Red,
    }
}

/// Attaches capacity, utilisation and a risk flag to each forecast candidate.
pub struct RiskClassifier<'a> {
    matcher: &'a CapacityMatcher,
    thresholds: RiskThresholds,
    coaches: Option<&'a CoachCounts>,
}

impl<'a> RiskClassifier<'a> {
    pub fn new(matcher: &'a CapacityMatcher, thresholds: RiskThresholds) -> Self {
        Self {
            matcher,
            thresholds,
            coaches: None,
        }
    }

    /// Multiply base capacity by each slot's typical coach count.
    pub fn with_coach_counts(mut self, coaches: &'a CoachCounts) -> Self {
        self.coaches = Some(coaches);
        self
    }

    /// Total capacity for a slot.
    pub fn capacity(&self, slot: &SlotKey) -> Option<f64> {
        let base = self.matcher.base_capacity(&slot.session_name)?;
        let coaches = self.coaches.map(|c| c.get(slot)).unwrap_or(1);
        Some(base * coaches as f64)
    }

    pub fn classify_one(&self, candidate: &ForecastCandidate) -> ForecastRow {
        let utilisation = self
            .capacity(&candidate.slot_key())
            .map(|capacity| candidate.predicted_attendance / capacity);

        ForecastRow {
            session_date: candidate.session_date,
            session_name: candidate.session_name.clone(),
            session_start: candidate.session_start,
            session_end: candidate.session_end,
            predicted_attendance: candidate.predicted_attendance,
            predicted_utilisation: utilisation,
            risk_flag: classify_utilisation(utilisation, &self.thresholds),
        }
    }

    pub fn classify(&self, candidates: &[ForecastCandidate]) -> Vec<ForecastRow> {
        let rows: Vec<ForecastRow> = candidates.iter().map(|c| self.classify_one(c)).collect();

        let mut unmatched: BTreeMap<&str, usize> = BTreeMap::new();
        for row in rows.iter().filter(|r| r.risk_flag == RiskFlag::Black) {
            *unmatched.entry(row.session_name.as_str()).or_default() += 1;
        }
        for (name, count) in &unmatched {
            warn!("No capacity rule matches '{}' ({} rows flagged black)", name, count);
        }

        rows
    }
}
