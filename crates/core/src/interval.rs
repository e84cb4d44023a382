//! Interval solver
//!
//! Busy-interval merging and greedy free-slot search. All times are UTC
//! instants with millisecond precision; every interval is half-open
//! `[start, end)`. Cross-user scheduling never sees real account ids here,
//! only synthetic `group:<user>` tags.

use std::collections::{BTreeMap, BTreeSet};

use chrono::{DateTime, Duration, Timelike, Utc};
use serde::{Deserialize, Serialize};

use crate::types::UserId;

/// A busy span annotated with the accounts contributing to it.
///
/// Account ids are strings rather than [`crate::types::AccountId`] because
/// group scheduling substitutes synthetic `group:<user>` tags for real ids
/// before intervals cross a user boundary.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BusyInterval {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub account_ids: BTreeSet<String>,
}

impl BusyInterval {
    pub fn new(start: DateTime<Utc>, end: DateTime<Utc>, account_id: impl Into<String>) -> Self {
        BusyInterval {
            start,
            end,
            account_ids: BTreeSet::from([account_id.into()]),
        }
    }
}

/// Merge overlapping and adjacent busy intervals.
///
/// Output intervals are pairwise disjoint, sorted by start, and annotated
/// with the union of contributing account ids. Idempotent and independent
/// of input order; zero-length inputs are dropped.
pub fn merge_busy(mut intervals: Vec<BusyInterval>) -> Vec<BusyInterval> {
    intervals.retain(|i| i.end > i.start);
    intervals.sort_by_key(|i| (i.start, i.end));

    let mut merged: Vec<BusyInterval> = Vec::with_capacity(intervals.len());
    for interval in intervals {
        match merged.last_mut() {
            Some(last) if interval.start <= last.end => {
                last.end = last.end.max(interval.end);
                last.account_ids.extend(interval.account_ids);
            }
            _ => merged.push(interval),
        }
    }
    merged
}

/// Synthetic account id used for one participant's merged busy set
pub fn group_account_id(user: UserId) -> String {
    format!("group:{user}")
}

/// Synthetic ids for every participant of a group session
pub fn build_group_account_ids(users: &[UserId]) -> Vec<String> {
    users.iter().copied().map(group_account_id).collect()
}

/// Daily working window, hours in the busy set's reference timezone
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct WorkingHours {
    pub start_hour: u32,
    pub end_hour: u32,
}

impl Default for WorkingHours {
    fn default() -> Self {
        WorkingHours {
            start_hour: 9,
            end_hour: 17,
        }
    }
}

/// Free-slot search parameters
#[derive(Debug, Clone)]
pub struct SlotQuery {
    pub window_start: DateTime<Utc>,
    pub window_end: DateTime<Utc>,
    pub duration: Duration,
    /// Accounts whose busy intervals are hard blocks. Empty means every
    /// contributing account blocks.
    pub required_account_ids: BTreeSet<String>,
    pub working_hours: Option<WorkingHours>,
    /// User preference weight per starting hour (UTC)
    pub hour_weights: BTreeMap<u32, f64>,
    pub max_candidates: usize,
}

/// One scored slot proposal
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SlotCandidate {
    pub start: DateTime<Utc>,
    pub end: DateTime<Utc>,
    pub score: f64,
    pub explanation: String,
}

const CANDIDATE_GRID_MINUTES: i64 = 30;
const EDGE_CLEARANCE_CAP_MINUTES: i64 = 60;

/// Greedy free-slot search over merged hard blocks.
///
/// Candidates are generated at each free gap's start and on a 30-minute
/// grid inside the gap, scored by working-hours compliance, clearance from
/// the window edges, and per-hour preference weights. Ties break toward
/// the earliest start.
pub fn find_slots(query: &SlotQuery, busy: &[BusyInterval]) -> Vec<SlotCandidate> {
    if query.duration <= Duration::zero()
        || query.window_start + query.duration > query.window_end
    {
        return Vec::new();
    }

    let blocks = hard_blocks(busy, &query.required_account_ids);
    let gaps = free_gaps(query.window_start, query.window_end, &blocks);

    let mut candidates = Vec::new();
    for (gap_start, gap_end) in gaps {
        let mut start = gap_start;
        while start + query.duration <= gap_end {
            candidates.push(score_slot(query, start));
            start = next_grid_start(start);
        }
    }

    candidates.sort_by(|a, b| {
        b.score
            .partial_cmp(&a.score)
            .unwrap_or(std::cmp::Ordering::Equal)
            .then_with(|| a.start.cmp(&b.start))
    });
    candidates.truncate(query.max_candidates);
    candidates
}

/// Merged intervals that block the search: an input interval is hard iff it
/// touches at least one required account.
fn hard_blocks(busy: &[BusyInterval], required: &BTreeSet<String>) -> Vec<BusyInterval> {
    let relevant: Vec<BusyInterval> = busy
        .iter()
        .filter(|interval| {
            required.is_empty() || interval.account_ids.iter().any(|id| required.contains(id))
        })
        .cloned()
        .collect();
    merge_busy(relevant)
}

/// Complement of the blocks inside `[window_start, window_end)`
fn free_gaps(
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    blocks: &[BusyInterval],
) -> Vec<(DateTime<Utc>, DateTime<Utc>)> {
    let mut gaps = Vec::new();
    let mut cursor = window_start;

    for block in blocks {
        if block.end <= window_start || block.start >= window_end {
            continue;
        }
        if block.start > cursor {
            gaps.push((cursor, block.start.min(window_end)));
        }
        cursor = cursor.max(block.end);
    }
    if cursor < window_end {
        gaps.push((cursor, window_end));
    }
    gaps
}

fn next_grid_start(start: DateTime<Utc>) -> DateTime<Utc> {
    let grid = Duration::minutes(CANDIDATE_GRID_MINUTES);
    let minute = i64::from(start.minute());
    let offset = minute % CANDIDATE_GRID_MINUTES;
    if offset == 0 && start.second() == 0 && start.nanosecond() == 0 {
        start + grid
    } else {
        // Snap forward onto the grid
        let snapped = start
            .with_second(0)
            .and_then(|s| s.with_nanosecond(0))
            .unwrap_or(start);
        snapped + Duration::minutes(CANDIDATE_GRID_MINUTES - offset)
    }
}

fn score_slot(query: &SlotQuery, start: DateTime<Utc>) -> SlotCandidate {
    let end = start + query.duration;

    let hours_fraction = query
        .working_hours
        .map_or(1.0, |wh| working_hours_fraction(start, end, wh));

    let lead_in = (start - query.window_start).num_minutes();
    let lead_out = (query.window_end - end).num_minutes();
    let clearance = lead_in.min(lead_out).clamp(0, EDGE_CLEARANCE_CAP_MINUTES);
    #[allow(clippy::cast_precision_loss)]
    let edge_score = clearance as f64 / EDGE_CLEARANCE_CAP_MINUTES as f64;

    let preference = query.hour_weights.get(&start.hour()).copied().unwrap_or(0.0);

    let score = 2.0 * hours_fraction + edge_score + preference;

    let mut notes = Vec::new();
    if query.working_hours.is_some() {
        if (hours_fraction - 1.0).abs() < f64::EPSILON {
            notes.push("within working hours".to_string());
        } else {
            notes.push(format!(
                "{:.0}% inside working hours",
                hours_fraction * 100.0
            ));
        }
    }
    notes.push(format!("{clearance}m clear of window edges"));
    if preference > 0.0 {
        notes.push("preferred hour".to_string());
    }

    SlotCandidate {
        start,
        end,
        score,
        explanation: notes.join("; "),
    }
}

/// Fraction of `[start, end)` that falls inside the daily working window
fn working_hours_fraction(start: DateTime<Utc>, end: DateTime<Utc>, wh: WorkingHours) -> f64 {
    let total = (end - start).num_minutes();
    if total <= 0 || wh.end_hour <= wh.start_hour {
        return 0.0;
    }

    let mut inside = 0i64;
    let mut cursor = start;
    while cursor < end {
        let next = (cursor + Duration::minutes(1)).min(end);
        let hour = cursor.hour();
        if hour >= wh.start_hour && hour < wh.end_hour {
            inside += (next - cursor).num_minutes().max(1);
        }
        cursor = next;
    }
    #[allow(clippy::cast_precision_loss)]
    let fraction = inside.min(total) as f64 / total as f64;
    fraction
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn at(hour: u32, minute: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 2, hour, minute, 0).unwrap()
    }

    fn interval(start: DateTime<Utc>, end: DateTime<Utc>, account: &str) -> BusyInterval {
        BusyInterval::new(start, end, account)
    }

    #[test]
    fn test_merge_overlapping_and_adjacent() {
        // (09:00,10:30) + (10:00,11:00) + (11:00,11:30) -> (09:00,11:30)
        let merged = merge_busy(vec![
            interval(at(9, 0), at(10, 30), "a"),
            interval(at(10, 0), at(11, 0), "a"),
            interval(at(11, 0), at(11, 30), "a"),
        ]);

        assert_eq!(merged.len(), 1);
        assert_eq!(merged[0].start, at(9, 0));
        assert_eq!(merged[0].end, at(11, 30));
    }

    #[test]
    fn test_merge_is_order_independent_and_idempotent() {
        let a = vec![
            interval(at(11, 0), at(11, 30), "x"),
            interval(at(9, 0), at(10, 30), "y"),
            interval(at(10, 0), at(11, 0), "x"),
        ];
        let mut b = a.clone();
        b.reverse();

        let merged_a = merge_busy(a);
        let merged_b = merge_busy(b);
        assert_eq!(merged_a, merged_b);

        let remerged = merge_busy(merged_a.clone());
        assert_eq!(remerged, merged_a);
    }

    #[test]
    fn test_merge_output_is_disjoint_and_sorted() {
        let merged = merge_busy(vec![
            interval(at(14, 0), at(15, 0), "a"),
            interval(at(9, 0), at(10, 0), "b"),
            interval(at(9, 30), at(9, 45), "c"),
        ]);

        for pair in merged.windows(2) {
            assert!(pair[0].end < pair[1].start);
        }
        assert_eq!(merged[0].account_ids, BTreeSet::from(["b".into(), "c".into()]));
    }

    #[test]
    fn test_merge_drops_empty_intervals() {
        let merged = merge_busy(vec![interval(at(9, 0), at(9, 0), "a")]);
        assert!(merged.is_empty());
    }

    #[test]
    fn test_group_ids_never_contain_account_ids() {
        let users = vec![UserId::new(), UserId::new()];
        let real_account = crate::types::AccountId::new().to_string();

        let ids = build_group_account_ids(&users);
        assert_eq!(ids.len(), 2);
        for id in &ids {
            assert!(id.starts_with("group:"));
            assert!(!id.contains(&real_account));
        }
    }

    fn query(window_start: DateTime<Utc>, window_end: DateTime<Utc>, minutes: i64) -> SlotQuery {
        SlotQuery {
            window_start,
            window_end,
            duration: Duration::minutes(minutes),
            required_account_ids: BTreeSet::new(),
            working_hours: None,
            hour_weights: BTreeMap::new(),
            max_candidates: 5,
        }
    }

    #[test]
    fn test_group_candidate_scenario() {
        // U1 busy (09:00,10:00), U2 busy (09:30,10:30), window (09:00,12:00),
        // duration 60m -> first candidate (10:30,11:30)
        let u1 = UserId::new();
        let u2 = UserId::new();
        let busy = vec![
            interval(at(9, 0), at(10, 0), &group_account_id(u1)),
            interval(at(9, 30), at(10, 30), &group_account_id(u2)),
        ];

        let mut q = query(at(9, 0), at(12, 0), 60);
        q.required_account_ids =
            BTreeSet::from([group_account_id(u1), group_account_id(u2)]);

        let slots = find_slots(&q, &busy);
        assert!(!slots.is_empty());
        assert_eq!(slots[0].start, at(10, 30));
        assert_eq!(slots[0].end, at(11, 30));
    }

    #[test]
    fn test_non_required_accounts_do_not_block() {
        let busy = vec![interval(at(9, 0), at(12, 0), "optional-account")];

        let mut q = query(at(9, 0), at(12, 0), 60);
        q.required_account_ids = BTreeSet::from(["required-account".into()]);

        let slots = find_slots(&q, &busy);
        assert!(!slots.is_empty());
        assert_eq!(slots[0].start.hour(), 9);
    }

    #[test]
    fn test_empty_required_set_blocks_on_everything() {
        let busy = vec![interval(at(9, 0), at(12, 0), "a")];
        let q = query(at(9, 0), at(12, 0), 60);
        assert!(find_slots(&q, &busy).is_empty());
    }

    #[test]
    fn test_fully_booked_window_yields_nothing() {
        let busy = vec![interval(at(8, 0), at(13, 0), "a")];
        let mut q = query(at(9, 0), at(12, 0), 30);
        q.required_account_ids = BTreeSet::from(["a".into()]);
        assert!(find_slots(&q, &busy).is_empty());
    }

    #[test]
    fn test_duration_longer_than_window_yields_nothing() {
        let q = query(at(9, 0), at(10, 0), 90);
        assert!(find_slots(&q, &[]).is_empty());
    }

    #[test]
    fn test_candidates_capped_and_ranked() {
        let mut q = query(at(9, 0), at(17, 0), 30);
        q.max_candidates = 3;

        let slots = find_slots(&q, &[]);
        assert_eq!(slots.len(), 3);
        for pair in slots.windows(2) {
            assert!(pair[0].score >= pair[1].score);
        }
    }

    #[test]
    fn test_working_hours_penalize_early_slots() {
        let mut q = query(at(6, 0), at(12, 0), 60);
        q.working_hours = Some(WorkingHours::default());

        let slots = find_slots(&q, &[]);
        let first = &slots[0];
        assert!(first.start.hour() >= 9, "expected in-hours winner, got {}", first.start);
    }

    #[test]
    fn test_hour_preference_tips_the_scale() {
        let mut q = query(at(9, 0), at(13, 0), 60);
        // Heavy preference for slots starting at 11:00 UTC
        q.hour_weights.insert(11, 5.0);

        let slots = find_slots(&q, &[]);
        assert_eq!(slots[0].start.hour(), 11);
    }

    #[test]
    fn test_ties_break_earliest() {
        // No working hours, no preferences, window much longer than the
        // clearance cap: interior slots all score identically.
        let q = query(at(8, 0), at(16, 0), 30);
        let slots = find_slots(&q, &[]);

        let top_score = slots[0].score;
        let tied: Vec<_> = slots.iter().filter(|s| (s.score - top_score).abs() < 1e-9).collect();
        for pair in tied.windows(2) {
            assert!(pair[0].start <= pair[1].start);
        }
    }
}
