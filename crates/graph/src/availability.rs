//! Busy-interval construction for availability queries
//!
//! Builds the merged busy set for one user from canonical events and active
//! holds. The annotated form (real account ids) stays inside the user
//! boundary; `busy_spans` strips annotations down to bare (start, end)
//! pairs, which is the only shape allowed to cross users.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;

use tminus_core::error::GraphResult;
use tminus_core::interval::{BusyInterval, merge_busy};
use tminus_core::models::{CanonicalEvent, EventStatus, Hold, Transparency};
use tminus_core::timezone::{local_midnight_utc, parse_timezone};
use tminus_core::types::UserId;

use crate::store::registry;

/// Merged busy intervals for a user inside a window, annotated with the
/// contributing account ids. System-authored events (no origin account)
/// block every account the user has linked.
pub async fn busy_intervals(
    pool: &SqlitePool,
    user_id: UserId,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> GraphResult<Vec<BusyInterval>> {
    let user = registry::get_user(pool, user_id).await?;
    let accounts = registry::accounts_for_user(pool, user_id).await?;
    let all_account_ids: Vec<String> = accounts
        .iter()
        .map(|a| a.account_id.to_string())
        .collect();
    let tz = parse_timezone(&user.timezone).ok();

    let events = sqlx::query_as::<_, CanonicalEvent>(
        r#"
        SELECT * FROM canonical_events
        WHERE user_id = ? AND deleted_at IS NULL
          AND start_at < ? AND end_at > ?
        "#,
    )
    .bind(user_id)
    .bind(window_end)
    .bind(window_start)
    .fetch_all(pool)
    .await?;

    let mut intervals = Vec::new();
    for event in &events {
        if event.transparency != Transparency::Opaque || event.status == EventStatus::Cancelled {
            continue;
        }

        let (start, end) = if event.all_day {
            all_day_span(event, tz)
        } else {
            (event.start_at, event.end_at)
        };

        let mut interval = BusyInterval {
            start,
            end,
            account_ids: Default::default(),
        };
        match event.origin_account_id {
            Some(account_id) => {
                interval.account_ids.insert(account_id.to_string());
            }
            None => {
                interval.account_ids.extend(all_account_ids.iter().cloned());
            }
        }
        intervals.push(interval);
    }

    // Active holds reserve time exactly like events do
    let holds = sqlx::query_as::<_, Hold>(
        r#"
        SELECT * FROM holds
        WHERE user_id = ? AND status = 'held' AND expires_at > ?
          AND start_at < ? AND end_at > ?
        "#,
    )
    .bind(user_id)
    .bind(Utc::now())
    .bind(window_end)
    .bind(window_start)
    .fetch_all(pool)
    .await?;

    for hold in holds {
        intervals.push(BusyInterval::new(
            hold.start_at,
            hold.end_at,
            hold.account_id.to_string(),
        ));
    }

    Ok(merge_busy(intervals))
}

/// Bare (start, end) pairs only: the cross-user projection of the busy set
pub async fn busy_spans(
    pool: &SqlitePool,
    user_id: UserId,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> GraphResult<Vec<(DateTime<Utc>, DateTime<Utc>)>> {
    let merged = busy_intervals(pool, user_id, window_start, window_end).await?;
    Ok(merged.into_iter().map(|i| (i.start, i.end)).collect())
}

/// All-day events block local midnight to local midnight when the user has
/// a timezone profile, UTC midnights otherwise.
fn all_day_span(
    event: &CanonicalEvent,
    tz: Option<chrono_tz::Tz>,
) -> (DateTime<Utc>, DateTime<Utc>) {
    match tz {
        Some(tz) => {
            let start = local_midnight_utc(event.start_at.date_naive(), tz);
            let mut end = local_midnight_utc(event.end_at.date_naive(), tz);
            if end <= start {
                end = start + Duration::days(1);
            }
            (start, end)
        }
        None => (event.start_at, event.end_at),
    }
}
