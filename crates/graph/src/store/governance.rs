//! Governance tables: allocations, commitments, VIP policies, relationships

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};
use uuid::Uuid;

use tminus_core::error::{GraphError, GraphResult};
use tminus_core::models::{Commitment, InteractionEntry, Relationship, TimeAllocation, VipPolicy};
use tminus_core::types::{CanonicalId, UserId};

/// Create an allocation, retiring any previously active one for the event
/// (at most one active allocation per event).
pub async fn upsert_allocation(
    conn: &mut SqliteConnection,
    user_id: UserId,
    canonical_id: &CanonicalId,
    billing_category: &str,
    client: &str,
    hourly_rate: Option<f64>,
) -> GraphResult<TimeAllocation> {
    let now = Utc::now();

    sqlx::query(
        "UPDATE time_allocations SET active = 0, updated_at = ? WHERE canonical_id = ? AND active = 1",
    )
    .bind(now)
    .bind(canonical_id)
    .execute(&mut *conn)
    .await?;

    let allocation = sqlx::query_as::<_, TimeAllocation>(
        r#"
        INSERT INTO time_allocations
            (id, user_id, canonical_id, billing_category, client, hourly_rate, active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, 1, ?, ?)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(canonical_id)
    .bind(billing_category)
    .bind(client)
    .bind(hourly_rate)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(allocation)
}

pub async fn release_allocation(
    conn: &mut SqliteConnection,
    canonical_id: &CanonicalId,
) -> GraphResult<bool> {
    let result = sqlx::query(
        "UPDATE time_allocations SET active = 0, updated_at = ? WHERE canonical_id = ? AND active = 1",
    )
    .bind(Utc::now())
    .bind(canonical_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn active_allocation(
    pool: &SqlitePool,
    canonical_id: &CanonicalId,
) -> GraphResult<Option<TimeAllocation>> {
    let allocation = sqlx::query_as::<_, TimeAllocation>(
        "SELECT * FROM time_allocations WHERE canonical_id = ? AND active = 1",
    )
    .bind(canonical_id)
    .fetch_optional(pool)
    .await?;

    Ok(allocation)
}

pub async fn list_allocations(
    pool: &SqlitePool,
    user_id: UserId,
    client: Option<&str>,
) -> GraphResult<Vec<TimeAllocation>> {
    let allocations = match client {
        Some(client) => {
            sqlx::query_as::<_, TimeAllocation>(
                "SELECT * FROM time_allocations WHERE user_id = ? AND client = ? AND active = 1 ORDER BY created_at",
            )
            .bind(user_id)
            .bind(client)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, TimeAllocation>(
                "SELECT * FROM time_allocations WHERE user_id = ? AND active = 1 ORDER BY created_at",
            )
            .bind(user_id)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(allocations)
}

/// Create or replace the live commitment for a client (at most one live per
/// client).
pub async fn upsert_commitment(
    conn: &mut SqliteConnection,
    user_id: UserId,
    client: &str,
    target_hours: f64,
    window_weeks: i64,
) -> GraphResult<Commitment> {
    let now = Utc::now();

    sqlx::query(
        "UPDATE commitments SET active = 0, updated_at = ? WHERE user_id = ? AND client = ? AND active = 1",
    )
    .bind(now)
    .bind(user_id)
    .bind(client)
    .execute(&mut *conn)
    .await?;

    let commitment = sqlx::query_as::<_, Commitment>(
        r#"
        INSERT INTO commitments
            (id, user_id, client, target_hours, window_weeks, active, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, 1, ?, ?)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(client)
    .bind(target_hours)
    .bind(window_weeks)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(commitment)
}

pub async fn end_commitment(
    conn: &mut SqliteConnection,
    user_id: UserId,
    client: &str,
) -> GraphResult<bool> {
    let result = sqlx::query(
        "UPDATE commitments SET active = 0, updated_at = ? WHERE user_id = ? AND client = ? AND active = 1",
    )
    .bind(Utc::now())
    .bind(user_id)
    .bind(client)
    .execute(conn)
    .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn live_commitment(
    pool: &SqlitePool,
    user_id: UserId,
    client: &str,
) -> GraphResult<Commitment> {
    sqlx::query_as::<_, Commitment>(
        "SELECT * FROM commitments WHERE user_id = ? AND client = ? AND active = 1",
    )
    .bind(user_id)
    .bind(client)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| GraphError::NotFound(format!("commitment for client {client}")))
}

pub async fn list_commitments(pool: &SqlitePool, user_id: UserId) -> GraphResult<Vec<Commitment>> {
    let commitments = sqlx::query_as::<_, Commitment>(
        "SELECT * FROM commitments WHERE user_id = ? AND active = 1 ORDER BY client",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(commitments)
}

/// Allocated, non-deleted events for a client inside a window, ordered for
/// deterministic proof export.
pub async fn allocated_events_in_window(
    pool: &SqlitePool,
    user_id: UserId,
    client: &str,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
) -> GraphResult<Vec<(CanonicalId, DateTime<Utc>, DateTime<Utc>)>> {
    let rows = sqlx::query_as::<_, (CanonicalId, DateTime<Utc>, DateTime<Utc>)>(
        r#"
        SELECT e.id, e.start_at, e.end_at
        FROM canonical_events e
        JOIN time_allocations a ON a.canonical_id = e.id AND a.active = 1
        WHERE a.user_id = ? AND a.client = ?
          AND e.deleted_at IS NULL
          AND e.start_at >= ? AND e.start_at < ?
        ORDER BY e.start_at, e.id
        "#,
    )
    .bind(user_id)
    .bind(client)
    .bind(window_start)
    .bind(window_end)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

pub async fn insert_report(
    conn: &mut SqliteConnection,
    commitment_id: Uuid,
    user_id: UserId,
    window_start: DateTime<Utc>,
    window_end: DateTime<Utc>,
    actual_hours: f64,
    payload: &str,
) -> GraphResult<()> {
    sqlx::query(
        r#"
        INSERT INTO commitment_reports
            (id, commitment_id, user_id, window_start, window_end, actual_hours, payload, generated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(commitment_id)
    .bind(user_id)
    .bind(window_start)
    .bind(window_end)
    .bind(actual_hours)
    .bind(payload)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn upsert_vip(
    conn: &mut SqliteConnection,
    user_id: UserId,
    participant_hash: &str,
    priority_weight: f64,
    conditions: &serde_json::Value,
) -> GraphResult<VipPolicy> {
    let now = Utc::now();
    let vip = sqlx::query_as::<_, VipPolicy>(
        r#"
        INSERT INTO vip_policies
            (id, user_id, participant_hash, priority_weight, conditions, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (user_id, participant_hash)
        DO UPDATE SET priority_weight = excluded.priority_weight,
                      conditions = excluded.conditions,
                      updated_at = excluded.updated_at
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(user_id)
    .bind(participant_hash)
    .bind(priority_weight)
    .bind(sqlx::types::Json(conditions))
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(vip)
}

pub async fn delete_vip(
    conn: &mut SqliteConnection,
    user_id: UserId,
    participant_hash: &str,
) -> GraphResult<bool> {
    let result =
        sqlx::query("DELETE FROM vip_policies WHERE user_id = ? AND participant_hash = ?")
            .bind(user_id)
            .bind(participant_hash)
            .execute(conn)
            .await?;

    Ok(result.rows_affected() > 0)
}

pub async fn list_vips(pool: &SqlitePool, user_id: UserId) -> GraphResult<Vec<VipPolicy>> {
    let vips = sqlx::query_as::<_, VipPolicy>(
        "SELECT * FROM vip_policies WHERE user_id = ? ORDER BY priority_weight DESC",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(vips)
}

pub async fn get_vip(
    pool: &SqlitePool,
    user_id: UserId,
    participant_hash: &str,
) -> GraphResult<Option<VipPolicy>> {
    let vip = sqlx::query_as::<_, VipPolicy>(
        "SELECT * FROM vip_policies WHERE user_id = ? AND participant_hash = ?",
    )
    .bind(user_id)
    .bind(participant_hash)
    .fetch_optional(pool)
    .await?;

    Ok(vip)
}

pub async fn upsert_relationship(
    conn: &mut SqliteConnection,
    relationship: &Relationship,
) -> GraphResult<()> {
    sqlx::query(
        r#"
        INSERT INTO relationships
            (user_id, participant_hash, display_name, category, city, timezone,
             cadence_target_days, last_interaction_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (user_id, participant_hash)
        DO UPDATE SET display_name = excluded.display_name,
                      category = excluded.category,
                      city = excluded.city,
                      timezone = excluded.timezone,
                      cadence_target_days = excluded.cadence_target_days,
                      last_interaction_at = COALESCE(excluded.last_interaction_at, relationships.last_interaction_at)
        "#,
    )
    .bind(relationship.user_id)
    .bind(&relationship.participant_hash)
    .bind(&relationship.display_name)
    .bind(&relationship.category)
    .bind(&relationship.city)
    .bind(&relationship.timezone)
    .bind(relationship.cadence_target_days)
    .bind(relationship.last_interaction_at)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get_relationship(
    pool: &SqlitePool,
    user_id: UserId,
    participant_hash: &str,
) -> GraphResult<Option<Relationship>> {
    let relationship = sqlx::query_as::<_, Relationship>(
        "SELECT * FROM relationships WHERE user_id = ? AND participant_hash = ?",
    )
    .bind(user_id)
    .bind(participant_hash)
    .fetch_optional(pool)
    .await?;

    Ok(relationship)
}

/// Append to the interaction ledger and advance last-interaction
pub async fn record_interaction(
    conn: &mut SqliteConnection,
    user_id: UserId,
    participant_hash: &str,
    canonical_id: Option<&CanonicalId>,
    kind: &str,
    occurred_at: DateTime<Utc>,
) -> GraphResult<()> {
    sqlx::query(
        r#"
        INSERT INTO interaction_ledger (user_id, participant_hash, canonical_id, kind, occurred_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(participant_hash)
    .bind(canonical_id)
    .bind(kind)
    .bind(occurred_at)
    .execute(&mut *conn)
    .await?;

    sqlx::query(
        r#"
        INSERT INTO relationships (user_id, participant_hash, last_interaction_at)
        VALUES (?, ?, ?)
        ON CONFLICT (user_id, participant_hash)
        DO UPDATE SET last_interaction_at = MAX(COALESCE(relationships.last_interaction_at, ''), excluded.last_interaction_at)
        "#,
    )
    .bind(user_id)
    .bind(participant_hash)
    .bind(occurred_at)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn interactions_for(
    pool: &SqlitePool,
    user_id: UserId,
    participant_hash: &str,
) -> GraphResult<Vec<InteractionEntry>> {
    let entries = sqlx::query_as::<_, InteractionEntry>(
        r#"
        SELECT * FROM interaction_ledger
        WHERE user_id = ? AND participant_hash = ?
        ORDER BY occurred_at DESC
        "#,
    )
    .bind(user_id)
    .bind(participant_hash)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}

/// How many non-deleted events this participant appears in
pub async fn shared_event_count(
    pool: &SqlitePool,
    user_id: UserId,
    participant_hash: &str,
) -> GraphResult<i64> {
    let count = sqlx::query_scalar::<_, i64>(
        r#"
        SELECT COUNT(*) FROM canonical_events
        WHERE user_id = ? AND deleted_at IS NULL
          AND EXISTS (
              SELECT 1 FROM json_each(canonical_events.participant_hashes)
              WHERE json_each.value = ?
          )
        "#,
    )
    .bind(user_id)
    .bind(participant_hash)
    .fetch_one(pool)
    .await?;

    Ok(count)
}
