//! Policy edge storage

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

use tminus_core::error::GraphResult;
use tminus_core::models::{CalendarKind, DetailLevel, PolicyEdge};
use tminus_core::types::{AccountId, PolicyEdgeId, UserId};

/// Insert or update the directional edge between two accounts
pub async fn upsert_edge(
    conn: &mut SqliteConnection,
    user_id: UserId,
    from_account_id: AccountId,
    to_account_id: AccountId,
    detail_level: DetailLevel,
    calendar_kind: CalendarKind,
) -> GraphResult<PolicyEdge> {
    let now = Utc::now();
    let edge = sqlx::query_as::<_, PolicyEdge>(
        r#"
        INSERT INTO policy_edges
            (id, user_id, from_account_id, to_account_id, detail_level, calendar_kind, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT (from_account_id, to_account_id)
        DO UPDATE SET detail_level = excluded.detail_level,
                      calendar_kind = excluded.calendar_kind,
                      updated_at = excluded.updated_at
        RETURNING *
        "#,
    )
    .bind(PolicyEdgeId::new())
    .bind(user_id)
    .bind(from_account_id)
    .bind(to_account_id)
    .bind(detail_level)
    .bind(calendar_kind)
    .bind(now)
    .bind(now)
    .fetch_one(conn)
    .await?;

    Ok(edge)
}

pub async fn list_for_user(pool: &SqlitePool, user_id: UserId) -> GraphResult<Vec<PolicyEdge>> {
    let edges = sqlx::query_as::<_, PolicyEdge>(
        "SELECT * FROM policy_edges WHERE user_id = ? ORDER BY created_at",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(edges)
}

/// Outbound edges for an origin account
pub async fn list_from_account(
    pool: &SqlitePool,
    from_account_id: AccountId,
) -> GraphResult<Vec<PolicyEdge>> {
    let edges = sqlx::query_as::<_, PolicyEdge>(
        "SELECT * FROM policy_edges WHERE from_account_id = ? ORDER BY created_at",
    )
    .bind(from_account_id)
    .fetch_all(pool)
    .await?;

    Ok(edges)
}

pub async fn get(pool: &SqlitePool, id: PolicyEdgeId) -> GraphResult<Option<PolicyEdge>> {
    let edge = sqlx::query_as::<_, PolicyEdge>("SELECT * FROM policy_edges WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?;

    Ok(edge)
}
