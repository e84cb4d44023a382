//! Mirror registry: one row per (canonical event, target account, edge)

use chrono::Utc;
use sqlx::{SqliteConnection, SqlitePool};

use tminus_core::error::{GraphError, GraphResult};
use tminus_core::models::{DetailLevel, MirrorRecord, MirrorStatus};
use tminus_core::types::{AccountId, CanonicalId, PolicyEdgeId, UserId};

/// Create or refresh the registry row for a pending projection
pub async fn upsert_pending(
    conn: &mut SqliteConnection,
    canonical_id: &CanonicalId,
    target_account_id: AccountId,
    policy_edge_id: PolicyEdgeId,
    detail_level: DetailLevel,
) -> GraphResult<()> {
    sqlx::query(
        r#"
        INSERT INTO mirror_records
            (canonical_id, target_account_id, policy_edge_id, detail_level, status, updated_at)
        VALUES (?, ?, ?, ?, 'pending', ?)
        ON CONFLICT (canonical_id, target_account_id, policy_edge_id)
        DO UPDATE SET detail_level = excluded.detail_level,
                      status = 'pending',
                      updated_at = excluded.updated_at
        "#,
    )
    .bind(canonical_id)
    .bind(target_account_id)
    .bind(policy_edge_id)
    .bind(detail_level)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

/// Record a confirmed provider write
pub async fn mark_written(
    conn: &mut SqliteConnection,
    canonical_id: &CanonicalId,
    target_account_id: AccountId,
    policy_edge_id: PolicyEdgeId,
    content_hash: &str,
    remote_mirror_id: &str,
    target_calendar_id: &str,
) -> GraphResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE mirror_records
        SET last_written_hash = ?, remote_mirror_id = ?, target_calendar_id = ?,
            status = 'live', updated_at = ?
        WHERE canonical_id = ? AND target_account_id = ? AND policy_edge_id = ?
        "#,
    )
    .bind(content_hash)
    .bind(remote_mirror_id)
    .bind(target_calendar_id)
    .bind(Utc::now())
    .bind(canonical_id)
    .bind(target_account_id)
    .bind(policy_edge_id)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(GraphError::NotFound(format!(
            "mirror {canonical_id} -> {target_account_id}"
        )));
    }
    Ok(())
}

pub async fn set_status(
    conn: &mut SqliteConnection,
    canonical_id: &CanonicalId,
    target_account_id: AccountId,
    policy_edge_id: PolicyEdgeId,
    status: MirrorStatus,
) -> GraphResult<()> {
    sqlx::query(
        r#"
        UPDATE mirror_records SET status = ?, updated_at = ?
        WHERE canonical_id = ? AND target_account_id = ? AND policy_edge_id = ?
        "#,
    )
    .bind(status)
    .bind(Utc::now())
    .bind(canonical_id)
    .bind(target_account_id)
    .bind(policy_edge_id)
    .execute(conn)
    .await?;

    Ok(())
}

/// Drop the registry row once the provider-side mirror is confirmed gone
pub async fn remove(
    conn: &mut SqliteConnection,
    canonical_id: &CanonicalId,
    target_account_id: AccountId,
    policy_edge_id: PolicyEdgeId,
) -> GraphResult<()> {
    sqlx::query(
        r#"
        DELETE FROM mirror_records
        WHERE canonical_id = ? AND target_account_id = ? AND policy_edge_id = ?
        "#,
    )
    .bind(canonical_id)
    .bind(target_account_id)
    .bind(policy_edge_id)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn list_for_event(
    pool: &SqlitePool,
    canonical_id: &CanonicalId,
) -> GraphResult<Vec<MirrorRecord>> {
    let mirrors = sqlx::query_as::<_, MirrorRecord>(
        "SELECT * FROM mirror_records WHERE canonical_id = ? ORDER BY target_account_id",
    )
    .bind(canonical_id)
    .fetch_all(pool)
    .await?;

    Ok(mirrors)
}

pub async fn get(
    pool: &SqlitePool,
    canonical_id: &CanonicalId,
    target_account_id: AccountId,
    policy_edge_id: PolicyEdgeId,
) -> GraphResult<Option<MirrorRecord>> {
    let mirror = sqlx::query_as::<_, MirrorRecord>(
        r#"
        SELECT * FROM mirror_records
        WHERE canonical_id = ? AND target_account_id = ? AND policy_edge_id = ?
        "#,
    )
    .bind(canonical_id)
    .bind(target_account_id)
    .bind(policy_edge_id)
    .fetch_optional(pool)
    .await?;

    Ok(mirror)
}

/// Find the mirror a provider-side event id belongs to
pub async fn find_by_remote(
    pool: &SqlitePool,
    target_account_id: AccountId,
    remote_mirror_id: &str,
) -> GraphResult<Option<MirrorRecord>> {
    let mirror = sqlx::query_as::<_, MirrorRecord>(
        "SELECT * FROM mirror_records WHERE target_account_id = ? AND remote_mirror_id = ?",
    )
    .bind(target_account_id)
    .bind(remote_mirror_id)
    .fetch_optional(pool)
    .await?;

    Ok(mirror)
}

/// Every mirror row for a user, joined for the drift walk
pub async fn list_for_user(pool: &SqlitePool, user_id: UserId) -> GraphResult<Vec<MirrorRecord>> {
    let mirrors = sqlx::query_as::<_, MirrorRecord>(
        r#"
        SELECT m.* FROM mirror_records m
        JOIN canonical_events e ON e.id = m.canonical_id
        WHERE e.user_id = ?
        ORDER BY m.canonical_id
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(mirrors)
}
