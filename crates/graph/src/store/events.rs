//! Canonical events, the journal, and deletion certificates

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use tminus_core::error::{GraphError, GraphResult};
use tminus_core::models::{CanonicalEvent, ChangeKind, DeletionCertificate, EventStatus, JournalEntry};
use tminus_core::types::{AccountId, CanonicalId, UserId};

/// Insert a freshly minted canonical event
pub async fn insert_event(
    conn: &mut SqliteConnection,
    event: &CanonicalEvent,
) -> GraphResult<()> {
    sqlx::query(
        r#"
        INSERT INTO canonical_events (
            id, user_id, source, origin_account_id, origin_remote_id,
            title, description, location, conference_url,
            start_at, end_at, all_day, status, visibility, transparency,
            rrule, participant_hashes, version, deleted_at, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&event.id)
    .bind(event.user_id)
    .bind(event.source)
    .bind(event.origin_account_id)
    .bind(&event.origin_remote_id)
    .bind(&event.title)
    .bind(&event.description)
    .bind(&event.location)
    .bind(&event.conference_url)
    .bind(event.start_at)
    .bind(event.end_at)
    .bind(event.all_day)
    .bind(event.status)
    .bind(event.visibility)
    .bind(event.transparency)
    .bind(&event.rrule)
    .bind(sqlx::types::Json(&event.participant_hashes))
    .bind(event.version)
    .bind(event.deleted_at)
    .bind(event.created_at)
    .bind(event.updated_at)
    .execute(conn)
    .await?;

    Ok(())
}

/// Overwrite the mutable fields of an existing canonical event
pub async fn update_event(
    conn: &mut SqliteConnection,
    event: &CanonicalEvent,
) -> GraphResult<()> {
    let result = sqlx::query(
        r#"
        UPDATE canonical_events
        SET title = ?, description = ?, location = ?, conference_url = ?,
            start_at = ?, end_at = ?, all_day = ?, status = ?,
            visibility = ?, transparency = ?, rrule = ?,
            participant_hashes = ?, version = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(&event.title)
    .bind(&event.description)
    .bind(&event.location)
    .bind(&event.conference_url)
    .bind(event.start_at)
    .bind(event.end_at)
    .bind(event.all_day)
    .bind(event.status)
    .bind(event.visibility)
    .bind(event.transparency)
    .bind(&event.rrule)
    .bind(sqlx::types::Json(&event.participant_hashes))
    .bind(event.version)
    .bind(event.updated_at)
    .bind(&event.id)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(GraphError::NotFound(format!("event {}", event.id)));
    }
    Ok(())
}

/// Mark a canonical event deleted without dropping the row
pub async fn tombstone_event(
    conn: &mut SqliteConnection,
    id: &CanonicalId,
    at: DateTime<Utc>,
) -> GraphResult<()> {
    let result = sqlx::query(
        "UPDATE canonical_events SET deleted_at = ?, updated_at = ? WHERE id = ? AND deleted_at IS NULL",
    )
    .bind(at)
    .bind(at)
    .bind(id)
    .execute(conn)
    .await?;

    if result.rows_affected() == 0 {
        return Err(GraphError::NotFound(format!("event {id}")));
    }
    Ok(())
}

pub async fn get_event(pool: &SqlitePool, user_id: UserId, id: &CanonicalId) -> GraphResult<CanonicalEvent> {
    sqlx::query_as::<_, CanonicalEvent>(
        "SELECT * FROM canonical_events WHERE id = ? AND user_id = ?",
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| GraphError::NotFound(format!("event {id}")))
}

/// Look up the canonical id for a provider origin pair
pub async fn find_by_origin(
    pool: &SqlitePool,
    origin_account_id: AccountId,
    origin_remote_id: &str,
) -> GraphResult<Option<CanonicalEvent>> {
    let event = sqlx::query_as::<_, CanonicalEvent>(
        "SELECT * FROM canonical_events WHERE origin_account_id = ? AND origin_remote_id = ?",
    )
    .bind(origin_account_id)
    .bind(origin_remote_id)
    .fetch_optional(pool)
    .await?;

    Ok(event)
}

/// Listing filters for canonical events
#[derive(Debug, Clone, Default)]
pub struct EventFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub status: Option<EventStatus>,
    pub include_deleted: bool,
    pub limit: Option<i64>,
}

pub async fn list_events(
    pool: &SqlitePool,
    user_id: UserId,
    filter: &EventFilter,
) -> GraphResult<Vec<CanonicalEvent>> {
    let mut sql = String::from("SELECT * FROM canonical_events WHERE user_id = ?");
    if filter.from.is_some() {
        sql.push_str(" AND end_at > ?");
    }
    if filter.to.is_some() {
        sql.push_str(" AND start_at < ?");
    }
    if filter.status.is_some() {
        sql.push_str(" AND status = ?");
    }
    if !filter.include_deleted {
        sql.push_str(" AND deleted_at IS NULL");
    }
    sql.push_str(" ORDER BY start_at LIMIT ?");

    let mut query = sqlx::query_as::<_, CanonicalEvent>(&sql).bind(user_id);
    if let Some(from) = filter.from {
        query = query.bind(from);
    }
    if let Some(to) = filter.to {
        query = query.bind(to);
    }
    if let Some(status) = filter.status {
        query = query.bind(status);
    }
    query = query.bind(filter.limit.unwrap_or(500));

    Ok(query.fetch_all(pool).await?)
}

/// Append one journal entry, always inside the mutation's transaction
pub async fn append_journal(
    conn: &mut SqliteConnection,
    user_id: UserId,
    canonical_id: &CanonicalId,
    actor: &str,
    change_kind: ChangeKind,
    patch: &serde_json::Value,
    reason: &str,
    idempotency_key: Option<&str>,
) -> GraphResult<()> {
    sqlx::query(
        r#"
        INSERT INTO event_journal
            (user_id, canonical_id, actor, change_kind, patch, reason, idempotency_key, recorded_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(user_id)
    .bind(canonical_id)
    .bind(actor)
    .bind(change_kind)
    .bind(sqlx::types::Json(patch))
    .bind(reason)
    .bind(idempotency_key)
    .bind(Utc::now())
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn journal_for(
    pool: &SqlitePool,
    canonical_id: &CanonicalId,
) -> GraphResult<Vec<JournalEntry>> {
    let entries = sqlx::query_as::<_, JournalEntry>(
        "SELECT * FROM event_journal WHERE canonical_id = ? ORDER BY seq",
    )
    .bind(canonical_id)
    .fetch_all(pool)
    .await?;

    Ok(entries)
}

/// Journal entries within one transaction, used while computing a deletion
/// certificate over the final slice
pub async fn journal_for_tx(
    conn: &mut SqliteConnection,
    canonical_id: &CanonicalId,
) -> GraphResult<Vec<JournalEntry>> {
    let entries = sqlx::query_as::<_, JournalEntry>(
        "SELECT * FROM event_journal WHERE canonical_id = ? ORDER BY seq",
    )
    .bind(canonical_id)
    .fetch_all(conn)
    .await?;

    Ok(entries)
}

pub async fn insert_certificate(
    conn: &mut SqliteConnection,
    cert: &DeletionCertificate,
) -> GraphResult<()> {
    sqlx::query(
        r#"
        INSERT INTO deletion_certificates (canonical_id, user_id, journal_digest, signature, issued_at)
        VALUES (?, ?, ?, ?, ?)
        "#,
    )
    .bind(&cert.canonical_id)
    .bind(cert.user_id)
    .bind(&cert.journal_digest)
    .bind(&cert.signature)
    .bind(cert.issued_at)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn get_certificate(
    pool: &SqlitePool,
    canonical_id: &CanonicalId,
) -> GraphResult<Option<DeletionCertificate>> {
    let cert = sqlx::query_as::<_, DeletionCertificate>(
        "SELECT * FROM deletion_certificates WHERE canonical_id = ?",
    )
    .bind(canonical_id)
    .fetch_optional(pool)
    .await?;

    Ok(cert)
}
