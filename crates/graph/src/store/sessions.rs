//! Scheduling sessions, candidates, and holds

use chrono::{DateTime, Utc};
use sqlx::{SqliteConnection, SqlitePool};

use tminus_core::error::{GraphError, GraphResult};
use tminus_core::models::{Hold, HoldStatus, SchedulingSession, SessionCandidate, SessionState};
use tminus_core::types::{CandidateId, HoldId, SessionId, UserId};

pub async fn insert_session(
    conn: &mut SqliteConnection,
    session: &SchedulingSession,
) -> GraphResult<()> {
    sqlx::query(
        r#"
        INSERT INTO scheduling_sessions (
            id, user_id, state, title, duration_minutes,
            window_start, window_end, participant_user_ids, required_account_ids,
            committed_candidate_id, committed_event_id, created_at, updated_at
        )
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(session.id)
    .bind(session.user_id)
    .bind(session.state)
    .bind(&session.title)
    .bind(session.duration_minutes)
    .bind(session.window_start)
    .bind(session.window_end)
    .bind(sqlx::types::Json(&session.participant_user_ids))
    .bind(sqlx::types::Json(&session.required_account_ids))
    .bind(session.committed_candidate_id)
    .bind(&session.committed_event_id)
    .bind(session.created_at)
    .bind(session.updated_at)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn insert_candidates(
    conn: &mut SqliteConnection,
    candidates: &[SessionCandidate],
) -> GraphResult<()> {
    for candidate in candidates {
        sqlx::query(
            r#"
            INSERT INTO session_candidates
                (id, session_id, user_id, start_at, end_at, score, explanation, rank)
            VALUES (?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(candidate.id)
        .bind(candidate.session_id)
        .bind(candidate.user_id)
        .bind(candidate.start_at)
        .bind(candidate.end_at)
        .bind(candidate.score)
        .bind(&candidate.explanation)
        .bind(candidate.rank)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn get_session(
    pool: &SqlitePool,
    user_id: UserId,
    id: SessionId,
) -> GraphResult<SchedulingSession> {
    sqlx::query_as::<_, SchedulingSession>(
        "SELECT * FROM scheduling_sessions WHERE id = ? AND user_id = ?",
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(pool)
    .await?
    .ok_or_else(|| GraphError::NotFound(format!("session {id}")))
}

pub async fn get_session_tx(
    conn: &mut SqliteConnection,
    user_id: UserId,
    id: SessionId,
) -> GraphResult<SchedulingSession> {
    sqlx::query_as::<_, SchedulingSession>(
        "SELECT * FROM scheduling_sessions WHERE id = ? AND user_id = ?",
    )
    .bind(id)
    .bind(user_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| GraphError::NotFound(format!("session {id}")))
}

pub async fn list_sessions(
    pool: &SqlitePool,
    user_id: UserId,
    state: Option<SessionState>,
) -> GraphResult<Vec<SchedulingSession>> {
    let sessions = match state {
        Some(state) => {
            sqlx::query_as::<_, SchedulingSession>(
                "SELECT * FROM scheduling_sessions WHERE user_id = ? AND state = ? ORDER BY created_at DESC",
            )
            .bind(user_id)
            .bind(state)
            .fetch_all(pool)
            .await?
        }
        None => {
            sqlx::query_as::<_, SchedulingSession>(
                "SELECT * FROM scheduling_sessions WHERE user_id = ? ORDER BY created_at DESC",
            )
            .bind(user_id)
            .fetch_all(pool)
            .await?
        }
    };

    Ok(sessions)
}

/// Sessions older than the cutoff that are still in a non-terminal state
pub async fn stale_sessions(
    pool: &SqlitePool,
    user_id: UserId,
    cutoff: DateTime<Utc>,
) -> GraphResult<Vec<SchedulingSession>> {
    let sessions = sqlx::query_as::<_, SchedulingSession>(
        r#"
        SELECT * FROM scheduling_sessions
        WHERE user_id = ? AND created_at < ? AND state IN ('open', 'candidates_ready')
        "#,
    )
    .bind(user_id)
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(sessions)
}

pub async fn set_session_state(
    conn: &mut SqliteConnection,
    id: SessionId,
    state: SessionState,
) -> GraphResult<()> {
    sqlx::query("UPDATE scheduling_sessions SET state = ?, updated_at = ? WHERE id = ?")
        .bind(state)
        .bind(Utc::now())
        .bind(id)
        .execute(conn)
        .await?;

    Ok(())
}

pub async fn set_session_committed(
    conn: &mut SqliteConnection,
    id: SessionId,
    candidate_id: CandidateId,
    event_id: &tminus_core::types::CanonicalId,
) -> GraphResult<()> {
    sqlx::query(
        r#"
        UPDATE scheduling_sessions
        SET state = 'committed', committed_candidate_id = ?, committed_event_id = ?, updated_at = ?
        WHERE id = ?
        "#,
    )
    .bind(candidate_id)
    .bind(event_id)
    .bind(Utc::now())
    .bind(id)
    .execute(conn)
    .await?;

    Ok(())
}

pub async fn candidates_for_session(
    pool: &SqlitePool,
    session_id: SessionId,
) -> GraphResult<Vec<SessionCandidate>> {
    let candidates = sqlx::query_as::<_, SessionCandidate>(
        "SELECT * FROM session_candidates WHERE session_id = ? ORDER BY rank",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(candidates)
}

pub async fn get_candidate_tx(
    conn: &mut SqliteConnection,
    session_id: SessionId,
    candidate_id: CandidateId,
) -> GraphResult<SessionCandidate> {
    sqlx::query_as::<_, SessionCandidate>(
        "SELECT * FROM session_candidates WHERE id = ? AND session_id = ?",
    )
    .bind(candidate_id)
    .bind(session_id)
    .fetch_optional(conn)
    .await?
    .ok_or_else(|| GraphError::NotFound(format!("candidate {candidate_id}")))
}

pub async fn insert_holds(conn: &mut SqliteConnection, holds: &[Hold]) -> GraphResult<()> {
    for hold in holds {
        sqlx::query(
            r#"
            INSERT INTO holds (
                id, session_id, user_id, account_id, start_at, end_at,
                provider_mirror_id, status, expires_at, created_at
            )
            VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)
            "#,
        )
        .bind(hold.id)
        .bind(hold.session_id)
        .bind(hold.user_id)
        .bind(hold.account_id)
        .bind(hold.start_at)
        .bind(hold.end_at)
        .bind(&hold.provider_mirror_id)
        .bind(hold.status)
        .bind(hold.expires_at)
        .bind(hold.created_at)
        .execute(&mut *conn)
        .await?;
    }
    Ok(())
}

pub async fn holds_for_session(
    pool: &SqlitePool,
    session_id: SessionId,
) -> GraphResult<Vec<Hold>> {
    let holds = sqlx::query_as::<_, Hold>(
        "SELECT * FROM holds WHERE session_id = ? ORDER BY start_at",
    )
    .bind(session_id)
    .fetch_all(pool)
    .await?;

    Ok(holds)
}

pub async fn holds_for_session_tx(
    conn: &mut SqliteConnection,
    session_id: SessionId,
) -> GraphResult<Vec<Hold>> {
    let holds = sqlx::query_as::<_, Hold>(
        "SELECT * FROM holds WHERE session_id = ? ORDER BY start_at",
    )
    .bind(session_id)
    .fetch_all(conn)
    .await?;

    Ok(holds)
}

pub async fn get_hold(pool: &SqlitePool, id: HoldId) -> GraphResult<Hold> {
    sqlx::query_as::<_, Hold>("SELECT * FROM holds WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| GraphError::NotFound(format!("hold {id}")))
}

pub async fn set_hold_status(
    conn: &mut SqliteConnection,
    id: HoldId,
    status: HoldStatus,
) -> GraphResult<()> {
    sqlx::query("UPDATE holds SET status = ? WHERE id = ?")
        .bind(status)
        .bind(id)
        .execute(conn)
        .await?;

    Ok(())
}

pub async fn set_hold_mirror(
    conn: &mut SqliteConnection,
    id: HoldId,
    provider_mirror_id: Option<&str>,
) -> GraphResult<()> {
    sqlx::query("UPDATE holds SET provider_mirror_id = ? WHERE id = ?")
        .bind(provider_mirror_id)
        .bind(id)
        .execute(conn)
        .await?;

    Ok(())
}

pub async fn extend_holds(
    conn: &mut SqliteConnection,
    session_id: SessionId,
    expires_at: DateTime<Utc>,
) -> GraphResult<u64> {
    let result = sqlx::query(
        "UPDATE holds SET expires_at = ? WHERE session_id = ? AND status = 'held'",
    )
    .bind(expires_at)
    .bind(session_id)
    .execute(conn)
    .await?;

    Ok(result.rows_affected())
}

/// A hold found by the provider-side id of its tentative mirror
pub async fn find_hold_by_mirror(
    pool: &SqlitePool,
    account_id: tminus_core::types::AccountId,
    provider_mirror_id: &str,
) -> GraphResult<Option<Hold>> {
    let hold = sqlx::query_as::<_, Hold>(
        "SELECT * FROM holds WHERE account_id = ? AND provider_mirror_id = ?",
    )
    .bind(account_id)
    .bind(provider_mirror_id)
    .fetch_optional(pool)
    .await?;

    Ok(hold)
}

/// Held holds whose expiry has passed
pub async fn expired_holds(pool: &SqlitePool, now: DateTime<Utc>) -> GraphResult<Vec<Hold>> {
    let holds = sqlx::query_as::<_, Hold>(
        "SELECT * FROM holds WHERE status = 'held' AND expires_at < ? ORDER BY expires_at",
    )
    .bind(now)
    .fetch_all(pool)
    .await?;

    Ok(holds)
}

/// Released or committed holds that still carry a provider-side mirror id.
/// Drift reconciliation scrubs released ones.
pub async fn terminal_holds_with_mirrors(
    pool: &SqlitePool,
    user_id: UserId,
) -> GraphResult<Vec<Hold>> {
    let holds = sqlx::query_as::<_, Hold>(
        r#"
        SELECT * FROM holds
        WHERE user_id = ? AND status = 'released' AND provider_mirror_id IS NOT NULL
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(holds)
}
