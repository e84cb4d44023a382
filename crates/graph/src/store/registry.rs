//! Global registry: users, account directory, cross-user session lookup

use chrono::Utc;
use sqlx::SqlitePool;

use tminus_core::error::{GraphError, GraphResult};
use tminus_core::models::{AccountHealth, AccountRecord, User};
use tminus_core::types::{AccountId, ProviderKind, SessionId, UserId};

pub async fn create_user(
    pool: &SqlitePool,
    display_name: &str,
    timezone: &str,
    locale: &str,
    participant_salt: &str,
) -> GraphResult<User> {
    let user = sqlx::query_as::<_, User>(
        r#"
        INSERT INTO users (id, display_name, timezone, locale, participant_salt, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(UserId::new())
    .bind(display_name)
    .bind(timezone)
    .bind(locale)
    .bind(participant_salt)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(user)
}

pub async fn get_user(pool: &SqlitePool, id: UserId) -> GraphResult<User> {
    sqlx::query_as::<_, User>("SELECT * FROM users WHERE id = ?")
        .bind(id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| GraphError::NotFound(format!("user {id}")))
}

pub async fn list_users(pool: &SqlitePool) -> GraphResult<Vec<UserId>> {
    let ids = sqlx::query_scalar::<_, UserId>("SELECT id FROM users ORDER BY created_at")
        .fetch_all(pool)
        .await?;

    Ok(ids)
}

/// Register an external account for a user
pub async fn register_account(
    pool: &SqlitePool,
    user_id: UserId,
    provider: ProviderKind,
    remote_id: &str,
    display_name: Option<&str>,
) -> GraphResult<AccountRecord> {
    let account = sqlx::query_as::<_, AccountRecord>(
        r#"
        INSERT INTO account_directory (account_id, user_id, provider, remote_id, display_name, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        RETURNING *
        "#,
    )
    .bind(AccountId::new())
    .bind(user_id)
    .bind(provider)
    .bind(remote_id)
    .bind(display_name)
    .bind(Utc::now())
    .fetch_one(pool)
    .await?;

    Ok(account)
}

pub async fn get_account(pool: &SqlitePool, account_id: AccountId) -> GraphResult<AccountRecord> {
    sqlx::query_as::<_, AccountRecord>("SELECT * FROM account_directory WHERE account_id = ?")
        .bind(account_id)
        .fetch_optional(pool)
        .await?
        .ok_or_else(|| GraphError::NotFound(format!("account {account_id}")))
}

/// Resolve an account by its provider-side identity
pub async fn find_account_by_remote(
    pool: &SqlitePool,
    provider: ProviderKind,
    remote_id: &str,
) -> GraphResult<Option<AccountRecord>> {
    let account = sqlx::query_as::<_, AccountRecord>(
        "SELECT * FROM account_directory WHERE provider = ? AND remote_id = ?",
    )
    .bind(provider)
    .bind(remote_id)
    .fetch_optional(pool)
    .await?;

    Ok(account)
}

/// Every registered account, for the periodic scan
pub async fn list_accounts(pool: &SqlitePool) -> GraphResult<Vec<AccountRecord>> {
    let accounts = sqlx::query_as::<_, AccountRecord>(
        "SELECT * FROM account_directory ORDER BY created_at",
    )
    .fetch_all(pool)
    .await?;

    Ok(accounts)
}

pub async fn accounts_for_user(
    pool: &SqlitePool,
    user_id: UserId,
) -> GraphResult<Vec<AccountRecord>> {
    let accounts = sqlx::query_as::<_, AccountRecord>(
        "SELECT * FROM account_directory WHERE user_id = ? ORDER BY created_at",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(accounts)
}

/// Per-account health counters for a user's accounts
pub async fn health_for_user(
    pool: &SqlitePool,
    user_id: UserId,
) -> GraphResult<Vec<AccountHealth>> {
    let health = sqlx::query_as::<_, AccountHealth>(
        r#"
        SELECT h.* FROM account_health h
        JOIN account_directory d ON d.account_id = h.account_id
        WHERE d.user_id = ?
        ORDER BY d.created_at
        "#,
    )
    .bind(user_id)
    .fetch_all(pool)
    .await?;

    Ok(health)
}

/// Register a group session for cross-user lookup
pub async fn register_group_session(
    pool: &SqlitePool,
    session_id: SessionId,
    owner_user_id: UserId,
    participant_user_ids: &[UserId],
) -> GraphResult<()> {
    sqlx::query(
        r#"
        INSERT INTO group_sessions (session_id, owner_user_id, participant_user_ids, created_at)
        VALUES (?, ?, ?, ?)
        "#,
    )
    .bind(session_id)
    .bind(owner_user_id)
    .bind(sqlx::types::Json(participant_user_ids))
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

/// (owner, participants) for a group session id
pub async fn lookup_group_session(
    pool: &SqlitePool,
    session_id: SessionId,
) -> GraphResult<Option<(UserId, Vec<UserId>)>> {
    let row = sqlx::query_as::<_, (UserId, sqlx::types::Json<Vec<UserId>>)>(
        "SELECT owner_user_id, participant_user_ids FROM group_sessions WHERE session_id = ?",
    )
    .bind(session_id)
    .fetch_optional(pool)
    .await?;

    Ok(row.map(|(owner, participants)| (owner, participants.0)))
}
