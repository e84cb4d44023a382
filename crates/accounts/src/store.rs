//! Account-scoped storage: credentials, cursors, channels, health

use chrono::{DateTime, Utc};
use sqlx::SqlitePool;

use tminus_core::models::AccountHealth;
use tminus_core::types::AccountId;

use crate::error::AccountResult;

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct CredentialRow {
    pub account_id: AccountId,
    pub refresh_token_ciphertext: Vec<u8>,
    pub access_token: Option<String>,
    pub access_token_expires_at: Option<DateTime<Utc>>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ChannelRecord {
    pub channel_id: String,
    pub account_id: AccountId,
    pub token: String,
    pub resource: String,
    pub expires_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
}

pub async fn upsert_credentials(
    pool: &SqlitePool,
    account_id: AccountId,
    refresh_token_ciphertext: &[u8],
) -> AccountResult<()> {
    sqlx::query(
        r#"
        INSERT INTO account_credentials (account_id, refresh_token_ciphertext, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT (account_id)
        DO UPDATE SET refresh_token_ciphertext = excluded.refresh_token_ciphertext,
                      access_token = NULL,
                      access_token_expires_at = NULL,
                      updated_at = excluded.updated_at
        "#,
    )
    .bind(account_id)
    .bind(refresh_token_ciphertext)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_credentials(
    pool: &SqlitePool,
    account_id: AccountId,
) -> AccountResult<Option<CredentialRow>> {
    let row = sqlx::query_as::<_, CredentialRow>(
        "SELECT * FROM account_credentials WHERE account_id = ?",
    )
    .bind(account_id)
    .fetch_optional(pool)
    .await?;

    Ok(row)
}

pub async fn set_access_token(
    pool: &SqlitePool,
    account_id: AccountId,
    access_token: Option<&str>,
    expires_at: Option<DateTime<Utc>>,
) -> AccountResult<()> {
    sqlx::query(
        r#"
        UPDATE account_credentials
        SET access_token = ?, access_token_expires_at = ?, updated_at = ?
        WHERE account_id = ?
        "#,
    )
    .bind(access_token)
    .bind(expires_at)
    .bind(Utc::now())
    .bind(account_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_credentials(pool: &SqlitePool, account_id: AccountId) -> AccountResult<()> {
    sqlx::query("DELETE FROM account_credentials WHERE account_id = ?")
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn get_cursor(pool: &SqlitePool, account_id: AccountId) -> AccountResult<Option<String>> {
    let cursor = sqlx::query_scalar::<_, Option<String>>(
        "SELECT cursor FROM sync_cursors WHERE account_id = ?",
    )
    .bind(account_id)
    .fetch_optional(pool)
    .await?;

    Ok(cursor.flatten())
}

pub async fn set_cursor(
    pool: &SqlitePool,
    account_id: AccountId,
    cursor: Option<&str>,
) -> AccountResult<()> {
    sqlx::query(
        r#"
        INSERT INTO sync_cursors (account_id, cursor, updated_at)
        VALUES (?, ?, ?)
        ON CONFLICT (account_id)
        DO UPDATE SET cursor = excluded.cursor, updated_at = excluded.updated_at
        "#,
    )
    .bind(account_id)
    .bind(cursor)
    .bind(Utc::now())
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_cursor(pool: &SqlitePool, account_id: AccountId) -> AccountResult<()> {
    sqlx::query("DELETE FROM sync_cursors WHERE account_id = ?")
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn insert_channel(
    pool: &SqlitePool,
    channel: &ChannelRecord,
) -> AccountResult<()> {
    sqlx::query(
        r#"
        INSERT INTO webhook_channels (channel_id, account_id, token, resource, expires_at, created_at)
        VALUES (?, ?, ?, ?, ?, ?)
        "#,
    )
    .bind(&channel.channel_id)
    .bind(channel.account_id)
    .bind(&channel.token)
    .bind(&channel.resource)
    .bind(channel.expires_at)
    .bind(channel.created_at)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn delete_channel(pool: &SqlitePool, channel_id: &str) -> AccountResult<()> {
    sqlx::query("DELETE FROM webhook_channels WHERE channel_id = ?")
        .bind(channel_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn update_channel_expiry(
    pool: &SqlitePool,
    channel_id: &str,
    expires_at: DateTime<Utc>,
) -> AccountResult<()> {
    sqlx::query("UPDATE webhook_channels SET expires_at = ? WHERE channel_id = ?")
        .bind(expires_at)
        .bind(channel_id)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn channels_for_account(
    pool: &SqlitePool,
    account_id: AccountId,
) -> AccountResult<Vec<ChannelRecord>> {
    let channels = sqlx::query_as::<_, ChannelRecord>(
        "SELECT * FROM webhook_channels WHERE account_id = ? ORDER BY expires_at",
    )
    .bind(account_id)
    .fetch_all(pool)
    .await?;

    Ok(channels)
}

pub async fn delete_channels_for_account(
    pool: &SqlitePool,
    account_id: AccountId,
) -> AccountResult<()> {
    sqlx::query("DELETE FROM webhook_channels WHERE account_id = ?")
        .bind(account_id)
        .execute(pool)
        .await?;
    Ok(())
}

/// Resolve a webhook notification's channel token; unknown tokens mean the
/// notification is rejected upstream.
pub async fn find_channel_by_token(
    pool: &SqlitePool,
    token: &str,
) -> AccountResult<Option<ChannelRecord>> {
    let channel = sqlx::query_as::<_, ChannelRecord>(
        "SELECT * FROM webhook_channels WHERE token = ?",
    )
    .bind(token)
    .fetch_optional(pool)
    .await?;

    Ok(channel)
}

pub async fn mark_sync_success(
    pool: &SqlitePool,
    account_id: AccountId,
    ts: DateTime<Utc>,
) -> AccountResult<()> {
    sqlx::query(
        r#"
        INSERT INTO account_health (account_id, last_success_at, last_attempt_at, consecutive_failures)
        VALUES (?, ?, ?, 0)
        ON CONFLICT (account_id)
        DO UPDATE SET last_success_at = excluded.last_success_at,
                      last_attempt_at = excluded.last_attempt_at,
                      last_failure_reason = NULL,
                      consecutive_failures = 0
        "#,
    )
    .bind(account_id)
    .bind(ts)
    .bind(ts)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn mark_sync_failure(
    pool: &SqlitePool,
    account_id: AccountId,
    reason: &str,
) -> AccountResult<()> {
    sqlx::query(
        r#"
        INSERT INTO account_health (account_id, last_attempt_at, last_failure_reason, consecutive_failures)
        VALUES (?, ?, ?, 1)
        ON CONFLICT (account_id)
        DO UPDATE SET last_attempt_at = excluded.last_attempt_at,
                      last_failure_reason = excluded.last_failure_reason,
                      consecutive_failures = account_health.consecutive_failures + 1
        "#,
    )
    .bind(account_id)
    .bind(Utc::now())
    .bind(reason)
    .execute(pool)
    .await?;

    Ok(())
}

/// Managed-orphan sightings are not failures, but they are worth counting
pub async fn record_orphan_sighting(
    pool: &SqlitePool,
    account_id: AccountId,
) -> AccountResult<()> {
    sqlx::query(
        r#"
        INSERT INTO account_health (account_id, orphan_sightings)
        VALUES (?, 1)
        ON CONFLICT (account_id)
        DO UPDATE SET orphan_sightings = account_health.orphan_sightings + 1
        "#,
    )
    .bind(account_id)
    .execute(pool)
    .await?;

    Ok(())
}

pub async fn get_health(
    pool: &SqlitePool,
    account_id: AccountId,
) -> AccountResult<Option<AccountHealth>> {
    let health = sqlx::query_as::<_, AccountHealth>(
        "SELECT * FROM account_health WHERE account_id = ?",
    )
    .bind(account_id)
    .fetch_optional(pool)
    .await?;

    Ok(health)
}
