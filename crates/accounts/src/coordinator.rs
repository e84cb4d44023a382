//! Account Coordinator
//!
//! Serializes token refresh, cursor movement, and channel lifecycle per
//! account. Failures here stay scoped to the one account; the health
//! counters record them and the other accounts keep syncing.

use std::collections::HashMap;
use std::sync::{Arc, Mutex as StdMutex};

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use tokio::sync::Mutex as AsyncMutex;
use tracing::{debug, info, warn};

use tminus_core::models::AccountHealth;
use tminus_core::models::AccountRecord;
use tminus_core::types::{AccountId, ProviderKind};
use tminus_provider::{CalendarApi, ChannelRegistration, ProviderClient};

use crate::cipher::TokenCipher;
use crate::error::{AccountError, AccountResult};
use crate::store;
use crate::store::ChannelRecord;
use crate::throttle::AccountThrottle;

#[derive(Debug, Clone)]
pub struct AccountConfig {
    /// Refresh when the cached access token is within this margin of expiry
    pub token_refresh_margin: Duration,
    /// Renew webhook channels with less than this much lifetime left
    pub channel_renewal_threshold: Duration,
    /// Deadline for any single provider call
    pub provider_call_timeout: std::time::Duration,
    pub rate_per_second: u32,
    pub rate_burst: u32,
}

impl Default for AccountConfig {
    fn default() -> Self {
        AccountConfig {
            token_refresh_margin: Duration::seconds(60),
            channel_renewal_threshold: Duration::hours(24),
            provider_call_timeout: std::time::Duration::from_secs(30),
            rate_per_second: 5,
            rate_burst: 10,
        }
    }
}

/// Hands out per-account coordinators; locks and the outbound throttle are
/// shared process-wide.
pub struct AccountRegistry {
    pool: SqlitePool,
    cipher: Arc<dyn TokenCipher>,
    config: AccountConfig,
    throttle: Arc<AccountThrottle>,
    locks: StdMutex<HashMap<AccountId, Arc<AsyncMutex<()>>>>,
}

impl AccountRegistry {
    pub fn new(pool: SqlitePool, cipher: Arc<dyn TokenCipher>, config: AccountConfig) -> Arc<Self> {
        let throttle = Arc::new(AccountThrottle::new(config.rate_per_second, config.rate_burst));
        Arc::new(AccountRegistry {
            pool,
            cipher,
            config,
            throttle,
            locks: StdMutex::new(HashMap::new()),
        })
    }

    fn lock_for(&self, account_id: AccountId) -> Arc<AsyncMutex<()>> {
        let mut locks = self.locks.lock().expect("account lock table poisoned");
        locks
            .entry(account_id)
            .or_insert_with(|| Arc::new(AsyncMutex::new(())))
            .clone()
    }

    pub fn coordinator(
        &self,
        account: AccountRecord,
        client: ProviderClient,
    ) -> AccountCoordinator {
        let lock = self.lock_for(account.account_id);
        AccountCoordinator {
            account,
            client,
            pool: self.pool.clone(),
            cipher: self.cipher.clone(),
            config: self.config.clone(),
            throttle: self.throttle.clone(),
            lock,
        }
    }
}

pub struct AccountCoordinator {
    account: AccountRecord,
    client: ProviderClient,
    pool: SqlitePool,
    cipher: Arc<dyn TokenCipher>,
    config: AccountConfig,
    throttle: Arc<AccountThrottle>,
    lock: Arc<AsyncMutex<()>>,
}

impl AccountCoordinator {
    pub fn account_id(&self) -> AccountId {
        self.account.account_id
    }

    pub fn provider(&self) -> ProviderKind {
        self.account.provider
    }

    pub fn client(&self) -> &ProviderClient {
        &self.client
    }

    /// Wait for an outbound-call slot (the write pipeline throttles its
    /// provider calls through the same per-account bucket).
    pub async fn acquire_call_slot(&self) {
        self.throttle.acquire(self.account.account_id).await;
    }

    /// Seal and store a refresh token (initial linking or re-consent)
    pub async fn store_refresh_token(&self, refresh_token: &str) -> AccountResult<()> {
        let _guard = self.lock.lock().await;
        let ciphertext = self
            .cipher
            .seal(refresh_token.as_bytes())
            .map_err(|e| AccountError::Internal(format!("seal failed: {e}")))?;
        store::upsert_credentials(&self.pool, self.account.account_id, &ciphertext).await?;
        info!(account_id = %self.account.account_id, "refresh token stored");
        Ok(())
    }

    /// Current access token, minting a fresh one when the cached token is
    /// within the refresh margin of expiry.
    pub async fn get_access_token(&self) -> AccountResult<String> {
        let _guard = self.lock.lock().await;
        self.mint_locked(false).await
    }

    /// Drop the cached token and mint a new one (provider rejected ours)
    pub async fn force_refresh(&self) -> AccountResult<String> {
        let _guard = self.lock.lock().await;
        self.mint_locked(true).await
    }

    async fn mint_locked(&self, force: bool) -> AccountResult<String> {
        let credentials = store::get_credentials(&self.pool, self.account.account_id)
            .await?
            .ok_or(AccountError::NoCredentials)?;

        if !force {
            if let (Some(token), Some(expires_at)) = (
                credentials.access_token.as_ref(),
                credentials.access_token_expires_at,
            ) {
                if expires_at > Utc::now() + self.config.token_refresh_margin {
                    return Ok(token.clone());
                }
            }
        }

        let refresh_token = self
            .cipher
            .open(&credentials.refresh_token_ciphertext)
            .map_err(|e| AccountError::Internal(format!("open failed: {e}")))?;
        let refresh_token = String::from_utf8(refresh_token)
            .map_err(|_| AccountError::Internal("refresh token is not utf-8".into()))?;

        self.throttle.acquire(self.account.account_id).await;
        let minted = tokio::time::timeout(
            self.config.provider_call_timeout,
            self.client.refresh_token(&refresh_token),
        )
        .await
        .map_err(|_| AccountError::ProviderUnavailable("token refresh timed out".into()))?
        .map_err(AccountError::from_refresh)?;

        store::set_access_token(
            &self.pool,
            self.account.account_id,
            Some(&minted.access_token),
            Some(minted.expires_at),
        )
        .await?;

        debug!(account_id = %self.account.account_id, "access token minted");
        Ok(minted.access_token)
    }

    // ------------------------------------------------------------------
    // Sync cursor
    // ------------------------------------------------------------------

    pub async fn get_sync_cursor(&self) -> AccountResult<Option<String>> {
        store::get_cursor(&self.pool, self.account.account_id).await
    }

    pub async fn set_sync_cursor(&self, cursor: Option<&str>) -> AccountResult<()> {
        let _guard = self.lock.lock().await;
        store::set_cursor(&self.pool, self.account.account_id, cursor).await
    }

    // ------------------------------------------------------------------
    // Webhook channels
    // ------------------------------------------------------------------

    /// Register a channel for a watched resource. The channel token is
    /// minted here and verified on every inbound notification.
    pub async fn register_channel(&self, resource: &str) -> AccountResult<ChannelRecord> {
        let _guard = self.lock.lock().await;
        let access_token = self.mint_locked(false).await?;
        let token = mint_channel_token();

        self.throttle.acquire(self.account.account_id).await;
        let registration = tokio::time::timeout(
            self.config.provider_call_timeout,
            self.client.register_channel(&access_token, resource, &token),
        )
        .await
        .map_err(|_| AccountError::ProviderUnavailable("channel registration timed out".into()))?
        .map_err(AccountError::from_provider)?;

        let record = ChannelRecord {
            channel_id: registration.channel_id,
            account_id: self.account.account_id,
            token,
            resource: resource.to_string(),
            expires_at: registration.expires_at,
            created_at: Utc::now(),
        };
        store::insert_channel(&self.pool, &record).await?;

        info!(
            account_id = %self.account.account_id,
            channel_id = %record.channel_id,
            "webhook channel registered"
        );
        Ok(record)
    }

    /// Renew every channel within the renewal threshold of expiry.
    /// Returns how many were renewed.
    pub async fn renew_channels(&self) -> AccountResult<usize> {
        let _guard = self.lock.lock().await;
        let channels = store::channels_for_account(&self.pool, self.account.account_id).await?;
        let deadline = Utc::now() + self.config.channel_renewal_threshold;

        let mut renewed = 0;
        for channel in channels.into_iter().filter(|c| c.expires_at < deadline) {
            let access_token = self.mint_locked(false).await?;
            self.throttle.acquire(self.account.account_id).await;

            let registration: ChannelRegistration = tokio::time::timeout(
                self.config.provider_call_timeout,
                self.client.renew_channel(
                    &access_token,
                    &channel.channel_id,
                    &channel.token,
                    &channel.resource,
                ),
            )
            .await
            .map_err(|_| AccountError::ProviderUnavailable("channel renewal timed out".into()))?
            .map_err(AccountError::from_provider)?;

            if registration.channel_id == channel.channel_id {
                store::update_channel_expiry(
                    &self.pool,
                    &channel.channel_id,
                    registration.expires_at,
                )
                .await?;
            } else {
                // Provider replaced the channel; keep the verification token
                store::delete_channel(&self.pool, &channel.channel_id).await?;
                store::insert_channel(
                    &self.pool,
                    &ChannelRecord {
                        channel_id: registration.channel_id,
                        account_id: self.account.account_id,
                        token: channel.token,
                        resource: channel.resource,
                        expires_at: registration.expires_at,
                        created_at: Utc::now(),
                    },
                )
                .await?;
            }
            renewed += 1;
        }
        Ok(renewed)
    }

    pub async fn list_channel_status(&self) -> AccountResult<Vec<ChannelRecord>> {
        store::channels_for_account(&self.pool, self.account.account_id).await
    }

    /// Delete all local auth state and best-effort stop provider channels
    pub async fn revoke(&self) -> AccountResult<()> {
        let _guard = self.lock.lock().await;
        let channels = store::channels_for_account(&self.pool, self.account.account_id).await?;

        if let Ok(access_token) = self.mint_locked(false).await {
            for channel in &channels {
                self.throttle.acquire(self.account.account_id).await;
                if let Err(err) = self
                    .client
                    .stop_channel(&access_token, &channel.channel_id)
                    .await
                {
                    warn!(channel_id = %channel.channel_id, %err, "best-effort channel stop failed");
                }
            }
        }

        store::delete_channels_for_account(&self.pool, self.account.account_id).await?;
        store::delete_cursor(&self.pool, self.account.account_id).await?;
        store::delete_credentials(&self.pool, self.account.account_id).await?;

        info!(account_id = %self.account.account_id, "account auth state revoked");
        Ok(())
    }

    // ------------------------------------------------------------------
    // Health
    // ------------------------------------------------------------------

    pub async fn mark_sync_success(&self, ts: DateTime<Utc>) -> AccountResult<()> {
        store::mark_sync_success(&self.pool, self.account.account_id, ts).await
    }

    pub async fn mark_sync_failure(&self, reason: &str) -> AccountResult<()> {
        store::mark_sync_failure(&self.pool, self.account.account_id, reason).await
    }

    pub async fn record_orphan_sighting(&self) -> AccountResult<()> {
        store::record_orphan_sighting(&self.pool, self.account.account_id).await
    }

    pub async fn health(&self) -> AccountResult<Option<AccountHealth>> {
        store::get_health(&self.pool, self.account.account_id).await
    }
}

/// Resolve an inbound webhook token to its channel; `None` means reject
pub async fn verify_channel_token(
    pool: &SqlitePool,
    token: &str,
) -> AccountResult<Option<ChannelRecord>> {
    store::find_channel_by_token(pool, token).await
}

fn mint_channel_token() -> String {
    use rand::RngCore;
    let mut bytes = [0u8; 16];
    rand::rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}
