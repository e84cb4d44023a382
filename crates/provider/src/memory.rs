//! In-memory provider
//!
//! Backs pipeline tests and local development: full capability set, a
//! revision-based change feed for cursor semantics, and failure injection
//! for retry/backoff and rollback paths.
//!
//! Each account is isolated by its refresh token: the minted access token
//! embeds it, and calendars are keyed per account, so one shared instance
//! behaves like a fleet of independent provider accounts.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::sync::{Arc, Mutex};

use chrono::Utc;

use tminus_core::models::{CalendarKind, MirrorPayload, NormalizedEvent, RawMirrorTags};

use crate::api::{CalendarApi, ChangePage, ChannelRegistration, MintedToken, WrittenEvent};
use crate::error::{ProviderError, ProviderResult};

/// Failure class to inject on the next write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InjectedFailure {
    Transient,
    Terminal,
    Auth,
    RateLimited,
}

impl InjectedFailure {
    fn into_error(self) -> ProviderError {
        match self {
            InjectedFailure::Transient => ProviderError::Transient("injected".into()),
            InjectedFailure::Terminal => ProviderError::Terminal("injected".into()),
            InjectedFailure::Auth => ProviderError::Auth("injected".into()),
            InjectedFailure::RateLimited => ProviderError::RateLimited,
        }
    }
}

#[derive(Debug)]
struct Change {
    revision: u64,
    key: (String, String),
    remote_id: String,
}

#[derive(Debug, Default)]
struct State {
    next_id: u64,
    revision: u64,
    /// (account key, calendar id) -> remote id -> event
    calendars: HashMap<(String, String), BTreeMap<String, NormalizedEvent>>,
    changes: Vec<Change>,
    cursor_invalidated: bool,
    fail_refresh: bool,
    write_failures: VecDeque<InjectedFailure>,
    channel_count: u64,
}

impl State {
    fn bump(&mut self, key: (String, String), remote_id: &str) {
        self.revision += 1;
        self.changes.push(Change {
            revision: self.revision,
            key,
            remote_id: remote_id.to_string(),
        });
    }
}

const TOKEN_PREFIX: &str = "memtok:";

/// Account key embedded in the minted access token
fn key_of(access_token: &str) -> String {
    access_token
        .strip_prefix(TOKEN_PREFIX)
        .unwrap_or(access_token)
        .to_string()
}

#[derive(Debug, Clone, Default)]
pub struct MemoryProvider {
    inner: Arc<Mutex<State>>,
}

impl MemoryProvider {
    pub fn new() -> Self {
        Self::default()
    }

    fn state(&self) -> std::sync::MutexGuard<'_, State> {
        self.inner.lock().expect("memory provider state poisoned")
    }

    /// Seed an externally-authored event into one account's calendar, as if
    /// a real user created it. `account_key` is that account's refresh
    /// token.
    pub fn seed_origin_event(&self, account_key: &str, calendar_id: &str, event: NormalizedEvent) {
        let mut state = self.state();
        let key = (account_key.to_string(), calendar_id.to_string());
        let remote_id = event.remote_id.clone();
        state
            .calendars
            .entry(key.clone())
            .or_default()
            .insert(remote_id.clone(), event);
        state.bump(key, &remote_id);
    }

    /// Remove an event provider-side, as if deleted in the provider UI
    pub fn remove_event(&self, account_key: &str, calendar_id: &str, remote_id: &str) {
        let mut state = self.state();
        let key = (account_key.to_string(), calendar_id.to_string());
        if let Some(calendar) = state.calendars.get_mut(&key) {
            calendar.remove(remote_id);
        }
        state.bump(key, remote_id);
    }

    /// Overwrite an event's title provider-side without touching its tags
    /// (simulates a user editing a managed mirror).
    pub fn tamper_title(&self, account_key: &str, calendar_id: &str, remote_id: &str, title: &str) {
        let mut state = self.state();
        let key = (account_key.to_string(), calendar_id.to_string());
        if let Some(event) = state
            .calendars
            .get_mut(&key)
            .and_then(|c| c.get_mut(remote_id))
        {
            event.title = title.to_string();
        }
        state.bump(key, remote_id);
    }

    pub fn fail_next_write(&self, failure: InjectedFailure) {
        self.state().write_failures.push_back(failure);
    }

    pub fn set_fail_refresh(&self, fail: bool) {
        self.state().fail_refresh = fail;
    }

    pub fn invalidate_cursor(&self) {
        self.state().cursor_invalidated = true;
    }

    pub fn event(
        &self,
        account_key: &str,
        calendar_id: &str,
        remote_id: &str,
    ) -> Option<NormalizedEvent> {
        self.state()
            .calendars
            .get(&(account_key.to_string(), calendar_id.to_string()))
            .and_then(|c| c.get(remote_id))
            .cloned()
    }

    pub fn event_count(&self, account_key: &str, calendar_id: &str) -> usize {
        self.state()
            .calendars
            .get(&(account_key.to_string(), calendar_id.to_string()))
            .map_or(0, BTreeMap::len)
    }

    fn take_write_failure(&self) -> Option<ProviderError> {
        self.state()
            .write_failures
            .pop_front()
            .map(InjectedFailure::into_error)
    }
}

impl CalendarApi for MemoryProvider {
    async fn refresh_token(&self, refresh_token: &str) -> ProviderResult<MintedToken> {
        if self.state().fail_refresh {
            return Err(ProviderError::Auth("injected refresh failure".into()));
        }
        Ok(MintedToken {
            access_token: format!("{TOKEN_PREFIX}{refresh_token}"),
            expires_at: Utc::now() + chrono::Duration::hours(1),
        })
    }

    async fn incremental_list(
        &self,
        access_token: &str,
        calendar_id: &str,
        cursor: &str,
    ) -> ProviderResult<ChangePage> {
        let account_key = key_of(access_token);
        let mut state = self.state();
        if state.cursor_invalidated {
            state.cursor_invalidated = false;
            return Err(ProviderError::CursorInvalidated);
        }

        let since: u64 = cursor
            .parse()
            .map_err(|_| ProviderError::CursorInvalidated)?;
        let key = (account_key, calendar_id.to_string());

        let mut page = ChangePage {
            next_cursor: Some(state.revision.to_string()),
            ..ChangePage::default()
        };
        let mut seen: Vec<String> = Vec::new();
        for change in state
            .changes
            .iter()
            .filter(|c| c.revision > since && c.key == key)
        {
            if seen.contains(&change.remote_id) {
                continue;
            }
            seen.push(change.remote_id.clone());

            match state
                .calendars
                .get(&key)
                .and_then(|c| c.get(&change.remote_id))
            {
                Some(event) => page.events.push(event.clone()),
                None => page.removed.push(change.remote_id.clone()),
            }
        }
        Ok(page)
    }

    async fn full_list(&self, access_token: &str, calendar_id: &str) -> ProviderResult<ChangePage> {
        let key = (key_of(access_token), calendar_id.to_string());
        let state = self.state();
        Ok(ChangePage {
            events: state
                .calendars
                .get(&key)
                .map(|c| c.values().cloned().collect())
                .unwrap_or_default(),
            removed: Vec::new(),
            next_cursor: Some(state.revision.to_string()),
        })
    }

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        payload: &MirrorPayload,
    ) -> ProviderResult<WrittenEvent> {
        if let Some(err) = self.take_write_failure() {
            return Err(err);
        }

        let key = (key_of(access_token), calendar_id.to_string());
        let mut state = self.state();
        state.next_id += 1;
        let remote_id = format!("mem-{}", state.next_id);
        let event = payload_to_event(&remote_id, payload);
        state
            .calendars
            .entry(key.clone())
            .or_default()
            .insert(remote_id.clone(), event);
        state.bump(key, &remote_id);

        Ok(WrittenEvent {
            remote_id,
            calendar_id: calendar_id.to_string(),
        })
    }

    async fn patch_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        remote_id: &str,
        payload: &MirrorPayload,
    ) -> ProviderResult<WrittenEvent> {
        if let Some(err) = self.take_write_failure() {
            return Err(err);
        }

        let key = (key_of(access_token), calendar_id.to_string());
        let mut state = self.state();
        let calendar = state.calendars.entry(key.clone()).or_default();
        if !calendar.contains_key(remote_id) {
            return Err(ProviderError::Terminal(format!("event {remote_id} is gone")));
        }
        calendar.insert(remote_id.to_string(), payload_to_event(remote_id, payload));
        state.bump(key, remote_id);

        Ok(WrittenEvent {
            remote_id: remote_id.to_string(),
            calendar_id: calendar_id.to_string(),
        })
    }

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        remote_id: &str,
    ) -> ProviderResult<()> {
        if let Some(err) = self.take_write_failure() {
            return Err(err);
        }

        let key = (key_of(access_token), calendar_id.to_string());
        let mut state = self.state();
        if let Some(calendar) = state.calendars.get_mut(&key) {
            calendar.remove(remote_id);
        }
        state.bump(key, remote_id);
        Ok(())
    }

    async fn register_channel(
        &self,
        _access_token: &str,
        _resource: &str,
        _channel_token: &str,
    ) -> ProviderResult<ChannelRegistration> {
        let mut state = self.state();
        state.channel_count += 1;
        Ok(ChannelRegistration {
            channel_id: format!("mem-chan-{}", state.channel_count),
            expires_at: Utc::now() + chrono::Duration::days(7),
        })
    }

    async fn renew_channel(
        &self,
        _access_token: &str,
        channel_id: &str,
        _channel_token: &str,
        _resource: &str,
    ) -> ProviderResult<ChannelRegistration> {
        Ok(ChannelRegistration {
            channel_id: channel_id.to_string(),
            expires_at: Utc::now() + chrono::Duration::days(7),
        })
    }

    async fn stop_channel(&self, _access_token: &str, _channel_id: &str) -> ProviderResult<()> {
        Ok(())
    }

    async fn resolve_calendar(
        &self,
        _access_token: &str,
        kind: CalendarKind,
    ) -> ProviderResult<String> {
        Ok(match kind {
            CalendarKind::PrimaryMirror => "primary".to_string(),
            CalendarKind::BusyOverlay => "busy-overlay".to_string(),
        })
    }
}

fn payload_to_event(remote_id: &str, payload: &MirrorPayload) -> NormalizedEvent {
    NormalizedEvent {
        remote_id: remote_id.to_string(),
        title: payload.title.clone(),
        description: payload.description.clone(),
        location: payload.location.clone(),
        conference_url: None,
        start_at: payload.start_at,
        end_at: payload.end_at,
        all_day: payload.all_day,
        status: payload.status,
        transparency: payload.transparency,
        rrule: payload.rrule.clone(),
        attendee_emails: Vec::new(),
        tags: Some(RawMirrorTags {
            canonical_id: Some(payload.tags.canonical_id.to_string()),
            owning_user_id: Some(payload.tags.owning_user_id.to_string()),
            policy_edge_id: Some(payload.tags.policy_edge_id.to_string()),
            content_hash: Some(payload.tags.content_hash.clone()),
        }),
    }
}

/// The content hash a provider-side event claims via its tags
pub fn tagged_hash(event: &NormalizedEvent) -> Option<&str> {
    event.tags.as_ref()?.content_hash.as_deref()
}
