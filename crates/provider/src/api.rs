//! The provider capability set
//!
//! `{refresh_token, incremental_list, full_list, create, patch, delete,
//! register_channel, renew_channel, stop_channel, resolve_calendar}` is
//! everything the rest of the system is allowed to ask of a provider.

use chrono::{DateTime, Utc};

use tminus_core::models::{CalendarKind, MirrorPayload, NormalizedEvent};

use crate::error::ProviderResult;
use crate::google::GoogleClient;
use crate::ics::IcsClient;
use crate::memory::MemoryProvider;
use crate::microsoft::MicrosoftClient;

/// Short-lived access token minted from a refresh token
#[derive(Debug, Clone)]
pub struct MintedToken {
    pub access_token: String,
    pub expires_at: DateTime<Utc>,
}

/// A registered or renewed webhook channel
#[derive(Debug, Clone)]
pub struct ChannelRegistration {
    pub channel_id: String,
    pub expires_at: DateTime<Utc>,
}

/// One page's worth of changes from a provider
#[derive(Debug, Clone, Default)]
pub struct ChangePage {
    pub events: Vec<NormalizedEvent>,
    /// Remote ids gone from the provider since the cursor
    pub removed: Vec<String>,
    pub next_cursor: Option<String>,
}

/// Result of a create or patch
#[derive(Debug, Clone)]
pub struct WrittenEvent {
    pub remote_id: String,
    pub calendar_id: String,
}

/// Provider capability set. Implementations must not retry internally;
/// retry policy belongs to the pipelines.
pub trait CalendarApi {
    async fn refresh_token(&self, refresh_token: &str) -> ProviderResult<MintedToken>;

    async fn incremental_list(
        &self,
        access_token: &str,
        calendar_id: &str,
        cursor: &str,
    ) -> ProviderResult<ChangePage>;

    async fn full_list(&self, access_token: &str, calendar_id: &str) -> ProviderResult<ChangePage>;

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        payload: &MirrorPayload,
    ) -> ProviderResult<WrittenEvent>;

    async fn patch_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        remote_id: &str,
        payload: &MirrorPayload,
    ) -> ProviderResult<WrittenEvent>;

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        remote_id: &str,
    ) -> ProviderResult<()>;

    async fn register_channel(
        &self,
        access_token: &str,
        resource: &str,
        channel_token: &str,
    ) -> ProviderResult<ChannelRegistration>;

    async fn renew_channel(
        &self,
        access_token: &str,
        channel_id: &str,
        channel_token: &str,
        resource: &str,
    ) -> ProviderResult<ChannelRegistration>;

    async fn stop_channel(&self, access_token: &str, channel_id: &str) -> ProviderResult<()>;

    /// Resolve (and auto-provision, for busy overlays) the target calendar
    async fn resolve_calendar(
        &self,
        access_token: &str,
        kind: CalendarKind,
    ) -> ProviderResult<String>;
}

/// Dispatching handle over the concrete provider variants
#[derive(Debug, Clone)]
pub enum ProviderClient {
    Google(GoogleClient),
    Microsoft(MicrosoftClient),
    Ics(IcsClient),
    Memory(MemoryProvider),
}

macro_rules! dispatch {
    ($self:ident, $client:ident => $call:expr) => {
        match $self {
            ProviderClient::Google($client) => $call,
            ProviderClient::Microsoft($client) => $call,
            ProviderClient::Ics($client) => $call,
            ProviderClient::Memory($client) => $call,
        }
    };
}

impl CalendarApi for ProviderClient {
    async fn refresh_token(&self, refresh_token: &str) -> ProviderResult<MintedToken> {
        dispatch!(self, c => c.refresh_token(refresh_token).await)
    }

    async fn incremental_list(
        &self,
        access_token: &str,
        calendar_id: &str,
        cursor: &str,
    ) -> ProviderResult<ChangePage> {
        dispatch!(self, c => c.incremental_list(access_token, calendar_id, cursor).await)
    }

    async fn full_list(&self, access_token: &str, calendar_id: &str) -> ProviderResult<ChangePage> {
        dispatch!(self, c => c.full_list(access_token, calendar_id).await)
    }

    async fn create_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        payload: &MirrorPayload,
    ) -> ProviderResult<WrittenEvent> {
        dispatch!(self, c => c.create_event(access_token, calendar_id, payload).await)
    }

    async fn patch_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        remote_id: &str,
        payload: &MirrorPayload,
    ) -> ProviderResult<WrittenEvent> {
        dispatch!(self, c => c.patch_event(access_token, calendar_id, remote_id, payload).await)
    }

    async fn delete_event(
        &self,
        access_token: &str,
        calendar_id: &str,
        remote_id: &str,
    ) -> ProviderResult<()> {
        dispatch!(self, c => c.delete_event(access_token, calendar_id, remote_id).await)
    }

    async fn register_channel(
        &self,
        access_token: &str,
        resource: &str,
        channel_token: &str,
    ) -> ProviderResult<ChannelRegistration> {
        dispatch!(self, c => c.register_channel(access_token, resource, channel_token).await)
    }

    async fn renew_channel(
        &self,
        access_token: &str,
        channel_id: &str,
        channel_token: &str,
        resource: &str,
    ) -> ProviderResult<ChannelRegistration> {
        dispatch!(self, c => c.renew_channel(access_token, channel_id, channel_token, resource).await)
    }

    async fn stop_channel(&self, access_token: &str, channel_id: &str) -> ProviderResult<()> {
        dispatch!(self, c => c.stop_channel(access_token, channel_id).await)
    }

    async fn resolve_calendar(
        &self,
        access_token: &str,
        kind: CalendarKind,
    ) -> ProviderResult<String> {
        dispatch!(self, c => c.resolve_calendar(access_token, kind).await)
    }
}
