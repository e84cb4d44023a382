//! Unified server configuration

use anyhow::Result;
use std::env;
use tminus_core::config::CoreConfig;

#[derive(Debug, Clone)]
pub struct UnifiedConfig {
    pub core: CoreConfig,
    pub api: tminus_api::config::Config,
    pub providers: ProviderSettings,
    /// Depth of the shared coordinator -> write-pipeline channel
    pub write_channel_depth: usize,
    /// Depth of the webhook/scan -> sync-pipeline channel
    pub poll_channel_depth: usize,
}

#[derive(Debug, Clone)]
pub enum ProviderSettings {
    Real {
        google_client_id: String,
        google_client_secret: String,
        microsoft_client_id: String,
        microsoft_client_secret: String,
        webhook_address: String,
    },
    /// Local development without real provider credentials
    InMemory,
}

impl UnifiedConfig {
    pub fn from_env() -> Result<Self> {
        let core = CoreConfig::from_env()?;
        let api = tminus_api::config::Config::from_env()?;

        let providers = if env::var("TMINUS_PROVIDER_MODE").as_deref() == Ok("memory") {
            ProviderSettings::InMemory
        } else {
            ProviderSettings::Real {
                google_client_id: env::var("GOOGLE_CLIENT_ID").unwrap_or_default(),
                google_client_secret: env::var("GOOGLE_CLIENT_SECRET").unwrap_or_default(),
                microsoft_client_id: env::var("MICROSOFT_CLIENT_ID").unwrap_or_default(),
                microsoft_client_secret: env::var("MICROSOFT_CLIENT_SECRET").unwrap_or_default(),
                webhook_address: env::var("TMINUS_WEBHOOK_ADDRESS")
                    .unwrap_or_else(|_| "https://localhost/webhooks/calendar".into()),
            }
        };

        Ok(UnifiedConfig {
            core,
            api,
            providers,
            write_channel_depth: env::var("WRITE_CHANNEL_DEPTH")
                .unwrap_or_else(|_| "256".into())
                .parse()?,
            poll_channel_depth: env::var("POLL_CHANNEL_DEPTH")
                .unwrap_or_else(|_| "256".into())
                .parse()?,
        })
    }
}
