//! Provider client selection
//!
//! The pipelines dispatch on the target account's provider kind; this is
//! the one place that mapping lives. The in-memory variant swaps the whole
//! fleet out for tests and local development.

use tminus_core::types::ProviderKind;

use crate::api::ProviderClient;
use crate::google::GoogleClient;
use crate::ics::IcsClient;
use crate::memory::MemoryProvider;
use crate::microsoft::MicrosoftClient;

#[derive(Debug, Clone)]
pub enum ProviderFactory {
    Real {
        google: GoogleClient,
        microsoft: MicrosoftClient,
        ics: IcsClient,
    },
    InMemory(MemoryProvider),
}

impl ProviderFactory {
    pub fn new(google: GoogleClient, microsoft: MicrosoftClient) -> Self {
        ProviderFactory::Real {
            google,
            microsoft,
            ics: IcsClient::new(),
        }
    }

    /// Every provider kind resolves to the same in-memory instance
    pub fn in_memory(provider: MemoryProvider) -> Self {
        ProviderFactory::InMemory(provider)
    }

    pub fn client_for(&self, kind: ProviderKind) -> ProviderClient {
        match self {
            ProviderFactory::Real {
                google,
                microsoft,
                ics,
            } => match kind {
                ProviderKind::Google => ProviderClient::Google(google.clone()),
                ProviderKind::Microsoft => ProviderClient::Microsoft(microsoft.clone()),
                ProviderKind::Ics => ProviderClient::Ics(ics.clone()),
            },
            ProviderFactory::InMemory(provider) => ProviderClient::Memory(provider.clone()),
        }
    }
}
