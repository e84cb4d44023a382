//! T-Minus Provider - External calendar provider clients
//!
//! One small capability set, one implementation per provider variant. The
//! rest of the system only speaks [`CalendarApi`] through
//! [`ProviderClient`]; everything provider-specific (wire formats, tag
//! mechanisms, cursor semantics) stays inside this crate.
//!
//! The extended-property keys written here are pinned forever: changing
//! them orphans every mirror already written.

pub mod api;
pub mod error;
pub mod factory;
pub mod google;
pub mod ics;
pub mod memory;
pub mod microsoft;

pub use api::{
    CalendarApi, ChangePage, ChannelRegistration, MintedToken, ProviderClient, WrittenEvent,
};
pub use error::{ProviderError, ProviderResult};
pub use factory::ProviderFactory;
pub use google::GoogleClient;
pub use ics::IcsClient;
pub use memory::MemoryProvider;
pub use microsoft::MicrosoftClient;
