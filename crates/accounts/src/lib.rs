//! T-Minus Accounts - Per-account coordination
//!
//! One logical coordinator per external account: encrypted refresh tokens,
//! short-lived access token minting, sync cursors, webhook channel
//! lifecycle, outbound rate limiting, and sync health counters. Refresh
//! token material never leaves this crate in the clear.

pub mod cipher;
pub mod coordinator;
pub mod error;
pub mod store;
pub mod throttle;

pub use cipher::{DevelopmentCipher, TokenCipher};
pub use coordinator::{AccountConfig, AccountCoordinator, AccountRegistry};
pub use error::{AccountError, AccountResult};
pub use store::ChannelRecord;
