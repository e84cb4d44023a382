//! Shared configuration logic
//!
//! Handles loading of common environment variables.

use anyhow::{Context, Result};
use std::env;

/// Common configuration used across services
#[derive(Debug, Clone)]
pub struct CoreConfig {
    /// Store connection URL (e.g. `sqlite://tminus.db`)
    pub database_url: String,

    /// Key material for deletion-certificate signatures and webhook token
    /// derivation
    pub signing_key: String,
}

impl CoreConfig {
    /// Load common configuration from environment variables.
    ///
    /// This will also initialize dotenv if it hasn't been done yet.
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        Ok(Self {
            database_url: env::var("DATABASE_URL").context("DATABASE_URL must be set")?,
            signing_key: env::var("TMINUS_SIGNING_KEY")
                .context("TMINUS_SIGNING_KEY must be set")?,
        })
    }
}
