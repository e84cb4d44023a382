//! Shared bootstrap for T-Minus services

pub mod bootstrap;

pub use bootstrap::{init_db, init_env, init_tracing};
