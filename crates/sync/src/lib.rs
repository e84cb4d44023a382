//! T-Minus Sync - Inbound change pipeline
//!
//! Drains webhook-triggered and scheduled poll signals, fetches incremental
//! changes from each account's provider, normalizes them, classifies them,
//! and feeds origin events into the User Graph Coordinator. Managed events
//! never re-enter ingestion; they only move drift state.

mod pipeline;

pub use pipeline::{SyncConfig, SyncPipeline, SyncStats};
