//! T-Minus Core - Domain logic and models
//!
//! This crate contains pure domain logic with no I/O operations: the
//! canonical event model, the projection compiler, the inbound-event
//! classifier, and the interval solver. Everything here is deterministic
//! and never suspends.

pub mod classify;
pub mod config;
pub mod error;
pub mod interval;
pub mod models;
pub mod projection;
pub mod recurrence;
pub mod security;
pub mod timezone;
pub mod types;

pub use classify::{Classification, EventClass, classify};
pub use error::GraphError;
pub use projection::{Projection, ProjectionError, WriteOp, compile_projection};
pub use recurrence::validate_rrule;
pub use security::{canonical_json_hash, format_instant_ms, participant_hash};
pub use timezone::{parse_timezone, validate_timezone};
