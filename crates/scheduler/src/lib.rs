//! T-Minus Scheduler - Group scheduling across users
//!
//! Coordinates a scheduling session over multiple User Graph Coordinators:
//! privacy-preserving busy merge, candidate generation, tentative hold
//! placement, and best-effort-atomic multi-participant commit with a
//! rollback path that converges every participant to cancelled.

mod group;

pub use group::{GroupScheduler, SchedulerConfig, SessionRequest, SessionView};
