//! T-Minus Worker - Write pipeline and periodic maintenance
//!
//! Consumes projection tasks over ordered per-account queues, calls the
//! provider APIs with retry/backoff, and reports results back into the
//! User Graph Coordinator. The maintainer half drives channel renewal,
//! token health, drift reconciliation, hold GC, and stale-session expiry.

pub mod config;
pub mod maintain;
pub mod write;

pub use config::WorkerConfig;
pub use maintain::Maintainer;
pub use write::WritePipeline;
