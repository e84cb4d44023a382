//! T-Minus Graph - Per-user canonical event graph
//!
//! The User Graph Coordinator is the single-writer authority over a user's
//! canonical events, mirror registry, policy graph, journal, scheduling
//! sessions, holds, and governance tables. Every mutation for a user
//! linearizes through that user's coordinator lock; readers run
//! concurrently against the store.

pub mod availability;
pub mod coordinator;
pub mod store;
pub mod tasks;

pub use coordinator::{CoordinatorConfig, CoordinatorRegistry, UserGraphCoordinator};
pub use tasks::{WritePurpose, WriteTask};
