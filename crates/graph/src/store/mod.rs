//! Store layer for the user graph
//!
//! Free async functions over the shared pool, in the shape the coordinator
//! expects: reads take the pool, mutations take a connection so the
//! coordinator can group them into one transaction per logical operation.

pub mod events;
pub mod governance;
pub mod mirrors;
pub mod policies;
pub mod registry;
pub mod sessions;
