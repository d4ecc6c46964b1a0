//! Claimsync Persistence - in-memory claim state cache and its small
//! on-disk snapshot

pub mod cache;
pub mod sqlite;

pub use cache::{ApplyOutcome, StateCache};
pub use sqlite::ClaimStore;
