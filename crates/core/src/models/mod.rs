//! Data models for claims, offers and sync bookkeeping

mod claim;
mod offer;
mod sync;

pub use claim::*;
pub use offer::*;
pub use sync::*;
