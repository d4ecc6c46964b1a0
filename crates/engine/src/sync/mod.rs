//! Claim synchronization: hybrid realtime/polling tracking, one-shot
//! reconciliation, and the cache/feedback pipeline updates flow through

pub mod hybrid;
pub mod pipeline;
pub mod reconciliation;

pub use hybrid::{HybridClaimSync, HybridSubscription, ModeChange, ModeListener};
pub use pipeline::UpdatePipeline;
pub use reconciliation::ClaimSyncService;
