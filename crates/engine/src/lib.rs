//! Claimsync Engine - subscriptions, reconnection, hybrid sync,
//! reconciliation, and user feedback

pub mod feedback;
pub mod realtime;
pub mod sync;
#[cfg(any(test, feature = "testing"))]
pub mod testing;
mod util;

pub use feedback::{spawn_connection_banner, FeedbackManager, FeedbackSink, HapticKind, Toast, ToastKind};
pub use realtime::{ReconnectionStrategy, RetryDecision, StateListener, Subscription, SubscriptionManager};
pub use sync::{ClaimSyncService, HybridClaimSync, HybridSubscription, ModeChange, ModeListener, UpdatePipeline};
