//! Realtime subscriptions and their reconnection policy

pub mod gate;
pub mod manager;
pub mod reconnection;

pub use gate::{UpdateGate, Versioned};
pub use manager::{ErrorCallback, StateListener, Subscription, SubscriptionManager, UpdateCallback};
pub use reconnection::{FixedJitter, JitterSource, RandomJitter, ReconnectionStrategy, RetryDecision};
