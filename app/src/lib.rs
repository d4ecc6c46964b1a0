//! Claimsync app shell - service wiring, screen bindings, and config

pub mod bindings;
pub mod config;
pub mod context;
pub mod feedback_sink;

pub use bindings::{ClaimWatch, HybridClaimOptions, OfferWatch, UserClaimsWatch};
pub use config::AppConfig;
pub use context::{SyncContext, SyncServices};
pub use feedback_sink::LogFeedbackSink;
