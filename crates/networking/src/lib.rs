//! Claimsync Networking - REST client, realtime channel transport, and the
//! traits the sync engine consumes them through

pub mod api;
pub mod http;
pub mod realtime;

pub use api::BackendApi;
pub use http::SupabaseClient;
pub use realtime::{
    ChannelEvent, ChannelTopic, PhoenixTransport, RealtimeChannel, RealtimeTransport, RowChange,
};
