//! Realtime channel abstraction
//!
//! A channel is a push subscription to row-level change events for one
//! table/filter pair. The engine consumes channels through the
//! [`RealtimeTransport`] trait; [`PhoenixTransport`] speaks the hosted
//! backend's websocket protocol.

mod frame;
mod phoenix;

pub use phoenix::PhoenixTransport;

use async_trait::async_trait;
use claimsync_core::{ChannelStatus, ClaimId, ClaimRow, FlashOffer, OfferId, Result, UserId};
use std::fmt;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// What a channel is scoped to
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChannelTopic {
    /// A single claim row
    Claim(ClaimId),
    /// Every claim row of a user
    UserClaims(UserId),
    /// A single flash offer row
    Offer(OfferId),
}

impl ChannelTopic {
    /// Broker topic name
    pub fn name(&self) -> String {
        match self {
            ChannelTopic::Claim(id) => format!("realtime:claim:{}", id),
            ChannelTopic::UserClaims(id) => format!("realtime:user-claims:{}", id),
            ChannelTopic::Offer(id) => format!("realtime:offer:{}", id),
        }
    }

    /// Row filter in `column=eq.value` form
    pub fn filter(&self) -> String {
        match self {
            ChannelTopic::Claim(id) => format!("id=eq.{}", id),
            ChannelTopic::UserClaims(id) => format!("user_id=eq.{}", id),
            ChannelTopic::Offer(id) => format!("id=eq.{}", id),
        }
    }

    pub fn is_offer(&self) -> bool {
        matches!(self, ChannelTopic::Offer(_))
    }
}

impl fmt::Display for ChannelTopic {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name())
    }
}

/// New-row payload of a change event
#[derive(Debug, Clone, PartialEq)]
pub enum RowChange {
    Claim(ClaimRow),
    Offer(FlashOffer),
}

/// Something that happened on a channel
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    Status(ChannelStatus),
    Change(RowChange),
}

/// An open channel: a stream of events plus the means to close it
///
/// Dropping the channel closes it.
pub struct RealtimeChannel {
    events: mpsc::Receiver<ChannelEvent>,
    cancel: CancellationToken,
}

impl RealtimeChannel {
    pub fn new(events: mpsc::Receiver<ChannelEvent>, cancel: CancellationToken) -> Self {
        Self { events, cancel }
    }

    /// Next event, or `None` once the transport side has gone away
    pub async fn next_event(&mut self) -> Option<ChannelEvent> {
        self.events.recv().await
    }

    pub fn close(&self) {
        self.cancel.cancel();
    }
}

impl Drop for RealtimeChannel {
    fn drop(&mut self) {
        self.cancel.cancel();
    }
}

/// Opens realtime channels
#[async_trait]
pub trait RealtimeTransport: Send + Sync {
    /// Open a channel for `topic`
    ///
    /// Returning `Ok` only means the connection attempt started; the
    /// channel reports `SUBSCRIBED` or a failure status as its first events.
    async fn open(&self, topic: &ChannelTopic) -> Result<RealtimeChannel>;
}
