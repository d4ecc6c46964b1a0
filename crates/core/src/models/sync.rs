//! Connection, mode and result types shared by the sync engine

use crate::errors::Error;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::time::Duration;

/// Connection state of one realtime channel, or the aggregate of all of them
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connecting,
    Connected,
    Disconnected,
    Failed,
}

impl ConnectionState {
    /// Fold per-channel states into one; no channels means disconnected
    pub fn aggregate<I>(states: I) -> ConnectionState
    where
        I: IntoIterator<Item = ConnectionState>,
    {
        let mut any = false;
        let mut connecting = false;
        let mut disconnected = false;
        for state in states {
            any = true;
            match state {
                ConnectionState::Failed => return ConnectionState::Failed,
                ConnectionState::Disconnected => disconnected = true,
                ConnectionState::Connecting => connecting = true,
                ConnectionState::Connected => {}
            }
        }
        if !any || disconnected {
            ConnectionState::Disconnected
        } else if connecting {
            ConnectionState::Connecting
        } else {
            ConnectionState::Connected
        }
    }

    /// States that should surface the connection warning banner
    pub fn is_degraded(&self) -> bool {
        matches!(self, ConnectionState::Disconnected | ConnectionState::Failed)
    }
}

/// Status string reported by the realtime broker for a channel
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChannelStatus {
    Subscribed,
    ChannelError,
    TimedOut,
    Closed,
}

impl fmt::Display for ChannelStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ChannelStatus::Subscribed => "SUBSCRIBED",
            ChannelStatus::ChannelError => "CHANNEL_ERROR",
            ChannelStatus::TimedOut => "TIMED_OUT",
            ChannelStatus::Closed => "CLOSED",
        };
        f.write_str(s)
    }
}

/// Transport currently used for a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SyncMode {
    Realtime,
    /// Polling by design (claims without realtime support)
    Polling,
    /// Started on realtime, degraded to polling after repeated failures
    Fallback,
}

/// Retry bookkeeping for one channel
///
/// `attempt_count` only grows until a successful subscribe or an explicit
/// reset (for example on app foreground).
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReconnectionState {
    pub attempt_count: u32,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub last_error: Option<String>,
}

impl ReconnectionState {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a failed attempt
    pub fn record_failure(&mut self, error: &Error) {
        self.attempt_count = self.attempt_count.saturating_add(1);
        self.last_error = Some(error.to_string());
        self.next_retry_at = None;
    }

    /// Record when the next attempt is scheduled
    pub fn schedule(&mut self, delay: Duration) {
        let delay = chrono::Duration::from_std(delay).unwrap_or(chrono::Duration::MAX);
        self.next_retry_at = Utc::now().checked_add_signed(delay);
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }
}

/// Outcome of a reconciliation sync
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncReport {
    pub success: bool,
    /// Number of cached claims that changed
    pub claims_synced: usize,
    #[serde(serialize_with = "serialize_errors")]
    pub errors: Vec<Error>,
}

impl SyncReport {
    pub fn succeeded(claims_synced: usize) -> Self {
        Self {
            success: true,
            claims_synced,
            errors: Vec::new(),
        }
    }

    pub fn failed(errors: Vec<Error>) -> Self {
        Self {
            success: false,
            claims_synced: 0,
            errors,
        }
    }
}

fn serialize_errors<S>(errors: &[Error], serializer: S) -> std::result::Result<S::Ok, S::Error>
where
    S: serde::Serializer,
{
    serializer.collect_seq(errors.iter().map(|e| e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggregate_state() {
        use ConnectionState::*;
        assert_eq!(ConnectionState::aggregate(Vec::new()), Disconnected);
        assert_eq!(ConnectionState::aggregate([Connected, Connected]), Connected);
        assert_eq!(ConnectionState::aggregate([Connected, Connecting]), Connecting);
        assert_eq!(ConnectionState::aggregate([Connecting, Disconnected]), Disconnected);
        assert_eq!(ConnectionState::aggregate([Connected, Failed, Connecting]), Failed);
    }

    #[test]
    fn test_reconnection_state_advances_and_resets() {
        let mut state = ReconnectionState::new();
        state.record_failure(&Error::NetworkError("CHANNEL_ERROR".into()));
        state.record_failure(&Error::NetworkError("TIMED_OUT".into()));
        assert_eq!(state.attempt_count, 2);
        assert_eq!(state.last_error.as_deref(), Some("Network error: TIMED_OUT"));

        state.schedule(Duration::from_secs(2));
        assert!(state.next_retry_at.is_some());

        state.reset();
        assert_eq!(state, ReconnectionState::default());
    }

    #[test]
    fn test_report_serializes_errors_as_strings() {
        let report = SyncReport::failed(vec![Error::NetworkError("offline".into())]);
        let json = serde_json::to_value(&report).unwrap();
        assert_eq!(json["success"], false);
        assert_eq!(json["claimsSynced"], 0);
        assert_eq!(json["errors"][0], "Network error: offline");
    }
}
