//! Configuration structs with production defaults

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Default polling interval for claims that cannot use realtime
pub const DEFAULT_POLL_INTERVAL_SECS: u64 = 30;

/// Hosted backend endpoints and credentials
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct BackendConfig {
    /// Project URL, e.g. `https://xyz.supabase.co`
    pub url: String,
    /// Public anon key sent as `apikey`
    pub anon_key: String,
    /// User access token (JWT); anon key is used when absent
    pub access_token: Option<String>,
    /// Table holding claim rows
    pub claims_table: String,
    /// Table holding flash offer rows
    pub offers_table: String,
    pub request_timeout_secs: u64,
    /// How long to wait for a channel join reply
    pub join_timeout_secs: u64,
    pub heartbeat_interval_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            url: "http://localhost:54321".to_string(),
            anon_key: String::new(),
            access_token: None,
            claims_table: "flash_offer_claims".to_string(),
            offers_table: "flash_offers".to_string(),
            request_timeout_secs: 15,
            join_timeout_secs: 10,
            heartbeat_interval_secs: 30,
        }
    }
}

impl BackendConfig {
    pub fn rest_url(&self) -> String {
        format!("{}/rest/v1", self.url.trim_end_matches('/'))
    }

    /// Realtime websocket endpoint (http(s) scheme swapped for ws(s))
    pub fn realtime_url(&self) -> String {
        let base = self.url.trim_end_matches('/');
        let ws_base = if let Some(rest) = base.strip_prefix("https://") {
            format!("wss://{}", rest)
        } else if let Some(rest) = base.strip_prefix("http://") {
            format!("ws://{}", rest)
        } else {
            base.to_string()
        };
        format!("{}/realtime/v1/websocket?apikey={}&vsn=1.0.0", ws_base, self.anon_key)
    }

    /// Token used for the Authorization header and channel joins
    pub fn bearer_token(&self) -> &str {
        self.access_token.as_deref().unwrap_or(&self.anon_key)
    }
}

/// Backoff policy for broken realtime channels
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct ReconnectionPolicy {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Attempts before the channel is parked as failed
    pub max_attempts: u32,
    /// Extra random delay as a fraction of the computed delay (0.0-1.0)
    pub jitter_ratio: f64,
}

impl Default for ReconnectionPolicy {
    fn default() -> Self {
        Self {
            base_delay_ms: 1_000,
            max_delay_ms: 30_000,
            max_attempts: 5,
            jitter_ratio: 0.2,
        }
    }
}

impl ReconnectionPolicy {
    pub fn base_delay(&self) -> Duration {
        Duration::from_millis(self.base_delay_ms)
    }

    pub fn max_delay(&self) -> Duration {
        Duration::from_millis(self.max_delay_ms)
    }
}

/// Engine tuning
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct SyncConfig {
    pub poll_interval_secs: u64,
    pub reconnection: ReconnectionPolicy,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            poll_interval_secs: DEFAULT_POLL_INTERVAL_SECS,
            reconnection: ReconnectionPolicy::default(),
        }
    }
}

impl SyncConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_secs(self.poll_interval_secs.max(1))
    }
}

/// User-facing feedback toggles
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct FeedbackConfig {
    /// Master switch; if false nothing is shown
    pub enabled: bool,
    pub haptics: bool,
    pub toasts: bool,
    /// Hide the connection banner automatically after this many seconds
    pub banner_auto_hide_secs: Option<u64>,
}

impl Default for FeedbackConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            haptics: true,
            toasts: true,
            banner_auto_hide_secs: Some(8),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_realtime_url_swaps_scheme() {
        let config = BackendConfig {
            url: "https://abc.supabase.co/".into(),
            anon_key: "anon".into(),
            ..Default::default()
        };
        assert_eq!(config.rest_url(), "https://abc.supabase.co/rest/v1");
        assert_eq!(
            config.realtime_url(),
            "wss://abc.supabase.co/realtime/v1/websocket?apikey=anon&vsn=1.0.0"
        );
    }

    #[test]
    fn test_bearer_falls_back_to_anon_key() {
        let mut config = BackendConfig {
            anon_key: "anon".into(),
            ..Default::default()
        };
        assert_eq!(config.bearer_token(), "anon");
        config.access_token = Some("jwt".into());
        assert_eq!(config.bearer_token(), "jwt");
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SyncConfig = serde_json::from_str(r#"{"pollIntervalSecs": 10}"#).unwrap();
        assert_eq!(config.poll_interval(), Duration::from_secs(10));
        assert_eq!(config.reconnection.max_attempts, 5);
    }
}
