//! User-facing feedback for sync events
//!
//! The sync code never talks to UI directly. It calls [`FeedbackManager`],
//! which forwards haptics, toasts and the connection banner to whatever
//! [`FeedbackSink`] the host installed.

use claimsync_core::{ClaimId, ConnectionState, FeedbackConfig};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HapticKind {
    Success,
    Warning,
    Error,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToastKind {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Toast {
    pub kind: ToastKind,
    pub title: String,
    pub message: String,
    pub claim_id: Option<ClaimId>,
}

/// Where feedback ends up (device haptics, toast layer, banner view)
pub trait FeedbackSink: Send + Sync {
    fn haptic(&self, kind: HapticKind);
    fn toast(&self, toast: &Toast);
    fn banner(&self, visible: bool);
}

#[derive(Default)]
struct BannerState {
    visible: AtomicBool,
    /// Bumped on every show so a stale auto-hide timer can tell it lost
    generation: AtomicU64,
}

#[derive(Clone)]
pub struct FeedbackManager {
    sink: Arc<dyn FeedbackSink>,
    config: Arc<RwLock<FeedbackConfig>>,
    banner: Arc<BannerState>,
}

impl FeedbackManager {
    pub fn new(sink: Arc<dyn FeedbackSink>, config: FeedbackConfig) -> Self {
        Self {
            sink,
            config: Arc::new(RwLock::new(config)),
            banner: Arc::new(BannerState::default()),
        }
    }

    pub fn config(&self) -> FeedbackConfig {
        self.config.read().map(|c| c.clone()).unwrap_or_default()
    }

    pub fn set_config(&self, config: FeedbackConfig) {
        if let Ok(mut current) = self.config.write() {
            *current = config;
        }
    }

    /// Haptic + toast for a redeemed claim
    pub fn show_accepted_feedback(&self, claim_id: &ClaimId) {
        info!("Claim {} accepted", claim_id);
        self.emit(
            HapticKind::Success,
            Toast {
                kind: ToastKind::Success,
                title: "Offer redeemed".to_string(),
                message: "Your claim was accepted. Enjoy!".to_string(),
                claim_id: Some(claim_id.clone()),
            },
        );
    }

    /// Haptic + toast carrying the rejection reason
    pub fn show_rejected_feedback(&self, claim_id: &ClaimId, reason: &str) {
        info!("Claim {} rejected: {}", claim_id, reason);
        self.emit(
            HapticKind::Error,
            Toast {
                kind: ToastKind::Error,
                title: "Claim rejected".to_string(),
                message: reason.to_string(),
                claim_id: Some(claim_id.clone()),
            },
        );
    }

    fn emit(&self, haptic: HapticKind, toast: Toast) {
        let config = self.config();
        if !config.enabled {
            return;
        }
        if config.haptics {
            self.sink.haptic(haptic);
        }
        if config.toasts {
            self.sink.toast(&toast);
        }
    }

    /// Show the degraded-connection banner
    ///
    /// With `banner_auto_hide_secs` set and a tokio runtime available, the
    /// banner hides itself unless it was shown again in the meantime.
    pub fn show_connection_warning(&self) {
        let generation = self.banner.generation.fetch_add(1, Ordering::SeqCst) + 1;
        let was_visible = self.banner.visible.swap(true, Ordering::SeqCst);

        let config = self.config();
        if !was_visible {
            debug!("Showing connection warning");
            if config.enabled {
                self.sink.banner(true);
            }
        }

        let Some(secs) = config.banner_auto_hide_secs else {
            return;
        };
        let Ok(handle) = tokio::runtime::Handle::try_current() else {
            return;
        };
        let manager = self.clone();
        handle.spawn(async move {
            tokio::time::sleep(Duration::from_secs(secs)).await;
            if manager.banner.generation.load(Ordering::SeqCst) == generation {
                manager.hide_connection_warning();
            }
        });
    }

    pub fn hide_connection_warning(&self) {
        if self.banner.visible.swap(false, Ordering::SeqCst) {
            debug!("Hiding connection warning");
            if self.config().enabled {
                self.sink.banner(false);
            }
        }
    }

    pub fn is_connection_warning_visible(&self) -> bool {
        self.banner.visible.load(Ordering::SeqCst)
    }
}

/// Drive the banner from an aggregate connection state
///
/// `failed` shows it; `connected` and `disconnected` (nothing open) hide it.
pub fn spawn_connection_banner(
    feedback: FeedbackManager,
    mut states: watch::Receiver<ConnectionState>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let apply = |state: ConnectionState| match state {
            ConnectionState::Failed => feedback.show_connection_warning(),
            ConnectionState::Connected | ConnectionState::Disconnected => {
                feedback.hide_connection_warning()
            }
            ConnectionState::Connecting => {}
        };

        apply(*states.borrow_and_update());
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                changed = states.changed() => {
                    if changed.is_err() {
                        break;
                    }
                    let state = *states.borrow_and_update();
                    apply(state);
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{settle, FeedbackEvent, RecordingSink};

    fn manager(config: FeedbackConfig) -> (Arc<RecordingSink>, FeedbackManager) {
        let sink = Arc::new(RecordingSink::new());
        (sink.clone(), FeedbackManager::new(sink, config))
    }

    fn id(raw: &str) -> ClaimId {
        ClaimId::new(raw).unwrap()
    }

    #[test]
    fn test_accepted_fires_haptic_and_toast() {
        let (sink, feedback) = manager(FeedbackConfig::default());
        feedback.show_accepted_feedback(&id("c1"));

        let events = sink.events();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0], FeedbackEvent::Haptic(HapticKind::Success));
        assert!(matches!(
            &events[1],
            FeedbackEvent::Toast(t) if t.kind == ToastKind::Success && t.claim_id == Some(id("c1"))
        ));
        assert!(!feedback.is_connection_warning_visible());
    }

    #[test]
    fn test_rejected_toast_carries_reason() {
        let (sink, feedback) = manager(FeedbackConfig::default());
        feedback.show_rejected_feedback(&id("c2"), "Expired");
        assert_eq!(sink.rejections(), vec![(id("c2"), "Expired".to_string())]);
    }

    #[test]
    fn test_disabled_config_is_silent() {
        let (sink, feedback) = manager(FeedbackConfig {
            enabled: false,
            ..Default::default()
        });
        feedback.show_accepted_feedback(&id("c1"));
        feedback.show_connection_warning();
        assert!(sink.events().is_empty());
        assert!(feedback.is_connection_warning_visible());

        feedback.set_config(FeedbackConfig {
            haptics: false,
            ..Default::default()
        });
        feedback.show_accepted_feedback(&id("c1"));
        assert_eq!(sink.events().len(), 1);
    }

    #[test]
    fn test_banner_toggles_once() {
        let (sink, feedback) = manager(FeedbackConfig {
            banner_auto_hide_secs: None,
            ..Default::default()
        });
        feedback.show_connection_warning();
        feedback.show_connection_warning();
        assert!(feedback.is_connection_warning_visible());
        feedback.hide_connection_warning();
        feedback.hide_connection_warning();
        assert!(!feedback.is_connection_warning_visible());
        assert_eq!(
            sink.events(),
            vec![FeedbackEvent::Banner(true), FeedbackEvent::Banner(false)]
        );
    }

    #[tokio::test(start_paused = true)]
    async fn test_banner_auto_hides() {
        let (_sink, feedback) = manager(FeedbackConfig::default());
        feedback.show_connection_warning();

        tokio::time::sleep(Duration::from_secs(5)).await;
        // Showing again restarts the countdown
        feedback.show_connection_warning();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(feedback.is_connection_warning_visible());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!feedback.is_connection_warning_visible());
    }

    #[tokio::test(start_paused = true)]
    async fn test_banner_follows_connection_state() {
        let (_sink, feedback) = manager(FeedbackConfig {
            banner_auto_hide_secs: None,
            ..Default::default()
        });
        let (tx, rx) = watch::channel(ConnectionState::Connecting);
        let cancel = CancellationToken::new();
        let task = spawn_connection_banner(feedback.clone(), rx, cancel.clone());

        tx.send_replace(ConnectionState::Failed);
        settle().await;
        assert!(feedback.is_connection_warning_visible());

        tx.send_replace(ConnectionState::Connecting);
        settle().await;
        assert!(feedback.is_connection_warning_visible());

        tx.send_replace(ConnectionState::Connected);
        settle().await;
        assert!(!feedback.is_connection_warning_visible());

        cancel.cancel();
        task.await.unwrap();
    }
}
