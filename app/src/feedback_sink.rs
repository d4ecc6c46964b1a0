//! Feedback sink for headless runs: everything goes to the log

use claimsync_engine::{FeedbackSink, HapticKind, Toast, ToastKind};
use tracing::{info, warn};

#[derive(Debug, Default, Clone, Copy)]
pub struct LogFeedbackSink;

impl FeedbackSink for LogFeedbackSink {
    fn haptic(&self, kind: HapticKind) {
        tracing::debug!("haptic: {:?}", kind);
    }

    fn toast(&self, toast: &Toast) {
        let claim = toast.claim_id.as_ref().map(|id| id.as_str()).unwrap_or("-");
        match toast.kind {
            ToastKind::Success => info!("[{}] {}: {}", claim, toast.title, toast.message),
            ToastKind::Error => warn!("[{}] {}: {}", claim, toast.title, toast.message),
        }
    }

    fn banner(&self, visible: bool) {
        if visible {
            warn!("Connection degraded, live updates paused");
        } else {
            info!("Connection restored");
        }
    }
}
