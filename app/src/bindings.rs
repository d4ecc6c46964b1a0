//! Screen-level bindings over [`SyncContext`]
//!
//! Each `use_*` call returns either a shared service (same instance every
//! call) or a guard whose lifetime is the screen's: dropping it unsubscribes.

use crate::context::SyncContext;
use claimsync_core::{
    CachedClaim, ClaimId, ClaimUpdate, ConnectionState, Error, FlashOffer, OfferId, Result,
    SyncMode,
};
use claimsync_engine::{
    ClaimSyncService, FeedbackManager, HybridSubscription, Subscription, SubscriptionManager,
};
use claimsync_persistence::{ApplyOutcome, StateCache};
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, warn};

type UpdateHandler = Arc<dyn Fn(ClaimUpdate) + Send + Sync>;
type ErrorHandler = Arc<dyn Fn(Error) + Send + Sync>;

/// Options for [`SyncContext::use_hybrid_claim_sync`]
#[derive(Clone)]
pub struct HybridClaimOptions {
    pub enabled: bool,
    pub on_update: Option<UpdateHandler>,
    pub on_error: Option<ErrorHandler>,
}

impl Default for HybridClaimOptions {
    fn default() -> Self {
        Self {
            enabled: true,
            on_update: None,
            on_error: None,
        }
    }
}

impl HybridClaimOptions {
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.enabled = enabled;
        self
    }

    pub fn on_update<F>(mut self, f: F) -> Self
    where
        F: Fn(ClaimUpdate) + Send + Sync + 'static,
    {
        self.on_update = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(Error) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }
}

impl SyncContext {
    pub fn use_subscription_manager(&self) -> &SubscriptionManager {
        &self.subscriptions
    }

    pub fn use_claim_sync(&self) -> &ClaimSyncService {
        &self.claim_sync
    }

    pub fn use_feedback_manager(&self) -> &FeedbackManager {
        &self.feedback
    }

    pub fn use_state_cache(&self) -> &Arc<StateCache> {
        &self.cache
    }

    /// Follow one claim; updates land in the cache and drive feedback
    /// before `on_update` sees them
    pub fn use_hybrid_claim_sync(&self, claim_id: &str, options: HybridClaimOptions) -> Result<ClaimWatch> {
        let claim_id = ClaimId::new(claim_id)?;
        let mut watch = ClaimWatch {
            context: self.clone(),
            claim_id,
            on_update: options.on_update,
            on_error: options.on_error,
            subscription: None,
        };
        watch.set_enabled(options.enabled)?;
        Ok(watch)
    }

    /// Live snapshot of a flash offer: one fetch, then realtime changes
    pub fn use_realtime_offer(&self, offer_id: &str) -> Result<OfferWatch> {
        let offer_id = OfferId::new(offer_id)?;
        let (tx, rx) = watch::channel(None);
        let tx = Arc::new(tx);

        let on_update = {
            let tx = tx.clone();
            move |offer: FlashOffer| publish_offer(&tx, offer)
        };
        let subscription = self.subscriptions.subscribe_to_offer_updates(
            offer_id.as_str(),
            on_update,
            |error| warn!("Offer channel error: {}", error),
        )?;

        let cancel = CancellationToken::new();
        let token = cancel.clone();
        let api = self.api.clone();
        tokio::spawn(async move {
            let fetched = tokio::select! {
                _ = token.cancelled() => return,
                fetched = api.fetch_offer(&offer_id) => fetched,
            };
            match fetched {
                Ok(Some(offer)) => publish_offer(&tx, offer),
                Ok(None) => warn!("Offer {} not found", offer_id),
                Err(e) => warn!("Initial fetch of offer {} failed: {}", offer_id, e),
            }
        });

        Ok(OfferWatch {
            offer: rx,
            subscription,
            _fetch: cancel.drop_guard(),
        })
    }

    /// Follow every claim of a user
    ///
    /// A claim the cache has never seen is cached from its row and triggers
    /// a reconciliation, so other new claims show up without a manual refresh.
    pub fn use_user_claims(&self, user_id: &str) -> Result<UserClaimsWatch> {
        let pipeline = self.pipeline.clone();
        let claim_sync = self.claim_sync.clone();
        let subscription = self.subscriptions.subscribe_to_user_claim_rows(
            user_id,
            move |row| {
                if pipeline.process_row(&row) == ApplyOutcome::Inserted {
                    debug!("New claim {}; reconciling", row.id);
                    let claim_sync = claim_sync.clone();
                    tokio::spawn(async move {
                        claim_sync.manual_sync().await;
                    });
                }
            },
            |error| warn!("User claims channel error: {}", error),
        )?;
        Ok(UserClaimsWatch { subscription })
    }
}

/// Replace the published offer if `offer` is at least as new
fn publish_offer(tx: &watch::Sender<Option<FlashOffer>>, offer: FlashOffer) {
    tx.send_if_modified(|current| match current {
        Some(existing) if existing.updated_at > offer.updated_at || *existing == offer => false,
        _ => {
            *current = Some(offer);
            true
        }
    });
}

/// One screen's interest in one claim
pub struct ClaimWatch {
    context: SyncContext,
    claim_id: ClaimId,
    on_update: Option<UpdateHandler>,
    on_error: Option<ErrorHandler>,
    subscription: Option<HybridSubscription>,
}

impl ClaimWatch {
    pub fn claim_id(&self) -> &ClaimId {
        &self.claim_id
    }

    pub fn is_enabled(&self) -> bool {
        self.subscription.is_some()
    }

    /// Start or stop following the claim; disabling stops all callbacks
    pub fn set_enabled(&mut self, enabled: bool) -> Result<()> {
        if !enabled {
            if self.subscription.take().is_some() {
                debug!("Watch on claim {} disabled", self.claim_id);
            }
            return Ok(());
        }
        if self.subscription.is_some() {
            return Ok(());
        }

        let pipeline = self.context.pipeline.clone();
        let on_update = self.on_update.clone();
        let on_error = self.on_error.clone();
        let subscription = self.context.hybrid.subscribe_to_claim_rows(
            self.claim_id.as_str(),
            move |row| {
                if pipeline.process_row(&row).is_change() {
                    if let Some(on_update) = &on_update {
                        on_update(row.to_update());
                    }
                }
            },
            move |error| match &on_error {
                Some(on_error) => on_error(error),
                None => debug!("Unhandled claim sync error: {}", error),
            },
        )?;
        self.subscription = Some(subscription);
        Ok(())
    }

    /// Cached state of the claim
    pub fn claim(&self) -> Option<CachedClaim> {
        self.context.cache.get_claim(&self.claim_id)
    }

    pub fn sync_mode(&self) -> Option<SyncMode> {
        self.context.hybrid.sync_mode(self.claim_id.as_str())
    }
}

/// Latest known state of a flash offer
pub struct OfferWatch {
    offer: watch::Receiver<Option<FlashOffer>>,
    subscription: Subscription,
    _fetch: DropGuard,
}

impl OfferWatch {
    pub fn current(&self) -> Option<FlashOffer> {
        self.offer.borrow().clone()
    }

    /// Receiver that wakes on every newer snapshot
    pub fn changes(&self) -> watch::Receiver<Option<FlashOffer>> {
        self.offer.clone()
    }

    pub fn connection_state(&self) -> ConnectionState {
        self.subscription.state()
    }
}

/// Realtime feed of a user's claims into the cache
pub struct UserClaimsWatch {
    subscription: Subscription,
}

impl UserClaimsWatch {
    pub fn connection_state(&self) -> ConnectionState {
        self.subscription.state()
    }
}
