//! Realtime-first claim tracking with a polling fallback
//!
//! Every tracked claim gets a supervisor task that picks the transport:
//!
//! - realtime-capable claims start on a realtime channel and drop to
//!   `fallback` (polling) once the channel gives up reconnecting;
//! - polling-only (legacy) claims are polled and never open a channel.
//!
//! `reevaluate` is the way back: fallback claims retry realtime, polling
//! claims re-check their capability. Listeners see one gated stream of
//! updates whatever the transport.

use crate::realtime::{ErrorCallback, Subscription, SubscriptionManager, UpdateCallback, UpdateGate};
use crate::util::lock;
use claimsync_core::{
    CachedClaim, ClaimId, ClaimPatch, ClaimRow, ClaimUpdate, ConnectionState, Error, Result,
    SyncCapability, SyncMode,
};
use claimsync_networking::BackendApi;
use claimsync_persistence::StateCache;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, watch};
use tokio::time::{Interval, MissedTickBehavior};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

const MODE_BUFFER: usize = 64;

/// A claim switched transport
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ModeChange {
    pub claim_id: ClaimId,
    /// `None` for the first mode a claim settles on
    pub from: Option<SyncMode>,
    pub to: SyncMode,
}

enum Control {
    Reevaluate,
}

struct ClaimListener {
    on_row: UpdateCallback<ClaimRow>,
    on_error: ErrorCallback,
    active: Arc<AtomicBool>,
}

struct ClaimEntry {
    epoch: u64,
    listeners: HashMap<u64, ClaimListener>,
    mode: Option<SyncMode>,
    gate: UpdateGate,
    cancel: CancellationToken,
    control: mpsc::UnboundedSender<Control>,
}

struct Shared {
    api: Arc<dyn BackendApi>,
    subscriptions: SubscriptionManager,
    cache: Arc<StateCache>,
    poll_interval: Duration,
    claims: Mutex<HashMap<ClaimId, ClaimEntry>>,
    modes_tx: broadcast::Sender<ModeChange>,
    next_id: AtomicU64,
}

#[derive(Clone)]
pub struct HybridClaimSync {
    shared: Arc<Shared>,
}

impl HybridClaimSync {
    pub fn new(
        api: Arc<dyn BackendApi>,
        subscriptions: SubscriptionManager,
        cache: Arc<StateCache>,
        poll_interval: Duration,
    ) -> Self {
        let (modes_tx, _) = broadcast::channel(MODE_BUFFER);
        Self {
            shared: Arc::new(Shared {
                api,
                subscriptions,
                cache,
                poll_interval,
                claims: Mutex::new(HashMap::new()),
                modes_tx,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Track a claim over whichever transport suits it
    pub fn subscribe_to_claim_updates<F, E>(
        &self,
        claim_id: &str,
        on_update: F,
        on_error: E,
    ) -> Result<HybridSubscription>
    where
        F: Fn(ClaimUpdate) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
    {
        self.subscribe_to_claim_rows(claim_id, move |row: ClaimRow| on_update(row.to_update()), on_error)
    }

    /// Full-row variant of [`subscribe_to_claim_updates`](Self::subscribe_to_claim_updates)
    pub fn subscribe_to_claim_rows<F, E>(
        &self,
        claim_id: &str,
        on_row: F,
        on_error: E,
    ) -> Result<HybridSubscription>
    where
        F: Fn(ClaimRow) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
    {
        let claim_id = ClaimId::new(claim_id)?;
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        let mut claims = lock(&self.shared.claims);
        let entry = claims.entry(claim_id.clone()).or_insert_with(|| {
            let cancel = CancellationToken::new();
            let (control, control_rx) = mpsc::unbounded_channel();
            debug!("Starting sync supervisor for claim {}", claim_id);
            tokio::spawn(supervise(
                self.shared.clone(),
                claim_id.clone(),
                id,
                cancel.clone(),
                control_rx,
            ));
            ClaimEntry {
                epoch: id,
                listeners: HashMap::new(),
                mode: None,
                gate: UpdateGate::new(),
                cancel,
                control,
            }
        });
        entry.listeners.insert(
            id,
            ClaimListener {
                on_row: Arc::new(on_row),
                on_error: Arc::new(on_error),
                active: active.clone(),
            },
        );
        drop(claims);

        Ok(HybridSubscription {
            shared: self.shared.clone(),
            claim_id,
            id,
            active,
        })
    }

    /// Current transport of a tracked claim
    ///
    /// `None` if the claim is not tracked (or its capability is still
    /// being looked up).
    pub fn sync_mode(&self, claim_id: &str) -> Option<SyncMode> {
        let claim_id = ClaimId::new(claim_id).ok()?;
        lock(&self.shared.claims).get(&claim_id).and_then(|e| e.mode)
    }

    /// Receiver of every mode flip
    pub fn mode_changes(&self) -> broadcast::Receiver<ModeChange> {
        self.shared.modes_tx.subscribe()
    }

    /// Call `callback` on every mode flip until the listener is dropped
    pub fn on_mode_change<F>(&self, callback: F) -> ModeListener
    where
        F: Fn(ModeChange) + Send + Sync + 'static,
    {
        let mut rx = self.shared.modes_tx.subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    received = rx.recv() => match received {
                        Ok(change) => callback(change),
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            warn!("Mode listener skipped {} changes", skipped);
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    },
                }
            }
        });

        ModeListener {
            _guard: cancel.drop_guard(),
        }
    }

    /// Ask every supervisor to reconsider its transport
    pub fn reevaluate(&self) -> usize {
        let claims = lock(&self.shared.claims);
        for entry in claims.values() {
            let _ = entry.control.send(Control::Reevaluate);
        }
        claims.len()
    }

    pub fn tracked_claims(&self) -> usize {
        lock(&self.shared.claims).len()
    }
}

impl Shared {
    fn set_mode(&self, claim_id: &ClaimId, epoch: u64, mode: SyncMode) {
        let mut claims = lock(&self.claims);
        let Some(entry) = claims.get_mut(claim_id).filter(|e| e.epoch == epoch) else {
            return;
        };
        if entry.mode == Some(mode) {
            return;
        }

        let from = entry.mode.replace(mode);
        drop(claims);

        match from {
            Some(from) => info!("Claim {} switched from {:?} to {:?}", claim_id, from, mode),
            None => debug!("Claim {} syncing via {:?}", claim_id, mode),
        }
        let _ = self.modes_tx.send(ModeChange {
            claim_id: claim_id.clone(),
            from,
            to: mode,
        });
    }

    fn mode(&self, claim_id: &ClaimId, epoch: u64) -> Option<SyncMode> {
        lock(&self.claims)
            .get(claim_id)
            .filter(|e| e.epoch == epoch)
            .and_then(|e| e.mode)
    }

    fn deliver(&self, claim_id: &ClaimId, epoch: u64, row: ClaimRow) {
        let handlers: Vec<_> = {
            let mut claims = lock(&self.claims);
            let Some(entry) = claims.get_mut(claim_id).filter(|e| e.epoch == epoch) else {
                return;
            };
            if !entry.gate.admit(&row) {
                return;
            }
            entry
                .listeners
                .values()
                .map(|l| (l.active.clone(), l.on_row.clone()))
                .collect()
        };
        for (active, on_row) in handlers {
            if active.load(Ordering::SeqCst) {
                on_row(row.clone());
            }
        }
    }

    fn notify_error(&self, claim_id: &ClaimId, epoch: u64, error: Error) {
        let handlers: Vec<_> = {
            let claims = lock(&self.claims);
            let Some(entry) = claims.get(claim_id).filter(|e| e.epoch == epoch) else {
                return;
            };
            entry
                .listeners
                .values()
                .map(|l| (l.active.clone(), l.on_error.clone()))
                .collect()
        };
        for (active, on_error) in handlers {
            if active.load(Ordering::SeqCst) {
                on_error(error.clone());
            }
        }
    }

    fn remove_listener(&self, claim_id: &ClaimId, id: u64) {
        let mut claims = lock(&self.claims);
        let now_empty = match claims.get_mut(claim_id) {
            Some(entry) => {
                entry.listeners.remove(&id);
                entry.listeners.is_empty()
            }
            None => false,
        };
        if now_empty {
            if let Some(entry) = claims.remove(claim_id) {
                debug!("Stopping sync supervisor for claim {}", claim_id);
                entry.cancel.cancel();
            }
        }
    }

    fn poll_timer(&self) -> Interval {
        let mut timer = tokio::time::interval(self.poll_interval);
        timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        timer
    }

    /// Capability from the cache, else from one fetch (merged into the cache)
    ///
    /// Returns `None` if cancelled while fetching.
    async fn capability(
        &self,
        claim_id: &ClaimId,
        epoch: u64,
        cancel: &CancellationToken,
    ) -> Option<SyncCapability> {
        if let Some(cached) = self.cache.get_claim(claim_id) {
            return Some(cached.capability);
        }

        let fetched = tokio::select! {
            _ = cancel.cancelled() => return None,
            fetched = self.api.fetch_claim(claim_id) => fetched,
        };
        match fetched {
            Ok(Some(row)) => {
                let capability = row.capability();
                self.cache.merge_claim(CachedClaim::from(row));
                Some(capability)
            }
            Ok(None) => {
                warn!("Claim {} not found; trying realtime", claim_id);
                self.notify_error(claim_id, epoch, Error::NotFound(format!("claim {}", claim_id)));
                Some(SyncCapability::RealtimeCapable)
            }
            Err(e) => {
                warn!("Capability lookup for claim {} failed: {}; trying realtime", claim_id, e);
                Some(SyncCapability::RealtimeCapable)
            }
        }
    }
}

fn open_realtime(
    shared: &Arc<Shared>,
    claim_id: &ClaimId,
    epoch: u64,
    errors: mpsc::UnboundedSender<Error>,
) -> Option<Subscription> {
    let weak: Weak<Shared> = Arc::downgrade(shared);
    let id = claim_id.clone();
    let subscribed = shared.subscriptions.subscribe_to_claim_rows(
        claim_id.as_str(),
        move |row| {
            if let Some(shared) = weak.upgrade() {
                shared.deliver(&id, epoch, row);
            }
        },
        move |error| {
            let _ = errors.send(error);
        },
    );
    match subscribed {
        Ok(subscription) => Some(subscription),
        Err(e) => {
            warn!("Could not subscribe to claim {}: {}", claim_id, e);
            None
        }
    }
}

async fn next_tick(timer: &mut Option<Interval>) {
    match timer {
        Some(timer) => {
            timer.tick().await;
        }
        None => std::future::pending().await,
    }
}

/// Resolves once the watched channel is connected; false if it went away
async fn wait_connected(states: &mut Option<watch::Receiver<ConnectionState>>) -> bool {
    let Some(states) = states else {
        return std::future::pending().await;
    };
    loop {
        if *states.borrow_and_update() == ConnectionState::Connected {
            return true;
        }
        if states.changed().await.is_err() {
            return false;
        }
    }
}

async fn supervise(
    shared: Arc<Shared>,
    claim_id: ClaimId,
    epoch: u64,
    cancel: CancellationToken,
    mut control: mpsc::UnboundedReceiver<Control>,
) {
    let Some(capability) = shared.capability(&claim_id, epoch, &cancel).await else {
        return;
    };

    let (errors_tx, mut errors) = mpsc::unbounded_channel();
    let mut realtime: Option<Subscription> = None;
    // Channel we are waiting on before leaving polling/fallback
    let mut promotion: Option<watch::Receiver<ConnectionState>> = None;
    let mut poller: Option<Interval> = None;

    match capability {
        SyncCapability::PollingOnly => {
            shared.set_mode(&claim_id, epoch, SyncMode::Polling);
            poller = Some(shared.poll_timer());
        }
        SyncCapability::RealtimeCapable => {
            realtime = open_realtime(&shared, &claim_id, epoch, errors_tx.clone());
            if realtime.is_some() {
                shared.set_mode(&claim_id, epoch, SyncMode::Realtime);
            } else {
                shared.set_mode(&claim_id, epoch, SyncMode::Fallback);
                poller = Some(shared.poll_timer());
            }
        }
    }

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,

            Some(error) = errors.recv() => {
                let gave_up = matches!(error, Error::RealtimeUnavailable(_));
                shared.notify_error(&claim_id, epoch, error);
                if gave_up && shared.mode(&claim_id, epoch) == Some(SyncMode::Realtime) {
                    shared.set_mode(&claim_id, epoch, SyncMode::Fallback);
                    poller = Some(shared.poll_timer());
                    promotion = realtime.as_ref().map(|s| s.state_changes());
                }
            }

            Some(Control::Reevaluate) = control.recv() => {
                match shared.mode(&claim_id, epoch) {
                    Some(SyncMode::Fallback) => {
                        debug!("Retrying realtime for claim {}", claim_id);
                        match &realtime {
                            Some(subscription) => {
                                shared.subscriptions.reset_channel(subscription.topic());
                            }
                            None => {
                                realtime = open_realtime(&shared, &claim_id, epoch, errors_tx.clone());
                                promotion = realtime.as_ref().map(|s| s.state_changes());
                            }
                        }
                    }
                    Some(SyncMode::Polling) => {
                        let fetched = tokio::select! {
                            _ = cancel.cancelled() => break,
                            fetched = shared.api.fetch_claim(&claim_id) => fetched,
                        };
                        if let Ok(Some(row)) = fetched {
                            let capability = row.capability();
                            let patch = ClaimPatch {
                                capability: Some(capability),
                                ..Default::default()
                            };
                            if !shared.cache.update_claim(&claim_id, patch) {
                                shared.cache.merge_claim(CachedClaim::from(row));
                            }
                            if capability == SyncCapability::RealtimeCapable && realtime.is_none() {
                                info!("Claim {} is now realtime-capable", claim_id);
                                realtime = open_realtime(&shared, &claim_id, epoch, errors_tx.clone());
                                promotion = realtime.as_ref().map(|s| s.state_changes());
                            }
                        }
                    }
                    Some(SyncMode::Realtime) | None => {}
                }
            }

            _ = next_tick(&mut poller) => {
                let fetched = tokio::select! {
                    _ = cancel.cancelled() => break,
                    fetched = shared.api.fetch_claim(&claim_id) => fetched,
                };
                match fetched {
                    Ok(Some(row)) => shared.deliver(&claim_id, epoch, row),
                    Ok(None) => shared.notify_error(
                        &claim_id,
                        epoch,
                        Error::NotFound(format!("claim {}", claim_id)),
                    ),
                    Err(e) => {
                        debug!("Poll for claim {} failed: {}", claim_id, e);
                        shared.notify_error(&claim_id, epoch, e);
                    }
                }
            }

            connected = wait_connected(&mut promotion) => {
                promotion = None;
                if connected {
                    shared.set_mode(&claim_id, epoch, SyncMode::Realtime);
                    poller = None;
                }
            }
        }
    }

    // Dropping `realtime` releases the channel
    drop(realtime);
    debug!("Sync supervisor for claim {} exited", claim_id);
}

/// Keeps a claim tracked; drop to stop its callbacks
pub struct HybridSubscription {
    shared: Arc<Shared>,
    claim_id: ClaimId,
    id: u64,
    active: Arc<AtomicBool>,
}

impl HybridSubscription {
    pub fn claim_id(&self) -> &ClaimId {
        &self.claim_id
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for HybridSubscription {
    fn drop(&mut self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.shared.remove_listener(&self.claim_id, self.id);
        }
    }
}

/// Keeps a mode-change callback registered; drop to unregister
pub struct ModeListener {
    _guard: DropGuard,
}
