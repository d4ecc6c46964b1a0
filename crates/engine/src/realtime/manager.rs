//! Reference-counted realtime subscriptions
//!
//! One channel task per topic, shared by every subscriber to that topic.
//! The task owns the transport channel, reports connection state, filters
//! duplicate updates and consults the [`ReconnectionStrategy`] whenever
//! the channel breaks. The channel is closed when its last subscriber
//! goes away.

use super::gate::UpdateGate;
use super::reconnection::{ReconnectionStrategy, RetryDecision};
use crate::util::lock;
use claimsync_core::{
    ChannelStatus, ClaimId, ClaimRow, ClaimUpdate, ConnectionState, Error, FlashOffer, OfferId,
    ReconnectionState, Result, UserId,
};
use claimsync_networking::{ChannelEvent, ChannelTopic, RealtimeTransport, RowChange};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{watch, Notify};
use tokio_util::sync::{CancellationToken, DropGuard};
use tracing::{debug, info, warn};

pub type UpdateCallback<T> = Arc<dyn Fn(T) + Send + Sync>;
pub type ErrorCallback = Arc<dyn Fn(Error) + Send + Sync>;

enum Handler {
    Claim(UpdateCallback<ClaimRow>),
    Offer(UpdateCallback<FlashOffer>),
}

struct Listener {
    handler: Handler,
    on_error: ErrorCallback,
    active: Arc<AtomicBool>,
}

struct ChannelEntry {
    /// Distinguishes this entry from an earlier one on the same topic
    epoch: u64,
    listeners: HashMap<u64, Listener>,
    cancel: CancellationToken,
    state_tx: watch::Sender<ConnectionState>,
    reconnection: ReconnectionState,
    gate: UpdateGate,
    wake: Arc<Notify>,
}

impl ChannelEntry {
    fn error_callbacks(&self) -> Vec<(Arc<AtomicBool>, ErrorCallback)> {
        self.listeners
            .values()
            .map(|l| (l.active.clone(), l.on_error.clone()))
            .collect()
    }
}

struct Shared {
    transport: Arc<dyn RealtimeTransport>,
    strategy: ReconnectionStrategy,
    channels: Mutex<HashMap<ChannelTopic, ChannelEntry>>,
    aggregate_tx: watch::Sender<ConnectionState>,
    next_id: AtomicU64,
}

/// Owns every live realtime channel
///
/// Cheap to clone; clones share the same channels. Subscribing requires a
/// running tokio runtime.
#[derive(Clone)]
pub struct SubscriptionManager {
    shared: Arc<Shared>,
}

impl SubscriptionManager {
    pub fn new(transport: Arc<dyn RealtimeTransport>, strategy: ReconnectionStrategy) -> Self {
        let (aggregate_tx, _) = watch::channel(ConnectionState::Disconnected);
        Self {
            shared: Arc::new(Shared {
                transport,
                strategy,
                channels: Mutex::new(HashMap::new()),
                aggregate_tx,
                next_id: AtomicU64::new(1),
            }),
        }
    }

    /// Follow updates for one claim
    pub fn subscribe_to_claim_updates<F, E>(
        &self,
        claim_id: &str,
        on_update: F,
        on_error: E,
    ) -> Result<Subscription>
    where
        F: Fn(ClaimUpdate) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
    {
        self.subscribe_to_claim_rows(claim_id, move |row: ClaimRow| on_update(row.to_update()), on_error)
    }

    /// Like [`subscribe_to_claim_updates`](Self::subscribe_to_claim_updates)
    /// but hands over the full row, so an uncached claim can be materialized
    pub fn subscribe_to_claim_rows<F, E>(
        &self,
        claim_id: &str,
        on_row: F,
        on_error: E,
    ) -> Result<Subscription>
    where
        F: Fn(ClaimRow) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
    {
        let claim_id = ClaimId::new(claim_id)?;
        Ok(self.subscribe(
            ChannelTopic::Claim(claim_id),
            Handler::Claim(Arc::new(on_row)),
            Arc::new(on_error),
        ))
    }

    /// Follow updates for every claim of a user
    pub fn subscribe_to_user_claims<F, E>(
        &self,
        user_id: &str,
        on_update: F,
        on_error: E,
    ) -> Result<Subscription>
    where
        F: Fn(ClaimUpdate) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
    {
        self.subscribe_to_user_claim_rows(user_id, move |row: ClaimRow| on_update(row.to_update()), on_error)
    }

    /// Full-row variant of [`subscribe_to_user_claims`](Self::subscribe_to_user_claims)
    pub fn subscribe_to_user_claim_rows<F, E>(
        &self,
        user_id: &str,
        on_row: F,
        on_error: E,
    ) -> Result<Subscription>
    where
        F: Fn(ClaimRow) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
    {
        let user_id = UserId::new(user_id)?;
        Ok(self.subscribe(
            ChannelTopic::UserClaims(user_id),
            Handler::Claim(Arc::new(on_row)),
            Arc::new(on_error),
        ))
    }

    /// Follow claimed-count and status changes of a flash offer
    pub fn subscribe_to_offer_updates<F, E>(
        &self,
        offer_id: &str,
        on_update: F,
        on_error: E,
    ) -> Result<Subscription>
    where
        F: Fn(FlashOffer) + Send + Sync + 'static,
        E: Fn(Error) + Send + Sync + 'static,
    {
        let offer_id = OfferId::new(offer_id)?;
        Ok(self.subscribe(
            ChannelTopic::Offer(offer_id),
            Handler::Offer(Arc::new(on_update)),
            Arc::new(on_error),
        ))
    }

    fn subscribe(&self, topic: ChannelTopic, handler: Handler, on_error: ErrorCallback) -> Subscription {
        let id = self.shared.next_id.fetch_add(1, Ordering::Relaxed);
        let active = Arc::new(AtomicBool::new(true));

        let mut channels = lock(&self.shared.channels);
        let opened = !channels.contains_key(&topic);
        let entry = channels.entry(topic.clone()).or_insert_with(|| {
            let cancel = CancellationToken::new();
            let wake = Arc::new(Notify::new());
            let (state_tx, _) = watch::channel(ConnectionState::Connecting);

            info!("Opening channel {}", topic);
            tokio::spawn(run_channel(
                self.shared.clone(),
                topic.clone(),
                id,
                cancel.clone(),
                wake.clone(),
            ));

            ChannelEntry {
                epoch: id,
                listeners: HashMap::new(),
                cancel,
                state_tx,
                reconnection: ReconnectionState::new(),
                gate: UpdateGate::new(),
                wake,
            }
        });

        entry.listeners.insert(
            id,
            Listener {
                handler,
                on_error,
                active: active.clone(),
            },
        );
        let state_rx = entry.state_tx.subscribe();
        debug!("{} now has {} subscriber(s)", topic, entry.listeners.len());

        if opened {
            self.shared.refresh_aggregate(&channels);
        }
        drop(channels);

        Subscription {
            shared: self.shared.clone(),
            topic,
            id,
            active,
            state_rx,
        }
    }

    /// Aggregate state over all channels (disconnected when there are none)
    pub fn connection_state(&self) -> ConnectionState {
        *self.shared.aggregate_tx.borrow()
    }

    /// Receiver of aggregate state transitions
    pub fn watch_connection_state(&self) -> watch::Receiver<ConnectionState> {
        self.shared.aggregate_tx.subscribe()
    }

    /// Call `callback` on every aggregate state transition until the
    /// returned listener is dropped
    pub fn on_connection_state_change<F>(&self, callback: F) -> StateListener
    where
        F: Fn(ConnectionState) + Send + Sync + 'static,
    {
        let mut rx = self.shared.aggregate_tx.subscribe();
        let cancel = CancellationToken::new();
        let token = cancel.clone();

        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    changed = rx.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let state = *rx.borrow_and_update();
                        callback(state);
                    }
                }
            }
        });

        StateListener {
            _guard: cancel.drop_guard(),
        }
    }

    /// State of one channel, if it is open
    pub fn channel_state(&self, topic: &ChannelTopic) -> Option<ConnectionState> {
        lock(&self.shared.channels)
            .get(topic)
            .map(|entry| *entry.state_tx.borrow())
    }

    pub fn channel_count(&self) -> usize {
        lock(&self.shared.channels).len()
    }

    pub fn subscriber_count(&self, topic: &ChannelTopic) -> usize {
        lock(&self.shared.channels)
            .get(topic)
            .map(|entry| entry.listeners.len())
            .unwrap_or(0)
    }

    /// Clear retry bookkeeping of every failing channel and retry now
    ///
    /// Called on app foreground; this is the only way out of the parked
    /// `failed` state once the retry ceiling was hit.
    pub fn reset_failed_channels(&self) -> usize {
        let mut channels = lock(&self.shared.channels);
        let mut reset = 0;
        for (topic, entry) in channels.iter_mut() {
            if entry.reconnection.attempt_count > 0 {
                info!("Resetting reconnection state of {}", topic);
                entry.reconnection.reset();
                entry.wake.notify_one();
                reset += 1;
            }
        }
        reset
    }

    /// Same as [`reset_failed_channels`](Self::reset_failed_channels) for one topic
    pub fn reset_channel(&self, topic: &ChannelTopic) -> bool {
        let mut channels = lock(&self.shared.channels);
        match channels.get_mut(topic) {
            Some(entry) if entry.reconnection.attempt_count > 0 => {
                entry.reconnection.reset();
                entry.wake.notify_one();
                true
            }
            _ => false,
        }
    }
}

impl Shared {
    fn refresh_aggregate(&self, channels: &HashMap<ChannelTopic, ChannelEntry>) {
        let aggregate = ConnectionState::aggregate(channels.values().map(|e| *e.state_tx.borrow()));
        self.aggregate_tx.send_if_modified(|current| {
            if *current != aggregate {
                debug!("Aggregate connection state: {:?} -> {:?}", current, aggregate);
                *current = aggregate;
                true
            } else {
                false
            }
        });
    }

    fn set_state(&self, topic: &ChannelTopic, epoch: u64, state: ConnectionState) {
        let channels = lock(&self.channels);
        if let Some(entry) = channels.get(topic).filter(|e| e.epoch == epoch) {
            entry.state_tx.send_replace(state);
            self.refresh_aggregate(&channels);
        }
    }

    fn mark_connected(&self, topic: &ChannelTopic, epoch: u64) {
        let mut channels = lock(&self.channels);
        if let Some(entry) = channels.get_mut(topic).filter(|e| e.epoch == epoch) {
            if entry.reconnection.attempt_count > 0 {
                info!(
                    "{} recovered after {} failed attempt(s)",
                    topic, entry.reconnection.attempt_count
                );
            }
            entry.reconnection.reset();
            entry.state_tx.send_replace(ConnectionState::Connected);
            self.refresh_aggregate(&channels);
        }
    }

    /// Record a failure, pick the retry, and tell the listeners
    ///
    /// Failures that are not transient park the channel right away.
    /// Returns `None` when the channel has already been torn down.
    fn record_failure(
        &self,
        topic: &ChannelTopic,
        epoch: u64,
        failure: &Error,
        state: ConnectionState,
    ) -> Option<RetryDecision> {
        let mut channels = lock(&self.channels);
        let entry = channels.get_mut(topic).filter(|e| e.epoch == epoch)?;

        entry.reconnection.record_failure(failure);
        let decision = if failure.is_retryable() {
            self.strategy.next_attempt(&entry.reconnection)
        } else {
            RetryDecision {
                delay: Duration::ZERO,
                should_retry: false,
            }
        };
        if decision.should_retry {
            entry.reconnection.schedule(decision.delay);
        }

        warn!(
            "{} failed (attempt {}): {}",
            topic, entry.reconnection.attempt_count, failure
        );

        entry.state_tx.send_replace(if decision.should_retry {
            state
        } else {
            ConnectionState::Failed
        });
        let callbacks = entry.error_callbacks();
        self.refresh_aggregate(&channels);
        drop(channels);

        for (active, on_error) in callbacks {
            if active.load(Ordering::SeqCst) {
                on_error(failure.clone());
            }
        }
        Some(decision)
    }

    fn notify_error(&self, topic: &ChannelTopic, epoch: u64, error: Error) {
        let callbacks = {
            let channels = lock(&self.channels);
            match channels.get(topic).filter(|e| e.epoch == epoch) {
                Some(entry) => entry.error_callbacks(),
                None => return,
            }
        };
        for (active, on_error) in callbacks {
            if active.load(Ordering::SeqCst) {
                on_error(error.clone());
            }
        }
    }

    fn dispatch(&self, topic: &ChannelTopic, epoch: u64, change: RowChange) {
        match change {
            RowChange::Claim(row) => {
                let handlers: Vec<_> = {
                    let mut channels = lock(&self.channels);
                    let Some(entry) = channels.get_mut(topic).filter(|e| e.epoch == epoch) else {
                        return;
                    };
                    if !entry.gate.admit(&row) {
                        debug!("Dropping duplicate update for claim {}", row.id);
                        return;
                    }
                    entry
                        .listeners
                        .values()
                        .filter_map(|l| match &l.handler {
                            Handler::Claim(f) => Some((l.active.clone(), f.clone())),
                            Handler::Offer(_) => None,
                        })
                        .collect()
                };
                for (active, on_row) in handlers {
                    if active.load(Ordering::SeqCst) {
                        on_row(row.clone());
                    }
                }
            }
            RowChange::Offer(offer) => {
                let handlers: Vec<_> = {
                    let mut channels = lock(&self.channels);
                    let Some(entry) = channels.get_mut(topic).filter(|e| e.epoch == epoch) else {
                        return;
                    };
                    if !entry.gate.admit(&offer) {
                        debug!("Dropping duplicate update for offer {}", offer.id);
                        return;
                    }
                    entry
                        .listeners
                        .values()
                        .filter_map(|l| match &l.handler {
                            Handler::Offer(f) => Some((l.active.clone(), f.clone())),
                            Handler::Claim(_) => None,
                        })
                        .collect()
                };
                for (active, on_update) in handlers {
                    if active.load(Ordering::SeqCst) {
                        on_update(offer.clone());
                    }
                }
            }
        }
    }

    fn remove_listener(&self, topic: &ChannelTopic, id: u64) {
        let mut channels = lock(&self.channels);
        let now_empty = match channels.get_mut(topic) {
            Some(entry) => {
                entry.listeners.remove(&id);
                entry.listeners.is_empty()
            }
            None => false,
        };
        if now_empty {
            if let Some(entry) = channels.remove(topic) {
                info!("Closing channel {}", topic);
                entry.cancel.cancel();
            }
            self.refresh_aggregate(&channels);
        }
    }
}

/// Channel task: connect, pump events, back off, repeat until cancelled
async fn run_channel(
    shared: Arc<Shared>,
    topic: ChannelTopic,
    epoch: u64,
    cancel: CancellationToken,
    wake: Arc<Notify>,
) {
    loop {
        if cancel.is_cancelled() {
            break;
        }
        shared.set_state(&topic, epoch, ConnectionState::Connecting);

        let opened = tokio::select! {
            _ = cancel.cancelled() => break,
            opened = shared.transport.open(&topic) => opened,
        };

        let (failure, state) = match opened {
            Err(e) => (e, ConnectionState::Failed),
            Ok(mut channel) => loop {
                let event = tokio::select! {
                    _ = cancel.cancelled() => {
                        channel.close();
                        debug!("Channel task for {} cancelled", topic);
                        return;
                    }
                    event = channel.next_event() => event,
                };

                match event {
                    Some(ChannelEvent::Status(ChannelStatus::Subscribed)) => {
                        shared.mark_connected(&topic, epoch);
                    }
                    Some(ChannelEvent::Change(change)) => shared.dispatch(&topic, epoch, change),
                    Some(ChannelEvent::Status(status @ ChannelStatus::ChannelError))
                    | Some(ChannelEvent::Status(status @ ChannelStatus::TimedOut)) => {
                        break (
                            Error::NetworkError(format!("{} reported {}", topic, status)),
                            ConnectionState::Failed,
                        );
                    }
                    Some(ChannelEvent::Status(ChannelStatus::Closed)) | None => {
                        break (
                            Error::NetworkError(format!("{} closed unexpectedly", topic)),
                            ConnectionState::Disconnected,
                        );
                    }
                }
            },
        };

        let Some(decision) = shared.record_failure(&topic, epoch, &failure, state) else {
            break;
        };

        if decision.should_retry {
            debug!("Retrying {} in {:?}", topic, decision.delay);
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = tokio::time::sleep(decision.delay) => {}
                _ = wake.notified() => {}
            }
        } else {
            warn!("{} exhausted its reconnection attempts", topic);
            shared.notify_error(
                &topic,
                epoch,
                Error::RealtimeUnavailable(format!("{} gave up reconnecting", topic)),
            );
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = wake.notified() => info!("Retrying parked channel {}", topic),
            }
        }
    }
    debug!("Channel task for {} exited", topic);
}

/// A live registration of interest in one topic
///
/// Dropping it (or calling [`unsubscribe`](Self::unsubscribe)) stops all
/// callbacks; the underlying channel closes when its last subscription goes.
pub struct Subscription {
    shared: Arc<Shared>,
    topic: ChannelTopic,
    id: u64,
    active: Arc<AtomicBool>,
    state_rx: watch::Receiver<ConnectionState>,
}

impl Subscription {
    pub fn topic(&self) -> &ChannelTopic {
        &self.topic
    }

    /// Current state of this subscription's channel
    pub fn state(&self) -> ConnectionState {
        *self.state_rx.borrow()
    }

    /// Receiver of this channel's state transitions
    pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
        self.state_rx.clone()
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    pub fn unsubscribe(self) {
        drop(self);
    }
}

impl Drop for Subscription {
    fn drop(&mut self) {
        if self.active.swap(false, Ordering::SeqCst) {
            self.shared.remove_listener(&self.topic, self.id);
        }
    }
}

/// Keeps a connection-state callback registered; drop to unregister
pub struct StateListener {
    _guard: DropGuard,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::realtime::reconnection::FixedJitter;
    use crate::testing::{claim_row, settle, FakeTransport};
    use claimsync_core::{ClaimStatus, ReconnectionPolicy};
    use std::sync::Mutex as StdMutex;
    use std::time::Duration;

    fn manager(transport: Arc<FakeTransport>) -> SubscriptionManager {
        let strategy = ReconnectionStrategy::with_jitter(
            ReconnectionPolicy {
                base_delay_ms: 100,
                max_delay_ms: 1_000,
                max_attempts: 2,
                jitter_ratio: 0.0,
            },
            Arc::new(FixedJitter(0.0)),
        );
        SubscriptionManager::new(transport, strategy)
    }

    fn recorder() -> (Arc<StdMutex<Vec<ClaimUpdate>>>, impl Fn(ClaimUpdate) + Send + Sync + 'static) {
        let seen = Arc::new(StdMutex::new(Vec::new()));
        let sink = seen.clone();
        (seen, move |u| sink.lock().unwrap().push(u))
    }

    fn topic(id: &str) -> ChannelTopic {
        ChannelTopic::Claim(ClaimId::new(id).unwrap())
    }

    #[tokio::test(start_paused = true)]
    async fn test_empty_id_is_invalid_argument() {
        let mgr = manager(Arc::new(FakeTransport::new()));
        let result = mgr.subscribe_to_claim_updates("", |_| {}, |_| {});
        assert!(matches!(result, Err(Error::InvalidArgument(_))));
        assert_eq!(mgr.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_duplicate_push_delivered_once() {
        let transport = Arc::new(FakeTransport::new());
        let mgr = manager(transport.clone());
        let (seen, on_update) = recorder();

        let _sub = mgr.subscribe_to_claim_updates("c1", on_update, |_| {}).unwrap();
        settle().await;
        assert_eq!(mgr.connection_state(), ConnectionState::Connected);

        let row = claim_row("c1", ClaimStatus::Redeemed, 10);
        transport.push(&topic("c1"), ChannelEvent::Change(RowChange::Claim(row.clone())));
        transport.push(&topic("c1"), ChannelEvent::Change(RowChange::Claim(row)));
        // Older state arriving late
        transport.push(
            &topic("c1"),
            ChannelEvent::Change(RowChange::Claim(claim_row("c1", ClaimStatus::Pending, 5))),
        );
        settle().await;

        let seen = seen.lock().unwrap();
        assert_eq!(seen.len(), 1);
        assert_eq!(seen[0].status, ClaimStatus::Redeemed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_shared_channel_is_reference_counted() {
        let transport = Arc::new(FakeTransport::new());
        let mgr = manager(transport.clone());
        let (seen_a, on_a) = recorder();
        let (seen_b, on_b) = recorder();

        let sub_a = mgr.subscribe_to_claim_updates("c1", on_a, |_| {}).unwrap();
        let sub_b = mgr.subscribe_to_claim_updates("c1", on_b, |_| {}).unwrap();
        settle().await;
        assert_eq!(transport.opens(&topic("c1")), 1);
        assert_eq!(mgr.subscriber_count(&topic("c1")), 2);

        sub_a.unsubscribe();
        settle().await;
        assert_eq!(transport.closes(&topic("c1")), 0);

        transport.push(
            &topic("c1"),
            ChannelEvent::Change(RowChange::Claim(claim_row("c1", ClaimStatus::Redeemed, 10))),
        );
        settle().await;
        assert_eq!(seen_a.lock().unwrap().len(), 0);
        assert_eq!(seen_b.lock().unwrap().len(), 1);

        drop(sub_b);
        settle().await;
        assert_eq!(transport.closes(&topic("c1")), 1);
        assert_eq!(transport.opens(&topic("c1")), 1);
        assert_eq!(mgr.channel_count(), 0);
        assert_eq!(mgr.connection_state(), ConnectionState::Disconnected);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_error_retries_then_parks() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_auto_status(Some(ChannelStatus::ChannelError));
        let mgr = manager(transport.clone());

        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = errors.clone();
        let _sub = mgr
            .subscribe_to_claim_updates("c1", |_| {}, move |e| sink.lock().unwrap().push(e))
            .unwrap();

        // 100ms + 200ms backoff, then the third failure exceeds max_attempts = 2
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.opens(&topic("c1")), 3);
        assert_eq!(mgr.channel_state(&topic("c1")), Some(ConnectionState::Failed));
        assert_eq!(mgr.connection_state(), ConnectionState::Failed);

        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 4);
        assert!(matches!(errors.last(), Some(Error::RealtimeUnavailable(_))));
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_failure_retries_then_recovers() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_fail_open(Some(Error::NetworkError("connection refused".into())));
        let mgr = manager(transport.clone());

        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = errors.clone();
        let _sub = mgr
            .subscribe_to_claim_updates("c1", |_| {}, move |e| sink.lock().unwrap().push(e))
            .unwrap();
        settle().await;
        assert_eq!(transport.open_attempts(), 1);
        assert_eq!(mgr.channel_state(&topic("c1")), Some(ConnectionState::Failed));

        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(transport.open_attempts(), 3);
        assert_eq!(transport.opens(&topic("c1")), 0);
        {
            let errors = errors.lock().unwrap();
            assert_eq!(errors.len(), 4);
            assert_eq!(errors[0], Error::NetworkError("connection refused".into()));
            assert!(matches!(errors[3], Error::RealtimeUnavailable(_)));
        }

        transport.set_fail_open(None);
        assert!(mgr.reset_channel(&topic("c1")));
        settle().await;
        assert_eq!(mgr.connection_state(), ConnectionState::Connected);
        assert_eq!(transport.opens(&topic("c1")), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_non_retryable_failure_parks_immediately() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_fail_open(Some(Error::AuthenticationRequired));
        let mgr = manager(transport.clone());

        let errors = Arc::new(StdMutex::new(Vec::new()));
        let sink = errors.clone();
        let _sub = mgr
            .subscribe_to_claim_updates("c1", |_| {}, move |e| sink.lock().unwrap().push(e))
            .unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(transport.open_attempts(), 1);
        assert_eq!(mgr.connection_state(), ConnectionState::Failed);
        let errors = errors.lock().unwrap();
        assert_eq!(errors.len(), 2);
        assert_eq!(errors[0], Error::AuthenticationRequired);
        assert!(matches!(errors[1], Error::RealtimeUnavailable(_)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_reset_revives_parked_channel() {
        let transport = Arc::new(FakeTransport::new());
        transport.set_auto_status(Some(ChannelStatus::TimedOut));
        let mgr = manager(transport.clone());
        let _sub = mgr.subscribe_to_claim_updates("c1", |_| {}, |_| {}).unwrap();
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert_eq!(mgr.connection_state(), ConnectionState::Failed);

        transport.set_auto_status(Some(ChannelStatus::Subscribed));
        assert_eq!(mgr.reset_failed_channels(), 1);
        settle().await;
        assert_eq!(mgr.connection_state(), ConnectionState::Connected);
        assert_eq!(transport.opens(&topic("c1")), 4);
    }

    #[tokio::test(start_paused = true)]
    async fn test_status_after_unsubscribe_is_ignored() {
        let transport = Arc::new(FakeTransport::new());
        let mgr = manager(transport.clone());
        let errors = Arc::new(StdMutex::new(0usize));
        let sink = errors.clone();
        let sub = mgr
            .subscribe_to_claim_updates("c1", |_| {}, move |_| *sink.lock().unwrap() += 1)
            .unwrap();
        settle().await;
        drop(sub);

        transport.push(&topic("c1"), ChannelEvent::Status(ChannelStatus::ChannelError));
        settle().await;
        assert_eq!(*errors.lock().unwrap(), 0);
        assert_eq!(mgr.channel_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_state_change_callback() {
        let transport = Arc::new(FakeTransport::new());
        let mgr = manager(transport.clone());
        let states = Arc::new(StdMutex::new(Vec::new()));
        let sink = states.clone();
        let listener = mgr.on_connection_state_change(move |s| sink.lock().unwrap().push(s));

        let sub = mgr.subscribe_to_user_claims("u1", |_| {}, |_| {}).unwrap();
        settle().await;
        drop(sub);
        settle().await;

        assert_eq!(
            states.lock().unwrap().last().copied(),
            Some(ConnectionState::Disconnected)
        );
        assert!(states.lock().unwrap().contains(&ConnectionState::Connected));

        drop(listener);
        settle().await;
        let _again = mgr.subscribe_to_user_claims("u1", |_| {}, |_| {}).unwrap();
        let before = states.lock().unwrap().len();
        settle().await;
        assert_eq!(states.lock().unwrap().len(), before);
    }
}
