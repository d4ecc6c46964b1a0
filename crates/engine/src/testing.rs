//! Scripted fakes for the backend, the realtime transport and the UI sink
//!
//! Compiled for this crate's tests and for downstream crates that enable
//! the `testing` feature.

use crate::feedback::{FeedbackSink, HapticKind, Toast, ToastKind};
use crate::util::lock;
use async_trait::async_trait;
use chrono::{DateTime, Duration as ChronoDuration, TimeZone, Utc};
use claimsync_core::{
    ChannelStatus, ClaimId, ClaimRow, ClaimStatus, Error, FlashOffer, OfferId, OfferStatus,
    Result, UserId,
};
use claimsync_networking::{BackendApi, ChannelEvent, ChannelTopic, RealtimeChannel, RealtimeTransport};
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Fixed reference instant so tests can talk in offsets
pub fn at(secs: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0)
        .single()
        .unwrap_or_else(Utc::now)
        + ChronoDuration::seconds(secs)
}

/// Let spawned tasks run; with paused time this also advances the clock a bit
pub async fn settle() {
    tokio::time::sleep(Duration::from_millis(10)).await;
}

/// Realtime-capable claim row owned by `u1`
pub fn claim_row(id: &str, status: ClaimStatus, updated_secs: i64) -> ClaimRow {
    ClaimRow {
        id: ClaimId::new(id).unwrap_or_else(|_| panic!("bad claim id {id:?}")),
        user_id: UserId::new("u1").unwrap_or_else(|_| panic!("bad user id")),
        offer_id: OfferId::new("o1").unwrap_or_else(|_| panic!("bad offer id")),
        venue_id: Some("v1".to_string()),
        status,
        rejection_reason: None,
        is_legacy: false,
        created_at: at(0),
        updated_at: at(updated_secs),
    }
}

pub fn offer(id: &str, claimed_count: u32, updated_secs: i64) -> FlashOffer {
    FlashOffer {
        id: OfferId::new(id).unwrap_or_else(|_| panic!("bad offer id {id:?}")),
        venue_id: "v1".to_string(),
        title: "Two-for-one espresso".to_string(),
        claimed_count,
        max_claims: 50,
        status: OfferStatus::Active,
        start_time: at(0),
        end_time: at(3_600),
        updated_at: at(updated_secs),
    }
}

struct OpenChannel {
    tx: mpsc::Sender<ChannelEvent>,
    cancel: CancellationToken,
}

#[derive(Default)]
struct TransportState {
    channels: HashMap<ChannelTopic, Vec<OpenChannel>>,
}

/// In-memory transport; events are pushed by the test
pub struct FakeTransport {
    state: Mutex<TransportState>,
    auto_status: Mutex<Option<ChannelStatus>>,
    fail_open: Mutex<Option<Error>>,
    open_attempts: AtomicUsize,
}

impl FakeTransport {
    /// Channels report `SUBSCRIBED` as soon as they open
    pub fn new() -> Self {
        Self {
            state: Mutex::new(TransportState::default()),
            auto_status: Mutex::new(Some(ChannelStatus::Subscribed)),
            fail_open: Mutex::new(None),
            open_attempts: AtomicUsize::new(0),
        }
    }

    /// Status every newly opened channel reports first (`None`: nothing)
    pub fn set_auto_status(&self, status: Option<ChannelStatus>) {
        *lock(&self.auto_status) = status;
    }

    /// Make `open` itself fail
    pub fn set_fail_open(&self, error: Option<Error>) {
        *lock(&self.fail_open) = error;
    }

    /// Deliver an event on the most recently opened channel for `topic`
    pub fn push(&self, topic: &ChannelTopic, event: ChannelEvent) {
        let state = lock(&self.state);
        if let Some(open) = state.channels.get(topic).and_then(|c| c.last()) {
            if !open.cancel.is_cancelled() {
                let _ = open.tx.try_send(event);
            }
        }
    }

    /// Calls to `open` across all topics, failed ones included
    pub fn open_attempts(&self) -> usize {
        self.open_attempts.load(Ordering::SeqCst)
    }

    /// Successful opens of `topic`
    pub fn opens(&self, topic: &ChannelTopic) -> usize {
        lock(&self.state)
            .channels
            .get(topic)
            .map(|c| c.len())
            .unwrap_or(0)
    }

    pub fn closes(&self, topic: &ChannelTopic) -> usize {
        lock(&self.state)
            .channels
            .get(topic)
            .map(|c| c.iter().filter(|o| o.cancel.is_cancelled()).count())
            .unwrap_or(0)
    }

    /// Channels currently open across all topics
    pub fn open_channels(&self) -> usize {
        lock(&self.state)
            .channels
            .values()
            .flatten()
            .filter(|o| !o.cancel.is_cancelled())
            .count()
    }
}

impl Default for FakeTransport {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RealtimeTransport for FakeTransport {
    async fn open(&self, topic: &ChannelTopic) -> Result<RealtimeChannel> {
        self.open_attempts.fetch_add(1, Ordering::SeqCst);
        if let Some(error) = lock(&self.fail_open).clone() {
            return Err(error);
        }

        let (tx, rx) = mpsc::channel(64);
        let cancel = CancellationToken::new();
        if let Some(status) = *lock(&self.auto_status) {
            let _ = tx.try_send(ChannelEvent::Status(status));
        }

        lock(&self.state)
            .channels
            .entry(topic.clone())
            .or_default()
            .push(OpenChannel {
                tx,
                cancel: cancel.clone(),
            });
        Ok(RealtimeChannel::new(rx, cancel))
    }
}

/// In-memory backend with call counters and injectable failures
#[derive(Default)]
pub struct FakeBackend {
    claims: Mutex<HashMap<ClaimId, ClaimRow>>,
    offers: Mutex<HashMap<OfferId, FlashOffer>>,
    unfiltered: Mutex<Vec<ClaimRow>>,
    failure: Mutex<Option<Error>>,
    delay: Mutex<Option<Duration>>,
    claim_fetches: AtomicUsize,
    user_claim_fetches: AtomicUsize,
    offer_fetches: AtomicUsize,
    pings: AtomicUsize,
}

impl FakeBackend {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn upsert_claim(&self, row: ClaimRow) {
        lock(&self.claims).insert(row.id.clone(), row);
    }

    /// Row returned by every user listing regardless of its owner
    pub fn add_unfiltered_row(&self, row: ClaimRow) {
        lock(&self.unfiltered).push(row);
    }

    pub fn upsert_offer(&self, offer: FlashOffer) {
        lock(&self.offers).insert(offer.id.clone(), offer);
    }

    /// Fail every call with `error` until cleared
    pub fn set_failure(&self, error: Option<Error>) {
        *lock(&self.failure) = error;
    }

    /// Make every call take this long
    pub fn set_delay(&self, delay: Option<Duration>) {
        *lock(&self.delay) = delay;
    }

    pub fn claim_fetches(&self) -> usize {
        self.claim_fetches.load(Ordering::SeqCst)
    }

    pub fn user_claim_fetches(&self) -> usize {
        self.user_claim_fetches.load(Ordering::SeqCst)
    }

    pub fn offer_fetches(&self) -> usize {
        self.offer_fetches.load(Ordering::SeqCst)
    }

    pub fn pings(&self) -> usize {
        self.pings.load(Ordering::SeqCst)
    }

    async fn call(&self, counter: &AtomicUsize) -> Result<()> {
        counter.fetch_add(1, Ordering::SeqCst);
        let delay = *lock(&self.delay);
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        match lock(&self.failure).clone() {
            Some(error) => Err(error),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl BackendApi for FakeBackend {
    async fn fetch_claim(&self, id: &ClaimId) -> Result<Option<ClaimRow>> {
        self.call(&self.claim_fetches).await?;
        Ok(lock(&self.claims).get(id).cloned())
    }

    async fn fetch_user_claims(&self, user_id: &UserId) -> Result<Vec<ClaimRow>> {
        self.call(&self.user_claim_fetches).await?;
        let mut rows: Vec<ClaimRow> = lock(&self.claims)
            .values()
            .filter(|row| &row.user_id == user_id)
            .cloned()
            .collect();
        rows.extend(lock(&self.unfiltered).iter().cloned());
        rows.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        Ok(rows)
    }

    async fn fetch_offer(&self, id: &OfferId) -> Result<Option<FlashOffer>> {
        self.call(&self.offer_fetches).await?;
        Ok(lock(&self.offers).get(id).cloned())
    }

    async fn ping(&self) -> Result<()> {
        self.call(&self.pings).await
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FeedbackEvent {
    Haptic(HapticKind),
    Toast(Toast),
    Banner(bool),
}

/// Sink that records everything it is asked to show
#[derive(Default)]
pub struct RecordingSink {
    events: Mutex<Vec<FeedbackEvent>>,
}

impl RecordingSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<FeedbackEvent> {
        lock(&self.events).clone()
    }

    /// Claims that got an accepted toast, in order
    pub fn acceptances(&self) -> Vec<ClaimId> {
        self.toasts(ToastKind::Success)
            .into_iter()
            .filter_map(|t| t.claim_id)
            .collect()
    }

    /// Claims that got a rejected toast, with the reason shown
    pub fn rejections(&self) -> Vec<(ClaimId, String)> {
        self.toasts(ToastKind::Error)
            .into_iter()
            .filter_map(|t| t.claim_id.map(|id| (id, t.message)))
            .collect()
    }

    pub fn banner_shown(&self) -> bool {
        lock(&self.events).contains(&FeedbackEvent::Banner(true))
    }

    fn toasts(&self, kind: ToastKind) -> Vec<Toast> {
        lock(&self.events)
            .iter()
            .filter_map(|e| match e {
                FeedbackEvent::Toast(t) if t.kind == kind => Some(t.clone()),
                _ => None,
            })
            .collect()
    }
}

impl FeedbackSink for RecordingSink {
    fn haptic(&self, kind: HapticKind) {
        lock(&self.events).push(FeedbackEvent::Haptic(kind));
    }

    fn toast(&self, toast: &Toast) {
        lock(&self.events).push(FeedbackEvent::Toast(toast.clone()));
    }

    fn banner(&self, visible: bool) {
        lock(&self.events).push(FeedbackEvent::Banner(visible));
    }
}
