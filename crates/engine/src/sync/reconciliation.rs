//! One-shot reconciliation of the user's claims with the backend
//!
//! Used for pull-to-refresh and on app foreground, independent of any
//! realtime subscription. Concurrent callers share a single in-flight sync.

use crate::util::lock;
use chrono::{DateTime, Utc};
use claimsync_core::{CachedClaim, Error, SyncReport, UserId};
use claimsync_networking::BackendApi;
use claimsync_persistence::StateCache;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

const CHANGE_BUFFER: usize = 256;

type SharedSync = Shared<BoxFuture<'static, SyncReport>>;

struct Inner {
    api: Arc<dyn BackendApi>,
    cache: Arc<StateCache>,
    session: RwLock<Option<UserId>>,
    online: AtomicBool,
    last_sync: Mutex<Option<DateTime<Utc>>>,
    in_flight: Mutex<Option<SharedSync>>,
    changes_tx: broadcast::Sender<CachedClaim>,
}

#[derive(Clone)]
pub struct ClaimSyncService {
    inner: Arc<Inner>,
}

impl ClaimSyncService {
    pub fn new(api: Arc<dyn BackendApi>, cache: Arc<StateCache>) -> Self {
        let (changes_tx, _) = broadcast::channel(CHANGE_BUFFER);
        Self {
            inner: Arc::new(Inner {
                api,
                cache,
                session: RwLock::new(None),
                online: AtomicBool::new(true),
                last_sync: Mutex::new(None),
                in_flight: Mutex::new(None),
                changes_tx,
            }),
        }
    }

    /// Set or clear the signed-in user; without one, syncing is a no-op
    pub fn set_session(&self, user_id: Option<UserId>) {
        if let Ok(mut session) = self.inner.session.write() {
            *session = user_id;
        }
    }

    pub fn session(&self) -> Option<UserId> {
        self.inner.session()
    }

    /// Record device reachability; returns the previous value
    pub fn set_online(&self, online: bool) -> bool {
        let was = self.inner.online.swap(online, Ordering::SeqCst);
        if was != online {
            info!("Device is now {}", if online { "online" } else { "offline" });
        }
        was
    }

    pub fn is_device_online(&self) -> bool {
        self.inner.online.load(Ordering::SeqCst)
    }

    /// When the last successful sync finished
    pub fn last_sync_timestamp(&self) -> Option<DateTime<Utc>> {
        *lock(&self.inner.last_sync)
    }

    /// Claims changed by reconciliation, as they are merged
    pub fn subscribe_changes(&self) -> broadcast::Receiver<CachedClaim> {
        self.inner.changes_tx.subscribe()
    }

    /// Fetch every claim of the session user and merge it into the cache
    ///
    /// Never fails: problems come back in [`SyncReport::errors`]. A call made
    /// while another sync is running waits for and returns that sync's report.
    pub async fn manual_sync(&self) -> SyncReport {
        let sync = {
            let mut in_flight = lock(&self.inner.in_flight);
            match in_flight.as_ref() {
                Some(running) => {
                    debug!("Joining in-flight sync");
                    running.clone()
                }
                None => {
                    let inner = self.inner.clone();
                    let task = tokio::spawn(async move {
                        let report = inner.run().await;
                        *lock(&inner.in_flight) = None;
                        report
                    });
                    let sync = async move {
                        task.await.unwrap_or_else(|e| {
                            SyncReport::failed(vec![Error::ApiError(format!("sync task failed: {}", e))])
                        })
                    }
                    .boxed()
                    .shared();
                    *in_flight = Some(sync.clone());
                    sync
                }
            }
        };
        sync.await
    }

    /// Ping the backend every `interval`; sync when the device comes back
    pub fn spawn_reachability_monitor(&self, interval: Duration, cancel: CancellationToken) -> JoinHandle<()> {
        let service = self.clone();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    _ = ticker.tick() => {}
                }

                let reachable = tokio::select! {
                    _ = cancel.cancelled() => break,
                    ping = service.inner.api.ping() => ping.is_ok(),
                };
                let was_online = service.set_online(reachable);
                if reachable && !was_online {
                    let report = service.manual_sync().await;
                    debug!("Reconnect sync finished: {:?}", report);
                }
            }
            debug!("Reachability monitor stopped");
        })
    }
}

impl Inner {
    fn session(&self) -> Option<UserId> {
        self.session.read().ok().and_then(|s| s.clone())
    }

    async fn run(&self) -> SyncReport {
        let Some(user_id) = self.session() else {
            debug!("No session; skipping sync");
            return SyncReport::succeeded(0);
        };

        if !self.online.load(Ordering::SeqCst) {
            warn!("Sync requested while offline");
            return SyncReport::failed(vec![Error::NetworkError("device is offline".to_string())]);
        }

        let rows = match self.api.fetch_user_claims(&user_id).await {
            Ok(rows) => rows,
            Err(Error::AuthenticationRequired) => {
                warn!("Session for {} is no longer valid; skipping sync", user_id);
                return SyncReport::succeeded(0);
            }
            Err(e) => {
                warn!("Sync for {} failed: {}", user_id, e);
                return SyncReport::failed(vec![e]);
            }
        };

        let fetched = rows.len();
        let mut errors = Vec::new();
        let mut changed = Vec::new();
        for row in rows {
            if row.user_id != user_id {
                errors.push(Error::InvalidData(format!(
                    "claim {} belongs to {}, not {}",
                    row.id, row.user_id, user_id
                )));
                continue;
            }
            let claim = CachedClaim::from(row);
            if self.cache.merge_claim(claim.clone()) {
                changed.push(claim);
            }
        }

        for claim in &changed {
            // No receivers is fine
            let _ = self.changes_tx.send(claim.clone());
        }
        *lock(&self.last_sync) = Some(Utc::now());

        if let Err(e) = self.cache.flush().await {
            warn!("Failed to flush claim snapshot: {}", e);
            errors.push(e);
        }

        info!(
            "Synced claims for {}: {} fetched, {} changed, {} errors",
            user_id,
            fetched,
            changed.len(),
            errors.len()
        );
        SyncReport {
            success: true,
            claims_synced: changed.len(),
            errors,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{claim_row, FakeBackend};
    use claimsync_core::{ClaimId, ClaimStatus};

    fn service() -> (Arc<FakeBackend>, Arc<StateCache>, ClaimSyncService) {
        let backend = Arc::new(FakeBackend::new());
        let cache = Arc::new(StateCache::new());
        let service = ClaimSyncService::new(backend.clone(), cache.clone());
        service.set_session(Some(UserId::new("u1").unwrap()));
        (backend, cache, service)
    }

    #[tokio::test]
    async fn test_no_session_is_noop() {
        let (backend, _cache, service) = service();
        service.set_session(None);
        let report = service.manual_sync().await;
        assert!(report.success);
        assert_eq!(report.claims_synced, 0);
        assert_eq!(backend.user_claim_fetches(), 0);
    }

    #[tokio::test]
    async fn test_offline_sync_leaves_cache_untouched() {
        let (backend, cache, service) = service();
        cache.merge_claim(CachedClaim::from(claim_row("c1", ClaimStatus::Pending, 0)));
        backend.upsert_claim(claim_row("c1", ClaimStatus::Redeemed, 10));
        let before = cache.claims();

        service.set_online(false);
        let report = service.manual_sync().await;

        assert!(!report.success);
        assert_eq!(report.claims_synced, 0);
        assert!(!report.errors.is_empty());
        assert_eq!(cache.claims(), before);
        assert_eq!(backend.user_claim_fetches(), 0);
        assert!(service.last_sync_timestamp().is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_syncs_share_one_fetch() {
        let (backend, _cache, service) = service();
        backend.upsert_claim(claim_row("c1", ClaimStatus::Pending, 0));
        backend.set_delay(Some(Duration::from_secs(1)));

        let (a, b, c) = tokio::join!(service.manual_sync(), service.manual_sync(), service.manual_sync());
        assert_eq!(backend.user_claim_fetches(), 1);
        assert_eq!(a, b);
        assert_eq!(b, c);
        assert_eq!(a.claims_synced, 1);

        service.manual_sync().await;
        assert_eq!(backend.user_claim_fetches(), 2);
    }

    #[tokio::test]
    async fn test_merges_and_broadcasts_changes() {
        let (backend, cache, service) = service();
        let mut changes = service.subscribe_changes();

        // Cache already holds a newer state for c2
        cache.merge_claim(CachedClaim::from(claim_row("c2", ClaimStatus::Redeemed, 50)));
        backend.upsert_claim(claim_row("c1", ClaimStatus::Pending, 10));
        backend.upsert_claim(claim_row("c2", ClaimStatus::Pending, 5));

        let report = service.manual_sync().await;
        assert!(report.success);
        assert_eq!(report.claims_synced, 1);
        assert!(report.errors.is_empty());
        assert!(service.last_sync_timestamp().is_some());

        assert_eq!(changes.recv().await.unwrap().id, ClaimId::new("c1").unwrap());
        let c2 = cache.get_claim(&ClaimId::new("c2").unwrap()).unwrap();
        assert_eq!(c2.status, ClaimStatus::Redeemed);

        // Nothing new the second time round
        assert_eq!(service.manual_sync().await.claims_synced, 0);
    }

    #[tokio::test]
    async fn test_fetch_failure_is_reported() {
        let (backend, _cache, service) = service();
        backend.set_failure(Some(Error::NetworkError("boom".into())));
        let report = service.manual_sync().await;
        assert!(!report.success);
        assert_eq!(report.errors, vec![Error::NetworkError("boom".into())]);
        assert!(service.last_sync_timestamp().is_none());
    }

    #[tokio::test]
    async fn test_expired_session_is_noop() {
        let (backend, _cache, service) = service();
        backend.set_failure(Some(Error::AuthenticationRequired));
        let report = service.manual_sync().await;
        assert!(report.success);
        assert!(report.errors.is_empty());
    }

    #[tokio::test]
    async fn test_foreign_rows_are_partial_errors() {
        let (backend, cache, service) = service();
        backend.upsert_claim(claim_row("c1", ClaimStatus::Pending, 0));
        let mut foreign = claim_row("c9", ClaimStatus::Pending, 0);
        foreign.user_id = UserId::new("u2").unwrap();
        backend.add_unfiltered_row(foreign);

        let report = service.manual_sync().await;
        assert!(report.success);
        assert_eq!(report.claims_synced, 1);
        assert!(matches!(report.errors.as_slice(), [Error::InvalidData(_)]));
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_monitor_syncs_when_back_online() {
        let (backend, _cache, service) = service();
        backend.upsert_claim(claim_row("c1", ClaimStatus::Pending, 0));
        backend.set_failure(Some(Error::NetworkError("no route".into())));

        let cancel = CancellationToken::new();
        let monitor = service.spawn_reachability_monitor(Duration::from_secs(5), cancel.clone());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(!service.is_device_online());

        backend.set_failure(None);
        tokio::time::sleep(Duration::from_secs(5)).await;
        assert!(service.is_device_online());
        assert_eq!(backend.user_claim_fetches(), 1);

        cancel.cancel();
        monitor.await.unwrap();
    }
}
