//! Process-wide cache of last-known claim states
//!
//! Reads are synchronous so screens can render between async updates.
//! Entries are only replaced by strictly newer or materially different
//! data, which makes every update idempotent.

use crate::sqlite::ClaimStore;
use claimsync_core::{
    CachedClaim, ClaimId, ClaimPatch, ClaimStatus, ClaimUpdate, Error, Result,
};
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// What applying an update did to the cache
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    /// Cache changed; carries the status before the update
    Applied { previous: ClaimStatus },
    /// Same status, reason and timestamp as the cached entry
    Duplicate,
    /// Older than the cached entry
    Stale,
    /// No cached entry to apply the update to
    Unknown,
    /// No cached entry existed; the full row became one
    Inserted,
}

impl ApplyOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. })
    }

    /// Whether the cache changed
    pub fn is_change(&self) -> bool {
        matches!(self, ApplyOutcome::Applied { .. } | ApplyOutcome::Inserted)
    }
}

/// Thread-safe claim cache with optional SQLite snapshot
pub struct StateCache {
    claims: RwLock<HashMap<ClaimId, CachedClaim>>,
    init: OnceCell<()>,
    store: Option<Arc<ClaimStore>>,
}

impl StateCache {
    /// In-memory cache with no snapshot
    pub fn new() -> Self {
        Self {
            claims: RwLock::new(HashMap::new()),
            init: OnceCell::new(),
            store: None,
        }
    }

    /// Cache that loads from and flushes to a snapshot store
    pub fn with_store(store: Arc<ClaimStore>) -> Self {
        Self {
            store: Some(store),
            ..Self::new()
        }
    }

    /// Load the snapshot, once
    ///
    /// Concurrent callers await the same initialization. A failed load
    /// leaves the cache uninitialized so a later call can retry.
    pub async fn initialize(&self) -> Result<()> {
        self.init
            .get_or_try_init(|| async {
                if let Some(store) = &self.store {
                    let loaded = store.load_all().await?;
                    let count = loaded.len();
                    for claim in loaded {
                        self.merge_claim(claim);
                    }
                    info!("State cache loaded {} claims from snapshot", count);
                } else {
                    debug!("State cache initialized without snapshot");
                }
                Ok::<(), Error>(())
            })
            .await
            .map(|_| ())
    }

    pub fn is_initialized(&self) -> bool {
        self.init.initialized()
    }

    pub fn get_claim(&self, id: &ClaimId) -> Option<CachedClaim> {
        self.claims.read().ok()?.get(id).cloned()
    }

    /// Apply a partial update to an existing entry
    ///
    /// Returns false if the claim is not cached.
    pub fn update_claim(&self, id: &ClaimId, patch: ClaimPatch) -> bool {
        let Ok(mut claims) = self.claims.write() else {
            return false;
        };
        let Some(entry) = claims.get_mut(id) else {
            return false;
        };

        if let Some(status) = patch.status {
            entry.status = status;
        }
        if let Some(reason) = patch.rejection_reason {
            entry.rejection_reason = reason;
        }
        if let Some(capability) = patch.capability {
            entry.capability = capability;
        }
        if let Some(updated_at) = patch.updated_at {
            entry.updated_at = updated_at;
        }
        true
    }

    /// Fold a change event into the cache, last write wins by `updated_at`
    pub fn apply_update(&self, update: &ClaimUpdate) -> ApplyOutcome {
        let Ok(mut claims) = self.claims.write() else {
            return ApplyOutcome::Unknown;
        };
        let Some(entry) = claims.get_mut(&update.claim_id) else {
            return ApplyOutcome::Unknown;
        };
        fold(entry, update.status, &update.rejection_reason, update.updated_at)
    }

    /// Like [`apply_update`](Self::apply_update) for a full row; an
    /// uncached claim is inserted instead of ignored
    ///
    /// The capability of an existing entry is kept.
    pub fn apply_row(&self, claim: CachedClaim) -> ApplyOutcome {
        let Ok(mut claims) = self.claims.write() else {
            return ApplyOutcome::Unknown;
        };
        match claims.get_mut(&claim.id) {
            Some(entry) => fold(entry, claim.status, &claim.rejection_reason, claim.updated_at),
            None => {
                debug!("Caching previously unknown claim {}", claim.id);
                claims.insert(claim.id.clone(), claim);
                ApplyOutcome::Inserted
            }
        }
    }

    /// Insert or replace a whole entry unless the cached one is newer
    ///
    /// Returns true if the cache changed.
    pub fn merge_claim(&self, claim: CachedClaim) -> bool {
        let Ok(mut claims) = self.claims.write() else {
            return false;
        };
        match claims.get(&claim.id) {
            Some(existing) if existing.updated_at > claim.updated_at => false,
            Some(existing) if *existing == claim => false,
            _ => {
                claims.insert(claim.id.clone(), claim);
                true
            }
        }
    }

    /// Drop one entry
    pub fn invalidate(&self, id: &ClaimId) {
        if let Ok(mut claims) = self.claims.write() {
            claims.remove(id);
        }
    }

    /// Drop every entry
    pub fn clear(&self) {
        if let Ok(mut claims) = self.claims.write() {
            claims.clear();
        }
    }

    /// Copy of every cached claim
    pub fn claims(&self) -> Vec<CachedClaim> {
        self.claims
            .read()
            .map(|c| c.values().cloned().collect())
            .unwrap_or_default()
    }

    pub fn len(&self) -> usize {
        self.claims.read().map(|c| c.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Write the current entries to the snapshot store, if any
    pub async fn flush(&self) -> Result<()> {
        let Some(store) = &self.store else {
            return Ok(());
        };
        let snapshot = self.claims();
        store.replace_all(&snapshot).await?;
        debug!("Flushed {} claims to snapshot", snapshot.len());
        Ok(())
    }
}

fn fold(
    entry: &mut CachedClaim,
    status: ClaimStatus,
    rejection_reason: &Option<String>,
    updated_at: DateTime<Utc>,
) -> ApplyOutcome {
    if updated_at < entry.updated_at {
        return ApplyOutcome::Stale;
    }
    if updated_at == entry.updated_at
        && status == entry.status
        && *rejection_reason == entry.rejection_reason
    {
        return ApplyOutcome::Duplicate;
    }

    let previous = entry.status;
    entry.status = status;
    entry.rejection_reason = rejection_reason.clone();
    entry.updated_at = updated_at;
    ApplyOutcome::Applied { previous }
}

impl Default for StateCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{DateTime, Duration, TimeZone, Utc};
    use claimsync_core::{OfferId, SyncCapability, UserId};

    fn t(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn pending(id: &str) -> CachedClaim {
        CachedClaim {
            id: ClaimId::new(id).unwrap(),
            user_id: UserId::new("u1").unwrap(),
            offer_id: OfferId::new("o1").unwrap(),
            venue_id: None,
            status: ClaimStatus::Pending,
            rejection_reason: None,
            capability: SyncCapability::RealtimeCapable,
            created_at: t(0),
            updated_at: t(0),
        }
    }

    fn update(id: &str, status: ClaimStatus, at: i64) -> ClaimUpdate {
        ClaimUpdate {
            claim_id: ClaimId::new(id).unwrap(),
            status,
            rejection_reason: None,
            updated_at: t(at),
        }
    }

    #[test]
    fn test_same_update_twice_writes_once() {
        let cache = StateCache::new();
        cache.merge_claim(pending("c1"));

        let u = update("c1", ClaimStatus::Redeemed, 10);
        assert_eq!(
            cache.apply_update(&u),
            ApplyOutcome::Applied { previous: ClaimStatus::Pending }
        );
        assert_eq!(cache.apply_update(&u), ApplyOutcome::Duplicate);
        assert_eq!(
            cache.get_claim(&u.claim_id).unwrap().status,
            ClaimStatus::Redeemed
        );
    }

    #[test]
    fn test_converges_to_newest_regardless_of_order() {
        let updates = [
            update("c1", ClaimStatus::Pending, 5),
            update("c1", ClaimStatus::Rejected, 30),
            update("c1", ClaimStatus::Redeemed, 20),
        ];

        for order in [[0, 1, 2], [2, 1, 0], [1, 0, 2], [2, 0, 1]] {
            let cache = StateCache::new();
            cache.merge_claim(pending("c1"));
            for i in order {
                cache.apply_update(&updates[i]);
            }
            let claim = cache.get_claim(&ClaimId::new("c1").unwrap()).unwrap();
            assert_eq!(claim.status, ClaimStatus::Rejected);
            assert_eq!(claim.updated_at, t(30));
        }
    }

    #[test]
    fn test_unknown_claim_is_not_materialized() {
        let cache = StateCache::new();
        assert_eq!(
            cache.apply_update(&update("ghost", ClaimStatus::Redeemed, 1)),
            ApplyOutcome::Unknown
        );
        assert!(cache.is_empty());
    }

    #[test]
    fn test_apply_row_inserts_unknown_claim() {
        let cache = StateCache::new();
        let mut row = pending("c1");
        row.status = ClaimStatus::Redeemed;
        row.updated_at = t(10);
        assert_eq!(cache.apply_row(row.clone()), ApplyOutcome::Inserted);
        assert_eq!(cache.apply_row(row.clone()), ApplyOutcome::Duplicate);

        let mut older = pending("c1");
        older.capability = SyncCapability::PollingOnly;
        assert_eq!(cache.apply_row(older), ApplyOutcome::Stale);

        let mut newer = row;
        newer.status = ClaimStatus::Expired;
        newer.updated_at = t(20);
        newer.capability = SyncCapability::PollingOnly;
        assert_eq!(
            cache.apply_row(newer),
            ApplyOutcome::Applied { previous: ClaimStatus::Redeemed }
        );
        let claim = cache.get_claim(&ClaimId::new("c1").unwrap()).unwrap();
        assert_eq!(claim.status, ClaimStatus::Expired);
        assert_eq!(claim.capability, SyncCapability::RealtimeCapable);
    }

    #[test]
    fn test_reason_change_with_same_timestamp_applies() {
        let cache = StateCache::new();
        cache.merge_claim(pending("c1"));
        let mut u = update("c1", ClaimStatus::Rejected, 10);
        cache.apply_update(&u);
        u.rejection_reason = Some("Venue closed".into());
        assert!(cache.apply_update(&u).is_applied());
    }

    #[test]
    fn test_merge_keeps_newer_entry() {
        let cache = StateCache::new();
        let mut newer = pending("c1");
        newer.updated_at = t(50);
        newer.status = ClaimStatus::Redeemed;
        assert!(cache.merge_claim(newer.clone()));
        assert!(!cache.merge_claim(pending("c1")));
        assert!(!cache.merge_claim(newer));
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_update_claim_patch() {
        let cache = StateCache::new();
        let id = ClaimId::new("c1").unwrap();
        assert!(!cache.update_claim(&id, ClaimPatch::default()));

        cache.merge_claim(pending("c1"));
        assert!(cache.update_claim(
            &id,
            ClaimPatch {
                capability: Some(SyncCapability::PollingOnly),
                ..Default::default()
            }
        ));
        let claim = cache.get_claim(&id).unwrap();
        assert_eq!(claim.capability, SyncCapability::PollingOnly);
        assert_eq!(claim.status, ClaimStatus::Pending);

        cache.invalidate(&id);
        assert!(cache.get_claim(&id).is_none());
    }

    #[tokio::test]
    async fn test_concurrent_initialize_loads_once() {
        let store = Arc::new(ClaimStore::connect_in_memory().await.unwrap());
        store.save_all(&[pending("c1")]).await.unwrap();

        let cache = Arc::new(StateCache::with_store(store));
        assert!(!cache.is_initialized());

        let (a, b) = tokio::join!(cache.initialize(), cache.initialize());
        a.unwrap();
        b.unwrap();

        assert!(cache.is_initialized());
        assert_eq!(cache.len(), 1);
        cache.initialize().await.unwrap();
        assert_eq!(cache.len(), 1);
    }

    #[tokio::test]
    async fn test_flush_writes_snapshot() {
        let store = Arc::new(ClaimStore::connect_in_memory().await.unwrap());
        let cache = StateCache::with_store(store.clone());
        cache.initialize().await.unwrap();
        cache.merge_claim(pending("c9"));
        cache.flush().await.unwrap();
        assert_eq!(store.load_all().await.unwrap().len(), 1);

        cache.invalidate(&ClaimId::new("c9").unwrap());
        cache.flush().await.unwrap();
        assert!(store.load_all().await.unwrap().is_empty());
    }
}
