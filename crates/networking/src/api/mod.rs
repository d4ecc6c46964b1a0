//! Backend query interface consumed by the sync engine
//!
//! The engine only talks to the hosted backend through this trait so tests
//! can substitute scripted fakes.

use async_trait::async_trait;
use claimsync_core::{ClaimId, ClaimRow, FlashOffer, OfferId, Result, UserId};

/// Point and list fetches against the hosted database
///
/// `Ok(None)` means the row does not exist; network failures are always
/// reported as errors so callers can tell the two apart.
#[async_trait]
pub trait BackendApi: Send + Sync {
    /// Fetch a single claim row
    async fn fetch_claim(&self, claim_id: &ClaimId) -> Result<Option<ClaimRow>>;

    /// Fetch every claim owned by a user
    async fn fetch_user_claims(&self, user_id: &UserId) -> Result<Vec<ClaimRow>>;

    /// Fetch a single flash offer row
    async fn fetch_offer(&self, offer_id: &OfferId) -> Result<Option<FlashOffer>>;

    /// Cheap reachability check
    async fn ping(&self) -> Result<()>;
}
