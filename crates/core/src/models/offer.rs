//! Flash offer models

use crate::types::OfferId;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Offer lifecycle status
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OfferStatus {
    Scheduled,
    Active,
    Paused,
    Full,
    Expired,
    Cancelled,
}

/// Row shape of `flash_offers`; also the payload of offer change events
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FlashOffer {
    pub id: OfferId,
    pub venue_id: String,
    pub title: String,
    #[serde(default)]
    pub claimed_count: u32,
    pub max_claims: u32,
    pub status: OfferStatus,
    pub start_time: DateTime<Utc>,
    pub end_time: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl FlashOffer {
    /// Claims still available (0 once full)
    pub fn remaining(&self) -> u32 {
        self.max_claims.saturating_sub(self.claimed_count)
    }

    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == OfferStatus::Active
            && self.remaining() > 0
            && now >= self.start_time
            && now < self.end_time
    }
}
