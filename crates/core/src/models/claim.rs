//! Claim models: wire rows, transient updates, and the cached view

use crate::errors::{Error, Result};
use crate::types::{ClaimId, OfferId, UserId};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Lifecycle status of a claim
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ClaimStatus {
    Pending,
    Redeemed,
    Rejected,
    Expired,
}

impl ClaimStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ClaimStatus::Pending => "pending",
            ClaimStatus::Redeemed => "redeemed",
            ClaimStatus::Rejected => "rejected",
            ClaimStatus::Expired => "expired",
        }
    }
}

impl fmt::Display for ClaimStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ClaimStatus {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "pending" => Ok(ClaimStatus::Pending),
            "redeemed" => Ok(ClaimStatus::Redeemed),
            "rejected" => Ok(ClaimStatus::Rejected),
            "expired" => Ok(ClaimStatus::Expired),
            other => Err(Error::InvalidData(format!("unknown claim status: {}", other))),
        }
    }
}

/// Whether a claim can be followed over a realtime channel
///
/// Decided once when the row is fetched; claims created before realtime
/// support are polled for their whole life.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncCapability {
    RealtimeCapable,
    PollingOnly,
}

/// Row shape of `flash_offer_claims` as returned by the REST and realtime APIs
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClaimRow {
    pub id: ClaimId,
    pub user_id: UserId,
    pub offer_id: OfferId,
    #[serde(default)]
    pub venue_id: Option<String>,
    pub status: ClaimStatus,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    /// Set on rows that predate realtime support
    #[serde(default)]
    pub is_legacy: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl ClaimRow {
    pub fn capability(&self) -> SyncCapability {
        if self.is_legacy {
            SyncCapability::PollingOnly
        } else {
            SyncCapability::RealtimeCapable
        }
    }

    /// The change event this row represents
    pub fn to_update(&self) -> ClaimUpdate {
        ClaimUpdate {
            claim_id: self.id.clone(),
            status: self.status,
            rejection_reason: self.rejection_reason.clone(),
            updated_at: self.updated_at,
        }
    }
}

/// A change to a single claim, as delivered by push or poll
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClaimUpdate {
    pub claim_id: ClaimId,
    pub status: ClaimStatus,
    #[serde(default)]
    pub rejection_reason: Option<String>,
    pub updated_at: DateTime<Utc>,
}

/// Last-known materialized state of a claim
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CachedClaim {
    pub id: ClaimId,
    pub user_id: UserId,
    pub offer_id: OfferId,
    pub venue_id: Option<String>,
    pub status: ClaimStatus,
    pub rejection_reason: Option<String>,
    pub capability: SyncCapability,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl From<ClaimRow> for CachedClaim {
    fn from(row: ClaimRow) -> Self {
        let capability = row.capability();
        CachedClaim {
            id: row.id,
            user_id: row.user_id,
            offer_id: row.offer_id,
            venue_id: row.venue_id,
            status: row.status,
            rejection_reason: row.rejection_reason,
            capability,
            created_at: row.created_at,
            updated_at: row.updated_at,
        }
    }
}

/// Partial update applied through `StateCache::update_claim`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClaimPatch {
    pub status: Option<ClaimStatus>,
    /// `Some(None)` clears the reason
    pub rejection_reason: Option<Option<String>>,
    pub capability: Option<SyncCapability>,
    pub updated_at: Option<DateTime<Utc>>,
}
