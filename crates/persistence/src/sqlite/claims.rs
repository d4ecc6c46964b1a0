//! Cached claim snapshot CRUD

use chrono::{DateTime, Utc};
use claimsync_core::{
    CachedClaim, ClaimId, ClaimStatus, Error, OfferId, Result, SyncCapability, UserId,
};
use sqlx::{SqliteConnection, SqlitePool};
use tracing::warn;

/// Database row for a cached claim
#[derive(Debug, sqlx::FromRow)]
struct CachedClaimRow {
    id: String,
    user_id: String,
    offer_id: String,
    venue_id: Option<String>,
    status: String,
    rejection_reason: Option<String>,
    capability: String,
    created_at: DateTime<Utc>,
    updated_at: DateTime<Utc>,
}

impl TryFrom<CachedClaimRow> for CachedClaim {
    type Error = Error;

    fn try_from(row: CachedClaimRow) -> Result<Self> {
        let capability = match row.capability.as_str() {
            "polling_only" => SyncCapability::PollingOnly,
            "realtime_capable" => SyncCapability::RealtimeCapable,
            other => {
                return Err(Error::InvalidData(format!("unknown capability: {}", other)));
            }
        };

        Ok(CachedClaim {
            id: ClaimId::new(row.id)?,
            user_id: UserId::new(row.user_id)?,
            offer_id: OfferId::new(row.offer_id)?,
            venue_id: row.venue_id,
            status: row.status.parse::<ClaimStatus>()?,
            rejection_reason: row.rejection_reason,
            capability,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

fn capability_str(capability: SyncCapability) -> &'static str {
    match capability {
        SyncCapability::RealtimeCapable => "realtime_capable",
        SyncCapability::PollingOnly => "polling_only",
    }
}

/// Load every cached claim, skipping rows that no longer decode
pub async fn load_cached_claims(pool: &SqlitePool) -> Result<Vec<CachedClaim>> {
    let rows: Vec<CachedClaimRow> = sqlx::query_as(
        r#"
        SELECT id, user_id, offer_id, venue_id, status, rejection_reason,
               capability, created_at, updated_at
        FROM cached_claims
        "#,
    )
    .fetch_all(pool)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;

    let mut claims = Vec::with_capacity(rows.len());
    for row in rows {
        let id = row.id.clone();
        match CachedClaim::try_from(row) {
            Ok(claim) => claims.push(claim),
            Err(e) => warn!("Skipping unreadable cached claim {}: {}", id, e),
        }
    }
    Ok(claims)
}

async fn upsert_one(conn: &mut SqliteConnection, claim: &CachedClaim) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO cached_claims
            (id, user_id, offer_id, venue_id, status, rejection_reason,
             capability, created_at, updated_at)
        VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
        ON CONFLICT(id) DO UPDATE SET
            status = excluded.status,
            rejection_reason = excluded.rejection_reason,
            capability = excluded.capability,
            venue_id = excluded.venue_id,
            updated_at = excluded.updated_at
        "#,
    )
    .bind(claim.id.as_str())
    .bind(claim.user_id.as_str())
    .bind(claim.offer_id.as_str())
    .bind(claim.venue_id.as_deref())
    .bind(claim.status.as_str())
    .bind(claim.rejection_reason.as_deref())
    .bind(capability_str(claim.capability))
    .bind(claim.created_at)
    .bind(claim.updated_at)
    .execute(conn)
    .await
    .map_err(|e| Error::DatabaseError(e.to_string()))?;
    Ok(())
}

/// Insert or replace claims in a single transaction
pub async fn upsert_cached_claims(pool: &SqlitePool, claims: &[CachedClaim]) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

    for claim in claims {
        upsert_one(&mut tx, claim).await?;
    }

    tx.commit()
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(())
}

/// Make the table hold exactly `claims`
pub async fn replace_cached_claims(pool: &SqlitePool, claims: &[CachedClaim]) -> Result<()> {
    let mut tx = pool
        .begin()
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

    sqlx::query("DELETE FROM cached_claims")
        .execute(&mut *tx)
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

    for claim in claims {
        upsert_one(&mut tx, claim).await?;
    }

    tx.commit()
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

    Ok(())
}

pub async fn delete_cached_claim(pool: &SqlitePool, id: &ClaimId) -> Result<()> {
    sqlx::query("DELETE FROM cached_claims WHERE id = ?")
        .bind(id.as_str())
        .execute(pool)
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;
    Ok(())
}

pub async fn clear_cached_claims(pool: &SqlitePool) -> Result<()> {
    sqlx::query("DELETE FROM cached_claims")
        .execute(pool)
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;
    Ok(())
}
