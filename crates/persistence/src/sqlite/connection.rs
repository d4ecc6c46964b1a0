//! Database connection and initialization

use claimsync_core::{CachedClaim, ClaimId, Error, Result};
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use sqlx::SqlitePool;
use std::path::Path;
use std::str::FromStr;

/// SQLite-backed snapshot of cached claims, keyed by claim id
pub struct ClaimStore {
    pool: SqlitePool,
}

impl ClaimStore {
    /// Connect to database at the given path, creating if necessary
    pub async fn connect(path: &Path) -> Result<Self> {
        // Ensure parent directory exists
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| Error::DatabaseError(e.to_string()))?;
        }

        let path_str = path.to_string_lossy();
        let options = SqliteConnectOptions::from_str(&format!("sqlite:{}", path_str))
            .map_err(|e| Error::DatabaseError(e.to_string()))?
            .create_if_missing(true);

        let pool = SqlitePoolOptions::new()
            .max_connections(2)
            .connect_with(options)
            .await
            .map_err(|e| Error::DatabaseError(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    /// Connect to in-memory database (for testing)
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await
            .map_err(|e| Error::DatabaseError(e.to_string()))?;

        let store = Self { pool };
        store.run_migrations().await?;
        Ok(store)
    }

    async fn run_migrations(&self) -> Result<()> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS cached_claims (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL,
                offer_id TEXT NOT NULL,
                venue_id TEXT,
                status TEXT NOT NULL,
                rejection_reason TEXT,
                capability TEXT NOT NULL,
                created_at TIMESTAMP NOT NULL,
                updated_at TIMESTAMP NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_cached_claims_user
                ON cached_claims (user_id);
            "#,
        )
        .execute(&self.pool)
        .await
        .map_err(|e| Error::DatabaseError(e.to_string()))?;

        Ok(())
    }

    /// Get a reference to the connection pool
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    pub async fn load_all(&self) -> Result<Vec<CachedClaim>> {
        super::load_cached_claims(&self.pool).await
    }

    pub async fn save_all(&self, claims: &[CachedClaim]) -> Result<()> {
        super::upsert_cached_claims(&self.pool, claims).await
    }

    /// Overwrite the snapshot with exactly these claims
    pub async fn replace_all(&self, claims: &[CachedClaim]) -> Result<()> {
        super::replace_cached_claims(&self.pool, claims).await
    }

    pub async fn delete(&self, id: &ClaimId) -> Result<()> {
        super::delete_cached_claim(&self.pool, id).await
    }

    pub async fn clear(&self) -> Result<()> {
        super::clear_cached_claims(&self.pool).await
    }
}
