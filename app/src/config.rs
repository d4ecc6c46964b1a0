//! App configuration: JSON file in the data dir, then env overrides

use anyhow::{Context, Result};
use claimsync_core::{BackendConfig, FeedbackConfig, SyncConfig, UserId};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

pub const CONFIG_FILE: &str = "config.json";
pub const SNAPSHOT_FILE: &str = "claims.db";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct AppConfig {
    pub backend: BackendConfig,
    pub sync: SyncConfig,
    pub feedback: FeedbackConfig,
    /// Signed-in user; without one reconciliation is a no-op
    pub user_id: Option<String>,
    /// Overrides the platform data directory
    pub data_dir: Option<PathBuf>,
}

impl AppConfig {
    /// Platform data directory for the app
    pub fn default_data_dir() -> PathBuf {
        dirs_next::data_local_dir()
            .map(|p| p.join("Claimsync"))
            .unwrap_or_else(|| PathBuf::from("."))
    }

    /// Load `config.json` from the data dir and apply `CLAIMSYNC_*` env vars
    pub fn load() -> Result<Self> {
        let path = Self::default_data_dir().join(CONFIG_FILE);
        let mut config = Self::load_from(&path)?;
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    /// Read a config file; a missing file yields the defaults
    pub fn load_from(path: &Path) -> Result<Self> {
        if !path.exists() {
            debug!("No config at {}, using defaults", path.display());
            return Ok(Self::default());
        }
        let raw = std::fs::read_to_string(path)
            .with_context(|| format!("reading {}", path.display()))?;
        let config = serde_json::from_str(&raw)
            .with_context(|| format!("parsing {}", path.display()))?;
        info!("Loaded config from {}", path.display());
        Ok(config)
    }

    /// Override fields from environment-style lookups
    pub fn apply_env<F>(&mut self, var: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(url) = var("CLAIMSYNC_BACKEND_URL") {
            self.backend.url = url;
        }
        if let Some(key) = var("CLAIMSYNC_ANON_KEY") {
            self.backend.anon_key = key;
        }
        if let Some(token) = var("CLAIMSYNC_ACCESS_TOKEN") {
            self.backend.access_token = Some(token);
        }
        if let Some(user) = var("CLAIMSYNC_USER_ID") {
            self.user_id = Some(user);
        }
        if let Some(secs) = var("CLAIMSYNC_POLL_INTERVAL_SECS") {
            self.sync.poll_interval_secs = secs
                .trim()
                .parse()
                .with_context(|| format!("CLAIMSYNC_POLL_INTERVAL_SECS is not a number: {:?}", secs))?;
        }
        Ok(())
    }

    pub fn data_dir(&self) -> PathBuf {
        self.data_dir.clone().unwrap_or_else(Self::default_data_dir)
    }

    pub fn snapshot_path(&self) -> PathBuf {
        self.data_dir().join(SNAPSHOT_FILE)
    }

    /// Validated session user, if configured
    pub fn session_user(&self) -> Result<Option<UserId>> {
        self.user_id
            .as_deref()
            .map(UserId::new)
            .transpose()
            .context("invalid user id in config")
    }
}
