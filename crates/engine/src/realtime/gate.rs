//! Duplicate and out-of-order suppression for row updates

use chrono::{DateTime, Utc};
use claimsync_core::{ClaimRow, FlashOffer};
use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};

/// An update that carries its own version
pub trait Versioned {
    /// Id of the row the update belongs to
    fn entity_key(&self) -> &str;
    fn version(&self) -> DateTime<Utc>;
    /// Hash of the fields consumers react to
    fn fingerprint(&self) -> u64;
}

impl Versioned for ClaimRow {
    fn entity_key(&self) -> &str {
        self.id.as_str()
    }

    fn version(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.status.hash(&mut hasher);
        self.rejection_reason.hash(&mut hasher);
        hasher.finish()
    }
}

impl Versioned for FlashOffer {
    fn entity_key(&self) -> &str {
        self.id.as_str()
    }

    fn version(&self) -> DateTime<Utc> {
        self.updated_at
    }

    fn fingerprint(&self) -> u64 {
        let mut hasher = DefaultHasher::new();
        self.claimed_count.hash(&mut hasher);
        self.status.hash(&mut hasher);
        hasher.finish()
    }
}

/// Remembers the last delivered version per entity
#[derive(Debug, Default)]
pub struct UpdateGate {
    last: HashMap<String, (DateTime<Utc>, u64)>,
}

impl UpdateGate {
    pub fn new() -> Self {
        Self::default()
    }

    /// Whether `update` should be delivered; records it if so
    ///
    /// Older versions are dropped, as are repeats of the last delivered
    /// version with identical content.
    pub fn admit<T: Versioned>(&mut self, update: &T) -> bool {
        let version = update.version();
        let fingerprint = update.fingerprint();

        if let Some((last_version, last_fingerprint)) = self.last.get(update.entity_key()) {
            if version < *last_version {
                return false;
            }
            if version == *last_version && fingerprint == *last_fingerprint {
                return false;
            }
        }

        self.last
            .insert(update.entity_key().to_string(), (version, fingerprint));
        true
    }
}
