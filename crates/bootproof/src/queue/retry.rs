use std::sync::Arc;

use super::VerificationAsset;
use crate::error::Result;
use crate::store::KeyValueStore;

pub const ATTEMPTS_PREFIX: &str = "screenshotVerification.attempts.";

/// Per-(asset, snapshot) attempt counters kept in the ephemeral store.
#[derive(Clone)]
pub struct RetryCounters {
    store: Arc<dyn KeyValueStore>,
}

impl RetryCounters {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(asset: &VerificationAsset) -> String {
        format!("{ATTEMPTS_PREFIX}{}.{}", asset.asset_key, asset.snapshot_epoch)
    }

    pub fn get(&self, asset: &VerificationAsset) -> Result<u32> {
        let raw = self.store.get(&Self::key(asset))?;
        Ok(raw.and_then(|s| s.trim().parse().ok()).unwrap_or(0))
    }

    pub fn increment(&self, asset: &VerificationAsset) -> Result<u32> {
        let next = self.get(asset)?.saturating_add(1);
        self.store.set(&Self::key(asset), &next.to_string())?;
        Ok(next)
    }

    pub fn clear(&self, asset: &VerificationAsset) -> Result<()> {
        self.store.clear(&Self::key(asset))
    }

    pub fn clear_all(&self) -> Result<usize> {
        let keys = self.store.keys_with_prefix(ATTEMPTS_PREFIX)?;
        for k in &keys {
            self.store.clear(k)?;
        }
        Ok(keys.len())
    }
}
