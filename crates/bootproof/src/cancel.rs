use std::sync::Arc;

use crate::error::Result;
use crate::store::KeyValueStore;

const CANCEL_PREFIX: &str = "screenshotVerification.cancel.";

/// Asset-scoped cancel requests, observed by a running pipeline between
/// stages.
#[derive(Clone)]
pub struct CancelFlags {
    store: Arc<dyn KeyValueStore>,
}

impl CancelFlags {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    fn key(asset_key: &str) -> String {
        format!("{CANCEL_PREFIX}{asset_key}")
    }

    pub fn request(&self, asset_key: &str) -> Result<()> {
        self.store.touch(&Self::key(asset_key))?;
        tracing::info!(asset = asset_key, "verification cancel requested");
        Ok(())
    }

    pub fn is_requested(&self, asset_key: &str) -> Result<bool> {
        self.store.exists(&Self::key(asset_key))
    }

    pub fn clear(&self, asset_key: &str) -> Result<()> {
        self.store.clear(&Self::key(asset_key))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn flags_are_per_asset() {
        let c = CancelFlags::new(Arc::new(MemoryStore::new()));
        c.request("agent-1").expect("request");
        assert!(c.is_requested("agent-1").expect("check"));
        assert!(!c.is_requested("agent-2").expect("check"));
        c.clear("agent-1").expect("clear");
        assert!(!c.is_requested("agent-1").expect("check"));
    }
}
