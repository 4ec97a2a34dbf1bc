use std::sync::Arc;

use crate::error::Result;
use crate::store::KeyValueStore;

pub const DISABLED_KEY: &str = "screenshotVerification.disabled";

/// Device-wide verification switch; present key means disabled.
#[derive(Clone)]
pub struct FeatureFlags {
    store: Arc<dyn KeyValueStore>,
}

impl FeatureFlags {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn verification_enabled(&self) -> Result<bool> {
        Ok(!self.store.exists(DISABLED_KEY)?)
    }

    pub fn set_verification_enabled(&self, enabled: bool) -> Result<()> {
        if enabled {
            self.store.clear(DISABLED_KEY)
        } else {
            self.store.touch(DISABLED_KEY)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    #[test]
    fn enabled_until_disabled() {
        let f = FeatureFlags::new(Arc::new(MemoryStore::new()));
        assert!(f.verification_enabled().expect("read"));
        f.set_verification_enabled(false).expect("disable");
        assert!(!f.verification_enabled().expect("read"));
        f.set_verification_enabled(true).expect("enable");
        assert!(f.verification_enabled().expect("read"));
    }
}
