use std::collections::{BTreeMap, HashSet};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use super::{KeyValueStore, StoreLock, validate_key};
use crate::error::{Error, Result};

/// Process-local store for tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryStore {
    values: Mutex<BTreeMap<String, String>>,
    locks: Arc<Mutex<HashSet<String>>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn values(&self) -> MutexGuard<'_, BTreeMap<String, String>> {
        self.values.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl KeyValueStore for MemoryStore {
    fn get(&self, key: &str) -> Result<Option<String>> {
        validate_key(key)?;
        Ok(self.values().get(key).cloned())
    }

    fn set(&self, key: &str, value: &str) -> Result<()> {
        validate_key(key)?;
        self.values().insert(key.to_string(), value.to_string());
        Ok(())
    }

    fn clear(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.values().remove(key);
        Ok(())
    }

    fn touch(&self, key: &str) -> Result<()> {
        validate_key(key)?;
        self.values().entry(key.to_string()).or_default();
        Ok(())
    }

    fn exists(&self, key: &str) -> Result<bool> {
        validate_key(key)?;
        Ok(self.values().contains_key(key))
    }

    fn keys_with_prefix(&self, prefix: &str) -> Result<Vec<String>> {
        Ok(self
            .values()
            .keys()
            .filter(|k| k.starts_with(prefix))
            .cloned()
            .collect())
    }

    fn lock(&self, name: &str, timeout: Duration) -> Result<StoreLock> {
        validate_key(name)?;
        let deadline = Instant::now() + timeout;
        loop {
            {
                let mut held = self.locks.lock().unwrap_or_else(|e| e.into_inner());
                if held.insert(name.to_string()) {
                    let locks = Arc::clone(&self.locks);
                    let name = name.to_string();
                    return Ok(StoreLock::new(move || {
                        locks
                            .lock()
                            .unwrap_or_else(|e| e.into_inner())
                            .remove(&name);
                    }));
                }
            }
            if Instant::now() >= deadline {
                return Err(Error::LockTimeout(format!("memory:{name}").into()));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn memory_lock_times_out_while_held() {
        let store = MemoryStore::new();
        let held = store.lock("queue", Duration::from_millis(10)).expect("lock");
        assert!(
            store
                .lock("queue", Duration::from_millis(20))
                .expect_err("held")
                .is_lock_timeout()
        );
        held.release();
        store.lock("queue", Duration::from_millis(20)).expect("relock");
    }
}
