use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::process;
use crate::store::{self, KeyValueStore};

pub const IN_PROGRESS_KEY: &str = "screenshotVerification.inProgress";
const IN_PROGRESS_LOCK: &str = "screenshotVerification.inProgress";

/// The one run currently executing on this device.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InProgressVerification {
    pub asset_key: String,
    pub snapshot_epoch: i64,
    pub start_time: i64,
    pub delay_secs: u64,
    pub pid: u32,
    pub timeout_secs: u64,
}

impl InProgressVerification {
    pub fn owner_alive(&self) -> bool {
        process::pid_alive(self.pid)
    }
}

pub enum Begin {
    Started(InProgressGuard),
    Busy(InProgressVerification),
}

#[derive(Clone)]
pub struct InProgressRepository {
    store: Arc<dyn KeyValueStore>,
    lock_timeout: Duration,
}

impl InProgressRepository {
    pub fn new(store: Arc<dyn KeyValueStore>, lock_timeout: Duration) -> Self {
        Self { store, lock_timeout }
    }

    pub fn get(&self) -> Result<Option<InProgressVerification>> {
        store::read_json(self.store.as_ref(), IN_PROGRESS_KEY)
    }

    /// The current record if its owner is still running. A record left by a
    /// dead process is removed.
    pub fn active(&self) -> Result<Option<InProgressVerification>> {
        let Some(rec) = self.get()? else {
            return Ok(None);
        };
        if rec.owner_alive() {
            return Ok(Some(rec));
        }
        tracing::warn!(
            asset = %rec.asset_key,
            epoch = rec.snapshot_epoch,
            pid = rec.pid,
            "clearing in-progress record of a process that is gone"
        );
        self.clear()?;
        Ok(None)
    }

    pub fn clear(&self) -> Result<()> {
        self.store.clear(IN_PROGRESS_KEY)
    }

    /// Claim the run slot for `rec`, or report who holds it.
    pub fn begin(&self, rec: InProgressVerification) -> Result<Begin> {
        let lock = self.store.lock(IN_PROGRESS_LOCK, self.lock_timeout)?;
        if let Some(current) = self.active()? {
            return Ok(Begin::Busy(current));
        }
        store::write_json(self.store.as_ref(), IN_PROGRESS_KEY, &rec)?;
        lock.release();
        tracing::debug!(asset = %rec.asset_key, epoch = rec.snapshot_epoch, pid = rec.pid, "run slot claimed");
        Ok(Begin::Started(InProgressGuard {
            store: self.store.clone(),
            record: rec,
        }))
    }
}

/// Removes the in-progress record when dropped.
pub struct InProgressGuard {
    store: Arc<dyn KeyValueStore>,
    record: InProgressVerification,
}

impl InProgressGuard {
    pub fn record(&self) -> &InProgressVerification {
        &self.record
    }
}

impl Drop for InProgressGuard {
    fn drop(&mut self) {
        if let Err(e) = self.store.clear(IN_PROGRESS_KEY) {
            tracing::warn!(asset = %self.record.asset_key, error = %e, "failed to clear in-progress record");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn record(pid: u32) -> InProgressVerification {
        InProgressVerification {
            asset_key: "agent-1".into(),
            snapshot_epoch: 1_700_000_000,
            start_time: 1_700_003_600,
            delay_secs: 60,
            pid,
            timeout_secs: 960,
        }
    }

    fn repo() -> InProgressRepository {
        InProgressRepository::new(Arc::new(MemoryStore::new()), Duration::from_millis(100))
    }

    #[test]
    fn second_claim_is_busy_while_guard_lives() {
        let repo = repo();
        let Begin::Started(guard) = repo.begin(record(process::current_pid())).expect("begin") else {
            panic!("slot should be free");
        };
        match repo.begin(record(process::current_pid())).expect("begin again") {
            Begin::Busy(held) => assert_eq!(held, *guard.record()),
            Begin::Started(_) => panic!("slot should be held"),
        }
        drop(guard);
        assert!(repo.get().expect("get").is_none());
    }

    #[test]
    fn record_of_dead_process_is_reclaimed() {
        let repo = repo();
        store::write_json(repo.store.as_ref(), IN_PROGRESS_KEY, &record(2_147_483_000)).expect("seed");
        assert!(repo.active().expect("active").is_none());
        assert!(repo.get().expect("get").is_none());
        assert!(matches!(
            repo.begin(record(process::current_pid())).expect("begin"),
            Begin::Started(_)
        ));
    }
}
