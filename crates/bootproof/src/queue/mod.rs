//! Durable, deduplicated, priority-ordered work list of snapshots awaiting
//! verification.
//!
//! The whole queue is one JSON document in the device store. Mutations hold
//! the queue lock across read/modify/write; reads are unlocked and advisory.

mod retry;

use std::cmp::Reverse;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::clock::Clock;
use crate::config::QueueConfig;
use crate::error::Result;
use crate::monitoring;
use crate::store::{self, KeyValueStore};

pub use retry::{ATTEMPTS_PREFIX, RetryCounters};

pub const QUEUE_KEY: &str = "screenshotVerification.queue";
const QUEUE_LOCK: &str = "screenshotVerification.queue";
const QUEUE_DOC_VERSION: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct VerificationAsset {
    pub asset_key: String,
    pub snapshot_epoch: i64,
    pub queued_time: i64,
    /// Newest verified snapshot of the asset when this entry was queued.
    #[serde(default)]
    pub most_recent_verification_epoch: i64,
}

impl VerificationAsset {
    pub fn new(
        asset_key: impl Into<String>,
        snapshot_epoch: i64,
        queued_time: i64,
        most_recent_verification_epoch: i64,
    ) -> Self {
        Self {
            asset_key: asset_key.into(),
            snapshot_epoch,
            queued_time,
            most_recent_verification_epoch,
        }
    }

    /// Larger means more overdue.
    pub fn priority(&self) -> i64 {
        self.snapshot_epoch
            .saturating_sub(self.most_recent_verification_epoch)
    }

    pub fn same_item(&self, asset_key: &str, snapshot_epoch: i64) -> bool {
        self.asset_key == asset_key && self.snapshot_epoch == snapshot_epoch
    }
}

impl PartialEq for VerificationAsset {
    fn eq(&self, other: &Self) -> bool {
        self.same_item(&other.asset_key, other.snapshot_epoch)
    }
}

impl Eq for VerificationAsset {}

impl std::fmt::Display for VerificationAsset {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.asset_key, self.snapshot_epoch)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
struct QueueDoc {
    version: u32,
    #[serde(default)]
    entries: Vec<VerificationAsset>,
}

#[derive(Debug, Clone)]
pub struct QueueLimits {
    pub capacity: usize,
    pub max_age_secs: i64,
    pub max_attempts: u32,
    pub lock_timeout: Duration,
}

impl From<&QueueConfig> for QueueLimits {
    fn from(cfg: &QueueConfig) -> Self {
        Self {
            capacity: cfg.capacity,
            max_age_secs: cfg.max_age_secs,
            max_attempts: cfg.max_attempts,
            lock_timeout: cfg.lock_timeout(),
        }
    }
}

impl Default for QueueLimits {
    fn default() -> Self {
        Self::from(&QueueConfig::default())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Eviction {
    Expired,
    Overflow,
}

impl Eviction {
    fn as_str(self) -> &'static str {
        match self {
            Self::Expired => "expired",
            Self::Overflow => "overflow",
        }
    }
}

#[derive(Clone)]
pub struct VerificationQueue {
    store: Arc<dyn KeyValueStore>,
    retries: RetryCounters,
    clock: Arc<dyn Clock>,
    limits: QueueLimits,
}

impl VerificationQueue {
    pub fn new(
        store: Arc<dyn KeyValueStore>,
        ephemeral: Arc<dyn KeyValueStore>,
        clock: Arc<dyn Clock>,
        limits: QueueLimits,
    ) -> Self {
        Self {
            store,
            retries: RetryCounters::new(ephemeral),
            clock,
            limits,
        }
    }

    pub fn limits(&self) -> &QueueLimits {
        &self.limits
    }

    /// Queue `asset` unless its retry budget is spent. Already-queued items
    /// are left where they are.
    pub fn add(&self, asset: VerificationAsset) -> Result<bool> {
        if !self.has_attempts_remaining(&asset)? {
            tracing::info!(item = %asset, "not queueing: no attempts remaining");
            return Ok(false);
        }
        self.mutate(|entries| {
            if entries.contains(&asset) {
                tracing::debug!(item = %asset, "already queued");
            } else {
                tracing::info!(item = %asset, priority = asset.priority(), "queued for verification");
                entries.push(asset);
            }
            true
        })
    }

    /// Remove `asset` (if queued) and forget its attempts.
    pub fn remove(&self, asset: &VerificationAsset) -> Result<bool> {
        let removed = self.mutate(|entries| {
            let before = entries.len();
            entries.retain(|e| e != asset);
            before != entries.len()
        })?;
        self.retries.clear(asset)?;
        if removed {
            tracing::info!(item = %asset, "removed from verification queue");
        }
        Ok(removed)
    }

    pub fn remove_all(&self) -> Result<usize> {
        let _lock = self.store.lock(QUEUE_LOCK, self.limits.lock_timeout)?;
        let removed = self.read_doc()?.entries.len();
        self.store.clear(QUEUE_KEY)?;
        let counters = self.retries.clear_all()?;
        monitoring::set_queue_depth(0);
        tracing::info!(removed, counters, "cleared verification queue");
        Ok(removed)
    }

    /// Highest-priority entry that still has attempts left.
    pub fn next(&self) -> Result<Option<VerificationAsset>> {
        for e in self.list()? {
            if self.has_attempts_remaining(&e)? {
                return Ok(Some(e));
            }
        }
        Ok(None)
    }

    pub fn count(&self) -> Result<usize> {
        Ok(self.list()?.len())
    }

    /// Current entries in priority order, pruned and capped but not persisted.
    pub fn list(&self) -> Result<Vec<VerificationAsset>> {
        let mut entries = self.read_doc()?.entries;
        self.normalize(&mut entries);
        Ok(entries)
    }

    /// Move `asset` to the back of its priority band with a fresh
    /// `queued_time`. Its attempt counter is kept.
    pub fn requeue(&self, asset: &VerificationAsset) -> Result<()> {
        let now = self.clock.now();
        let mut fresh = asset.clone();
        fresh.queued_time = now;
        self.mutate(|entries| {
            entries.retain(|e| e != asset);
            entries.push(fresh);
        })?;
        tracing::info!(item = %asset, queued_time = now, "requeued for another attempt");
        Ok(())
    }

    pub fn increment_attempts(&self, asset: &VerificationAsset) -> Result<u32> {
        self.retries.increment(asset)
    }

    pub fn attempts(&self, asset: &VerificationAsset) -> Result<u32> {
        self.retries.get(asset)
    }

    pub fn has_attempts_remaining(&self, asset: &VerificationAsset) -> Result<bool> {
        Ok(self.attempts(asset)? < self.limits.max_attempts)
    }

    pub fn contains(&self, asset_key: &str, snapshot_epoch: i64) -> Result<bool> {
        Ok(self
            .list()?
            .iter()
            .any(|e| e.same_item(asset_key, snapshot_epoch)))
    }

    fn read_doc(&self) -> Result<QueueDoc> {
        let doc: Option<QueueDoc> = store::read_json(self.store.as_ref(), QUEUE_KEY)?;
        Ok(doc.unwrap_or(QueueDoc {
            version: QUEUE_DOC_VERSION,
            entries: Vec::new(),
        }))
    }

    fn write_doc(&self, entries: Vec<VerificationAsset>) -> Result<()> {
        let doc = QueueDoc {
            version: QUEUE_DOC_VERSION,
            entries,
        };
        store::write_json(self.store.as_ref(), QUEUE_KEY, &doc)
    }

    /// Prune expired entries, sort by priority (stable), cap to capacity.
    fn normalize(&self, entries: &mut Vec<VerificationAsset>) -> Vec<(VerificationAsset, Eviction)> {
        let now = self.clock.now();
        let mut evicted = Vec::new();
        let mut kept = Vec::with_capacity(entries.len());
        for e in entries.drain(..) {
            if now.saturating_sub(e.queued_time) > self.limits.max_age_secs {
                evicted.push((e, Eviction::Expired));
            } else {
                kept.push(e);
            }
        }
        kept.sort_by_key(|e| Reverse(e.priority()));
        if kept.len() > self.limits.capacity {
            for e in kept.split_off(self.limits.capacity) {
                evicted.push((e, Eviction::Overflow));
            }
        }
        *entries = kept;
        evicted
    }

    fn mutate<R>(&self, f: impl FnOnce(&mut Vec<VerificationAsset>) -> R) -> Result<R> {
        let lock = self.store.lock(QUEUE_LOCK, self.limits.lock_timeout)?;
        let mut entries = self.read_doc()?.entries;
        let mut evicted = self.normalize(&mut entries);
        let out = f(&mut entries);
        evicted.extend(self.normalize(&mut entries));
        let depth = entries.len();
        self.write_doc(entries)?;
        drop(lock);

        for (e, why) in evicted {
            tracing::warn!(item = %e, reason = why.as_str(), priority = e.priority(), "dropped from verification queue");
            monitoring::queue_dropped(why.as_str());
            self.retries.clear(&e)?;
        }
        monitoring::set_queue_depth(depth);
        Ok(out)
    }
}
