//! Single-flight execution of queued verifications.

mod in_progress;

use std::sync::Arc;

use crate::assets::{Asset, AssetRepository};
use crate::broker::{ConnectionBroker, ConnectionLease};
use crate::clock::Clock;
use crate::config::RunnerConfig;
use crate::error::Result;
use crate::process;
use crate::queue::VerificationAsset;
use crate::verification::{PipelineOutcome, VerificationPipeline};

pub use in_progress::{Begin, IN_PROGRESS_KEY, InProgressGuard, InProgressRepository, InProgressVerification};

#[derive(Debug)]
pub enum RunOutcome {
    /// Another live process owns the run slot.
    Busy(InProgressVerification),
    /// Nothing runnable is queued.
    Idle,
    Invalid {
        item: VerificationAsset,
        reason: String,
    },
    Ran {
        item: VerificationAsset,
        outcome: PipelineOutcome,
    },
}

enum Candidate {
    Valid(Asset),
    Invalid(String),
}

pub struct VerificationRunner {
    pipeline: VerificationPipeline,
    in_progress: InProgressRepository,
    broker: Arc<dyn ConnectionBroker>,
    connection_name: String,
    runner_cfg: RunnerConfig,
}

impl VerificationRunner {
    pub fn new(
        pipeline: VerificationPipeline,
        in_progress: InProgressRepository,
        broker: Arc<dyn ConnectionBroker>,
        connection_name: impl Into<String>,
        runner_cfg: RunnerConfig,
    ) -> Self {
        Self {
            pipeline,
            in_progress,
            broker,
            connection_name: connection_name.into(),
            runner_cfg,
        }
    }

    pub fn in_progress(&self) -> &InProgressRepository {
        &self.in_progress
    }

    /// Run the highest-priority valid queue entry, dequeueing invalid ones
    /// on the way.
    pub fn run_next(&self) -> Result<RunOutcome> {
        if let Some(rec) = self.in_progress.active()? {
            tracing::info!(asset = %rec.asset_key, epoch = rec.snapshot_epoch, pid = rec.pid, "a verification is already running");
            return Ok(RunOutcome::Busy(rec));
        }
        let queue = &self.pipeline.services().queue;
        for item in queue.list()? {
            if !queue.has_attempts_remaining(&item)? {
                tracing::info!(item = %item, "dropping entry with no attempts remaining");
                queue.remove(&item)?;
                continue;
            }
            match self.validate(&item)? {
                Candidate::Valid(asset) => return self.execute(item, asset),
                Candidate::Invalid(reason) => {
                    tracing::info!(item = %item, reason = %reason, "dropping invalid queue entry");
                    queue.remove(&item)?;
                }
            }
        }
        Ok(RunOutcome::Idle)
    }

    /// Run one snapshot now, whether or not it is queued.
    pub fn run_one(&self, asset_key: &str, snapshot_epoch: i64) -> Result<RunOutcome> {
        if let Some(rec) = self.in_progress.active()? {
            return Ok(RunOutcome::Busy(rec));
        }
        let svc = self.pipeline.services();
        let queued = svc
            .queue
            .list()?
            .into_iter()
            .find(|e| e.same_item(asset_key, snapshot_epoch));
        let item = match queued {
            Some(item) => item,
            None => {
                let mrve = if svc.assets.exists(asset_key)? {
                    svc.assets.get(asset_key)?.most_recent_verified_epoch()
                } else {
                    0
                };
                VerificationAsset::new(asset_key, snapshot_epoch, svc.clock.now(), mrve)
            }
        };
        match self.validate(&item)? {
            Candidate::Valid(asset) => self.execute(item, asset),
            Candidate::Invalid(reason) => {
                svc.queue.remove(&item)?;
                Ok(RunOutcome::Invalid { item, reason })
            }
        }
    }

    /// Flag the running verification of `asset_key` for cancellation.
    /// Returns `false`, and sets nothing, when that asset is not running.
    pub fn request_cancel(&self, asset_key: &str) -> Result<bool> {
        match self.in_progress.active()? {
            Some(rec) if rec.asset_key == asset_key => {
                self.pipeline.services().cancel.request(asset_key)?;
                Ok(true)
            }
            _ => {
                tracing::info!(asset = asset_key, "no running verification to cancel");
                Ok(false)
            }
        }
    }

    fn validate(&self, item: &VerificationAsset) -> Result<Candidate> {
        let svc = self.pipeline.services();
        if !svc.assets.exists(&item.asset_key)? {
            return Ok(Candidate::Invalid("asset no longer exists".into()));
        }
        let asset = svc.assets.get(&item.asset_key)?;
        if asset.removing || asset.archived {
            return Ok(Candidate::Invalid("asset is being removed or archived".into()));
        }
        if !asset.has_local_point(item.snapshot_epoch) {
            return Ok(Candidate::Invalid("recovery point no longer exists locally".into()));
        }
        if !svc.features.verification_enabled()? {
            return Ok(Candidate::Invalid("screenshot verification is disabled".into()));
        }
        if let Some(why) = asset.unsupported_reason() {
            return Ok(Candidate::Invalid(format!("asset does not support verification: {why}")));
        }
        Ok(Candidate::Valid(asset))
    }

    fn execute(&self, item: VerificationAsset, asset: Asset) -> Result<RunOutcome> {
        let svc = self.pipeline.services();
        let delay_secs = asset
            .verification
            .wait_seconds
            .unwrap_or(self.runner_cfg.default_delay_secs);
        let ready_secs = asset
            .verification
            .error_seconds
            .unwrap_or(self.runner_cfg.ready_timeout_secs);
        let scripts = asset.verification.scripts.len() as u64;
        let record = InProgressVerification {
            asset_key: item.asset_key.clone(),
            snapshot_epoch: item.snapshot_epoch,
            start_time: svc.clock.now(),
            delay_secs,
            pid: process::current_pid(),
            timeout_secs: ready_secs + delay_secs + scripts * self.runner_cfg.script_timeout_secs,
        };
        let _guard = match self.in_progress.begin(record)? {
            Begin::Started(guard) => guard,
            Begin::Busy(rec) => return Ok(RunOutcome::Busy(rec)),
        };

        // A request that raced the end of an earlier run must not hit this one.
        if svc.cancel.is_requested(&item.asset_key)? {
            tracing::info!(item = %item, "discarding cancel request left from an earlier run");
            svc.cancel.clear(&item.asset_key)?;
        }

        let attempt = svc.queue.increment_attempts(&item)?;
        tracing::info!(item = %item, attempt, "verification attempt");

        let lease = match ConnectionLease::acquire(self.broker.clone(), &self.connection_name, &item.asset_key) {
            Ok(lease) => lease,
            Err(e) => {
                tracing::warn!(item = %item, connection = %self.connection_name, error = %e, "hypervisor connection unavailable");
                let outcome = self.pipeline.fail_without_connection(&item, asset, &e.to_string())?;
                return Ok(RunOutcome::Ran { item, outcome });
            }
        };
        let outcome = self.pipeline.run(&item, asset, lease.connection());
        if let Err(e) = lease.release() {
            tracing::warn!(item = %item, error = %e, "failed to release hypervisor connection");
        }
        Ok(RunOutcome::Ran { item, outcome: outcome? })
    }
}
