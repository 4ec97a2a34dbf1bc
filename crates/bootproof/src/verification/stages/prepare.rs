use std::sync::Arc;
use std::time::Duration;

use bootproof_macros::Stage;
use regex::Regex;

use crate::driver::HypervisorDriver;
use crate::error::{Error, Result};
use crate::features::FeatureFlags;
use crate::model::StageResult;
use crate::store::{KeyValueStore, StoreLock};
use crate::transaction::Stage;
use crate::verification::VerificationContext;

#[Stage(id = "verification.preflight", label = "Check asset and hypervisor")]
pub struct PreflightStage {
    pub driver: Arc<dyn HypervisorDriver>,
    pub features: FeatureFlags,
}

impl Stage<VerificationContext> for PreflightStage {
    fn commit(&mut self, ctx: &mut VerificationContext) -> Result<StageResult> {
        if !self.features.verification_enabled()? {
            return Ok(StageResult::skipped("screenshot verification is disabled"));
        }
        let asset = &ctx.asset;
        if asset.removing || asset.archived {
            return Ok(StageResult::skipped("asset is no longer eligible for verification"));
        }
        if let Some(why) = asset.unsupported_reason() {
            return Ok(StageResult::unrecoverable(format!("incompatible asset: {why}")));
        }
        if !asset.has_local_point(ctx.snapshot_epoch) {
            return Ok(StageResult::skipped(format!(
                "recovery point {} no longer exists locally",
                ctx.snapshot_epoch
            )));
        }
        if let Err(e) = self.driver.check_connection(&ctx.connection) {
            return Ok(StageResult::intermittent(format!(
                "hypervisor connection '{}' unavailable: {e}",
                ctx.connection.name
            )));
        }
        Ok(StageResult::success())
    }
}

#[Stage(id = "verification.cleanup_stale", label = "Remove stale verification artifacts")]
pub struct CleanupStaleStage {
    pub driver: Arc<dyn HypervisorDriver>,
}

impl Stage<VerificationContext> for CleanupStaleStage {
    fn commit(&mut self, ctx: &mut VerificationContext) -> Result<StageResult> {
        match self.driver.cleanup_stale(&ctx.connection, ctx.asset_key()) {
            Ok(0) => Ok(StageResult::success()),
            Ok(n) => {
                tracing::info!(asset = ctx.asset_key(), removed = n, "removed stale verification artifacts");
                Ok(StageResult::success())
            }
            Err(e) => Ok(StageResult::intermittent(format!(
                "could not remove stale artifacts: {e}"
            ))),
        }
    }
}

#[Stage(id = "verification.asset_lock", label = "Lock asset")]
pub struct AssetLockStage {
    pub locks: Arc<dyn KeyValueStore>,
    pub timeout: Duration,
    pub held: Option<StoreLock>,
}

impl AssetLockStage {
    pub fn lock_name(asset_key: &str) -> String {
        format!("asset.{asset_key}")
    }
}

impl Stage<VerificationContext> for AssetLockStage {
    fn commit(&mut self, ctx: &mut VerificationContext) -> Result<StageResult> {
        match self.locks.lock(&Self::lock_name(ctx.asset_key()), self.timeout) {
            Ok(lock) => {
                self.held = Some(lock);
                Ok(StageResult::success())
            }
            Err(Error::LockTimeout(_)) => Ok(StageResult::intermittent(format!(
                "asset {} is locked by another operation",
                ctx.asset_key()
            ))),
            Err(e) => Err(e),
        }
    }

    fn cleanup(&mut self, _ctx: &mut VerificationContext) -> Result<()> {
        if let Some(lock) = self.held.take() {
            lock.release();
        }
        Ok(())
    }
}

#[Stage(id = "verification.create_clone", label = "Clone recovery point")]
pub struct CreateCloneStage {
    pub driver: Arc<dyn HypervisorDriver>,
}

impl CreateCloneStage {
    pub fn clone_name(asset_key: &str, snapshot_epoch: i64) -> String {
        format!("bootproof-{asset_key}-{snapshot_epoch}")
    }
}

impl Stage<VerificationContext> for CreateCloneStage {
    fn commit(&mut self, ctx: &mut VerificationContext) -> Result<StageResult> {
        let name = Self::clone_name(ctx.asset_key(), ctx.snapshot_epoch);
        match self
            .driver
            .create_clone(&ctx.connection, &ctx.asset, ctx.snapshot_epoch, &name)
        {
            Ok(clone) => {
                tracing::debug!(clone = %clone.name, mount = ?clone.mount_path, "created clone");
                ctx.clone = Some(clone);
                Ok(StageResult::success())
            }
            Err(e) => Ok(StageResult::unrecoverable(format!("clone failed: {e}"))),
        }
    }

    fn cleanup(&mut self, ctx: &mut VerificationContext) -> Result<()> {
        let Some(clone) = ctx.clone.take() else {
            return Ok(());
        };
        self.driver.destroy_clone(&ctx.connection, &clone)
    }
}

#[Stage(id = "verification.hide_files", label = "Hide sensitive files")]
pub struct HideFilesStage {
    pub driver: Arc<dyn HypervisorDriver>,
    pub patterns: Vec<Regex>,
}

impl Stage<VerificationContext> for HideFilesStage {
    fn commit(&mut self, ctx: &mut VerificationContext) -> Result<StageResult> {
        let Some(clone) = ctx.clone.as_ref() else {
            return Ok(StageResult::unrecoverable("no clone to prepare"));
        };
        match self.driver.hide_files(clone, &self.patterns) {
            Ok(n) => {
                if n > 0 {
                    tracing::info!(clone = %clone.name, hidden = n, "hid files in clone");
                }
                Ok(StageResult::success())
            }
            Err(e) => Ok(StageResult::unrecoverable(format!("could not prepare clone: {e}"))),
        }
    }
}
