use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use bootproof_macros::Stage;

use crate::clock::Clock;
use crate::driver::HypervisorDriver;
use crate::error::{Error, Result};
use crate::features::FeatureFlags;
use crate::model::{ScriptOutcome, StageResult};
use crate::transaction::Stage;
use crate::verification::VerificationContext;

#[Stage(id = "verification.screenshot", label = "Capture screenshot")]
pub struct ScreenshotStage {
    pub driver: Arc<dyn HypervisorDriver>,
    pub clock: Arc<dyn Clock>,
    pub features: FeatureFlags,
    pub screenshots_dir: PathBuf,
}

impl ScreenshotStage {
    pub fn output_path(&self, asset_key: &str, snapshot_epoch: i64) -> PathBuf {
        self.screenshots_dir
            .join(asset_key)
            .join(format!("{snapshot_epoch}.png"))
    }
}

impl Stage<VerificationContext> for ScreenshotStage {
    fn commit(&mut self, ctx: &mut VerificationContext) -> Result<StageResult> {
        let vm = ctx
            .vm
            .clone()
            .ok_or_else(|| Error::msg("screenshot requires a running VM"))?;
        if !ctx.screenshot_delay.is_zero() {
            tracing::debug!(delay_secs = ctx.screenshot_delay.as_secs(), "waiting before screenshot");
            self.clock.sleep(ctx.screenshot_delay);
        }
        if !self.features.verification_enabled()? {
            return Ok(StageResult::skipped("screenshot verification was disabled during the run"));
        }

        let output = self.output_path(ctx.asset_key(), ctx.snapshot_epoch);
        if let Some(dir) = output.parent() {
            fs::create_dir_all(dir)?;
        }
        if let Err(e) = self.driver.screenshot(&ctx.connection, &vm, &output) {
            ctx.screenshot_failed = true;
            return Ok(StageResult::intermittent(format!("screenshot capture failed: {e}")));
        }
        ctx.screenshot_path = Some(output);

        let services = ctx.missing_services();
        let apps = ctx.missing_applications();
        if !services.is_empty() || !apps.is_empty() {
            let mut parts = Vec::new();
            if !services.is_empty() {
                parts.push(format!("missing services: {}", services.join(", ")));
            }
            if !apps.is_empty() {
                parts.push(format!("missing applications: {}", apps.join(", ")));
            }
            return Ok(StageResult::unrecoverable(parts.join("; ")));
        }
        Ok(StageResult::success())
    }
}

#[Stage(id = "verification.scripts", label = "Run verification scripts")]
pub struct RunScriptsStage {
    pub driver: Arc<dyn HypervisorDriver>,
}

impl Stage<VerificationContext> for RunScriptsStage {
    fn commit(&mut self, ctx: &mut VerificationContext) -> Result<StageResult> {
        let vm = ctx
            .vm
            .clone()
            .ok_or_else(|| Error::msg("scripts require a running VM"))?;
        let scripts = ctx.asset.verification.scripts.clone();
        let mut timed_out = Vec::new();
        let mut failed = Vec::new();
        for script in &scripts {
            let run = self
                .driver
                .run_script(&ctx.connection, &vm, script, ctx.script_timeout)?;
            let outcome = ScriptOutcome {
                name: script.name.clone(),
                exit_code: run.exit_code,
                timed_out: run.timed_out,
                output: run.output,
            };
            if outcome.timed_out {
                timed_out.push(outcome.name.clone());
            } else if !outcome.succeeded() {
                failed.push(outcome.name.clone());
            }
            ctx.script_outcomes.push(outcome);
        }
        if !failed.is_empty() {
            return Ok(StageResult::unrecoverable(format!(
                "scripts failed: {}",
                failed.join(", ")
            )));
        }
        if !timed_out.is_empty() {
            return Ok(StageResult::intermittent(format!(
                "scripts timed out: {}",
                timed_out.join(", ")
            )));
        }
        Ok(StageResult::success())
    }
}
