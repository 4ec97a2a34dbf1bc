//! The screenshot verification pipeline and its post-result handling.

mod context;
pub mod grade;
pub mod stages;

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use regex::Regex;
use sha2::{Digest, Sha256};

use crate::assets::{Asset, AssetRepository};
use crate::cancel::CancelFlags;
use crate::clock::Clock;
use crate::config::RunnerConfig;
use crate::driver::{self, HypervisorConnection, HypervisorDriver};
use crate::error::Result;
use crate::features::FeatureFlags;
use crate::model::{ScreenshotResult, StageResult, VerificationResultType};
use crate::monitoring;
use crate::notify::{EvidenceUploader, NotificationContext, Notifier};
use crate::queue::{VerificationAsset, VerificationQueue};
use crate::status::{StatusBoard, StatusRecord};
use crate::store::KeyValueStore;
use crate::transaction::{FailurePolicy, Halt, StageRecord, Transaction, TransactionReport, TransactionSink};

pub use context::VerificationContext;
use stages::{
    AssetLockStage, CleanupStaleStage, CreateCloneStage, HideFilesStage, NotifyStage, PreflightStage,
    ProvisionVmStage, RunScriptsStage, ScreenshotStage, UploadEvidenceStage, WaitForReadyStage,
};

/// Stage id used when no connection could be obtained for a run.
pub const CONNECTION_STAGE: &str = "verification.connection";

#[derive(Clone)]
pub struct PipelineServices {
    pub driver: Arc<dyn HypervisorDriver>,
    pub assets: Arc<dyn AssetRepository>,
    pub queue: VerificationQueue,
    pub features: FeatureFlags,
    pub cancel: CancelFlags,
    pub status: StatusBoard,
    /// Where per-asset exclusivity locks live.
    pub locks: Arc<dyn KeyValueStore>,
    pub notifier: Arc<dyn Notifier>,
    pub uploader: Arc<dyn EvidenceUploader>,
    pub clock: Arc<dyn Clock>,
    pub sink: Arc<dyn TransactionSink>,
}

#[derive(Debug, Clone)]
pub struct PipelineOptions {
    pub runner: RunnerConfig,
    pub screenshots_dir: PathBuf,
    pub notify_success: bool,
    pub asset_lock_timeout: Duration,
}

#[derive(Debug)]
pub enum PipelineOutcome {
    Cancelled {
        report: TransactionReport,
    },
    Finished {
        result: VerificationResultType,
        requeued: bool,
        report: TransactionReport,
    },
}

impl PipelineOutcome {
    pub fn result(&self) -> Option<VerificationResultType> {
        match self {
            Self::Cancelled { .. } => None,
            Self::Finished { result, .. } => Some(*result),
        }
    }

    pub fn report(&self) -> &TransactionReport {
        match self {
            Self::Cancelled { report } | Self::Finished { report, .. } => report,
        }
    }
}

pub struct VerificationPipeline {
    svc: PipelineServices,
    opts: PipelineOptions,
    hidden: Vec<Regex>,
}

impl VerificationPipeline {
    pub fn new(svc: PipelineServices, opts: PipelineOptions) -> Result<Self> {
        let hidden = driver::compile_patterns(&opts.runner.hidden_files)?;
        Ok(Self { svc, opts, hidden })
    }

    pub fn services(&self) -> &PipelineServices {
        &self.svc
    }

    /// Verify `item` on `conn` and apply the resulting queue, evidence,
    /// notification and status updates.
    pub fn run(&self, item: &VerificationAsset, asset: Asset, conn: &HypervisorConnection) -> Result<PipelineOutcome> {
        let mut ctx = VerificationContext::new(
            asset,
            conn.clone(),
            item.snapshot_epoch,
            self.svc.clock.now(),
            &self.opts.runner,
        );
        tracing::info!(item = %item, connection = %conn.name, "starting screenshot verification");

        let report = self.transaction(&ctx).commit(&mut ctx);
        if let Halt::Cancelled { before } = report.halt {
            tracing::info!(item = %item, before, "verification cancelled");
            self.svc.queue.remove(item)?;
            return Ok(PipelineOutcome::Cancelled { report });
        }
        self.conclude(item, &ctx, report)
    }

    /// Grade a run that never reached the hypervisor because its connection
    /// could not be obtained.
    pub fn fail_without_connection(&self, item: &VerificationAsset, asset: Asset, reason: &str) -> Result<PipelineOutcome> {
        let conn = HypervisorConnection::local("unavailable");
        let ctx = VerificationContext::new(
            asset,
            conn,
            item.snapshot_epoch,
            self.svc.clock.now(),
            &self.opts.runner,
        );
        let report = TransactionReport {
            name: "verification".to_string(),
            records: vec![StageRecord {
                id: CONNECTION_STAGE,
                result: Some(StageResult::intermittent(format!(
                    "could not obtain a hypervisor connection: {reason}"
                ))),
                error: None,
                elapsed_ms: 0,
            }],
            halt: Halt::Failed { stage: CONNECTION_STAGE },
            elapsed_ms: 0,
        };
        self.conclude(item, &ctx, report)
    }

    fn transaction(&self, ctx: &VerificationContext) -> Transaction<VerificationContext> {
        let svc = &self.svc;
        let check = svc.cancel.clone();
        let clear = svc.cancel.clone();
        let mut tx = Transaction::new("verification", FailurePolicy::StopOnFailure, svc.sink.clone())
            .cancel_when(move |ctx: &VerificationContext| match check.is_requested(ctx.asset_key()) {
                Ok(requested) => requested,
                Err(e) => {
                    tracing::warn!(asset = ctx.asset_key(), error = %e, "could not read cancel flag");
                    false
                }
            })
            .on_cancel(move |ctx: &mut VerificationContext| {
                if let Err(e) = clear.clear(ctx.asset_key()) {
                    tracing::warn!(asset = ctx.asset_key(), error = %e, "could not clear cancel flag");
                }
            })
            .stage(PreflightStage {
                driver: svc.driver.clone(),
                features: svc.features.clone(),
            })
            .stage(CleanupStaleStage {
                driver: svc.driver.clone(),
            })
            .stage(AssetLockStage {
                locks: svc.locks.clone(),
                timeout: self.opts.asset_lock_timeout,
                held: None,
            })
            .stage(CreateCloneStage {
                driver: svc.driver.clone(),
            })
            .stage(HideFilesStage {
                driver: svc.driver.clone(),
                patterns: self.hidden.clone(),
            })
            .stage(ProvisionVmStage {
                driver: svc.driver.clone(),
                default_cpus: self.opts.runner.default_cpus(),
                default_ram_mib: self.opts.runner.vm_ram_mib,
            })
            .stage(WaitForReadyStage {
                driver: svc.driver.clone(),
                clock: svc.clock.clone(),
            })
            .stage(ScreenshotStage {
                driver: svc.driver.clone(),
                clock: svc.clock.clone(),
                features: svc.features.clone(),
                screenshots_dir: self.opts.screenshots_dir.clone(),
            });
        if !ctx.asset.verification.scripts.is_empty() {
            tx = tx.stage(RunScriptsStage {
                driver: svc.driver.clone(),
            });
        }
        tx
    }

    fn conclude(&self, item: &VerificationAsset, ctx: &VerificationContext, report: TransactionReport) -> Result<PipelineOutcome> {
        let result = grade::aggregate(&report.records);
        let deciding = grade::deciding_record(&report.records);
        let message = deciding.and_then(StageRecord::message).map(str::to_string);
        tracing::info!(
            item = %item,
            result = %result,
            stage = deciding.map(|r| r.id).unwrap_or("none"),
            message = message.as_deref().unwrap_or(""),
            "verification graded"
        );

        let queue = &self.svc.queue;
        let requeued = if result == VerificationResultType::FailureIntermittent && queue.has_attempts_remaining(item)? {
            queue.requeue(item)?;
            true
        } else {
            queue.remove(item)?;
            false
        };

        if !requeued {
            self.record_result(ctx, result, message)?;
        }
        Ok(PipelineOutcome::Finished {
            result,
            requeued,
            report,
        })
    }

    fn record_result(&self, ctx: &VerificationContext, result: VerificationResultType, message: Option<String>) -> Result<()> {
        let svc = &self.svc;
        let now = svc.clock.now();
        let elapsed_secs = (now - ctx.started_at).max(0);
        let screenshot_path = ctx.screenshot_path.clone().filter(|p| p.is_file());
        let screenshot_sha256 = match screenshot_path.as_deref().map(sha256_file).transpose() {
            Ok(sum) => sum,
            Err(e) => {
                tracing::warn!(asset = ctx.asset_key(), error = %e, "could not hash screenshot");
                None
            }
        };

        let evidence = ScreenshotResult {
            result,
            snapshot_epoch: ctx.snapshot_epoch,
            captured_at: now,
            screenshot_path: screenshot_path.clone(),
            screenshot_sha256: screenshot_sha256.clone(),
            agent_responded: ctx.agent_responded,
            pending_reboot: ctx.pending_reboot,
            screenshot_failed: ctx.screenshot_failed,
            missing_services: ctx.missing_services(),
            missing_applications: ctx.missing_applications(),
            scripts: ctx.script_outcomes.clone(),
            message: message.clone(),
            elapsed_secs,
        };
        if let Err(e) = svc.assets.record_screenshot(ctx.asset_key(), &evidence) {
            tracing::warn!(asset = ctx.asset_key(), epoch = ctx.snapshot_epoch, error = %e, "could not store screenshot result");
        }
        monitoring::verification_finished(result, elapsed_secs as f64);

        let mut note = NotificationContext {
            asset_key: ctx.asset.key_name.clone(),
            hostname: ctx.asset.hostname.clone(),
            snapshot_epoch: ctx.snapshot_epoch,
            result,
            message: message.clone(),
            captured_at: now,
            screenshot_path,
            screenshot_sha256,
            missing_services: evidence.missing_services,
            missing_applications: evidence.missing_applications,
        };
        let report = Transaction::new("notification", FailurePolicy::ContinueOnFailure, svc.sink.clone())
            .stage(NotifyStage {
                notifier: svc.notifier.clone(),
                notify_success: self.opts.notify_success,
            })
            .stage(UploadEvidenceStage {
                uploader: svc.uploader.clone(),
            })
            .commit(&mut note);
        for failed in report.failed_stages() {
            tracing::warn!(
                asset = ctx.asset_key(),
                stage = failed.id,
                error = failed.message().unwrap_or(""),
                "notification stage failed"
            );
            monitoring::notification_failed(failed.id);
        }

        svc.status.record(&StatusRecord {
            asset_key: ctx.asset.key_name.clone(),
            snapshot_epoch: ctx.snapshot_epoch,
            status: result.into(),
            result,
            updated_at: now,
            message,
        })
    }
}

pub fn sha256_file(path: &Path) -> Result<String> {
    let bytes = fs::read(path)?;
    Ok(hex::encode(Sha256::digest(&bytes)))
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::assets::{MemoryAssetRepository, OsFamily, RecoveryPoint, ScriptSpec};
    use crate::clock::ManualClock;
    use crate::driver::{SimulatedDriver, SimulatedPlan};
    use crate::error::Error;
    use crate::queue::QueueLimits;
    use crate::store::MemoryStore;
    use crate::transaction::TracingSink;

    const EPOCH: i64 = 1_700_000_000;

    #[derive(Default)]
    struct RecordingNotifier {
        seen: Mutex<Vec<VerificationResultType>>,
        fail: bool,
    }

    impl Notifier for RecordingNotifier {
        fn notify(&self, n: &NotificationContext) -> Result<()> {
            self.seen.lock().expect("lock").push(n.result);
            if self.fail {
                return Err(Error::msg("smtp relay refused the message"));
            }
            Ok(())
        }
    }

    struct NoUpload;

    impl EvidenceUploader for NoUpload {
        fn upload(&self, _n: &NotificationContext) -> Result<()> {
            Ok(())
        }
    }

    struct Harness {
        pipeline: VerificationPipeline,
        driver: Arc<SimulatedDriver>,
        assets: Arc<MemoryAssetRepository>,
        notifier: Arc<RecordingNotifier>,
        _dir: tempfile::TempDir,
    }

    fn asset() -> Asset {
        let mut a = Asset::new("agent-1", OsFamily::Windows);
        a.hostname = "fileserver".into();
        a.verification.wait_seconds = Some(0);
        a.add_point(RecoveryPoint::local(EPOCH));
        a
    }

    fn harness(plan: SimulatedPlan, notifier: RecordingNotifier, asset: Asset) -> Harness {
        let dir = tempfile::tempdir().expect("tempdir");
        let store: Arc<dyn KeyValueStore> = Arc::new(MemoryStore::new());
        let clock = Arc::new(ManualClock::new(EPOCH + 3_600));
        let driver = Arc::new(SimulatedDriver::new(plan));
        let assets = Arc::new(MemoryAssetRepository::with_assets([asset]));
        let notifier = Arc::new(notifier);
        let svc = PipelineServices {
            driver: driver.clone(),
            assets: assets.clone(),
            queue: VerificationQueue::new(store.clone(), store.clone(), clock.clone(), QueueLimits::default()),
            features: FeatureFlags::new(store.clone()),
            cancel: CancelFlags::new(store.clone()),
            status: StatusBoard::new(store.clone()),
            locks: store,
            notifier: notifier.clone(),
            uploader: Arc::new(NoUpload),
            clock,
            sink: Arc::new(TracingSink),
        };
        let opts = PipelineOptions {
            runner: RunnerConfig::default(),
            screenshots_dir: dir.path().to_path_buf(),
            notify_success: true,
            asset_lock_timeout: Duration::from_millis(50),
        };
        Harness {
            pipeline: VerificationPipeline::new(svc, opts).expect("pipeline"),
            driver,
            assets,
            notifier,
            _dir: dir,
        }
    }

    fn item() -> VerificationAsset {
        VerificationAsset::new("agent-1", EPOCH, EPOCH + 60, 0)
    }

    fn run(h: &Harness) -> PipelineOutcome {
        let a = h.assets.get("agent-1").expect("asset");
        h.pipeline
            .run(&item(), a, &HypervisorConnection::local("local"))
            .expect("run")
    }

    #[test]
    fn successful_run_records_hashed_evidence() {
        let h = harness(SimulatedPlan::default(), RecordingNotifier::default(), asset());
        let out = run(&h);
        assert_eq!(out.result(), Some(VerificationResultType::Success));

        let stored = h.assets.get("agent-1").expect("asset");
        let shot = stored
            .recovery_point(EPOCH)
            .and_then(|p| p.screenshot.clone())
            .expect("screenshot result");
        assert!(shot.is_success());
        assert_eq!(shot.screenshot_sha256.as_deref().map(str::len), Some(64));
        assert!(h.driver.called("destroy_vm"));
        assert!(h.driver.called("destroy_clone"));
        assert!(!out.report().records.iter().any(|r| r.id == RunScriptsStage::ID));
    }

    #[test]
    fn final_capture_failure_is_kept_on_the_evidence() {
        let plan = SimulatedPlan {
            screenshot_fails: true,
            ..SimulatedPlan::default()
        };
        let h = harness(plan, RecordingNotifier::default(), asset());
        let queue = &h.pipeline.services().queue;
        for _ in 0..3 {
            queue.increment_attempts(&item()).expect("attempt");
        }
        let out = run(&h);
        assert!(matches!(
            out,
            PipelineOutcome::Finished {
                result: VerificationResultType::FailureIntermittent,
                requeued: false,
                ..
            }
        ));
        let shot = h
            .assets
            .get("agent-1")
            .expect("asset")
            .recovery_point(EPOCH)
            .and_then(|p| p.screenshot.clone())
            .expect("screenshot result");
        assert!(shot.screenshot_failed);
        assert!(shot.screenshot_path.is_none());
    }

    #[test]
    fn clone_failure_is_unrecoverable_and_skips_boot() {
        let plan = SimulatedPlan {
            clone_fails: true,
            ..SimulatedPlan::default()
        };
        let h = harness(plan, RecordingNotifier::default(), asset());
        let out = run(&h);
        assert_eq!(out.result(), Some(VerificationResultType::FailureUnrecoverable));
        assert!(!h.driver.called("create_vm"));
        assert!(!h.driver.called("destroy_clone"));
        let status = h.pipeline.services().status.failure_marker("agent-1").expect("marker");
        assert!(status.is_some_and(|m| m.contains("clone failed")));
    }

    #[test]
    fn panicking_stage_is_graded_unrecoverable_and_cleaned_up() {
        let plan = SimulatedPlan {
            panic_on: Some("start_vm"),
            ..SimulatedPlan::default()
        };
        let h = harness(plan, RecordingNotifier::default(), asset());
        let out = run(&h);
        assert_eq!(out.result(), Some(VerificationResultType::FailureUnrecoverable));
        assert!(h.driver.called("destroy_clone"));
    }

    #[test]
    fn pending_reboot_is_skipped() {
        let mut plan = SimulatedPlan::default();
        plan.guest.pending_reboot = true;
        let h = harness(plan, RecordingNotifier::default(), asset());
        assert_eq!(run(&h).result(), Some(VerificationResultType::Skipped));
        assert!(!h.driver.called("screenshot"));
    }

    #[test]
    fn failing_script_is_unrecoverable() {
        let plan = SimulatedPlan {
            script_exit_code: 2,
            ..SimulatedPlan::default()
        };
        let mut a = asset();
        a.verification.scripts = vec![ScriptSpec {
            name: "sql-check".into(),
            path: "/scripts/sql-check.ps1".into(),
        }];
        let h = harness(plan, RecordingNotifier::default(), a);
        let out = run(&h);
        assert_eq!(out.result(), Some(VerificationResultType::FailureUnrecoverable));
        let shot = h
            .assets
            .get("agent-1")
            .expect("asset")
            .recovery_point(EPOCH)
            .and_then(|p| p.screenshot.clone())
            .expect("screenshot result");
        assert_eq!(shot.scripts.len(), 1);
        assert_eq!(shot.scripts[0].exit_code, Some(2));
    }

    #[test]
    fn notification_failure_does_not_change_result() {
        let notifier = RecordingNotifier {
            fail: true,
            ..RecordingNotifier::default()
        };
        let h = harness(SimulatedPlan::default(), notifier, asset());
        assert_eq!(run(&h).result(), Some(VerificationResultType::Success));
        assert_eq!(*h.notifier.seen.lock().expect("lock"), vec![VerificationResultType::Success]);
        let status = h.pipeline.services().status.get("agent-1").expect("status").expect("record");
        assert_eq!(status.result, VerificationResultType::Success);
    }

    #[test]
    fn missing_connection_requeues_while_attempts_remain() {
        let h = harness(SimulatedPlan::default(), RecordingNotifier::default(), asset());
        let a = h.assets.get("agent-1").expect("asset");
        let out = h
            .pipeline
            .fail_without_connection(&item(), a, "broker returned 503")
            .expect("run");
        match out {
            PipelineOutcome::Finished { result, requeued, .. } => {
                assert_eq!(result, VerificationResultType::FailureIntermittent);
                assert!(requeued);
            }
            other => panic!("unexpected outcome {other:?}"),
        }
        assert!(h.pipeline.services().queue.contains("agent-1", EPOCH).expect("contains"));
        assert!(h.notifier.seen.lock().expect("lock").is_empty());
    }
}
