use std::path::PathBuf;
use std::time::Duration;

use crate::assets::Asset;
use crate::config::RunnerConfig;
use crate::driver::{CloneHandle, GuestStatus, HypervisorConnection, VmHandle};
use crate::model::ScriptOutcome;

/// State of one verification run, threaded through every stage.
#[derive(Debug)]
pub struct VerificationContext {
    pub asset: Asset,
    pub connection: HypervisorConnection,
    pub snapshot_epoch: i64,
    pub started_at: i64,

    pub ready_timeout: Duration,
    pub ready_poll: Duration,
    pub screenshot_delay: Duration,
    pub script_timeout: Duration,

    pub clone: Option<CloneHandle>,
    pub vm: Option<VmHandle>,

    pub agent_injected: bool,
    pub agent_responded: bool,
    pub screenshot_failed: bool,
    pub pending_reboot: bool,
    pub screenshot_path: Option<PathBuf>,
    pub guest: Option<GuestStatus>,
    pub script_outcomes: Vec<ScriptOutcome>,
}

impl VerificationContext {
    pub fn new(
        asset: Asset,
        connection: HypervisorConnection,
        snapshot_epoch: i64,
        started_at: i64,
        cfg: &RunnerConfig,
    ) -> Self {
        let ready_timeout = asset
            .verification
            .error_seconds
            .unwrap_or(cfg.ready_timeout_secs);
        let delay = asset
            .verification
            .wait_seconds
            .unwrap_or(cfg.default_delay_secs);
        Self {
            asset,
            connection,
            snapshot_epoch,
            started_at,
            ready_timeout: Duration::from_secs(ready_timeout),
            ready_poll: Duration::from_secs(cfg.ready_poll_secs.max(1)),
            screenshot_delay: Duration::from_secs(delay),
            script_timeout: Duration::from_secs(cfg.script_timeout_secs),
            clone: None,
            vm: None,
            agent_injected: false,
            agent_responded: false,
            screenshot_failed: false,
            pending_reboot: false,
            screenshot_path: None,
            guest: None,
            script_outcomes: Vec::new(),
        }
    }

    pub fn asset_key(&self) -> &str {
        &self.asset.key_name
    }

    /// Expected services the guest did not report, once it has reported.
    pub fn missing_services(&self) -> Vec<String> {
        missing(
            &self.asset.verification.expected_services,
            self.guest.as_ref().map(|g| g.services.as_slice()),
        )
    }

    pub fn missing_applications(&self) -> Vec<String> {
        missing(
            &self.asset.verification.expected_applications,
            self.guest.as_ref().map(|g| g.applications.as_slice()),
        )
    }
}

fn missing(expected: &[String], reported: Option<&[String]>) -> Vec<String> {
    let Some(reported) = reported else {
        return Vec::new();
    };
    expected
        .iter()
        .filter(|want| !reported.iter().any(|got| got.eq_ignore_ascii_case(want)))
        .cloned()
        .collect()
}
