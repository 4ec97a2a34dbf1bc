//! Verification metrics. Recording is a no-op until a recorder is installed,
//! which the CLI does only when a textfile target is configured.

use std::path::{Path, PathBuf};

use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

use crate::error::{Error, Result};
use crate::model::VerificationResultType;
use crate::store::atomic_write_text;

pub const VERIFICATIONS_TOTAL: &str = "bootproof_verifications_total";
pub const VERIFICATION_DURATION: &str = "bootproof_verification_duration_seconds";
pub const QUEUE_DEPTH: &str = "bootproof_queue_depth";
pub const QUEUE_DROPPED: &str = "bootproof_queue_dropped_total";
pub const NOTIFICATION_FAILURES: &str = "bootproof_notification_failures_total";

pub fn describe() {
    metrics::describe_counter!(VERIFICATIONS_TOTAL, "Completed verification runs by result");
    metrics::describe_histogram!(
        VERIFICATION_DURATION,
        "Wall time of one verification run, provisioning through teardown"
    );
    metrics::describe_gauge!(QUEUE_DEPTH, "Entries in the verification queue");
    metrics::describe_counter!(
        QUEUE_DROPPED,
        "Queue entries dropped by age or capacity, by reason"
    );
    metrics::describe_counter!(
        NOTIFICATION_FAILURES,
        "Notification stages that failed, by stage"
    );
}

pub fn verification_finished(result: VerificationResultType, elapsed_secs: f64) {
    metrics::counter!(VERIFICATIONS_TOTAL, "result" => result.as_str()).increment(1);
    metrics::histogram!(VERIFICATION_DURATION).record(elapsed_secs);
}

pub fn set_queue_depth(depth: usize) {
    metrics::gauge!(QUEUE_DEPTH).set(depth as f64);
}

pub fn queue_dropped(reason: &'static str) {
    metrics::counter!(QUEUE_DROPPED, "reason" => reason).increment(1);
}

pub fn notification_failed(stage: &'static str) {
    metrics::counter!(NOTIFICATION_FAILURES, "stage" => stage).increment(1);
}

/// Process-wide Prometheus recorder whose snapshot is written to a
/// node-exporter textfile.
pub struct MetricsTextfile {
    handle: PrometheusHandle,
    path: PathBuf,
}

impl MetricsTextfile {
    pub fn install(path: &Path) -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .install_recorder()
            .map_err(|e| Error::msg(format!("failed to install metrics recorder: {e}")))?;
        describe();
        Ok(Self {
            handle,
            path: path.to_path_buf(),
        })
    }

    pub fn flush(&self) -> Result<()> {
        atomic_write_text(&self.path, &self.handle.render())?;
        tracing::debug!(path = %self.path.display(), "wrote metrics textfile");
        Ok(())
    }
}
