use std::path::PathBuf;

use serde::{Deserialize, Serialize};

use super::VerificationResultType;

/// Evidence stored on a recovery point once a verification finishes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScreenshotResult {
    pub result: VerificationResultType,
    pub snapshot_epoch: i64,
    pub captured_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_path: Option<PathBuf>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot_sha256: Option<String>,
    #[serde(default)]
    pub agent_responded: bool,
    #[serde(default)]
    pub pending_reboot: bool,
    /// The VM came up but no image could be captured.
    #[serde(default)]
    pub screenshot_failed: bool,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_services: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub missing_applications: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub scripts: Vec<ScriptOutcome>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub elapsed_secs: i64,
}

impl ScreenshotResult {
    pub fn is_success(&self) -> bool {
        self.result == VerificationResultType::Success
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptOutcome {
    pub name: String,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub output: String,
}

impl ScriptOutcome {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}
