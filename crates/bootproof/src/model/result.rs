use std::fmt;

use serde::{Deserialize, Serialize};

/// Outcome grade of a stage or a whole run.
///
/// Ordering for aggregation comes from [`rank`](Self::rank), not from the
/// declaration order. `Skipped` outranks both failure kinds, so one skipping
/// stage hides any failure recorded before it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VerificationResultType {
    Success,
    FailureIntermittent,
    FailureUnrecoverable,
    Skipped,
}

impl VerificationResultType {
    pub fn rank(self) -> u8 {
        match self {
            Self::Success => 0,
            Self::FailureIntermittent => 1,
            Self::FailureUnrecoverable => 2,
            Self::Skipped => 3,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "SUCCESS",
            Self::FailureIntermittent => "FAILURE_INTERMITTENT",
            Self::FailureUnrecoverable => "FAILURE_UNRECOVERABLE",
            Self::Skipped => "SKIPPED",
        }
    }
}

impl fmt::Display for VerificationResultType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StageResult {
    pub result: VerificationResultType,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

impl StageResult {
    pub fn success() -> Self {
        Self {
            result: VerificationResultType::Success,
            message: None,
        }
    }

    pub fn intermittent(msg: impl Into<String>) -> Self {
        Self::with(VerificationResultType::FailureIntermittent, msg)
    }

    pub fn unrecoverable(msg: impl Into<String>) -> Self {
        Self::with(VerificationResultType::FailureUnrecoverable, msg)
    }

    pub fn skipped(msg: impl Into<String>) -> Self {
        Self::with(VerificationResultType::Skipped, msg)
    }

    fn with(result: VerificationResultType, msg: impl Into<String>) -> Self {
        Self {
            result,
            message: Some(msg.into()),
        }
    }

    pub fn is_success(&self) -> bool {
        self.result == VerificationResultType::Success
    }
}
