//! Terminal per-asset verification status, read by the rest of the appliance
//! to show machine health.

use std::sync::Arc;

use serde::{Deserialize, Serialize};

use crate::error::Result;
use crate::model::VerificationResultType;
use crate::store::{self, KeyValueStore};

const STATUS_PREFIX: &str = "screenshotVerification.status.";
const FAILURE_PREFIX: &str = "screenshotVerification.failed.";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStatus {
    Success,
    Skipped,
    Failed,
}

impl From<VerificationResultType> for VerificationStatus {
    fn from(r: VerificationResultType) -> Self {
        match r {
            VerificationResultType::Success => Self::Success,
            VerificationResultType::Skipped => Self::Skipped,
            VerificationResultType::FailureIntermittent
            | VerificationResultType::FailureUnrecoverable => Self::Failed,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusRecord {
    pub asset_key: String,
    pub snapshot_epoch: i64,
    pub status: VerificationStatus,
    pub result: VerificationResultType,
    pub updated_at: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Clone)]
pub struct StatusBoard {
    store: Arc<dyn KeyValueStore>,
}

impl StatusBoard {
    pub fn new(store: Arc<dyn KeyValueStore>) -> Self {
        Self { store }
    }

    pub fn record(&self, rec: &StatusRecord) -> Result<()> {
        store::write_json(
            self.store.as_ref(),
            &format!("{STATUS_PREFIX}{}", rec.asset_key),
            rec,
        )?;
        let marker = format!("{FAILURE_PREFIX}{}", rec.asset_key);
        match rec.status {
            VerificationStatus::Failed => {
                let msg = rec.message.clone().unwrap_or_else(|| rec.result.to_string());
                self.store.set(&marker, &msg)?;
            }
            VerificationStatus::Success | VerificationStatus::Skipped => self.store.clear(&marker)?,
        }
        Ok(())
    }

    pub fn get(&self, asset_key: &str) -> Result<Option<StatusRecord>> {
        store::read_json(self.store.as_ref(), &format!("{STATUS_PREFIX}{asset_key}"))
    }

    pub fn failure_marker(&self, asset_key: &str) -> Result<Option<String>> {
        self.store.get(&format!("{FAILURE_PREFIX}{asset_key}"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::MemoryStore;

    fn rec(result: VerificationResultType) -> StatusRecord {
        StatusRecord {
            asset_key: "agent-1".into(),
            snapshot_epoch: 100,
            status: result.into(),
            result,
            updated_at: 200,
            message: Some("boot timed out".into()),
        }
    }

    #[test]
    fn success_clears_failure_marker() {
        let board = StatusBoard::new(Arc::new(MemoryStore::new()));
        board
            .record(&rec(VerificationResultType::FailureIntermittent))
            .expect("record failure");
        assert_eq!(
            board.failure_marker("agent-1").expect("marker").as_deref(),
            Some("boot timed out")
        );
        board
            .record(&rec(VerificationResultType::Success))
            .expect("record success");
        assert!(board.failure_marker("agent-1").expect("marker").is_none());
        assert_eq!(
            board.get("agent-1").expect("get").map(|r| r.status),
            Some(VerificationStatus::Success)
        );
    }
}
