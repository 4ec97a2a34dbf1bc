use std::sync::Arc;

use bootproof_macros::Stage;

use crate::error::Result;
use crate::model::{StageResult, VerificationResultType};
use crate::notify::{EvidenceUploader, NotificationContext, Notifier};
use crate::transaction::Stage;

#[Stage(id = "notify.send", label = "Send verification notification")]
pub struct NotifyStage {
    pub notifier: Arc<dyn Notifier>,
    pub notify_success: bool,
}

impl Stage<NotificationContext> for NotifyStage {
    fn commit(&mut self, ctx: &mut NotificationContext) -> Result<StageResult> {
        if ctx.result == VerificationResultType::Success && !self.notify_success {
            return Ok(StageResult::success());
        }
        self.notifier.notify(ctx)?;
        Ok(StageResult::success())
    }
}

#[Stage(id = "notify.upload_evidence", label = "Upload verification evidence")]
pub struct UploadEvidenceStage {
    pub uploader: Arc<dyn EvidenceUploader>,
}

impl Stage<NotificationContext> for UploadEvidenceStage {
    fn commit(&mut self, ctx: &mut NotificationContext) -> Result<StageResult> {
        self.uploader.upload(ctx)?;
        Ok(StageResult::success())
    }
}
