//! Concrete verification and notification stages.

mod boot;
mod evidence;
mod notify;
mod prepare;

pub use boot::{ProvisionVmStage, WaitForReadyStage};
pub use evidence::{RunScriptsStage, ScreenshotStage};
pub use notify::{NotifyStage, UploadEvidenceStage};
pub use prepare::{AssetLockStage, CleanupStaleStage, CreateCloneStage, HideFilesStage, PreflightStage};
