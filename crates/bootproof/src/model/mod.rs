mod result;
mod schedule;
mod screenshot;

pub use result::{StageResult, VerificationResultType};
pub use schedule::{ScheduleOption, WeeklySchedule};
pub use screenshot::{ScreenshotResult, ScriptOutcome};
