//! Protected-machine model as seen by verification, plus the repository the
//! scheduler and runner read it through.

mod repository;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::model::{ScheduleOption, ScreenshotResult, WeeklySchedule};

pub use repository::{AssetRepository, FileAssetRepository, MemoryAssetRepository};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssetKind {
    #[default]
    Agent,
    Share,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OsFamily {
    Windows,
    Linux,
    Mac,
    #[default]
    Unknown,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Origin {
    #[default]
    Local,
    Replicated,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OffsiteState {
    #[default]
    None,
    InProgress,
    Complete,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BackupSettings {
    pub interval_minutes: u32,
    pub schedule: WeeklySchedule,
}

impl Default for BackupSettings {
    fn default() -> Self {
        Self {
            interval_minutes: 60,
            schedule: WeeklySchedule::empty(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ScriptSpec {
    pub name: String,
    pub path: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationSettings {
    pub schedule: ScheduleOption,
    pub custom_schedule: WeeklySchedule,
    /// Delay between guest readiness and the screenshot.
    pub wait_seconds: Option<u64>,
    /// Readiness timeout override.
    pub error_seconds: Option<u64>,
    pub expected_applications: Vec<String>,
    pub expected_services: Vec<String>,
    pub cpu_cores: Option<u32>,
    pub ram_mib: Option<u64>,
    pub scripts: Vec<ScriptSpec>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecoveryPoint {
    pub epoch: i64,
    #[serde(default = "default_true")]
    pub local: bool,
    #[serde(default)]
    pub deleted: bool,
    #[serde(default)]
    pub offsite: OffsiteState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub screenshot: Option<ScreenshotResult>,
}

fn default_true() -> bool {
    true
}

impl RecoveryPoint {
    pub fn local(epoch: i64) -> Self {
        Self {
            epoch,
            local: true,
            deleted: false,
            offsite: OffsiteState::None,
            screenshot: None,
        }
    }

    pub fn exists_locally(&self) -> bool {
        self.local && !self.deleted
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Asset {
    pub key_name: String,
    #[serde(default)]
    pub hostname: String,
    #[serde(default)]
    pub kind: AssetKind,
    #[serde(default)]
    pub os: OsFamily,
    #[serde(default)]
    pub origin: Origin,
    #[serde(default)]
    pub archived: bool,
    #[serde(default)]
    pub removing: bool,
    /// Reports backups continuously instead of following a local calendar.
    #[serde(default)]
    pub remote_scheduled: bool,
    #[serde(default)]
    pub backup: BackupSettings,
    #[serde(default)]
    pub verification: VerificationSettings,
    #[serde(default)]
    pub recovery_points: BTreeMap<i64, RecoveryPoint>,
}

impl Asset {
    pub fn new(key: impl Into<String>, os: OsFamily) -> Self {
        let key_name = key.into();
        Self {
            hostname: key_name.clone(),
            key_name,
            kind: AssetKind::Agent,
            os,
            origin: Origin::Local,
            archived: false,
            removing: false,
            remote_scheduled: false,
            backup: BackupSettings::default(),
            verification: VerificationSettings::default(),
            recovery_points: BTreeMap::new(),
        }
    }

    /// Why this asset can never be verified, if it can't.
    pub fn unsupported_reason(&self) -> Option<&'static str> {
        if self.kind == AssetKind::Share {
            return Some("shares cannot be booted");
        }
        match self.os {
            OsFamily::Windows | OsFamily::Linux => None,
            OsFamily::Mac => Some("macOS guests are not supported"),
            OsFamily::Unknown => Some("guest operating system is unknown"),
        }
    }

    pub fn recovery_point(&self, epoch: i64) -> Option<&RecoveryPoint> {
        self.recovery_points.get(&epoch)
    }

    pub fn recovery_point_mut(&mut self, epoch: i64) -> Option<&mut RecoveryPoint> {
        self.recovery_points.get_mut(&epoch)
    }

    pub fn has_local_point(&self, epoch: i64) -> bool {
        self.recovery_point(epoch)
            .is_some_and(RecoveryPoint::exists_locally)
    }

    pub fn local_epochs(&self) -> impl Iterator<Item = i64> + '_ {
        self.recovery_points
            .values()
            .filter(|p| p.exists_locally())
            .map(|p| p.epoch)
    }

    /// Epoch of the newest point carrying a screenshot result, 0 if none.
    pub fn most_recent_verified_epoch(&self) -> i64 {
        self.recovery_points
            .values()
            .rev()
            .find(|p| p.screenshot.is_some())
            .map(|p| p.epoch)
            .unwrap_or(0)
    }

    pub fn add_point(&mut self, point: RecoveryPoint) {
        self.recovery_points.insert(point.epoch, point);
    }
}
