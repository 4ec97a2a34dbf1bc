//! Boundary to the hypervisor that clones snapshots and boots them.

mod hook;
mod simulated;

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use regex::Regex;
use serde::{Deserialize, Serialize};
use walkdir::WalkDir;

use crate::assets::{Asset, OsFamily, ScriptSpec};
use crate::error::{Error, Result};

pub use hook::HookDriver;
pub use simulated::{SimulatedDriver, SimulatedPlan};

pub const HIDDEN_SUFFIX: &str = ".bootproof-hidden";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HypervisorConnection {
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub address: Option<String>,
    /// Obtained from the connection broker; must be released after the run.
    #[serde(default)]
    pub brokered: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub lease_id: Option<String>,
}

impl HypervisorConnection {
    pub fn local(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            address: None,
            brokered: false,
            lease_id: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CloneHandle {
    pub name: String,
    /// Where the clone's guest filesystem is visible to this host, if it is.
    pub mount_path: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct VmSpec {
    pub name: String,
    pub cpus: u32,
    pub ram_mib: u64,
    pub os: OsFamily,
    pub clone: CloneHandle,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct VmHandle {
    pub name: String,
    /// A guest agent was injected, so readiness can be polled.
    #[serde(default)]
    pub agent_injected: bool,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct GuestStatus {
    pub agent_responded: bool,
    pub ready: bool,
    pub pending_reboot: bool,
    pub services: Vec<String>,
    pub applications: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ScriptRun {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub output: String,
}

pub trait HypervisorDriver: Send + Sync {
    fn check_connection(&self, conn: &HypervisorConnection) -> Result<()>;

    /// Remove clones/VMs a crashed run left behind for this asset.
    fn cleanup_stale(&self, conn: &HypervisorConnection, asset_key: &str) -> Result<usize>;

    fn create_clone(
        &self,
        conn: &HypervisorConnection,
        asset: &Asset,
        snapshot_epoch: i64,
        name: &str,
    ) -> Result<CloneHandle>;

    fn destroy_clone(&self, conn: &HypervisorConnection, clone: &CloneHandle) -> Result<()>;

    /// Rename files matching `patterns` inside the clone so the guest does
    /// not find them on boot.
    fn hide_files(&self, clone: &CloneHandle, patterns: &[Regex]) -> Result<usize> {
        hide_matching_files(clone, patterns)
    }

    fn create_vm(&self, conn: &HypervisorConnection, spec: &VmSpec) -> Result<VmHandle>;

    fn start_vm(&self, conn: &HypervisorConnection, vm: &VmHandle) -> Result<()>;

    fn destroy_vm(&self, conn: &HypervisorConnection, vm: &VmHandle) -> Result<()>;

    fn guest_status(&self, conn: &HypervisorConnection, vm: &VmHandle) -> Result<GuestStatus>;

    fn screenshot(&self, conn: &HypervisorConnection, vm: &VmHandle, output: &Path) -> Result<()>;

    fn run_script(
        &self,
        conn: &HypervisorConnection,
        vm: &VmHandle,
        script: &ScriptSpec,
        timeout: Duration,
    ) -> Result<ScriptRun>;
}

pub fn hide_matching_files(clone: &CloneHandle, patterns: &[Regex]) -> Result<usize> {
    let Some(root) = clone.mount_path.as_deref() else {
        tracing::debug!(clone = %clone.name, "clone is not mounted locally; nothing to hide");
        return Ok(0);
    };
    if patterns.is_empty() {
        return Ok(0);
    }
    let mut hidden = 0usize;
    for ent in WalkDir::new(root).follow_links(false) {
        let ent = ent.map_err(|e| Error::msg(format!("failed to walk {}: {e}", root.display())))?;
        if !ent.file_type().is_file() {
            continue;
        }
        let Some(name) = ent.file_name().to_str() else {
            continue;
        };
        if name.ends_with(HIDDEN_SUFFIX) || !patterns.iter().any(|re| re.is_match(name)) {
            continue;
        }
        let target = ent.path().with_file_name(format!("{name}{HIDDEN_SUFFIX}"));
        fs::rename(ent.path(), &target).map_err(|e| {
            Error::msg(format!("failed to hide {}: {e}", ent.path().display()))
        })?;
        tracing::debug!(file = %ent.path().display(), "hid file in clone");
        hidden += 1;
    }
    Ok(hidden)
}

pub fn compile_patterns(patterns: &[String]) -> Result<Vec<Regex>> {
    patterns
        .iter()
        .map(|p| Regex::new(p).map_err(|e| Error::msg(format!("invalid hidden-file pattern '{p}': {e}"))))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn hides_matching_files_recursively() {
        let dir = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(dir.path().join("Windows")).expect("mkdir");
        fs::write(dir.path().join("pagefile.sys"), "x").expect("write");
        fs::write(dir.path().join("Windows").join("HIBERFIL.SYS"), "x").expect("write");
        fs::write(dir.path().join("keep.txt"), "x").expect("write");

        let clone = CloneHandle {
            name: "c".into(),
            mount_path: Some(dir.path().to_path_buf()),
        };
        let patterns = compile_patterns(&[
            r"(?i)^pagefile\.sys$".to_string(),
            r"(?i)^hiberfil\.sys$".to_string(),
        ])
        .expect("patterns");
        assert_eq!(hide_matching_files(&clone, &patterns).expect("hide"), 2);
        assert!(dir.path().join("pagefile.sys.bootproof-hidden").exists());
        assert!(dir.path().join("Windows").join("HIBERFIL.SYS.bootproof-hidden").exists());
        assert!(dir.path().join("keep.txt").exists());
        // Already hidden files are left alone.
        assert_eq!(hide_matching_files(&clone, &patterns).expect("hide again"), 0);
    }

    #[test]
    fn invalid_patterns_are_reported() {
        let err = compile_patterns(&["(".to_string()]).unwrap_err();
        assert!(err.to_string().contains("invalid hidden-file pattern"));
    }
}
