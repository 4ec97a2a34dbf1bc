use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use super::{CloneHandle, GuestStatus, HypervisorConnection, HypervisorDriver, ScriptRun, VmHandle, VmSpec};
use crate::assets::{Asset, ScriptSpec};
use crate::error::{Error, Result};

/// PNG signature followed by a marker, enough for hashing and upload.
const PLACEHOLDER_IMAGE: &[u8] = b"\x89PNG\r\n\x1a\nbootproof-simulated";

/// Scripted behaviour for [`SimulatedDriver`].
#[derive(Debug, Clone)]
pub struct SimulatedPlan {
    pub connection_ok: bool,
    pub clone_fails: bool,
    pub clone_mount: Option<PathBuf>,
    pub vm_create_fails: bool,
    pub vm_start_fails: bool,
    pub agent_injected: bool,
    /// `guest_status` calls that report not-ready before `guest` is returned.
    pub polls_until_ready: u32,
    pub guest: GuestStatus,
    pub screenshot_fails: bool,
    pub script_exit_code: i32,
    /// Operation name whose call panics.
    pub panic_on: Option<&'static str>,
}

impl Default for SimulatedPlan {
    fn default() -> Self {
        Self {
            connection_ok: true,
            clone_fails: false,
            clone_mount: None,
            vm_create_fails: false,
            vm_start_fails: false,
            agent_injected: true,
            polls_until_ready: 0,
            guest: GuestStatus {
                agent_responded: true,
                ready: true,
                pending_reboot: false,
                services: Vec::new(),
                applications: Vec::new(),
            },
            screenshot_fails: false,
            script_exit_code: 0,
            panic_on: None,
        }
    }
}

type CallHook = Box<dyn Fn(&str) + Send + Sync>;

/// In-process driver for dry runs and tests. Records every call.
pub struct SimulatedDriver {
    plan: Mutex<SimulatedPlan>,
    calls: Mutex<Vec<String>>,
    polls: Mutex<u32>,
    on_call: Option<CallHook>,
}

impl Default for SimulatedDriver {
    fn default() -> Self {
        Self::new(SimulatedPlan::default())
    }
}

impl SimulatedDriver {
    pub fn new(plan: SimulatedPlan) -> Self {
        Self {
            plan: Mutex::new(plan),
            calls: Mutex::new(Vec::new()),
            polls: Mutex::new(0),
            on_call: None,
        }
    }

    /// Invoke `hook` with the operation name at the start of every call.
    pub fn with_call_hook(mut self, hook: impl Fn(&str) + Send + Sync + 'static) -> Self {
        self.on_call = Some(Box::new(hook));
        self
    }

    pub fn set_plan(&self, plan: SimulatedPlan) {
        *self.plan.lock().unwrap_or_else(|e| e.into_inner()) = plan;
        *self.polls.lock().unwrap_or_else(|e| e.into_inner()) = 0;
    }

    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    pub fn called(&self, op: &str) -> bool {
        self.calls().iter().any(|c| c == op)
    }

    fn enter(&self, op: &'static str) -> SimulatedPlan {
        self.calls
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(op.to_string());
        if let Some(hook) = &self.on_call {
            hook(op);
        }
        let plan = self.plan.lock().unwrap_or_else(|e| e.into_inner()).clone();
        if plan.panic_on == Some(op) {
            panic!("simulated {op} panic");
        }
        plan
    }
}

impl HypervisorDriver for SimulatedDriver {
    fn check_connection(&self, conn: &HypervisorConnection) -> Result<()> {
        if self.enter("check_connection").connection_ok {
            Ok(())
        } else {
            Err(Error::msg(format!("hypervisor '{}' is unreachable", conn.name)))
        }
    }

    fn cleanup_stale(&self, _conn: &HypervisorConnection, _asset_key: &str) -> Result<usize> {
        self.enter("cleanup_stale");
        Ok(0)
    }

    fn create_clone(
        &self,
        _conn: &HypervisorConnection,
        asset: &Asset,
        snapshot_epoch: i64,
        name: &str,
    ) -> Result<CloneHandle> {
        let plan = self.enter("create_clone");
        if plan.clone_fails {
            return Err(Error::msg(format!(
                "snapshot {snapshot_epoch} of {} could not be cloned",
                asset.key_name
            )));
        }
        Ok(CloneHandle {
            name: name.to_string(),
            mount_path: plan.clone_mount,
        })
    }

    fn destroy_clone(&self, _conn: &HypervisorConnection, _clone: &CloneHandle) -> Result<()> {
        self.enter("destroy_clone");
        Ok(())
    }

    fn create_vm(&self, _conn: &HypervisorConnection, spec: &VmSpec) -> Result<VmHandle> {
        let plan = self.enter("create_vm");
        if plan.vm_create_fails {
            return Err(Error::msg("not enough host memory for the VM"));
        }
        Ok(VmHandle {
            name: spec.name.clone(),
            agent_injected: plan.agent_injected,
        })
    }

    fn start_vm(&self, _conn: &HypervisorConnection, vm: &VmHandle) -> Result<()> {
        if self.enter("start_vm").vm_start_fails {
            return Err(Error::msg(format!("{} failed to power on", vm.name)));
        }
        Ok(())
    }

    fn destroy_vm(&self, _conn: &HypervisorConnection, _vm: &VmHandle) -> Result<()> {
        self.enter("destroy_vm");
        Ok(())
    }

    fn guest_status(&self, _conn: &HypervisorConnection, _vm: &VmHandle) -> Result<GuestStatus> {
        let plan = self.enter("guest_status");
        let mut polls = self.polls.lock().unwrap_or_else(|e| e.into_inner());
        *polls += 1;
        if *polls <= plan.polls_until_ready {
            return Ok(GuestStatus::default());
        }
        Ok(plan.guest)
    }

    fn screenshot(&self, _conn: &HypervisorConnection, vm: &VmHandle, output: &Path) -> Result<()> {
        if self.enter("screenshot").screenshot_fails {
            return Err(Error::msg(format!("{} console capture failed", vm.name)));
        }
        if let Some(parent) = output.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(output, PLACEHOLDER_IMAGE)?;
        Ok(())
    }

    fn run_script(
        &self,
        _conn: &HypervisorConnection,
        _vm: &VmHandle,
        script: &ScriptSpec,
        _timeout: Duration,
    ) -> Result<ScriptRun> {
        let plan = self.enter("run_script");
        Ok(ScriptRun {
            exit_code: Some(plan.script_exit_code),
            timed_out: false,
            output: format!("{} exited {}", script.name, plan.script_exit_code),
        })
    }
}
