use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use super::{CloneHandle, GuestStatus, HypervisorConnection, HypervisorDriver, ScriptRun, VmHandle, VmSpec};
use crate::assets::{Asset, ScriptSpec};
use crate::config::HookCommands;
use crate::error::{Error, Result};
use crate::process::{self, CommandOutput};

/// Runs one configured command per driver operation.
///
/// Commands are argv templates; `{placeholder}` tokens are substituted
/// per call. Output conventions:
/// - `create_clone`: last stdout line, if any, is the clone's local mount path.
/// - `create_vm`: last stdout line may be a JSON `VmHandle`.
/// - `guest_status`: last stdout line is a JSON `GuestStatus`.
/// - `cleanup_stale`: last stdout line may be the number of removed artifacts.
#[derive(Debug, Clone)]
pub struct HookDriver {
    hooks: HookCommands,
    timeout: Duration,
}

type Vars = BTreeMap<&'static str, String>;

impl HookDriver {
    pub fn new(hooks: HookCommands, timeout: Duration) -> Self {
        Self { hooks, timeout }
    }

    fn conn_vars(conn: &HypervisorConnection) -> Vars {
        let mut v = Vars::new();
        v.insert("connection", conn.name.clone());
        v.insert("address", conn.address.clone().unwrap_or_default());
        v
    }

    fn run(&self, op: &'static str, template: &[String], vars: &Vars, timeout: Duration) -> Result<CommandOutput> {
        let argv = render(template, vars);
        let out = process::run_captured(op, &argv, timeout)?;
        if out.timed_out {
            return Err(Error::msg(format!(
                "{op} hook timed out after {}s",
                timeout.as_secs()
            )));
        }
        if !out.success() {
            return Err(Error::msg(format!(
                "{op} hook exited with {}: {}",
                out.exit_code
                    .map(|c| c.to_string())
                    .unwrap_or_else(|| "signal".to_string()),
                out.tail(5)
            )));
        }
        Ok(out)
    }

    fn run_op(&self, op: &'static str, template: &[String], vars: &Vars) -> Result<CommandOutput> {
        self.run(op, template, vars, self.timeout)
    }
}

fn render(template: &[String], vars: &Vars) -> Vec<String> {
    template
        .iter()
        .map(|arg| {
            let mut s = arg.clone();
            for (k, v) in vars {
                s = s.replace(&format!("{{{k}}}"), v);
            }
            s
        })
        .collect()
}

impl HypervisorDriver for HookDriver {
    fn check_connection(&self, conn: &HypervisorConnection) -> Result<()> {
        if self.hooks.check_connection.is_empty() {
            return Ok(());
        }
        self.run_op("check_connection", &self.hooks.check_connection, &Self::conn_vars(conn))?;
        Ok(())
    }

    fn cleanup_stale(&self, conn: &HypervisorConnection, asset_key: &str) -> Result<usize> {
        if self.hooks.cleanup_stale.is_empty() {
            return Ok(0);
        }
        let mut vars = Self::conn_vars(conn);
        vars.insert("asset", asset_key.to_string());
        let out = self.run_op("cleanup_stale", &self.hooks.cleanup_stale, &vars)?;
        Ok(out
            .last_stdout_line()
            .and_then(|l| l.trim().parse().ok())
            .unwrap_or(0))
    }

    fn create_clone(
        &self,
        conn: &HypervisorConnection,
        asset: &Asset,
        snapshot_epoch: i64,
        name: &str,
    ) -> Result<CloneHandle> {
        let mut vars = Self::conn_vars(conn);
        vars.insert("asset", asset.key_name.clone());
        vars.insert("snapshot", snapshot_epoch.to_string());
        vars.insert("clone", name.to_string());
        let out = self.run_op("create_clone", &self.hooks.create_clone, &vars)?;
        let mount_path = out
            .last_stdout_line()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .map(PathBuf::from);
        Ok(CloneHandle {
            name: name.to_string(),
            mount_path,
        })
    }

    fn destroy_clone(&self, conn: &HypervisorConnection, clone: &CloneHandle) -> Result<()> {
        let mut vars = Self::conn_vars(conn);
        vars.insert("clone", clone.name.clone());
        self.run_op("destroy_clone", &self.hooks.destroy_clone, &vars)?;
        Ok(())
    }

    fn create_vm(&self, conn: &HypervisorConnection, spec: &VmSpec) -> Result<VmHandle> {
        let mut vars = Self::conn_vars(conn);
        vars.insert("vm", spec.name.clone());
        vars.insert("clone", spec.clone.name.clone());
        vars.insert(
            "mount",
            spec.clone
                .mount_path
                .as_deref()
                .map(|p| p.display().to_string())
                .unwrap_or_default(),
        );
        vars.insert("cpus", spec.cpus.to_string());
        vars.insert("ram_mib", spec.ram_mib.to_string());
        vars.insert("os", format!("{:?}", spec.os).to_lowercase());
        let out = self.run_op("create_vm", &self.hooks.create_vm, &vars)?;
        match out.last_stdout_line() {
            Some(line) if line.trim_start().starts_with('{') => serde_json::from_str(line)
                .map_err(|e| Error::msg(format!("create_vm hook printed invalid JSON: {e}"))),
            _ => Ok(VmHandle {
                name: spec.name.clone(),
                agent_injected: false,
            }),
        }
    }

    fn start_vm(&self, conn: &HypervisorConnection, vm: &VmHandle) -> Result<()> {
        let mut vars = Self::conn_vars(conn);
        vars.insert("vm", vm.name.clone());
        self.run_op("start_vm", &self.hooks.start_vm, &vars)?;
        Ok(())
    }

    fn destroy_vm(&self, conn: &HypervisorConnection, vm: &VmHandle) -> Result<()> {
        let mut vars = Self::conn_vars(conn);
        vars.insert("vm", vm.name.clone());
        self.run_op("destroy_vm", &self.hooks.destroy_vm, &vars)?;
        Ok(())
    }

    fn guest_status(&self, conn: &HypervisorConnection, vm: &VmHandle) -> Result<GuestStatus> {
        let mut vars = Self::conn_vars(conn);
        vars.insert("vm", vm.name.clone());
        let out = self.run_op("guest_status", &self.hooks.guest_status, &vars)?;
        let line = out
            .last_stdout_line()
            .ok_or_else(|| Error::msg("guest_status hook printed nothing"))?;
        serde_json::from_str(line)
            .map_err(|e| Error::msg(format!("guest_status hook printed invalid JSON: {e}")))
    }

    fn screenshot(&self, conn: &HypervisorConnection, vm: &VmHandle, output: &Path) -> Result<()> {
        let mut vars = Self::conn_vars(conn);
        vars.insert("vm", vm.name.clone());
        vars.insert("output", output.display().to_string());
        self.run_op("screenshot", &self.hooks.screenshot, &vars)?;
        if !output.is_file() {
            return Err(Error::msg(format!(
                "screenshot hook did not write {}",
                output.display()
            )));
        }
        Ok(())
    }

    fn run_script(
        &self,
        conn: &HypervisorConnection,
        vm: &VmHandle,
        script: &ScriptSpec,
        timeout: Duration,
    ) -> Result<ScriptRun> {
        let mut vars = Self::conn_vars(conn);
        vars.insert("vm", vm.name.clone());
        vars.insert("script", script.path.clone());
        vars.insert("script_name", script.name.clone());
        let argv = render(&self.hooks.run_script, &vars);
        // Script failures are outcomes, not driver errors.
        let out = process::run_captured("run_script", &argv, timeout)?;
        Ok(ScriptRun {
            exit_code: out.exit_code,
            timed_out: out.timed_out,
            output: out.tail(20),
        })
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use crate::assets::OsFamily;

    fn sh(script: &str) -> Vec<String> {
        vec!["sh".into(), "-c".into(), script.into()]
    }

    #[test]
    fn placeholders_are_substituted_per_argument() {
        let mut vars = Vars::new();
        vars.insert("asset", "agent-1".into());
        vars.insert("snapshot", "1700000000".into());
        assert_eq!(
            render(&["zfs-clone".into(), "{asset}@{snapshot}".into(), "{unknown}".into()], &vars),
            vec!["zfs-clone", "agent-1@1700000000", "{unknown}"]
        );
    }

    #[test]
    fn create_clone_reads_mount_path_from_stdout() {
        let hooks = HookCommands {
            create_clone: sh("echo creating {clone} >&2; echo /mnt/{clone}"),
            ..HookCommands::default()
        };
        let d = HookDriver::new(hooks, Duration::from_secs(10));
        let asset = Asset::new("agent-1", OsFamily::Linux);
        let c = d
            .create_clone(&HypervisorConnection::local("local"), &asset, 1, "bp-agent-1-1")
            .expect("clone");
        assert_eq!(c.mount_path, Some(PathBuf::from("/mnt/bp-agent-1-1")));
    }

    #[test]
    fn failing_hook_reports_exit_code_and_output() {
        let hooks = HookCommands {
            start_vm: sh("echo no capacity; exit 7"),
            ..HookCommands::default()
        };
        let d = HookDriver::new(hooks, Duration::from_secs(10));
        let vm = VmHandle {
            name: "vm".into(),
            agent_injected: false,
        };
        let err = d
            .start_vm(&HypervisorConnection::local("local"), &vm)
            .unwrap_err()
            .to_string();
        assert!(err.contains("exited with 7"), "{err}");
        assert!(err.contains("no capacity"), "{err}");
    }

    #[test]
    fn guest_status_parses_json() {
        let hooks = HookCommands {
            guest_status: sh(r#"echo '{"agent_responded":true,"ready":true,"services":["sshd"]}'"#),
            ..HookCommands::default()
        };
        let d = HookDriver::new(hooks, Duration::from_secs(10));
        let vm = VmHandle {
            name: "vm".into(),
            agent_injected: true,
        };
        let st = d
            .guest_status(&HypervisorConnection::local("local"), &vm)
            .expect("status");
        assert!(st.ready && st.agent_responded);
        assert_eq!(st.services, vec!["sshd".to_string()]);
    }

    #[test]
    fn script_exit_code_is_an_outcome() {
        let hooks = HookCommands {
            run_script: sh("echo checking {script_name}; exit 2"),
            ..HookCommands::default()
        };
        let d = HookDriver::new(hooks, Duration::from_secs(10));
        let vm = VmHandle {
            name: "vm".into(),
            agent_injected: true,
        };
        let script = ScriptSpec {
            name: "db-check".into(),
            path: "/scripts/db.sh".into(),
        };
        let run = d
            .run_script(&HypervisorConnection::local("local"), &vm, &script, Duration::from_secs(10))
            .expect("run");
        assert_eq!(run.exit_code, Some(2));
        assert_eq!(run.output, "checking db-check");
    }
}
