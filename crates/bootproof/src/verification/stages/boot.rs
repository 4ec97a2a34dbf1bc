use std::sync::Arc;

use bootproof_macros::Stage;

use crate::clock::Clock;
use crate::driver::{HypervisorDriver, VmSpec};
use crate::error::{Error, Result};
use crate::model::StageResult;
use crate::transaction::Stage;
use crate::verification::VerificationContext;

#[Stage(id = "verification.provision_vm", label = "Provision and boot VM")]
pub struct ProvisionVmStage {
    pub driver: Arc<dyn HypervisorDriver>,
    pub default_cpus: u32,
    pub default_ram_mib: u64,
}

impl Stage<VerificationContext> for ProvisionVmStage {
    fn commit(&mut self, ctx: &mut VerificationContext) -> Result<StageResult> {
        let clone = ctx
            .clone
            .clone()
            .ok_or_else(|| Error::msg("VM provisioning requires a clone"))?;
        let settings = &ctx.asset.verification;
        let spec = VmSpec {
            name: format!("bootproof-{}", ctx.asset.key_name),
            cpus: settings.cpu_cores.unwrap_or(self.default_cpus).max(1),
            ram_mib: settings.ram_mib.unwrap_or(self.default_ram_mib),
            os: ctx.asset.os,
            clone,
        };
        let vm = match self.driver.create_vm(&ctx.connection, &spec) {
            Ok(vm) => vm,
            Err(e) => return Ok(StageResult::intermittent(format!("VM creation failed: {e}"))),
        };
        ctx.agent_injected = vm.agent_injected;
        ctx.vm = Some(vm.clone());
        if let Err(e) = self.driver.start_vm(&ctx.connection, &vm) {
            return Ok(StageResult::intermittent(format!("VM failed to start: {e}")));
        }
        tracing::info!(vm = %vm.name, cpus = spec.cpus, ram_mib = spec.ram_mib, "verification VM started");
        Ok(StageResult::success())
    }

    fn cleanup(&mut self, ctx: &mut VerificationContext) -> Result<()> {
        let Some(vm) = ctx.vm.take() else {
            return Ok(());
        };
        self.driver.destroy_vm(&ctx.connection, &vm)
    }
}

#[Stage(id = "verification.wait_ready", label = "Wait for guest readiness")]
pub struct WaitForReadyStage {
    pub driver: Arc<dyn HypervisorDriver>,
    pub clock: Arc<dyn Clock>,
}

impl Stage<VerificationContext> for WaitForReadyStage {
    fn commit(&mut self, ctx: &mut VerificationContext) -> Result<StageResult> {
        if !ctx.agent_injected {
            tracing::debug!(asset = ctx.asset_key(), "no guest agent; not waiting for readiness");
            return Ok(StageResult::success());
        }
        let vm = ctx
            .vm
            .clone()
            .ok_or_else(|| Error::msg("readiness check requires a running VM"))?;
        let deadline = self.clock.now() + ctx.ready_timeout.as_secs() as i64;
        loop {
            match self.driver.guest_status(&ctx.connection, &vm) {
                Ok(st) => {
                    ctx.agent_responded |= st.agent_responded;
                    if st.pending_reboot {
                        ctx.pending_reboot = true;
                        return Ok(StageResult::skipped("guest has a reboot pending"));
                    }
                    if st.ready {
                        ctx.guest = Some(st);
                        return Ok(StageResult::success());
                    }
                }
                Err(e) => tracing::debug!(vm = %vm.name, error = %e, "guest status poll failed"),
            }
            if self.clock.now() >= deadline {
                return Ok(StageResult::intermittent(format!(
                    "guest was not ready after {}s",
                    ctx.ready_timeout.as_secs()
                )));
            }
            self.clock.sleep(ctx.ready_poll);
        }
    }
}
