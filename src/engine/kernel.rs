//! Kernel module convergence after driver packages are in place.
//!
//! The driver packages ship DKMS sources. The module still has to be built
//! against the running kernel and loaded, unless the conflicting open-source
//! module holds the device, in which case only a reboot helps.

use anyhow::Context;
use std::fs;

use crate::context::HostContext;
use crate::error::ProvisionResult;
use crate::gpu::{self, VENDOR_MODULE, VENDOR_UVM_MODULE};
use crate::host::HostProfile;
use crate::pkg::{PackageAdapter, StepReport};
use crate::process::CommandSpec;

/// Tool whose presence means the driver expects its modules at boot.
pub const PERSISTENCE_DAEMON: &str = "nvidia-persistenced";

/// modules-load.d entries, in the spelling modprobe accepts.
const BOOT_MODULES: [&str; 2] = ["nvidia", "nvidia-uvm"];

/// Terminal state of the kernel module stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ModuleOutcome {
    Loaded,
    RebootRequired,
    LoadFailed { reason: String },
}

/// Bring the vendor modules up on the running kernel.
pub fn converge(
    ctx: &HostContext<'_>,
    adapter: &dyn PackageAdapter,
    profile: &HostProfile,
    steps: &mut Vec<StepReport>,
) -> ProvisionResult<ModuleOutcome> {
    match gpu::probe_modules(ctx.runner) {
        Ok(modules) if modules.vendor_active() => {
            tracing::debug!("vendor modules already loaded");
            return Ok(ModuleOutcome::Loaded);
        }
        Ok(_) => {}
        Err(e) => tracing::warn!("Unable to list kernel modules: {:#}", e),
    }

    let headers = adapter.kernel_header_packages(&profile.kernel_release);
    tracing::info!("Installing kernel headers for {}...", profile.kernel_release);
    adapter.install_packages(&headers)?;
    steps.push(StepReport::done("kernel headers"));

    steps.push(build_dkms_modules(ctx));

    // Never load the vendor module while nouveau might hold the device.
    match gpu::probe_modules(ctx.runner) {
        Ok(modules) if modules.conflicting => {
            tracing::warn!("nouveau is loaded; reboot to complete the NVIDIA driver install");
            return Ok(ModuleOutcome::RebootRequired);
        }
        Ok(_) => {}
        Err(e) => {
            tracing::error!("Cannot check for nouveau, not loading the NVIDIA module: {:#}", e);
            return Ok(ModuleOutcome::LoadFailed {
                reason: format!("unable to list loaded kernel modules: {:#}", e),
            });
        }
    }

    for module in [VENDOR_MODULE, VENDOR_UVM_MODULE] {
        let cmd = CommandSpec::new("modprobe").arg(module).privileged();
        if let Err(e) = ctx.runner.run_checked(&cmd) {
            tracing::error!("Failed to load {}: {:#}", module, e);
            return Ok(ModuleOutcome::LoadFailed {
                reason: format!("{:#}", e),
            });
        }
    }
    steps.push(StepReport::done("module load"));
    Ok(ModuleOutcome::Loaded)
}

/// Build every DKMS module that is registered but not yet built.
///
/// A failed build is reported but does not stop the run; the modprobe that
/// follows is the real test.
fn build_dkms_modules(ctx: &HostContext<'_>) -> StepReport {
    const STEP: &str = "dkms build";

    if !ctx.runner.exists("dkms") {
        return StepReport::skipped(STEP, "dkms is not installed");
    }

    let status = match ctx
        .runner
        .run_checked(&CommandSpec::new("dkms").arg("status").privileged())
    {
        Ok(output) => output.stdout,
        Err(e) => {
            tracing::warn!("dkms status failed: {:#}", e);
            return StepReport::tolerated(STEP, format!("{:#}", e));
        }
    };

    let pending = added_modules(&status);
    if pending.is_empty() {
        return StepReport::skipped(STEP, "no modules pending build");
    }

    let mut failures = Vec::new();
    for module in pending {
        tracing::info!("Building kernel module {}...", module);
        let cmd = CommandSpec::new("dkms")
            .arg("install")
            .arg(module)
            .privileged();
        if let Err(e) = ctx.runner.run_checked(&cmd) {
            tracing::warn!("dkms install {} failed: {:#}", module, e);
            failures.push(format!("{:#}", e));
        }
    }

    if failures.is_empty() {
        StepReport::done(STEP)
    } else {
        StepReport::tolerated(STEP, failures.join("; "))
    }
}

/// `module/version` of each `dkms status` entry in the `added` state.
///
/// Handles both `nvidia/550.54.15: added` and the long form
/// `nvidia/550.54.15, 5.14.0, x86_64: added`.
fn added_modules(status: &str) -> Vec<&str> {
    status
        .lines()
        .filter(|line| line.contains("added"))
        .filter_map(|line| line.split(':').next())
        .filter_map(|entry| entry.split(',').next())
        .map(str::trim)
        .filter(|module| !module.is_empty())
        .collect()
}

/// Make the vendor modules load at boot when the persistence daemon is
/// installed. Only missing lines are appended.
pub fn persist_modules(ctx: &HostContext<'_>) -> StepReport {
    const STEP: &str = "module persistence";

    if !ctx.runner.exists(PERSISTENCE_DAEMON) {
        return StepReport::skipped(STEP, format!("{} is not installed", PERSISTENCE_DAEMON));
    }

    let conf = ctx.paths.modules_load_conf("nvidia");
    let existing = fs::read_to_string(&conf).unwrap_or_default();
    let missing: Vec<&str> = BOOT_MODULES
        .iter()
        .copied()
        .filter(|m| !existing.lines().any(|l| l.trim() == *m))
        .collect();
    if missing.is_empty() {
        return StepReport::skipped(STEP, "modules already listed");
    }

    let mut content = existing;
    if !content.is_empty() && !content.ends_with('\n') {
        content.push('\n');
    }
    for module in missing {
        content.push_str(module);
        content.push('\n');
    }

    match ctx
        .runner
        .write_file(&conf, &content)
        .with_context(|| format!("updating {}", conf.display()))
    {
        Ok(()) => StepReport::done(STEP),
        Err(e) => {
            tracing::warn!("{:#}", e);
            StepReport::tolerated(STEP, format!("{:#}", e))
        }
    }
}
