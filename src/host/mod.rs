//! Host environment probe.
//!
//! Read-only detection of everything the provisioning decision depends on
//! except the GPU itself (see [`crate::gpu`]). The only fatal outcome here
//! is an unsupported architecture; an unreadable os-release or missing
//! package manager just disables driver provisioning later on.

pub mod arch;
pub mod distro;
pub mod os_release;

pub use arch::Architecture;
pub use distro::{Distro, DistroFamily, PackageManager, RpmBucket};
pub use os_release::OsRelease;

use serde::Serialize;

use crate::context::HostContext;
use crate::error::{ProvisionError, ProvisionResult};
use crate::process::{CommandRunner, CommandSpec};

/// Immutable snapshot of the host, probed once per run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HostProfile {
    pub arch: Architecture,
    pub os: OsRelease,
    pub family: DistroFamily,
    pub package_manager: Option<PackageManager>,
    /// Running kernel release (`uname -r`).
    pub kernel_release: String,
}

/// Determine the CPU architecture. Fails fatally on anything unsupported.
pub fn probe_arch(runner: &dyn CommandRunner) -> ProvisionResult<Architecture> {
    let machine = uname(runner, "-m")?;
    machine.parse()
}

/// Probe architecture, OS identity, package manager and kernel release.
pub fn probe_host(ctx: &HostContext<'_>) -> ProvisionResult<HostProfile> {
    let arch = probe_arch(ctx.runner)?;

    let os = match OsRelease::load(&ctx.paths.os_release()) {
        Ok(os) => os,
        Err(e) => {
            tracing::warn!("Unable to identify distribution: {:#}", e);
            OsRelease::default()
        }
    };
    let family = DistroFamily::from_os_release(&os);
    let package_manager = PackageManager::detect(ctx.runner);
    let kernel_release = uname(ctx.runner, "-r")?;

    tracing::debug!(
        %arch,
        distro = %os.id,
        version = %os.version_id,
        family = family.kind(),
        package_manager = ?package_manager,
        kernel = %kernel_release,
        "host probed"
    );

    Ok(HostProfile {
        arch,
        os,
        family,
        package_manager,
        kernel_release,
    })
}

fn uname(runner: &dyn CommandRunner, flag: &str) -> ProvisionResult<String> {
    let output = runner
        .run_checked(&CommandSpec::new("uname").arg(flag))
        .map_err(|e| ProvisionError::fatal(format!("Unable to run uname {}: {:#}", flag, e)))?;
    Ok(output.stdout.trim().to_string())
}
