//! Preflight checks.
//!
//! Resolves how privileged commands will run and validates that the host has
//! the base tools before anything is touched. Every failure here is a
//! [`ProvisionError::FatalEnvironment`]: nothing has been attempted yet.
//!
//! # Example
//!
//! ```rust,no_run
//! use host_provisioner::preflight::{check_required_tools, resolve_elevation, REQUIRED_TOOLS};
//! use host_provisioner::process::SystemRunner;
//!
//! let elevation = resolve_elevation()?;
//! let runner = SystemRunner::new(elevation);
//! check_required_tools(&runner, REQUIRED_TOOLS)?;
//! # Ok::<(), host_provisioner::ProvisionError>(())
//! ```

use crate::error::{ProvisionError, ProvisionResult};
use crate::process::{CommandRunner, Elevation};

/// Tools the installer cannot work without.
///
/// Each tuple is (command_name, package_name).
pub const REQUIRED_TOOLS: &[(&str, &str)] = &[("curl", "curl"), ("uname", "coreutils")];

/// Pick the elevation strategy for a given effective uid.
pub fn elevation_for(euid: u32, has_sudo: bool) -> ProvisionResult<Elevation> {
    if euid == 0 {
        return Ok(Elevation::Root);
    }
    if has_sudo {
        return Ok(Elevation::Sudo);
    }
    Err(ProvisionError::fatal(
        "This script requires superuser permissions. Please re-run as root.",
    ))
}

/// Resolve elevation for the current process.
pub fn resolve_elevation() -> ProvisionResult<Elevation> {
    // SAFETY: geteuid has no preconditions and cannot fail.
    let euid = unsafe { libc::geteuid() };
    let elevation = elevation_for(euid, which::which("sudo").is_ok())?;
    if elevation == Elevation::Sudo {
        tracing::debug!(euid, "not root, privileged commands will use sudo");
    }
    Ok(elevation)
}

/// Check that specific tools are available.
///
/// # Returns
///
/// * `Ok(())` if all tools are found
/// * `Err` listing each missing tool and the package that provides it
pub fn check_required_tools(
    runner: &dyn CommandRunner,
    tools: &[(&str, &str)],
) -> ProvisionResult<()> {
    let missing: Vec<(&str, &str)> = tools
        .iter()
        .copied()
        .filter(|(tool, _)| !runner.exists(tool))
        .collect();

    if !missing.is_empty() {
        let msg = missing
            .iter()
            .map(|(t, p)| format!("  {} (install: {})", t, p))
            .collect::<Vec<_>>()
            .join("\n");
        return Err(ProvisionError::fatal(format!(
            "Missing required host tools:\n{}",
            msg
        )));
    }

    Ok(())
}
