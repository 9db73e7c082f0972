//! Provisioning decision.

use serde::Serialize;
use std::fmt;

use crate::gpu::{Detection, DriverStatus, GpuState};
use crate::host::HostProfile;

/// What the engine will do on this host. Never persisted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum ProvisioningPlan {
    SkipNoGpu,
    SkipUndetectable,
    SkipNoPackageManager,
    AlreadyConfigured,
    InstallRepoAndDrivers,
    RebuildKernelModule,
    RebootRequired,
}

impl ProvisioningPlan {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::SkipNoGpu => "skip-no-gpu",
            Self::SkipUndetectable => "skip-undetectable",
            Self::SkipNoPackageManager => "skip-no-package-manager",
            Self::AlreadyConfigured => "already-configured",
            Self::InstallRepoAndDrivers => "install-repo-and-drivers",
            Self::RebuildKernelModule => "rebuild-kernel-module",
            Self::RebootRequired => "reboot-required",
        }
    }

    /// Whether executing this plan touches the package manager.
    pub fn provisions(&self) -> bool {
        matches!(self, Self::InstallRepoAndDrivers | Self::RebuildKernelModule)
    }
}

impl fmt::Display for ProvisioningPlan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Pick the plan. Rules are checked in order and the first match wins.
pub fn decide(profile: &HostProfile, gpu: &GpuState) -> ProvisioningPlan {
    match gpu.detection {
        Detection::Undetectable => return ProvisioningPlan::SkipUndetectable,
        Detection::NotFound => return ProvisioningPlan::SkipNoGpu,
        Detection::Found(_) => {}
    }

    if matches!(gpu.driver, DriverStatus::Ready { .. }) {
        return ProvisioningPlan::AlreadyConfigured;
    }
    if profile.package_manager.is_none() {
        return ProvisioningPlan::SkipNoPackageManager;
    }

    match gpu.driver {
        DriverStatus::Unresponsive if gpu.modules.conflicting => ProvisioningPlan::RebootRequired,
        DriverStatus::Unresponsive => ProvisioningPlan::RebuildKernelModule,
        DriverStatus::Missing | DriverStatus::NoCompatibleVersion => {
            ProvisioningPlan::InstallRepoAndDrivers
        }
        DriverStatus::Ready { .. } => ProvisioningPlan::AlreadyConfigured,
    }
}
