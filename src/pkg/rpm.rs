//! dnf/yum adapter.

use crate::error::{ProvisionError, ProvisionResult};
use crate::host::{Distro, PackageManager};
use crate::process::{CommandRunner, CommandSpec};

use super::{PackageAdapter, RepoSpec, StepReport, DRIVER_METAPACKAGE};

/// DKMS driver package required before the metapackage on legacy RHEL.
pub const LEGACY_DKMS_PACKAGE: &str = "nvidia-driver-latest-dkms";

pub struct RpmAdapter<'a> {
    runner: &'a dyn CommandRunner,
    manager: PackageManager,
    distro: Distro,
    legacy: bool,
}

impl<'a> RpmAdapter<'a> {
    pub fn new(
        runner: &'a dyn CommandRunner,
        manager: PackageManager,
        distro: Distro,
        legacy: bool,
    ) -> Self {
        Self {
            runner,
            manager,
            distro,
            legacy,
        }
    }

    fn install_cmd(&self) -> CommandSpec {
        CommandSpec::new(self.manager.binary())
            .args(["-y", "install"])
            .privileged()
    }

    fn register(&self, repo_url: &str) -> anyhow::Result<()> {
        match self.manager {
            PackageManager::Yum => {
                self.runner.run_checked(&self.install_cmd().arg("yum-utils"))?;
                self.runner.run_checked(
                    &CommandSpec::new("yum-config-manager")
                        .arg("--add-repo")
                        .arg(repo_url)
                        .privileged(),
                )?;
            }
            PackageManager::Dnf => {
                self.runner.run_checked(
                    &CommandSpec::new("dnf")
                        .args(["config-manager", "--add-repo"])
                        .arg(repo_url)
                        .privileged(),
                )?;
            }
            PackageManager::Apt => anyhow::bail!("apt-get cannot register RPM repositories"),
        }
        Ok(())
    }
}

impl PackageAdapter for RpmAdapter<'_> {
    fn manager(&self) -> PackageManager {
        self.manager
    }

    fn add_repository(&self, repo: &RepoSpec) -> ProvisionResult<Vec<StepReport>> {
        let mut steps = Vec::new();

        tracing::info!("Installing NVIDIA repository...");
        let head = CommandSpec::new("curl")
            .args(["-I", "--silent", "--fail", "--location"])
            .arg(&repo.repo_url);
        if let Err(e) = self.runner.run_checked(&head) {
            tracing::debug!("repository probe failed: {:#}", e);
            return Err(ProvisionError::provisioning(
                "repository registration",
                anyhow::anyhow!(
                    "NVIDIA GPU detected, but NVIDIA publishes no CUDA repository for {} \
                     on this architecture ({}). Install the CUDA driver manually: \
                     https://docs.nvidia.com/cuda/cuda-installation-guide-linux/",
                    repo.slug,
                    repo.repo_url
                ),
            ));
        }

        self.register(&repo.repo_url)
            .map_err(|e| ProvisionError::provisioning("repository registration", e))?;
        steps.push(StepReport::done("repository registration"));

        // EPEL carries dkms and libvdpau for the rhel bucket. It may already
        // be configured, so a failed install is not fatal.
        if let Some(epel_url) = &repo.key_url {
            tracing::info!("Installing EPEL repository...");
            match self.runner.run_checked(&self.install_cmd().arg(epel_url)) {
                Ok(_) => steps.push(StepReport::done("epel installation")),
                Err(e) => {
                    tracing::warn!("EPEL installation failed, continuing: {:#}", e);
                    steps.push(StepReport::tolerated("epel installation", format!("{:#}", e)));
                }
            }
        }

        Ok(steps)
    }

    /// dnf and yum refresh metadata on install.
    fn refresh_indices(&self) -> ProvisionResult<StepReport> {
        Ok(StepReport::skipped(
            "index refresh",
            format!("{} refreshes metadata on install", self.manager),
        ))
    }

    fn install_packages(&self, names: &[String]) -> ProvisionResult<()> {
        self.runner
            .run_checked(&self.install_cmd().args(names.iter().cloned()))
            .map_err(|e| ProvisionError::provisioning("package installation", e))?;
        Ok(())
    }

    fn kernel_header_packages(&self, kernel_release: &str) -> Vec<String> {
        self.distro.kernel_header_packages(kernel_release)
    }

    fn driver_packages(&self) -> Vec<String> {
        let mut packages = Vec::new();
        if self.legacy {
            packages.push(LEGACY_DKMS_PACKAGE.to_string());
        }
        packages.push(DRIVER_METAPACKAGE.to_string());
        packages
    }
}
