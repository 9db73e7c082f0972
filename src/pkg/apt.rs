//! apt adapter for Debian and Ubuntu.

use std::path::Path;

use crate::context::{HostContext, HostPaths};
use crate::error::{ProvisionError, ProvisionResult};
use crate::host::{Distro, PackageManager};
use crate::process::{CommandRunner, CommandSpec};

use super::{sources, PackageAdapter, RepoSpec, StepReport};

pub struct AptAdapter<'a> {
    runner: &'a dyn CommandRunner,
    paths: &'a HostPaths,
    scratch: &'a Path,
    distro: Distro,
}

impl<'a> AptAdapter<'a> {
    pub fn new(ctx: &'a HostContext<'a>, distro: Distro) -> Self {
        Self {
            runner: ctx.runner,
            paths: ctx.paths,
            scratch: ctx.scratch,
            distro,
        }
    }
}

impl PackageAdapter for AptAdapter<'_> {
    fn manager(&self) -> PackageManager {
        PackageManager::Apt
    }

    fn add_repository(&self, repo: &RepoSpec) -> ProvisionResult<Vec<StepReport>> {
        let key_url = repo.key_url.as_deref().ok_or_else(|| {
            ProvisionError::provisioning(
                "keyring download",
                anyhow::anyhow!("no keyring package for {}", repo.slug),
            )
        })?;
        let file_name = key_url.rsplit('/').next().unwrap_or("cuda-keyring.deb");
        let keyring = self.scratch.join(file_name);

        tracing::info!("Installing NVIDIA repository...");
        self.runner
            .run_checked(
                &CommandSpec::new("curl")
                    .args(["-fsSL", "-o"])
                    .arg(keyring.display().to_string())
                    .arg(key_url),
            )
            .map_err(|e| ProvisionError::provisioning("keyring download", e))?;

        self.runner
            .run_checked(
                &CommandSpec::new("dpkg")
                    .arg("-i")
                    .arg(keyring.display().to_string())
                    .privileged(),
            )
            .map_err(|e| ProvisionError::provisioning("keyring installation", e))?;

        let mut steps = vec![StepReport::done("keyring installation")];
        if self.distro == Distro::Debian {
            steps.push(sources::enable_contrib(self.runner, self.paths)?);
        }
        Ok(steps)
    }

    fn refresh_indices(&self) -> ProvisionResult<StepReport> {
        self.runner
            .run_checked(&CommandSpec::new("apt-get").arg("update").privileged())
            .map_err(|e| ProvisionError::provisioning("index refresh", e))?;
        Ok(StepReport::done("index refresh"))
    }

    fn kernel_header_packages(&self, kernel_release: &str) -> Vec<String> {
        self.distro.kernel_header_packages(kernel_release)
    }

    fn install_packages(&self, names: &[String]) -> ProvisionResult<()> {
        let cmd = CommandSpec::new("apt-get")
            .env("DEBIAN_FRONTEND", "noninteractive")
            .args(["-y", "install"])
            .args(names.iter().cloned())
            .arg("-q")
            .privileged();
        self.runner
            .run_checked(&cmd)
            .map_err(|e| ProvisionError::provisioning("package installation", e))?;
        Ok(())
    }
}
