//! Package-manager adapters.
//!
//! [`PackageAdapter`] hides the distro-specific command syntax for
//! registering the CUDA repository and installing packages. One adapter per
//! [`DistroFamily`] variant; [`adapter_for`] picks it from the host profile.

pub mod apt;
pub mod rpm;
pub mod sources;

use serde::Serialize;

use crate::config::DriverConfig;
use crate::context::HostContext;
use crate::error::{ProvisionError, ProvisionResult};
use crate::host::{DistroFamily, HostProfile, PackageManager, RpmBucket};

pub use apt::AptAdapter;
pub use rpm::RpmAdapter;

/// Driver metapackage published in the CUDA repositories.
pub const DRIVER_METAPACKAGE: &str = "cuda-drivers";

/// Repository coordinates for one host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RepoSpec {
    /// `rhel-family` or `debian-family`.
    pub family: &'static str,
    /// Repository directory, e.g. `rhel9`.
    pub slug: String,
    /// `.repo` file (RPM) or repository directory (apt).
    pub repo_url: String,
    /// Trust artifact: keyring package (apt) or EPEL release (rhel bucket).
    pub key_url: Option<String>,
}

impl RepoSpec {
    /// Resolve repository URLs. `None` for unsupported distros.
    pub fn resolve(profile: &HostProfile, drivers: &DriverConfig) -> Option<Self> {
        let slug = profile.family.repo_slug()?;
        let base = drivers.cuda_repo_base.trim_end_matches('/');
        let arch = profile.arch.cuda_repo_segment();
        let repo_dir = format!("{}/{}/{}", base, slug, arch);

        let spec = match &profile.family {
            DistroFamily::Rhel {
                bucket, version, ..
            } => RepoSpec {
                family: profile.family.kind(),
                repo_url: format!("{}/cuda-{}.repo", repo_dir, slug),
                key_url: (*bucket == RpmBucket::Rhel)
                    .then(|| drivers.epel_release_url(version)),
                slug,
            },
            DistroFamily::Debian { .. } => RepoSpec {
                family: profile.family.kind(),
                key_url: Some(format!("{}/{}", repo_dir, drivers.keyring_package)),
                repo_url: format!("{}/", repo_dir),
                slug,
            },
            DistroFamily::Unsupported { .. } => return None,
        };
        Some(spec)
    }
}

/// Result of a single adapter step that did not abort the run.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum StepOutcome {
    Done,
    Skipped { reason: String },
    /// Failed, but the procedure treats the failure as acceptable.
    Tolerated { reason: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StepReport {
    pub step: &'static str,
    #[serde(flatten)]
    pub outcome: StepOutcome,
}

impl StepReport {
    pub fn done(step: &'static str) -> Self {
        Self {
            step,
            outcome: StepOutcome::Done,
        }
    }

    pub fn skipped(step: &'static str, reason: impl Into<String>) -> Self {
        Self {
            step,
            outcome: StepOutcome::Skipped {
                reason: reason.into(),
            },
        }
    }

    pub fn tolerated(step: &'static str, reason: impl Into<String>) -> Self {
        Self {
            step,
            outcome: StepOutcome::Tolerated {
                reason: reason.into(),
            },
        }
    }
}

/// Uniform interface over system package managers.
pub trait PackageAdapter {
    fn manager(&self) -> PackageManager;

    /// Register the CUDA repository and its trust material.
    ///
    /// A failure here aborts driver provisioning; steps that are allowed to
    /// fail are reported as [`StepOutcome::Tolerated`].
    fn add_repository(&self, repo: &RepoSpec) -> ProvisionResult<Vec<StepReport>>;

    /// Refresh package indices. Failure is a hard failure of the plan.
    fn refresh_indices(&self) -> ProvisionResult<StepReport>;

    fn install_packages(&self, names: &[String]) -> ProvisionResult<()>;

    /// Header packages pinned to `kernel_release`.
    fn kernel_header_packages(&self, kernel_release: &str) -> Vec<String>;

    /// Packages that install the driver, in order.
    fn driver_packages(&self) -> Vec<String> {
        vec![DRIVER_METAPACKAGE.to_string()]
    }
}

/// Fail when the host's distro has no driver provisioning procedure.
///
/// Called before anything is installed whenever the plan needs drivers, so
/// the run stops with the host untouched.
pub fn ensure_supported(profile: &HostProfile) -> ProvisionResult<()> {
    if let DistroFamily::Unsupported { id } = &profile.family {
        return Err(ProvisionError::fatal(format!(
            "NVIDIA GPU detected, but distribution '{}' is not supported. \
             Install the CUDA driver manually: \
             https://docs.nvidia.com/cuda/cuda-installation-guide-linux/",
            if id.is_empty() { "unknown" } else { id }
        )));
    }
    Ok(())
}

/// Pick the adapter for this host.
///
/// An unknown distro is fatal: the GPU needs drivers and there is no
/// procedure to get them.
pub fn adapter_for<'a>(
    ctx: &'a HostContext<'a>,
    profile: &HostProfile,
) -> ProvisionResult<Box<dyn PackageAdapter + 'a>> {
    let manager = profile.package_manager.ok_or_else(|| {
        ProvisionError::provisioning(
            "package manager detection",
            anyhow::anyhow!("no supported package manager found"),
        )
    })?;

    ensure_supported(profile)?;

    if !profile.family.served_by(manager) {
        return Err(ProvisionError::provisioning(
            "package manager detection",
            anyhow::anyhow!(
                "{} cannot install packages for a {} host",
                manager,
                profile.family.kind()
            ),
        ));
    }

    match &profile.family {
        DistroFamily::Rhel { distro, .. } => Ok(Box::new(RpmAdapter::new(
            ctx.runner,
            manager,
            *distro,
            profile.family.is_legacy_rhel(),
        ))),
        DistroFamily::Debian { distro, .. } => Ok(Box::new(AptAdapter::new(ctx, *distro))),
        DistroFamily::Unsupported { .. } => unreachable!("rejected above"),
    }
}
