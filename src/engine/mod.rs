//! Driver provisioning engine.
//!
//! [`decide`] turns the probed host and GPU state into a
//! [`ProvisioningPlan`]; [`Engine::execute`] carries the plan out and
//! reports a terminal [`Outcome`]. A failed provisioning step ends the
//! driver branch with [`Outcome::ProvisioningFailed`] instead of an error,
//! so the binary and service stay in place and usable on CPU.

pub mod kernel;
pub mod plan;

pub use kernel::ModuleOutcome;
pub use plan::{decide, ProvisioningPlan};

use serde::Serialize;

use crate::config::DriverConfig;
use crate::context::HostContext;
use crate::error::{ProvisionError, ProvisionResult};
use crate::gpu::GpuState;
use crate::host::HostProfile;
use crate::pkg::{self, PackageAdapter, RepoSpec, StepReport};

/// Terminal state of a run's driver branch.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "kebab-case")]
pub enum Outcome {
    /// Drivers were provisioned in this run and the modules are loaded.
    Ready,
    AlreadyConfigured,
    /// No GPU on the bus.
    CpuOnly,
    /// No scanning tool was available to look for a GPU.
    DetectionUnavailable,
    DriverInstallSkipped { reason: String },
    /// Successful but incomplete: the conflicting module must go away first.
    RebootRequired,
    ProvisioningFailed { step: &'static str, reason: String },
    ModuleLoadFailed { reason: String },
}

impl Outcome {
    /// Whether the driver branch failed.
    pub fn is_failure(&self) -> bool {
        matches!(
            self,
            Outcome::ProvisioningFailed { .. } | Outcome::ModuleLoadFailed { .. }
        )
    }

    pub fn summary(&self) -> String {
        match self {
            Outcome::Ready => "NVIDIA GPU ready.".to_string(),
            Outcome::AlreadyConfigured => "NVIDIA GPU installed.".to_string(),
            Outcome::CpuOnly => "No NVIDIA GPU detected. Running in CPU-only mode.".to_string(),
            Outcome::DetectionUnavailable => {
                "Unable to detect NVIDIA GPU (no lspci or lshw). Running in CPU-only mode."
                    .to_string()
            }
            Outcome::DriverInstallSkipped { reason } => {
                format!("Skipping NVIDIA driver install: {}.", reason)
            }
            Outcome::RebootRequired => "Reboot to complete NVIDIA CUDA driver install.".to_string(),
            Outcome::ProvisioningFailed { step, reason } => {
                format!("NVIDIA driver install failed at {}: {}", step, reason)
            }
            Outcome::ModuleLoadFailed { reason } => {
                format!("NVIDIA kernel module failed to load: {}", reason)
            }
        }
    }
}

/// Plan, outcome and the steps taken to get there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EngineRun {
    pub plan: ProvisioningPlan,
    pub outcome: Outcome,
    pub steps: Vec<StepReport>,
}

pub struct Engine<'a> {
    ctx: &'a HostContext<'a>,
    profile: &'a HostProfile,
    drivers: &'a DriverConfig,
}

impl<'a> Engine<'a> {
    pub fn new(ctx: &'a HostContext<'a>, profile: &'a HostProfile, drivers: &'a DriverConfig) -> Self {
        Self {
            ctx,
            profile,
            drivers,
        }
    }

    /// Decide and execute in one go.
    pub fn run(&self, gpu: &GpuState) -> ProvisionResult<EngineRun> {
        let plan = decide(self.profile, gpu);
        tracing::info!(%plan, "driver provisioning plan");

        if plan.provisions() && !self.drivers.enabled {
            return Ok(EngineRun {
                plan,
                outcome: Outcome::DriverInstallSkipped {
                    reason: "driver provisioning is disabled in the configuration".to_string(),
                },
                steps: Vec::new(),
            });
        }
        self.execute(plan)
    }

    /// Carry out `plan`. Only a fatal environment error escapes; provisioning
    /// failures become [`Outcome::ProvisioningFailed`].
    pub fn execute(&self, plan: ProvisioningPlan) -> ProvisionResult<EngineRun> {
        let mut steps = Vec::new();

        let result = match plan {
            ProvisioningPlan::SkipNoGpu => Ok(Outcome::CpuOnly),
            ProvisioningPlan::SkipUndetectable => Ok(Outcome::DetectionUnavailable),
            ProvisioningPlan::SkipNoPackageManager => Ok(Outcome::DriverInstallSkipped {
                reason: "no supported package manager found".to_string(),
            }),
            ProvisioningPlan::AlreadyConfigured => Ok(Outcome::AlreadyConfigured),
            ProvisioningPlan::RebootRequired => Ok(Outcome::RebootRequired),
            ProvisioningPlan::InstallRepoAndDrivers => self.install_drivers(&mut steps),
            ProvisioningPlan::RebuildKernelModule => self.rebuild_module(&mut steps),
        };

        let outcome = match result {
            Ok(outcome) => outcome,
            Err(ProvisionError::Provisioning { step, reason }) => {
                tracing::error!("{} failed: {}", step, reason);
                Outcome::ProvisioningFailed { step, reason }
            }
            Err(e) => return Err(e),
        };

        if outcome == Outcome::Ready {
            steps.push(kernel::persist_modules(self.ctx));
        }

        Ok(EngineRun {
            plan,
            outcome,
            steps,
        })
    }

    fn install_drivers(&self, steps: &mut Vec<StepReport>) -> ProvisionResult<Outcome> {
        let adapter = pkg::adapter_for(self.ctx, self.profile)?;
        let repo = RepoSpec::resolve(self.profile, self.drivers).ok_or_else(|| {
            ProvisionError::fatal(format!(
                "no CUDA repository for {}",
                self.profile.family.kind()
            ))
        })?;

        steps.extend(adapter.add_repository(&repo)?);
        steps.push(adapter.refresh_indices()?);

        tracing::info!("Installing CUDA driver...");
        for package in adapter.driver_packages() {
            adapter.install_packages(std::slice::from_ref(&package))?;
        }
        steps.push(StepReport::done("driver installation"));

        self.converge(adapter.as_ref(), steps)
    }

    fn rebuild_module(&self, steps: &mut Vec<StepReport>) -> ProvisionResult<Outcome> {
        tracing::info!("NVIDIA driver installed but not responding; rebuilding kernel module");
        let adapter = pkg::adapter_for(self.ctx, self.profile)?;
        self.converge(adapter.as_ref(), steps)
    }

    fn converge(&self, adapter: &dyn PackageAdapter, steps: &mut Vec<StepReport>) -> ProvisionResult<Outcome> {
        Ok(match kernel::converge(self.ctx, adapter, self.profile, steps)? {
            ModuleOutcome::Loaded => Outcome::Ready,
            ModuleOutcome::RebootRequired => Outcome::RebootRequired,
            ModuleOutcome::LoadFailed { reason } => Outcome::ModuleLoadFailed { reason },
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gpu;
    use crate::host::probe_host;
    use crate::testing::{FakeHost, KERNEL_RELEASE};

    const PM_PREFIXES: [&str; 5] = ["dnf", "yum", "apt-get", "dpkg", "DEBIAN_FRONTEND"];

    /// Probe the fake host and run the engine against it.
    fn provision(host: &FakeHost, drivers: &DriverConfig) -> ProvisionResult<EngineRun> {
        let paths = host.paths();
        let scratch = host.scratch();
        let ctx = HostContext::new(host, &paths, &scratch);
        let profile = probe_host(&ctx)?;
        let gpu = gpu::probe_gpu(host);
        Engine::new(&ctx, &profile, drivers).run(&gpu)
    }

    fn package_manager_calls(host: &FakeHost) -> Vec<String> {
        host.calls()
            .into_iter()
            .filter(|c| PM_PREFIXES.iter().any(|p| c.starts_with(p)))
            .collect()
    }

    #[test]
    fn test_rhel9_installs_epel_before_drivers() {
        let host = FakeHost::rhel9().with_gpu();

        let run = provision(&host, &DriverConfig::default()).unwrap();

        assert_eq!(run.plan, ProvisioningPlan::InstallRepoAndDrivers);
        assert_eq!(run.outcome, Outcome::Ready);
        let epel = host.position("dnf -y install https://dl.fedoraproject.org").unwrap();
        let drivers = host.position("dnf -y install cuda-drivers").unwrap();
        assert!(epel < drivers);
        assert!(host.called(&format!(
            "dnf -y install kernel-devel-{0} kernel-headers-{0}",
            KERNEL_RELEASE
        )));
        assert!(host.has_module("nvidia"));
        assert!(host.has_module("nvidia_uvm"));
    }

    #[test]
    fn test_debian12_order() {
        let host = FakeHost::debian12().with_gpu();

        let run = provision(&host, &DriverConfig::default()).unwrap();

        assert_eq!(run.outcome, Outcome::Ready);
        let keyring = host.position("dpkg -i").unwrap();
        let contrib = host.position("write /etc/apt/sources.list.d/contrib.list").unwrap();
        let refresh = host.position("apt-get update").unwrap();
        let drivers = host
            .position("DEBIAN_FRONTEND=noninteractive apt-get -y install cuda-drivers")
            .unwrap();
        assert!(keyring < contrib);
        assert!(contrib < refresh);
        assert!(refresh < drivers);
        assert!(host.called(&format!(
            "DEBIAN_FRONTEND=noninteractive apt-get -y install linux-headers-{} -q",
            KERNEL_RELEASE
        )));
    }

    #[test]
    fn test_working_driver_makes_no_package_manager_calls() {
        let host = FakeHost::rhel9().with_gpu().with_working_driver();

        let run = provision(&host, &DriverConfig::default()).unwrap();

        assert_eq!(run.plan, ProvisioningPlan::AlreadyConfigured);
        assert_eq!(run.outcome, Outcome::AlreadyConfigured);
        assert!(package_manager_calls(&host).is_empty());
        assert!(run.steps.is_empty());
    }

    #[test]
    fn test_nouveau_requires_reboot_without_modprobe() {
        let host = FakeHost::rhel9().with_gpu().with_module("nouveau");

        let run = provision(&host, &DriverConfig::default()).unwrap();

        assert_eq!(run.plan, ProvisioningPlan::InstallRepoAndDrivers);
        assert_eq!(run.outcome, Outcome::RebootRequired);
        assert!(host.called("dnf -y install cuda-drivers"));
        assert!(!host.called("modprobe"));
    }

    #[test]
    fn test_unreadable_modules_skip_module_load() {
        let host = FakeHost::rhel9()
            .with_gpu()
            .with_module("nouveau")
            .fail_on("lsmod");

        let run = provision(&host, &DriverConfig::default()).unwrap();

        assert!(matches!(run.outcome, Outcome::ModuleLoadFailed { .. }));
        assert!(host.called("dnf -y install cuda-drivers"));
        assert!(!host.called("modprobe"));
    }

    #[test]
    fn test_legacy_rhel_installs_dkms_package_first() {
        let host = FakeHost::new()
            .with_os_release("rhel", "7.9")
            .with_tools(&["yum", "yum-config-manager", "lspci"])
            .with_gpu();

        let run = provision(&host, &DriverConfig::default()).unwrap();

        assert_eq!(run.plan, ProvisioningPlan::InstallRepoAndDrivers);
        assert_eq!(run.outcome, Outcome::Ready);
        let utils = host.position("yum -y install yum-utils").unwrap();
        let register = host.position("yum-config-manager --add-repo").unwrap();
        let epel = host
            .position("yum -y install https://dl.fedoraproject.org/pub/epel/epel-release-latest-7")
            .unwrap();
        let dkms = host.position("yum -y install nvidia-driver-latest-dkms").unwrap();
        let drivers = host.position("yum -y install cuda-drivers").unwrap();
        assert!(utils < register);
        assert!(register < epel);
        assert!(epel < dkms);
        assert!(dkms < drivers);
    }

    #[test]
    fn test_rpm_report_marks_refresh_skipped() {
        let host = FakeHost::rhel9().with_gpu();

        let run = provision(&host, &DriverConfig::default()).unwrap();

        let refresh = run.steps.iter().find(|s| s.step == "index refresh").unwrap();
        assert!(matches!(refresh.outcome, pkg::StepOutcome::Skipped { .. }));
    }

    #[test]
    fn test_second_run_is_already_configured() {
        let host = FakeHost::rhel9().with_gpu();
        let first = provision(&host, &DriverConfig::default()).unwrap();
        assert_eq!(first.outcome, Outcome::Ready);
        host.clear_calls();

        let second = provision(&host, &DriverConfig::default()).unwrap();

        assert_eq!(second.plan, ProvisioningPlan::AlreadyConfigured);
        assert!(package_manager_calls(&host).is_empty());
    }

    #[test]
    fn test_repo_failure_ends_driver_branch() {
        let host = FakeHost::rhel9().with_gpu().fail_on("dnf config-manager");

        let run = provision(&host, &DriverConfig::default()).unwrap();

        assert!(run.outcome.is_failure());
        assert!(matches!(
            run.outcome,
            Outcome::ProvisioningFailed {
                step: "repository registration",
                ..
            }
        ));
        assert!(!host.called("dnf -y install cuda-drivers"));
    }

    #[test]
    fn test_epel_failure_still_installs_drivers() {
        let host = FakeHost::rhel9()
            .with_gpu()
            .fail_on("dnf -y install https://dl.fedoraproject.org");

        let run = provision(&host, &DriverConfig::default()).unwrap();

        assert_eq!(run.outcome, Outcome::Ready);
        assert!(run
            .steps
            .iter()
            .any(|s| s.step == "epel installation"
                && matches!(s.outcome, pkg::StepOutcome::Tolerated { .. })));
    }

    #[test]
    fn test_modprobe_failure_is_module_load_failed() {
        let host = FakeHost::rhel9().with_gpu().fail_on("modprobe nvidia_uvm");

        let run = provision(&host, &DriverConfig::default()).unwrap();

        assert!(matches!(run.outcome, Outcome::ModuleLoadFailed { .. }));
        assert!(run.outcome.is_failure());
    }

    #[test]
    fn test_stale_driver_rebuilds_without_repository() {
        let host = FakeHost::rhel9().with_gpu().with_stale_driver();

        let run = provision(&host, &DriverConfig::default()).unwrap();

        assert_eq!(run.plan, ProvisioningPlan::RebuildKernelModule);
        assert_eq!(run.outcome, Outcome::Ready);
        assert!(!host.called("curl"));
        assert!(!host.called("dnf -y install cuda-drivers"));
        assert!(host.called("dkms install"));
    }

    #[test]
    fn test_unknown_distro_with_gpu_is_fatal() {
        let host = FakeHost::new()
            .with_os_release("gentoo", "2.14")
            .with_tools(&["dnf", "lspci"])
            .with_gpu();

        let err = provision(&host, &DriverConfig::default()).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn test_no_scanner_is_detection_unavailable() {
        let host = FakeHost::rhel9().without_tool("lspci").with_gpu();

        let run = provision(&host, &DriverConfig::default()).unwrap();

        assert_eq!(run.outcome, Outcome::DetectionUnavailable);
        assert!(package_manager_calls(&host).is_empty());
    }

    #[test]
    fn test_no_gpu_is_cpu_only() {
        let host = FakeHost::rhel9();
        let run = provision(&host, &DriverConfig::default()).unwrap();
        assert_eq!(run.outcome, Outcome::CpuOnly);
        assert!(!run.outcome.is_failure());
    }

    #[test]
    fn test_disabled_drivers_skip_install() {
        let host = FakeHost::rhel9().with_gpu();
        let drivers = DriverConfig {
            enabled: false,
            ..DriverConfig::default()
        };

        let run = provision(&host, &drivers).unwrap();

        assert_eq!(run.plan, ProvisioningPlan::InstallRepoAndDrivers);
        assert!(matches!(run.outcome, Outcome::DriverInstallSkipped { .. }));
        assert!(package_manager_calls(&host).is_empty());
    }

    #[test]
    fn test_ready_persists_modules_with_daemon() {
        let host = FakeHost::rhel9()
            .with_gpu()
            .with_tools(&[kernel::PERSISTENCE_DAEMON]);

        provision(&host, &DriverConfig::default()).unwrap();

        assert_eq!(
            host.read("etc/modules-load.d/nvidia.conf"),
            "nvidia\nnvidia-uvm\n"
        );
    }

    #[test]
    fn test_outcome_serializes_with_status_tag() {
        let json = serde_json::to_value(Outcome::ProvisioningFailed {
            step: "index refresh",
            reason: "exit code 100".to_string(),
        })
        .unwrap();
        assert_eq!(json["status"], "provisioning-failed");
        assert_eq!(json["step"], "index refresh");
    }
}
