//! End-to-end run: preflight, probe, support check, binary, service, drivers, report.

use anyhow::Context;
use std::env;
use tempfile::TempDir;

use crate::config::Config;
use crate::context::{HostContext, HostPaths};
use crate::engine::{self, Engine};
use crate::error::{ProvisionError, ProvisionResult};
use crate::gpu;
use crate::host;
use crate::install::{
    BinaryInstaller, FetchInstaller, ServiceRegistrar, ServiceSpec, SystemdRegistrar,
};
use crate::pkg;
use crate::preflight::{self, REQUIRED_TOOLS};
use crate::process::{CommandRunner, SystemRunner};
use crate::report::{self, RunReport};

/// Owns the configuration and the run-scoped scratch directory, which is
/// removed when the installer is dropped.
pub struct Installer {
    config: Config,
    scratch: TempDir,
}

impl Installer {
    pub fn new(config: Config) -> anyhow::Result<Self> {
        let scratch = tempfile::Builder::new()
            .prefix("host-provisioner-")
            .tempdir()
            .context("creating scratch directory")?;
        Ok(Self { config, scratch })
    }

    /// Run against the real host.
    pub fn run(&self) -> ProvisionResult<RunReport> {
        let elevation = preflight::resolve_elevation()?;
        let runner = SystemRunner::new(elevation);
        self.run_on(&runner, &HostPaths::system())
    }

    /// Run against any host. Errors are fatal environment or install
    /// failures; driver failures are part of the report.
    pub fn run_on(&self, runner: &dyn CommandRunner, paths: &HostPaths) -> ProvisionResult<RunReport> {
        let started_at = report::utc_timestamp();
        preflight::check_required_tools(runner, REQUIRED_TOOLS)?;

        let ctx = HostContext::new(runner, paths, self.scratch.path());
        let profile = host::probe_host(&ctx)?;
        tracing::info!(
            "Detected {} {} ({})",
            profile.os.pretty_name.as_deref().unwrap_or(&profile.os.id),
            profile.os.version_id,
            profile.arch
        );

        // Driver support is settled before anything is written to the host.
        let gpu = gpu::probe_gpu(runner);
        let plan = engine::decide(&profile, &gpu);
        if plan.provisions() && self.config.drivers.enabled {
            pkg::ensure_supported(&profile)?;
        }

        let service = &self.config.service;
        let binary = FetchInstaller::new(&ctx, &self.config.binary, &service.name);
        let binary_installed = binary.install()?;

        let spec = ServiceSpec {
            name: service.name.clone(),
            user: service.user().to_string(),
            home: service.home(),
            exec_path: binary.target(),
            args: service.args.clone(),
            restart: service.restart.clone(),
            environment: self.service_environment()?,
        };
        let service_active = SystemdRegistrar::new(&ctx).register(&spec)?;

        let run = Engine::new(&ctx, &profile, &self.config.drivers).run(&gpu)?;

        let report = RunReport::new(started_at, &profile, binary_installed, service_active, gpu, run);
        report.log_summary();

        if let Some(path) = &self.config.report.path {
            if let Err(e) = report.write(runner, &paths.resolve(path)) {
                tracing::warn!("{:#}", e);
            }
        }
        Ok(report)
    }

    /// Configured entries, plus the installer's PATH unless overridden.
    fn service_environment(&self) -> ProvisionResult<Vec<(String, String)>> {
        let mut environment = self
            .config
            .service
            .environment()
            .map_err(|e| ProvisionError::fatal(format!("{:#}", e)))?;
        if !environment.iter().any(|(key, _)| key == "PATH") {
            if let Ok(path) = env::var("PATH") {
                environment.insert(0, ("PATH".to_string(), path));
            }
        }
        Ok(environment)
    }
}
