//! Final status report.
//!
//! Every run ends with a [`RunReport`]: logged as status lines and, when
//! `report.path` is configured, written as pretty JSON.

use anyhow::{Context, Result};
use serde::Serialize;
use std::path::Path;
use time::OffsetDateTime;

use crate::engine::{EngineRun, Outcome, ProvisioningPlan};
use crate::gpu::GpuState;
use crate::host::HostProfile;
use crate::pkg::StepReport;
use crate::process::CommandRunner;

/// Exit status for a driver provisioning failure.
pub const EXIT_DRIVER_FAILURE: u8 = 2;

/// Exit status for a fatal environment or any other escaped error.
pub const EXIT_FATAL: u8 = 1;

#[derive(Debug, Clone, Serialize)]
pub struct HostSummary {
    pub arch: String,
    pub distro: String,
    pub version: String,
    pub family: &'static str,
    pub package_manager: Option<String>,
    pub kernel_release: String,
}

impl From<&HostProfile> for HostSummary {
    fn from(profile: &HostProfile) -> Self {
        Self {
            arch: profile.arch.to_string(),
            distro: profile
                .os
                .pretty_name
                .clone()
                .unwrap_or_else(|| profile.os.id.clone()),
            version: profile.os.version_id.clone(),
            family: profile.family.kind(),
            package_manager: profile.package_manager.map(|pm| pm.to_string()),
            kernel_release: profile.kernel_release.clone(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct RunReport {
    pub started_at: String,
    pub finished_at: String,
    pub host: HostSummary,
    pub binary_installed: bool,
    pub service_active: bool,
    pub gpu: GpuState,
    pub plan: ProvisioningPlan,
    pub outcome: Outcome,
    pub steps: Vec<StepReport>,
    pub exit_code: u8,
}

impl RunReport {
    pub fn new(
        started_at: String,
        profile: &HostProfile,
        binary_installed: bool,
        service_active: bool,
        gpu: GpuState,
        run: EngineRun,
    ) -> Self {
        let exit_code = exit_code_for(&run.outcome);
        Self {
            started_at,
            finished_at: utc_timestamp(),
            host: HostSummary::from(profile),
            binary_installed,
            service_active,
            gpu,
            plan: run.plan,
            outcome: run.outcome,
            steps: run.steps,
            exit_code,
        }
    }

    /// Emit the operator-facing status lines.
    pub fn log_summary(&self) {
        if self.binary_installed || self.service_active {
            tracing::info!(
                binary_installed = self.binary_installed,
                service_active = self.service_active,
                "service installed"
            );
        }
        let summary = self.outcome.summary();
        if self.outcome.is_failure() {
            tracing::error!("{}", summary);
        } else if matches!(
            self.outcome,
            Outcome::RebootRequired | Outcome::DetectionUnavailable
        ) {
            tracing::warn!("{}", summary);
        } else {
            tracing::info!("{}", summary);
        }
        tracing::info!("Install complete.");
    }

    /// Write the report as JSON through the runner (the target may be
    /// root-owned).
    pub fn write(&self, runner: &dyn CommandRunner, path: &Path) -> Result<()> {
        let payload = serde_json::to_string_pretty(self).context("serializing run report")?;
        runner
            .write_file(path, &format!("{}\n", payload))
            .with_context(|| format!("writing run report '{}'", path.display()))
    }
}

/// 0 unless the driver branch failed.
pub fn exit_code_for(outcome: &Outcome) -> u8 {
    if outcome.is_failure() {
        EXIT_DRIVER_FAILURE
    } else {
        0
    }
}

/// Current UTC time as `YYYY-MM-DDTHH:MM:SSZ`.
pub fn utc_timestamp() -> String {
    let now = OffsetDateTime::now_utc();
    format!(
        "{:04}-{:02}-{:02}T{:02}:{:02}:{:02}Z",
        now.year(),
        now.month() as u8,
        now.day(),
        now.hour(),
        now.minute(),
        now.second()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes() {
        assert_eq!(exit_code_for(&Outcome::Ready), 0);
        assert_eq!(exit_code_for(&Outcome::RebootRequired), 0);
        assert_eq!(exit_code_for(&Outcome::CpuOnly), 0);
        assert_eq!(exit_code_for(&Outcome::DetectionUnavailable), 0);
        assert_eq!(
            exit_code_for(&Outcome::DriverInstallSkipped {
                reason: "no supported package manager found".to_string()
            }),
            0
        );
        assert_eq!(
            exit_code_for(&Outcome::ModuleLoadFailed {
                reason: "modprobe".to_string()
            }),
            EXIT_DRIVER_FAILURE
        );
        assert_eq!(
            exit_code_for(&Outcome::ProvisioningFailed {
                step: "index refresh",
                reason: "exit code 100".to_string()
            }),
            EXIT_DRIVER_FAILURE
        );
    }

    #[test]
    fn test_utc_timestamp_shape() {
        let ts = utc_timestamp();
        assert_eq!(ts.len(), 20);
        assert_eq!(&ts[4..5], "-");
        assert_eq!(&ts[10..11], "T");
        assert!(ts.ends_with('Z'));
    }
}
