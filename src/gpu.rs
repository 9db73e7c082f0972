//! GPU detection and kernel module state.
//!
//! Detection runs in priority order and stops at the first method that
//! answers:
//!
//! 1. the vendor tool (`nvidia-smi`)
//! 2. a PCI bus scan (`lspci -d 10de:`)
//! 3. the hardware lister (`lshw -c display`)
//!
//! When neither scanner is installed the result is [`Detection::Undetectable`],
//! which is distinct from [`Detection::NotFound`].

use serde::Serialize;

use crate::process::{CommandRunner, CommandSpec};

/// PCI vendor id assigned to NVIDIA.
pub const NVIDIA_PCI_VENDOR: &str = "10de";

/// Vendor kernel modules that must be loaded for the runtime to work.
pub const VENDOR_MODULE: &str = "nvidia";
pub const VENDOR_UVM_MODULE: &str = "nvidia_uvm";

/// Open-source driver that conflicts with the vendor module.
pub const CONFLICTING_MODULE: &str = "nouveau";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GpuVendor {
    Nvidia,
    None,
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DetectionMethod {
    VendorTool,
    PciScan,
    HardwareLister,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(tag = "result", content = "method", rename_all = "snake_case")]
pub enum Detection {
    Found(DetectionMethod),
    NotFound,
    /// No scanning tool is installed, so absence cannot be established.
    Undetectable,
}

/// What the vendor tool says about the installed driver.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum DriverStatus {
    /// `nvidia-smi` is not installed.
    Missing,
    /// `nvidia-smi` is installed but cannot talk to the driver.
    Unresponsive,
    /// `nvidia-smi` works but reports no CUDA-capable driver version.
    NoCompatibleVersion,
    Ready { cuda_version: String },
}

/// Loaded kernel modules relevant to the driver.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ModuleState {
    pub vendor: bool,
    pub vendor_uvm: bool,
    pub conflicting: bool,
}

impl ModuleState {
    /// Parse `lsmod` output.
    pub fn parse(lsmod: &str) -> Self {
        let mut state = Self::default();
        for name in lsmod.lines().skip(1).filter_map(|l| l.split_whitespace().next()) {
            match name {
                VENDOR_MODULE => state.vendor = true,
                VENDOR_UVM_MODULE => state.vendor_uvm = true,
                CONFLICTING_MODULE => state.conflicting = true,
                _ => {}
            }
        }
        state
    }

    /// Both vendor modules are loaded.
    pub fn vendor_active(&self) -> bool {
        self.vendor && self.vendor_uvm
    }
}

/// GPU snapshot. Re-probed after provisioning steps.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GpuState {
    pub vendor: GpuVendor,
    pub detection: Detection,
    pub driver: DriverStatus,
    pub modules: ModuleState,
}

impl GpuState {
    pub fn is_present(&self) -> bool {
        matches!(self.detection, Detection::Found(_))
    }
}

/// Read loaded kernel modules.
///
/// Callers that act on the conflicting module must treat an error as
/// "state unknown", never as "nothing loaded".
pub fn probe_modules(runner: &dyn CommandRunner) -> anyhow::Result<ModuleState> {
    let output = runner.run_checked(&CommandSpec::new("lsmod"))?;
    Ok(ModuleState::parse(&output.stdout))
}

/// Detect the GPU, first success wins.
pub fn probe_gpu(runner: &dyn CommandRunner) -> GpuState {
    // Only informs the plan; the engine re-reads modules before modprobe.
    let modules = probe_modules(runner).unwrap_or_else(|e| {
        tracing::warn!("Unable to list kernel modules: {:#}", e);
        ModuleState::default()
    });
    let driver = query_vendor_tool(runner);

    if matches!(
        driver,
        DriverStatus::Ready { .. } | DriverStatus::NoCompatibleVersion
    ) {
        return GpuState {
            vendor: GpuVendor::Nvidia,
            detection: Detection::Found(DetectionMethod::VendorTool),
            driver,
            modules,
        };
    }

    let has_lspci = runner.exists("lspci");
    let has_lshw = runner.exists("lshw");

    let detection = if has_lspci && pci_scan(runner) {
        Detection::Found(DetectionMethod::PciScan)
    } else if has_lshw && hardware_lister_scan(runner) {
        Detection::Found(DetectionMethod::HardwareLister)
    } else if !has_lspci && !has_lshw {
        Detection::Undetectable
    } else {
        Detection::NotFound
    };

    let vendor = match detection {
        Detection::Found(_) => GpuVendor::Nvidia,
        Detection::NotFound => GpuVendor::None,
        Detection::Undetectable => GpuVendor::Unknown,
    };

    GpuState {
        vendor,
        detection,
        driver,
        modules,
    }
}

fn query_vendor_tool(runner: &dyn CommandRunner) -> DriverStatus {
    if !runner.exists("nvidia-smi") {
        return DriverStatus::Missing;
    }
    match runner.run(&CommandSpec::new("nvidia-smi")) {
        Ok(output) if output.success => match parse_cuda_version(&output.stdout) {
            Some(cuda_version) => DriverStatus::Ready { cuda_version },
            None => DriverStatus::NoCompatibleVersion,
        },
        Ok(output) => {
            tracing::debug!(stderr = %output.stderr_tail(), "nvidia-smi failed");
            DriverStatus::Unresponsive
        }
        Err(e) => {
            tracing::debug!("nvidia-smi could not run: {:#}", e);
            DriverStatus::Unresponsive
        }
    }
}

/// Extract `X.Y` from the `CUDA Version: X.Y` banner.
pub fn parse_cuda_version(output: &str) -> Option<String> {
    let rest = output.split("CUDA Version:").nth(1)?;
    let version: String = rest
        .trim_start()
        .chars()
        .take_while(|c| c.is_ascii_digit() || *c == '.')
        .collect();
    let (major, minor) = version.split_once('.')?;
    if major.is_empty() || minor.is_empty() {
        return None;
    }
    Some(version)
}

fn pci_scan(runner: &dyn CommandRunner) -> bool {
    let cmd = CommandSpec::new("lspci")
        .arg("-d")
        .arg(format!("{}:", NVIDIA_PCI_VENDOR));
    runner
        .run(&cmd)
        .map(|o| o.success && o.stdout.contains("NVIDIA"))
        .unwrap_or(false)
}

fn hardware_lister_scan(runner: &dyn CommandRunner) -> bool {
    let cmd = CommandSpec::new("lshw")
        .args(["-c", "display", "-numeric", "-disable", "network"])
        .privileged();
    runner
        .run(&cmd)
        .map(|o| o.success && lshw_reports_vendor(&o.stdout))
        .unwrap_or(false)
}

fn lshw_reports_vendor(output: &str) -> bool {
    let tag = format!("[{}]", NVIDIA_PCI_VENDOR.to_ascii_uppercase());
    output
        .lines()
        .map(str::trim)
        .any(|l| l.starts_with("vendor:") && l.ends_with(&tag))
}
