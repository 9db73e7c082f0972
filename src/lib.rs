//! Host provisioning for an accelerated inference service.
//!
//! Places a service binary on a Linux host, registers it with systemd and,
//! when an NVIDIA GPU is present, brings the vendor driver to a working state:
//!
//! - **Environment probe** - architecture, distro family, package manager, kernel
//! - **GPU detection** - vendor tool, PCI scan, hardware lister, in that order
//! - **Provisioning engine** - a pure plan decision plus its execution
//! - **Package adapters** - dnf/yum and apt repository and package handling
//!
//! # Architecture
//!
//! ```text
//! preflight ──> host::probe_host ──> install (binary, service)
//!                                        │
//!                gpu::probe_gpu ──> engine::decide ──> Engine::execute
//!                                                          │
//!                                         pkg::PackageAdapter (rpm | apt)
//!                                                          │
//!                                                      RunReport
//! ```
//!
//! Every host effect goes through [`process::CommandRunner`], so the whole
//! run can be replayed against a simulated host.

pub mod config;
pub mod context;
pub mod engine;
pub mod error;
pub mod gpu;
pub mod host;
pub mod install;
pub mod installer;
pub mod pkg;
pub mod preflight;
pub mod process;
pub mod report;

#[cfg(test)]
mod testing;

pub use config::Config;
pub use engine::{decide, Engine, Outcome, ProvisioningPlan};
pub use error::{ProvisionError, ProvisionResult};
pub use installer::Installer;
pub use report::RunReport;
