//! Binary placement and service registration.
//!
//! The engine does not depend on these; the installer runs them before the
//! driver branch and only cares whether they succeeded.

pub mod binary;
pub mod systemd;
pub mod users;

pub use binary::FetchInstaller;
pub use systemd::SystemdRegistrar;

use serde::Serialize;
use std::path::PathBuf;

use crate::error::ProvisionResult;

/// Fetch the service binary and place it on the host.
pub trait BinaryInstaller {
    /// `Ok(false)` when there is nothing to place.
    fn install(&self) -> ProvisionResult<bool>;
}

/// Everything needed to run the binary as a system service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ServiceSpec {
    pub name: String,
    pub user: String,
    pub home: PathBuf,
    pub exec_path: PathBuf,
    pub args: Vec<String>,
    pub restart: String,
    pub environment: Vec<(String, String)>,
}

/// Register a service with the init system.
pub trait ServiceRegistrar {
    /// Returns whether the service is active afterwards.
    fn register(&self, spec: &ServiceSpec) -> ProvisionResult<bool>;
}
