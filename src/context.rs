//! Host context threaded through every provisioning step.

use std::path::{Path, PathBuf};

use crate::process::CommandRunner;

/// Well-known host files, resolved against a filesystem root.
///
/// The root is `/` on a real host and a scratch directory under test.
#[derive(Debug, Clone)]
pub struct HostPaths {
    root: PathBuf,
}

impl HostPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn system() -> Self {
        Self::new("/")
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Map an absolute host path under this root.
    pub fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path.strip_prefix("/").unwrap_or(path))
    }

    pub fn os_release(&self) -> PathBuf {
        self.root.join("etc/os-release")
    }

    pub fn passwd(&self) -> PathBuf {
        self.root.join("etc/passwd")
    }

    pub fn group(&self) -> PathBuf {
        self.root.join("etc/group")
    }

    pub fn apt_sources_list(&self) -> PathBuf {
        self.root.join("etc/apt/sources.list")
    }

    pub fn apt_sources_dir(&self) -> PathBuf {
        self.root.join("etc/apt/sources.list.d")
    }

    pub fn systemd_unit(&self, service: &str) -> PathBuf {
        self.root
            .join("etc/systemd/system")
            .join(format!("{}.service", service))
    }

    pub fn modules_load_conf(&self, name: &str) -> PathBuf {
        self.root
            .join("etc/modules-load.d")
            .join(format!("{}.conf", name))
    }
}

/// Everything a step needs to touch the host.
pub struct HostContext<'a> {
    /// Executes commands and privileged writes.
    pub runner: &'a dyn CommandRunner,
    /// Host file locations.
    pub paths: &'a HostPaths,
    /// Run-scoped scratch directory for downloaded artifacts.
    pub scratch: &'a Path,
}

impl<'a> HostContext<'a> {
    pub fn new(runner: &'a dyn CommandRunner, paths: &'a HostPaths, scratch: &'a Path) -> Self {
        Self {
            runner,
            paths,
            scratch,
        }
    }
}
