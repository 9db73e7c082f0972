//! Distribution families and package managers.
//!
//! Distro ids from os-release are normalized once into [`DistroFamily`] so
//! the rest of the crate never branches on raw strings.

use serde::Serialize;
use std::fmt;

use super::os_release::OsRelease;
use crate::process::CommandRunner;

/// Newest Fedora release the CUDA repositories are known to publish.
pub const FEDORA_MAX_REPO_VERSION: u32 = 39;

/// Amazon Linux is served from a fixed Fedora repository.
const AMAZON_REPO_VERSION: &str = "37";

/// Distributions with a known driver provisioning procedure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Distro {
    Rhel,
    Centos,
    Rocky,
    Fedora,
    Amazon,
    Debian,
    Ubuntu,
}

impl Distro {
    pub fn from_id(id: &str) -> Option<Self> {
        match id {
            "rhel" => Some(Distro::Rhel),
            "centos" => Some(Distro::Centos),
            "rocky" => Some(Distro::Rocky),
            "fedora" => Some(Distro::Fedora),
            "amzn" => Some(Distro::Amazon),
            "debian" => Some(Distro::Debian),
            "ubuntu" => Some(Distro::Ubuntu),
            _ => None,
        }
    }

    pub fn id(&self) -> &'static str {
        match self {
            Distro::Rhel => "rhel",
            Distro::Centos => "centos",
            Distro::Rocky => "rocky",
            Distro::Fedora => "fedora",
            Distro::Amazon => "amzn",
            Distro::Debian => "debian",
            Distro::Ubuntu => "ubuntu",
        }
    }

    /// Kernel header/devel packages pinned to the running kernel release.
    ///
    /// Never the latest available: the module must build against exactly the
    /// kernel that is booted.
    pub fn kernel_header_packages(&self, kernel_release: &str) -> Vec<String> {
        match self {
            Distro::Rhel | Distro::Centos | Distro::Rocky | Distro::Amazon => vec![
                format!("kernel-devel-{}", kernel_release),
                format!("kernel-headers-{}", kernel_release),
            ],
            Distro::Fedora => vec![format!("kernel-devel-{}", kernel_release)],
            Distro::Debian | Distro::Ubuntu => {
                vec![format!("linux-headers-{}", kernel_release)]
            }
        }
    }
}

impl fmt::Display for Distro {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.id())
    }
}

/// Repository bucket for RPM-based distros.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RpmBucket {
    Rhel,
    Fedora,
}

impl RpmBucket {
    pub fn name(&self) -> &'static str {
        match self {
            RpmBucket::Rhel => "rhel",
            RpmBucket::Fedora => "fedora",
        }
    }
}

/// A distro normalized into the family that determines its procedure.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "family", rename_all = "snake_case")]
pub enum DistroFamily {
    /// dnf/yum distros, keyed by repository bucket and version.
    Rhel {
        distro: Distro,
        bucket: RpmBucket,
        version: String,
    },
    /// apt distros, keyed by distro and dotless version.
    Debian { distro: Distro, version: String },
    /// No known procedure.
    Unsupported { id: String },
}

impl DistroFamily {
    pub fn from_os_release(release: &OsRelease) -> Self {
        let Some(distro) = Distro::from_id(&release.id) else {
            return DistroFamily::Unsupported {
                id: release.id.clone(),
            };
        };

        match distro {
            Distro::Rhel | Distro::Centos | Distro::Rocky => DistroFamily::Rhel {
                distro,
                bucket: RpmBucket::Rhel,
                version: major_version(&release.version_id).to_string(),
            },
            Distro::Fedora => {
                let version = release
                    .version_id
                    .parse::<u32>()
                    .map(|v| v.min(FEDORA_MAX_REPO_VERSION))
                    .unwrap_or(FEDORA_MAX_REPO_VERSION);
                DistroFamily::Rhel {
                    distro,
                    bucket: RpmBucket::Fedora,
                    version: version.to_string(),
                }
            }
            Distro::Amazon => DistroFamily::Rhel {
                distro,
                bucket: RpmBucket::Fedora,
                version: AMAZON_REPO_VERSION.to_string(),
            },
            Distro::Debian | Distro::Ubuntu => DistroFamily::Debian {
                distro,
                version: release.version_id.replace('.', ""),
            },
        }
    }

    /// Repository directory name, e.g. `rhel9` or `ubuntu2204`.
    pub fn repo_slug(&self) -> Option<String> {
        match self {
            DistroFamily::Rhel {
                bucket, version, ..
            } => Some(format!("{}{}", bucket.name(), version)),
            DistroFamily::Debian { distro, version } => Some(format!("{}{}", distro.id(), version)),
            DistroFamily::Unsupported { .. } => None,
        }
    }

    pub fn distro(&self) -> Option<Distro> {
        match self {
            DistroFamily::Rhel { distro, .. } | DistroFamily::Debian { distro, .. } => {
                Some(*distro)
            }
            DistroFamily::Unsupported { .. } => None,
        }
    }

    /// Legacy RHEL needs the DKMS driver package before the metapackage.
    pub fn is_legacy_rhel(&self) -> bool {
        matches!(
            self,
            DistroFamily::Rhel {
                bucket: RpmBucket::Rhel,
                version,
                ..
            } if version == "7"
        )
    }

    /// Whether `manager` belongs to this family.
    pub fn served_by(&self, manager: PackageManager) -> bool {
        match self {
            DistroFamily::Rhel { .. } => {
                matches!(manager, PackageManager::Dnf | PackageManager::Yum)
            }
            DistroFamily::Debian { .. } => manager == PackageManager::Apt,
            DistroFamily::Unsupported { .. } => false,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            DistroFamily::Rhel { .. } => "rhel-family",
            DistroFamily::Debian { .. } => "debian-family",
            DistroFamily::Unsupported { .. } => "unsupported",
        }
    }
}

fn major_version(version: &str) -> &str {
    version.split('.').next().unwrap_or(version)
}

/// System package managers, in detection order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PackageManager {
    Dnf,
    Yum,
    Apt,
}

impl PackageManager {
    const DETECTION_ORDER: [PackageManager; 3] =
        [PackageManager::Dnf, PackageManager::Yum, PackageManager::Apt];

    pub fn binary(&self) -> &'static str {
        match self {
            PackageManager::Dnf => "dnf",
            PackageManager::Yum => "yum",
            PackageManager::Apt => "apt-get",
        }
    }

    /// First available package manager on PATH.
    pub fn detect(runner: &dyn CommandRunner) -> Option<Self> {
        Self::DETECTION_ORDER
            .into_iter()
            .find(|pm| runner.exists(pm.binary()))
    }
}

impl fmt::Display for PackageManager {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.binary())
    }
}
