//! Installer configuration.
//!
//! The CLI takes no flags. Everything tunable lives in an optional TOML file:
//! `$HOST_PROVISIONER_CONFIG` if set, else `/etc/host-provisioner/config.toml`
//! if it exists, else built-in defaults.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::fs;
use std::path::{Path, PathBuf};

pub const CONFIG_ENV: &str = "HOST_PROVISIONER_CONFIG";
pub const DEFAULT_CONFIG_PATH: &str = "/etc/host-provisioner/config.toml";

const DEFAULT_SERVICE_NAME: &str = "accel-agent";
const DEFAULT_CUDA_REPO_BASE: &str = "https://developer.download.nvidia.com/compute/cuda/repos";
const DEFAULT_KEYRING_PACKAGE: &str = "cuda-keyring_1.1-1_all.deb";
const DEFAULT_EPEL_RELEASE_URL: &str =
    "https://dl.fedoraproject.org/pub/epel/epel-release-latest-{version}.noarch.rpm";

/// systemd `Restart=` values accepted in `service.restart`.
const RESTART_POLICIES: &[&str] = &[
    "no",
    "always",
    "on-success",
    "on-failure",
    "on-abnormal",
    "on-abort",
    "on-watchdog",
];

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct Config {
    pub service: ServiceConfig,
    pub binary: BinaryConfig,
    pub drivers: DriverConfig,
    pub report: ReportConfig,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ServiceConfig {
    /// Unit name and, unless overridden, the system user.
    pub name: String,
    pub user: Option<String>,
    pub home: Option<PathBuf>,
    pub args: Vec<String>,
    pub restart: String,
    /// Extra `KEY=value` entries for the unit's environment.
    pub environment: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct BinaryConfig {
    /// URL (`http(s)://`), `file://` URL or local path. Unset skips placement.
    pub source: Option<String>,
    pub sha256: Option<String>,
    pub install_dir: PathBuf,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct DriverConfig {
    pub enabled: bool,
    pub cuda_repo_base: String,
    pub keyring_package: String,
    /// `{version}` is replaced with the RHEL major version.
    pub epel_release_url: String,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields, default)]
pub struct ReportConfig {
    /// Where to write the JSON run report, if anywhere.
    pub path: Option<PathBuf>,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            name: DEFAULT_SERVICE_NAME.to_string(),
            user: None,
            home: None,
            args: vec!["serve".to_string()],
            restart: "always".to_string(),
            environment: Vec::new(),
        }
    }
}

impl Default for BinaryConfig {
    fn default() -> Self {
        Self {
            source: None,
            sha256: None,
            install_dir: PathBuf::from("/usr/local/bin"),
        }
    }
}

impl Default for DriverConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            cuda_repo_base: DEFAULT_CUDA_REPO_BASE.to_string(),
            keyring_package: DEFAULT_KEYRING_PACKAGE.to_string(),
            epel_release_url: DEFAULT_EPEL_RELEASE_URL.to_string(),
        }
    }
}

impl ServiceConfig {
    pub fn user(&self) -> &str {
        self.user.as_deref().unwrap_or(&self.name)
    }

    pub fn home(&self) -> PathBuf {
        self.home
            .clone()
            .unwrap_or_else(|| PathBuf::from("/usr/share").join(&self.name))
    }

    /// Parsed `environment` entries.
    pub fn environment(&self) -> Result<Vec<(String, String)>> {
        self.environment
            .iter()
            .map(|entry| {
                let (key, value) = entry.split_once('=').with_context(|| {
                    format!("service.environment entry '{}' is not KEY=value", entry)
                })?;
                if key.is_empty() {
                    bail!("service.environment entry '{}' has an empty key", entry);
                }
                Ok((key.to_string(), value.to_string()))
            })
            .collect()
    }
}

impl DriverConfig {
    pub fn epel_release_url(&self, major_version: &str) -> String {
        self.epel_release_url.replace("{version}", major_version)
    }
}

impl Config {
    /// Load from the environment-selected or default path.
    pub fn load() -> Result<Self> {
        if let Ok(path) = env::var(CONFIG_ENV) {
            return Self::load_from(Path::new(&path));
        }
        let default_path = Path::new(DEFAULT_CONFIG_PATH);
        if default_path.is_file() {
            return Self::load_from(default_path);
        }
        Ok(Self::default())
    }

    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("reading config '{}'", path.display()))?;
        let config: Config = toml::from_str(&content)
            .with_context(|| format!("parsing config '{}'", path.display()))?;
        config
            .validate()
            .with_context(|| format!("invalid config '{}'", path.display()))?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        validate_unit_name(&self.service.name)?;
        validate_unit_name(self.service.user())?;

        if !RESTART_POLICIES.contains(&self.service.restart.as_str()) {
            bail!(
                "service.restart '{}' is not one of: {}",
                self.service.restart,
                RESTART_POLICIES.join(", ")
            );
        }
        self.service.environment()?;

        if let Some(sha) = &self.binary.sha256 {
            validate_sha256(sha)?;
        }
        if !self.binary.install_dir.is_absolute() {
            bail!(
                "binary.install_dir must be absolute, got '{}'",
                self.binary.install_dir.display()
            );
        }
        if !self.drivers.cuda_repo_base.starts_with("https://") {
            bail!(
                "drivers.cuda_repo_base must be an https URL, got '{}'",
                self.drivers.cuda_repo_base
            );
        }
        Ok(())
    }
}

fn validate_unit_name(name: &str) -> Result<()> {
    if name.is_empty() {
        bail!("service name must not be empty");
    }
    if !name
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.'))
    {
        bail!(
            "'{}' may only contain ASCII letters, digits, '-', '_' and '.'",
            name
        );
    }
    Ok(())
}

fn validate_sha256(sha: &str) -> Result<()> {
    if sha.len() != 64 || !sha.chars().all(|c| c.is_ascii_hexdigit()) {
        bail!("binary.sha256 must be 64 hex characters, got '{}'", sha);
    }
    Ok(())
}
