//! CPU architecture.

use serde::Serialize;
use std::fmt;
use std::str::FromStr;

use crate::error::ProvisionError;

/// Architectures the installer can provision.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// Path segment used by the CUDA repositories.
    ///
    /// Server-class arm64 is published as `sbsa`.
    pub fn cuda_repo_segment(&self) -> &'static str {
        match self {
            Architecture::Amd64 => "x86_64",
            Architecture::Arm64 => "sbsa",
        }
    }
}

impl FromStr for Architecture {
    type Err = ProvisionError;

    /// Accepts both kernel (`uname -m`) and Debian-style names.
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "x86_64" | "amd64" => Ok(Architecture::Amd64),
            "aarch64" | "arm64" => Ok(Architecture::Arm64),
            other => Err(ProvisionError::fatal(format!(
                "Unsupported architecture: {}",
                other
            ))),
        }
    }
}

impl fmt::Display for Architecture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Architecture::Amd64 => write!(f, "amd64"),
            Architecture::Arm64 => write!(f, "arm64"),
        }
    }
}
