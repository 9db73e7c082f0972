//! Error taxonomy for a provisioning run.
//!
//! Only two things abort work: a host that cannot be provisioned at all
//! ([`ProvisionError::FatalEnvironment`]) and a failed step inside the driver
//! branch ([`ProvisionError::Provisioning`]). Degraded GPU detection and a
//! pending reboot are not errors; they are terminal outcomes reported by the
//! engine.

use thiserror::Error;

/// Errors that stop a run or a branch of a run.
#[derive(Debug, Error)]
pub enum ProvisionError {
    /// The host cannot be provisioned: unsupported architecture, no way to
    /// elevate, missing base tools, or an unknown distro where drivers were
    /// otherwise reachable. Nothing has been attempted when this is raised.
    #[error("{0}")]
    FatalEnvironment(String),

    /// A repository registration or package installation step failed. Only
    /// the driver branch is aborted; the service keeps running CPU-only.
    #[error("{step} failed: {reason}")]
    Provisioning { step: &'static str, reason: String },

    /// The binary placement or service registration collaborator failed.
    #[error("{component} failed: {reason}")]
    Install {
        component: &'static str,
        reason: String,
    },
}

impl ProvisionError {
    pub fn fatal(message: impl Into<String>) -> Self {
        Self::FatalEnvironment(message.into())
    }

    /// Wrap a lower-level failure, keeping its full context chain verbatim.
    pub fn provisioning(step: &'static str, err: impl Into<anyhow::Error>) -> Self {
        Self::Provisioning {
            step,
            reason: format!("{:#}", err.into()),
        }
    }

    pub fn install(component: &'static str, err: impl Into<anyhow::Error>) -> Self {
        Self::Install {
            component,
            reason: format!("{:#}", err.into()),
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::FatalEnvironment(_))
    }
}

/// Result type for provisioning operations.
pub type ProvisionResult<T> = Result<T, ProvisionError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provisioning_keeps_context_chain() {
        let err = anyhow::anyhow!("exit code 100").context("apt-get update");
        let wrapped = ProvisionError::provisioning("index refresh", err);
        assert_eq!(
            wrapped.to_string(),
            "index refresh failed: apt-get update: exit code 100"
        );
        assert!(!wrapped.is_fatal());
    }

    #[test]
    fn test_fatal_message_is_verbatim() {
        let err = ProvisionError::fatal("Unsupported architecture: riscv64");
        assert!(err.is_fatal());
        assert_eq!(err.to_string(), "Unsupported architecture: riscv64");
    }
}
