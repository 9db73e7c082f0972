//! Fetch, verify and atomically place the service binary.

use anyhow::{bail, Context, Result};
use sha2::{Digest, Sha256};
use std::fs::{self, File};
use std::io::{BufReader, Read};
use std::path::{Path, PathBuf};

use crate::config::BinaryConfig;
use crate::context::HostContext;
use crate::error::{ProvisionError, ProvisionResult};
use crate::process::CommandSpec;

use super::BinaryInstaller;

pub struct FetchInstaller<'a> {
    ctx: &'a HostContext<'a>,
    config: &'a BinaryConfig,
    name: &'a str,
}

impl<'a> FetchInstaller<'a> {
    pub fn new(ctx: &'a HostContext<'a>, config: &'a BinaryConfig, name: &'a str) -> Self {
        Self { ctx, config, name }
    }

    /// Final location of the binary as the service sees it.
    pub fn target(&self) -> PathBuf {
        self.config.install_dir.join(self.name)
    }

    fn fetch(&self, source: &str) -> Result<PathBuf> {
        let dest = self.ctx.scratch.join(self.name);
        if source.starts_with("https://") || source.starts_with("http://") {
            tracing::info!("Downloading {}...", source);
            self.ctx.runner.run_checked(
                &CommandSpec::new("curl")
                    .args(["--fail", "--show-error", "--location", "--progress-bar", "-o"])
                    .arg(dest.display().to_string())
                    .arg(source),
            )?;
        } else {
            let local = Path::new(source.strip_prefix("file://").unwrap_or(source));
            fs::copy(local, &dest).with_context(|| {
                format!("Failed to copy {} to {}", local.display(), dest.display())
            })?;
        }
        Ok(dest)
    }

    fn fetch_and_place(&self, source: &str) -> Result<()> {
        let staged = self.fetch(source)?;
        if let Some(expected) = &self.config.sha256 {
            verify_sha256(&staged, expected)?;
        }
        tracing::info!(
            "Installing {} to {}...",
            self.name,
            self.config.install_dir.display()
        );
        self.place(&staged)
    }

    fn place(&self, staged: &Path) -> Result<()> {
        let dir = self.ctx.paths.resolve(&self.config.install_dir);
        let pending = dir.join(format!(".{}.new", self.name));
        let target = dir.join(self.name);

        let runner = self.ctx.runner;
        runner.run_checked(
            &CommandSpec::new("install")
                .args(["-o0", "-g0", "-m755", "-d"])
                .arg(dir.display().to_string())
                .privileged(),
        )?;
        runner.run_checked(
            &CommandSpec::new("install")
                .args(["-o0", "-g0", "-m755"])
                .arg(staged.display().to_string())
                .arg(pending.display().to_string())
                .privileged(),
        )?;
        runner.run_checked(
            &CommandSpec::new("mv")
                .arg("-f")
                .arg(pending.display().to_string())
                .arg(target.display().to_string())
                .privileged(),
        )?;
        Ok(())
    }
}

impl BinaryInstaller for FetchInstaller<'_> {
    fn install(&self) -> ProvisionResult<bool> {
        let Some(source) = self.config.source.as_deref() else {
            tracing::debug!("no binary source configured, skipping placement");
            return Ok(false);
        };

        self.fetch_and_place(source)
            .map_err(|e| ProvisionError::install("binary placement", e))?;
        Ok(true)
    }
}

/// Stream a file through SHA-256, returning the hex digest.
pub fn sha256_file(path: &Path) -> Result<String> {
    let f = File::open(path).with_context(|| format!("Failed to open {}", path.display()))?;
    let mut r = BufReader::new(f);
    let mut hasher = Sha256::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = r.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

fn verify_sha256(path: &Path, expected: &str) -> Result<()> {
    let actual = sha256_file(path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        bail!(
            "checksum mismatch for {}: expected {}, got {}",
            path.display(),
            expected,
            actual
        );
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::FakeHost;

    // sha256("hello\n")
    const HELLO_SHA: &str = "5891b5b522d5df086d0ff0b110fbd9d21bb4fc7163af34d08286a2e846f6be03";

    fn config(source: Option<String>, sha256: Option<&str>) -> BinaryConfig {
        BinaryConfig {
            source,
            sha256: sha256.map(str::to_string),
            ..BinaryConfig::default()
        }
    }

    #[test]
    fn test_sha256_file() {
        let host = FakeHost::new();
        host.write("hello.txt", "hello\n");
        assert_eq!(sha256_file(&host.root().join("hello.txt")).unwrap(), HELLO_SHA);
    }

    #[test]
    fn test_no_source_is_skipped() {
        let host = FakeHost::new();
        let paths = host.paths();
        let scratch = host.scratch();
        let ctx = HostContext::new(&host, &paths, &scratch);
        let cfg = config(None, None);

        assert!(!FetchInstaller::new(&ctx, &cfg, "accel-agent").install().unwrap());
        assert!(host.calls().is_empty());
    }

    #[test]
    fn test_local_source_is_placed_atomically() {
        let host = FakeHost::new();
        host.write("dist/accel-agent", "hello\n");
        let paths = host.paths();
        let scratch = host.scratch();
        let ctx = HostContext::new(&host, &paths, &scratch);
        let source = format!("file://{}", host.root().join("dist/accel-agent").display());
        let cfg = config(Some(source), Some(HELLO_SHA));

        let installer = FetchInstaller::new(&ctx, &cfg, "accel-agent");
        assert!(installer.install().unwrap());

        let dir = host.root().join("usr/local/bin");
        assert_eq!(
            host.calls(),
            vec![
                format!("install -o0 -g0 -m755 -d {}", dir.display()),
                format!(
                    "install -o0 -g0 -m755 {} {}",
                    scratch.join("accel-agent").display(),
                    dir.join(".accel-agent.new").display()
                ),
                format!(
                    "mv -f {} {}",
                    dir.join(".accel-agent.new").display(),
                    dir.join("accel-agent").display()
                ),
            ]
        );
        assert_eq!(installer.target(), PathBuf::from("/usr/local/bin/accel-agent"));
    }

    #[test]
    fn test_remote_source_uses_curl() {
        let host = FakeHost::new();
        let paths = host.paths();
        let scratch = host.scratch();
        let ctx = HostContext::new(&host, &paths, &scratch);
        let cfg = config(Some("https://example.com/accel-agent".to_string()), None);

        FetchInstaller::new(&ctx, &cfg, "accel-agent").install().unwrap();

        assert!(host.calls()[0].starts_with("curl --fail --show-error --location"));
        assert!(host.calls()[0].ends_with("https://example.com/accel-agent"));
    }

    #[test]
    fn test_checksum_mismatch_never_places() {
        let host = FakeHost::new();
        host.write("dist/accel-agent", "tampered\n");
        let paths = host.paths();
        let scratch = host.scratch();
        let ctx = HostContext::new(&host, &paths, &scratch);
        let source = host.root().join("dist/accel-agent").display().to_string();
        let cfg = config(Some(source), Some(HELLO_SHA));

        let err = FetchInstaller::new(&ctx, &cfg, "accel-agent")
            .install()
            .unwrap_err();

        assert!(err.to_string().contains("checksum mismatch"));
        assert!(!host.called("install"));
        assert!(!host.called("mv"));
    }

    #[test]
    fn test_download_failure_is_install_error() {
        let host = FakeHost::new().fail_on("curl");
        let paths = host.paths();
        let scratch = host.scratch();
        let ctx = HostContext::new(&host, &paths, &scratch);
        let cfg = config(Some("https://example.com/accel-agent".to_string()), None);

        let err = FetchInstaller::new(&ctx, &cfg, "accel-agent")
            .install()
            .unwrap_err();
        assert!(matches!(
            err,
            ProvisionError::Install {
                component: "binary placement",
                ..
            }
        ));
    }
}
