//! External command execution.
//!
//! Every effect on the host (package managers, kernel module tools,
//! privileged file writes) goes through [`CommandRunner`]. The system
//! implementation shells out; tests substitute a simulated host.

use anyhow::{bail, Context, Result};
use std::fmt;
use std::fs;
use std::io::Write;
use std::path::Path;
use std::process::{Command, Stdio};

/// How privileged commands are executed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Elevation {
    /// Already running as root.
    Root,
    /// Privileged commands are prefixed with `sudo -E`.
    Sudo,
}

/// A single command invocation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    pub env: Vec<(String, String)>,
    pub privileged: bool,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
            privileged: false,
        }
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    /// Run this command with root privileges.
    pub fn privileged(mut self) -> Self {
        self.privileged = true;
        self
    }
}

impl fmt::Display for CommandSpec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (key, value) in &self.env {
            write!(f, "{}={} ", key, value)?;
        }
        write!(f, "{}", self.program)?;
        for arg in &self.args {
            write!(f, " {}", arg)?;
        }
        Ok(())
    }
}

/// Captured result of a finished command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandOutput {
    pub success: bool,
    pub code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl CommandOutput {
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            success: true,
            code: Some(0),
            stdout: stdout.into(),
            stderr: String::new(),
        }
    }

    pub fn failed(code: i32, stderr: impl Into<String>) -> Self {
        Self {
            success: false,
            code: Some(code),
            stdout: String::new(),
            stderr: stderr.into(),
        }
    }

    /// Last few lines of stderr, for error messages.
    pub fn stderr_tail(&self) -> String {
        let lines: Vec<&str> = self
            .stderr
            .lines()
            .map(str::trim)
            .filter(|l| !l.is_empty())
            .collect();
        let start = lines.len().saturating_sub(5);
        lines[start..].join("\n")
    }
}

/// Executes commands and privileged writes on the host.
pub trait CommandRunner {
    /// Whether `program` can be found on PATH.
    fn exists(&self, program: &str) -> bool;

    /// Run a command to completion. Only fails if the command could not be
    /// started; a non-zero exit is reported through [`CommandOutput`].
    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput>;

    /// Write a root-owned file, creating parent directories as needed.
    fn write_file(&self, path: &Path, contents: &str) -> Result<()>;

    /// Run a command and fail on a non-zero exit.
    fn run_checked(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let output = self.run(cmd)?;
        if !output.success {
            let tail = output.stderr_tail();
            if tail.is_empty() {
                bail!(
                    "`{}` failed with exit code {}",
                    cmd,
                    output.code.unwrap_or(-1)
                );
            }
            bail!(
                "`{}` failed with exit code {}: {}",
                cmd,
                output.code.unwrap_or(-1),
                tail
            );
        }
        Ok(output)
    }
}

/// [`CommandRunner`] backed by `std::process::Command`.
#[derive(Debug, Clone)]
pub struct SystemRunner {
    elevation: Elevation,
}

impl SystemRunner {
    pub fn new(elevation: Elevation) -> Self {
        Self { elevation }
    }

    pub fn elevation(&self) -> Elevation {
        self.elevation
    }

    fn command(&self, cmd: &CommandSpec) -> Command {
        let mut command = if cmd.privileged && self.elevation == Elevation::Sudo {
            let mut c = Command::new("sudo");
            c.arg("-E").arg(&cmd.program);
            c
        } else {
            Command::new(&cmd.program)
        };
        command.args(&cmd.args);
        for (key, value) in &cmd.env {
            command.env(key, value);
        }
        command
    }
}

impl CommandRunner for SystemRunner {
    fn exists(&self, program: &str) -> bool {
        which::which(program).is_ok()
    }

    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        tracing::debug!(command = %cmd, privileged = cmd.privileged, "running");
        let output = self
            .command(cmd)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute `{}`", cmd))?;

        Ok(CommandOutput {
            success: output.status.success(),
            code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        tracing::debug!(path = %path.display(), "writing");
        if self.elevation == Elevation::Root {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)
                    .with_context(|| format!("Failed to create {}", parent.display()))?;
            }
            return fs::write(path, contents)
                .with_context(|| format!("Failed to write {}", path.display()));
        }

        if let Some(parent) = path.parent() {
            self.run_checked(
                &CommandSpec::new("install")
                    .args(["-o0", "-g0", "-m755", "-d"])
                    .arg(parent.display().to_string())
                    .privileged(),
            )?;
        }

        let mut child = Command::new("sudo")
            .arg("tee")
            .arg(path)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to spawn sudo tee {}", path.display()))?;

        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(contents.as_bytes())
                .with_context(|| format!("Failed to stream contents to {}", path.display()))?;
        }

        let output = child
            .wait_with_output()
            .with_context(|| format!("Failed to wait for sudo tee {}", path.display()))?;
        if !output.status.success() {
            bail!(
                "Writing {} failed: {}",
                path.display(),
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }
}
