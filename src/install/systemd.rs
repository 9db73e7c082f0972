//! systemd service registration.

use anyhow::Result;
use std::fmt::Write as _;

use crate::context::HostContext;
use crate::error::{ProvisionError, ProvisionResult};
use crate::process::CommandSpec;

use super::users::{self, DEVICE_GROUPS};
use super::{ServiceRegistrar, ServiceSpec};

/// Render the unit file for `spec`.
pub fn render_unit(spec: &ServiceSpec) -> String {
    let mut exec = spec.exec_path.display().to_string();
    for arg in &spec.args {
        exec.push(' ');
        exec.push_str(arg);
    }

    let mut unit = format!(
        "[Unit]\n\
         Description={name} Service\n\
         After=network-online.target\n\
         \n\
         [Service]\n\
         ExecStart={exec}\n\
         User={user}\n\
         Group={user}\n\
         Restart={restart}\n\
         RestartSec=3\n",
        name = spec.name,
        exec = exec,
        user = spec.user,
        restart = spec.restart,
    );
    for (key, value) in &spec.environment {
        let _ = writeln!(unit, "Environment=\"{}={}\"", key, value);
    }
    unit.push_str("\n[Install]\nWantedBy=default.target\n");
    unit
}

pub struct SystemdRegistrar<'a> {
    ctx: &'a HostContext<'a>,
    operator: Option<String>,
}

impl<'a> SystemdRegistrar<'a> {
    /// The invoking user, if any, joins the service group.
    pub fn new(ctx: &'a HostContext<'a>) -> Self {
        Self {
            ctx,
            operator: users::invoking_user(),
        }
    }

    pub fn with_operator(mut self, operator: Option<String>) -> Self {
        self.operator = operator;
        self
    }

    fn systemctl(&self, args: &[&str]) -> Result<()> {
        self.ctx
            .runner
            .run_checked(&CommandSpec::new("systemctl").args(args.iter().copied()).privileged())?;
        Ok(())
    }

    /// systemd is PID 1 and able to start units.
    fn systemd_running(&self) -> bool {
        self.ctx
            .runner
            .run(&CommandSpec::new("systemctl").arg("is-system-running"))
            .map(|o| matches!(o.stdout.trim(), "running" | "degraded"))
            .unwrap_or(false)
    }

    fn configure(&self, spec: &ServiceSpec) -> Result<bool> {
        let runner = self.ctx.runner;
        let paths = self.ctx.paths;

        users::ensure_system_user(runner, paths, &spec.user, &spec.home)?;
        users::join_existing_groups(runner, paths, &spec.user, DEVICE_GROUPS)?;
        if let Some(operator) = &self.operator {
            tracing::info!("Adding current user to {} group...", spec.user);
            users::add_to_group(runner, operator, &spec.user)?;
        }

        tracing::info!("Creating {} systemd service...", spec.name);
        runner.write_file(&paths.systemd_unit(&spec.name), &render_unit(spec))?;

        if !self.systemd_running() {
            tracing::warn!("systemd is not running; {} will start on next boot", spec.name);
            self.systemctl(&["enable", &spec.name])?;
            return Ok(false);
        }

        tracing::info!("Enabling and starting {} service...", spec.name);
        self.systemctl(&["daemon-reload"])?;
        self.systemctl(&["enable", &spec.name])?;
        self.systemctl(&["restart", &spec.name])?;

        let active = runner
            .run(&CommandSpec::new("systemctl").args(["is-active", "--quiet", spec.name.as_str()]))?
            .success;
        Ok(active)
    }
}

impl ServiceRegistrar for SystemdRegistrar<'_> {
    fn register(&self, spec: &ServiceSpec) -> ProvisionResult<bool> {
        if !self.ctx.runner.exists("systemctl") {
            tracing::warn!("systemctl not found, skipping service registration");
            return Ok(false);
        }
        self.configure(spec)
            .map_err(|e| ProvisionError::install("service registration", e))
    }
}
