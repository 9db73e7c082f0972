//! Simulated host for unit tests.
//!
//! `FakeHost` answers commands the way a real machine would and mutates its
//! state as packages are installed and modules loaded, so a provisioning run
//! can be replayed against it end to end. Every command and write is recorded
//! in order.

use anyhow::{bail, Result};
use std::cell::RefCell;
use std::collections::BTreeSet;
use std::fs;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

use crate::context::HostPaths;
use crate::process::{CommandOutput, CommandRunner, CommandSpec};

pub(crate) const KERNEL_RELEASE: &str = "5.14.0-362.el9.x86_64";
pub(crate) const DKMS_MODULE: &str = "nvidia/550.54.15";

#[derive(Debug, Default)]
struct State {
    tools: BTreeSet<String>,
    modules: BTreeSet<String>,
    gpu_on_bus: bool,
    dkms_added: bool,
    fail: Vec<String>,
    calls: Vec<String>,
}

pub(crate) struct FakeHost {
    root: TempDir,
    machine: String,
    state: RefCell<State>,
}

impl FakeHost {
    /// Minimal host: coreutils-level tools only, no package manager.
    pub(crate) fn new() -> Self {
        let host = Self {
            root: TempDir::new().unwrap(),
            machine: "x86_64".to_string(),
            state: RefCell::new(State::default()),
        };
        host.with_tools(&[
            "uname", "curl", "install", "mv", "useradd", "usermod", "lsmod", "modprobe",
        ])
    }

    pub(crate) fn with_machine(mut self, machine: &str) -> Self {
        self.machine = machine.to_string();
        self
    }

    pub(crate) fn with_tools(self, tools: &[&str]) -> Self {
        self.state
            .borrow_mut()
            .tools
            .extend(tools.iter().map(|t| t.to_string()));
        self
    }

    pub(crate) fn without_tool(self, tool: &str) -> Self {
        self.state.borrow_mut().tools.remove(tool);
        self
    }

    pub(crate) fn with_os_release(self, id: &str, version: &str) -> Self {
        self.write(
            "etc/os-release",
            &format!("ID=\"{}\"\nVERSION_ID=\"{}\"\n", id, version),
        );
        self
    }

    /// rhel9 host with dnf and lspci.
    pub(crate) fn rhel9() -> Self {
        Self::new()
            .with_os_release("rhel", "9.3")
            .with_tools(&["dnf", "lspci"])
    }

    /// debian 12 host with apt-get, dpkg and lspci.
    pub(crate) fn debian12() -> Self {
        let host = Self::new()
            .with_os_release("debian", "12")
            .with_tools(&["apt-get", "dpkg", "lspci"]);
        host.write(
            "etc/apt/sources.list",
            "deb http://deb.debian.org/debian bookworm main\n",
        );
        host
    }

    /// NVIDIA device visible on the PCI bus.
    pub(crate) fn with_gpu(self) -> Self {
        self.state.borrow_mut().gpu_on_bus = true;
        self
    }

    /// Driver installed and modules loaded.
    pub(crate) fn with_working_driver(self) -> Self {
        {
            let mut state = self.state.borrow_mut();
            state.tools.insert("nvidia-smi".to_string());
            state.modules.insert("nvidia".to_string());
            state.modules.insert("nvidia_uvm".to_string());
        }
        self
    }

    /// Driver packages installed but module not built for this kernel.
    pub(crate) fn with_stale_driver(self) -> Self {
        {
            let mut state = self.state.borrow_mut();
            state.tools.insert("nvidia-smi".to_string());
            state.tools.insert("dkms".to_string());
            state.dkms_added = true;
        }
        self
    }

    pub(crate) fn with_module(self, module: &str) -> Self {
        self.state.borrow_mut().modules.insert(module.to_string());
        self
    }

    /// Every command whose rendering starts with `prefix` exits non-zero.
    pub(crate) fn fail_on(self, prefix: &str) -> Self {
        self.state.borrow_mut().fail.push(prefix.to_string());
        self
    }

    pub(crate) fn paths(&self) -> HostPaths {
        HostPaths::new(self.root.path())
    }

    pub(crate) fn root(&self) -> &Path {
        self.root.path()
    }

    pub(crate) fn scratch(&self) -> PathBuf {
        let dir = self.root.path().join("scratch");
        fs::create_dir_all(&dir).unwrap();
        dir
    }

    pub(crate) fn write(&self, rel: &str, contents: &str) {
        let path = self.root.path().join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, contents).unwrap();
    }

    pub(crate) fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.root.path().join(rel)).unwrap()
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.state.borrow().calls.clone()
    }

    pub(crate) fn clear_calls(&self) {
        self.state.borrow_mut().calls.clear();
    }

    pub(crate) fn has_module(&self, module: &str) -> bool {
        self.state.borrow().modules.contains(module)
    }

    /// Index of the first call starting with `prefix`.
    pub(crate) fn position(&self, prefix: &str) -> Option<usize> {
        self.calls().iter().position(|c| c.starts_with(prefix))
    }

    pub(crate) fn called(&self, prefix: &str) -> bool {
        self.position(prefix).is_some()
    }

    fn lsmod(&self) -> String {
        let mut out = String::from("Module                  Size  Used by\n");
        for module in &self.state.borrow().modules {
            out.push_str(&format!("{:<24}{:>8}  0\n", module, 16384));
        }
        out
    }

    fn simulate(&self, cmd: &CommandSpec) -> CommandOutput {
        let mut state = self.state.borrow_mut();
        let args: Vec<&str> = cmd.args.iter().map(String::as_str).collect();

        match (cmd.program.as_str(), args.as_slice()) {
            ("uname", ["-m"]) => CommandOutput::ok(format!("{}\n", self.machine)),
            ("uname", ["-r"]) => CommandOutput::ok(format!("{}\n", KERNEL_RELEASE)),
            ("nvidia-smi", _) => {
                if state.modules.contains("nvidia") {
                    CommandOutput::ok(
                        "| NVIDIA-SMI 550.54.15   Driver Version: 550.54.15   CUDA Version: 12.4 |\n",
                    )
                } else {
                    CommandOutput::failed(
                        9,
                        "NVIDIA-SMI has failed because it couldn't communicate with the NVIDIA driver.",
                    )
                }
            }
            ("lspci", _) if state.gpu_on_bus => CommandOutput::ok(
                "01:00.0 3D controller: NVIDIA Corporation GA102GL [A10] (rev a1)\n",
            ),
            ("lshw", _) if state.gpu_on_bus => CommandOutput::ok(
                "  *-display\n       description: 3D controller\n       vendor: NVIDIA Corporation [10DE]\n",
            ),
            ("lsmod", _) => {
                drop(state);
                return CommandOutput::ok(self.lsmod());
            }
            ("dnf" | "yum" | "apt-get", _)
                if args.contains(&"install") && args.contains(&"cuda-drivers") =>
            {
                state.tools.insert("nvidia-smi".to_string());
                state.tools.insert("dkms".to_string());
                state.dkms_added = true;
                CommandOutput::ok("")
            }
            ("dkms", ["status"]) if state.dkms_added => {
                CommandOutput::ok(format!("{}: added\n", DKMS_MODULE))
            }
            ("dkms", ["install", _]) => {
                state.dkms_added = false;
                CommandOutput::ok("")
            }
            ("systemctl", ["is-system-running"]) => CommandOutput::ok("running\n"),
            ("modprobe", [module]) => {
                if state.modules.contains("nouveau") {
                    CommandOutput::failed(1, "modprobe: ERROR: could not insert 'nvidia'")
                } else {
                    state.modules.insert(module.to_string());
                    CommandOutput::ok("")
                }
            }
            _ => CommandOutput::ok(""),
        }
    }
}

impl CommandRunner for FakeHost {
    fn exists(&self, program: &str) -> bool {
        self.state.borrow().tools.contains(program)
    }

    fn run(&self, cmd: &CommandSpec) -> Result<CommandOutput> {
        let line = cmd.to_string();
        self.state.borrow_mut().calls.push(line.clone());

        if !self.exists(&cmd.program) {
            bail!("Failed to execute `{}`: No such file or directory", line);
        }

        if self
            .state
            .borrow()
            .fail
            .iter()
            .any(|prefix| line.starts_with(prefix.as_str()))
        {
            return Ok(CommandOutput::failed(1, format!("simulated failure: {}", line)));
        }

        Ok(self.simulate(cmd))
    }

    fn write_file(&self, path: &Path, contents: &str) -> Result<()> {
        let rel = path.strip_prefix(self.root.path()).unwrap_or(path);
        self.state
            .borrow_mut()
            .calls
            .push(format!("write /{}", rel.display()));
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(path, contents)?;
        Ok(())
    }
}
