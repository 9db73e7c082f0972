//! Enabling the Debian `contrib` component.
//!
//! The CUDA driver packages depend on firmware that Debian ships in
//! `contrib`. Instead of editing the system source lists in place, a sibling
//! file is written with the first `main` component on each line switched to
//! `contrib`. Generated files carry [`CONTRIB_MARKER`] on their first line
//! and are never rewritten.

use anyhow::Context;
use std::fs;
use std::path::{Path, PathBuf};

use crate::context::HostPaths;
use crate::error::{ProvisionError, ProvisionResult};
use crate::process::CommandRunner;

use super::StepReport;

pub const CONTRIB_MARKER: &str = "# contrib component enabled by host-provisioner";

const STEP: &str = "contrib enablement";

/// (system source file, generated contrib file) pairs, one-line and deb822.
fn source_pairs(paths: &HostPaths) -> [(PathBuf, PathBuf); 2] {
    let dir = paths.apt_sources_dir();
    [
        (paths.apt_sources_list(), dir.join("contrib.list")),
        (dir.join("debian.sources"), dir.join("contrib.sources")),
    ]
}

/// Write the contrib variants of whichever system source files exist.
pub fn enable_contrib(runner: &dyn CommandRunner, paths: &HostPaths) -> ProvisionResult<StepReport> {
    let mut written = 0;
    let mut present = 0;

    for (source, target) in source_pairs(paths) {
        if !source.is_file() {
            continue;
        }
        if already_generated(&target) {
            tracing::debug!(path = %target.display(), "contrib sources already present");
            present += 1;
            continue;
        }

        let content = fs::read_to_string(&source)
            .with_context(|| format!("reading {}", source.display()))
            .map_err(|e| ProvisionError::provisioning(STEP, e))?;
        let rewritten = format!("{}\n{}", CONTRIB_MARKER, rewrite_to_contrib(&content));
        runner
            .write_file(&target, &rewritten)
            .map_err(|e| ProvisionError::provisioning(STEP, e))?;
        tracing::info!("Enabled contrib sources in {}", target.display());
        written += 1;
    }

    Ok(match (written, present) {
        (0, 0) => StepReport::skipped(STEP, "no apt source files found"),
        (0, _) => StepReport::skipped(STEP, "contrib sources already present"),
        _ => StepReport::done(STEP),
    })
}

fn already_generated(target: &Path) -> bool {
    fs::read_to_string(target)
        .map(|c| c.lines().next() == Some(CONTRIB_MARKER))
        .unwrap_or(false)
}

/// Replace the first whole-word `main` on every line with `contrib`.
pub fn rewrite_to_contrib(content: &str) -> String {
    let mut out = String::with_capacity(content.len() + 16);
    for line in content.split_inclusive('\n') {
        out.push_str(&replace_first_word(line, "main", "contrib"));
    }
    out
}

fn replace_first_word(line: &str, word: &str, with: &str) -> String {
    let bytes = line.as_bytes();
    let mut from = 0;
    while let Some(offset) = line[from..].find(word) {
        let start = from + offset;
        let end = start + word.len();
        let before_ok = start == 0 || bytes[start - 1].is_ascii_whitespace();
        let after_ok = end == bytes.len() || bytes[end].is_ascii_whitespace();
        if before_ok && after_ok {
            return format!("{}{}{}", &line[..start], with, &line[end..]);
        }
        from = end;
    }
    line.to_string()
}
