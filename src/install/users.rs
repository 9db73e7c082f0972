//! Service account management.
//!
//! Lookups read the host's passwd and group files directly; changes go
//! through `useradd`/`usermod` so the host's own policies apply.

use anyhow::{Context, Result};
use std::env;
use std::fs;
use std::path::Path;

use crate::context::HostPaths;
use crate::process::{CommandRunner, CommandSpec};

/// Groups that grant access to GPU device nodes.
pub const DEVICE_GROUPS: &[&str] = &["render", "video"];

/// Read a user's (uid, gid) from the passwd file.
///
/// Returns:
/// - Ok(Some((uid, gid))) if user found
/// - Ok(None) if user not found or file doesn't exist
/// - Err if file exists but is corrupted/unreadable
pub fn read_uid(paths: &HostPaths, username: &str) -> Result<Option<(u32, u32)>> {
    let passwd_path = paths.passwd();
    let Some(fields) = find_entry(&passwd_path, username, 4)? else {
        return Ok(None);
    };

    let uid: u32 = fields[2].parse().with_context(|| {
        format!(
            "Corrupted passwd file: invalid UID '{}' for user '{}' at {}",
            fields[2],
            username,
            passwd_path.display()
        )
    })?;
    let gid: u32 = fields[3].parse().with_context(|| {
        format!(
            "Corrupted passwd file: invalid GID '{}' for user '{}' at {}",
            fields[3],
            username,
            passwd_path.display()
        )
    })?;
    Ok(Some((uid, gid)))
}

/// Read a GID from the group file, same contract as [`read_uid`].
pub fn read_gid(paths: &HostPaths, groupname: &str) -> Result<Option<u32>> {
    let group_path = paths.group();
    let Some(fields) = find_entry(&group_path, groupname, 3)? else {
        return Ok(None);
    };

    let gid: u32 = fields[2].parse().with_context(|| {
        format!(
            "Corrupted group file: invalid GID '{}' for group '{}' at {}",
            fields[2],
            groupname,
            group_path.display()
        )
    })?;
    Ok(Some(gid))
}

/// Fields of the first colon-separated entry named `name` with at least
/// `min_fields` fields. A missing file has no entries.
fn find_entry(path: &Path, name: &str, min_fields: usize) -> Result<Option<Vec<String>>> {
    if !path.exists() {
        return Ok(None);
    }
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read {}", path.display()))?;

    Ok(content
        .lines()
        .map(|line| line.split(':').collect::<Vec<_>>())
        .find(|parts| parts.len() >= min_fields && parts[0] == name)
        .map(|parts| parts.into_iter().map(str::to_string).collect()))
}

/// Create a system user with its own group and home, unless it exists.
pub fn ensure_system_user(
    runner: &dyn CommandRunner,
    paths: &HostPaths,
    username: &str,
    home: &Path,
) -> Result<()> {
    if let Some((uid, _)) = read_uid(paths, username)? {
        tracing::debug!(uid, "user {} already exists", username);
        return Ok(());
    }

    tracing::info!("Creating {} user...", username);
    runner.run_checked(
        &CommandSpec::new("useradd")
            .args(["-r", "-s", "/bin/false", "-U", "-m", "-d"])
            .arg(home.display().to_string())
            .arg(username)
            .privileged(),
    )?;
    Ok(())
}

/// Add `username` to each of `groups` that exists on the host.
pub fn join_existing_groups(
    runner: &dyn CommandRunner,
    paths: &HostPaths,
    username: &str,
    groups: &[&str],
) -> Result<()> {
    for group in groups {
        if read_gid(paths, group)?.is_none() {
            tracing::debug!("group {} does not exist, skipping", group);
            continue;
        }
        tracing::info!("Adding {} user to {} group...", username, group);
        add_to_group(runner, username, group)?;
    }
    Ok(())
}

pub fn add_to_group(runner: &dyn CommandRunner, username: &str, group: &str) -> Result<()> {
    runner.run_checked(
        &CommandSpec::new("usermod")
            .args(["-a", "-G", group, username])
            .privileged(),
    )?;
    Ok(())
}

/// The human who started the installer, if it was not root.
pub fn invoking_user() -> Option<String> {
    env::var("SUDO_USER")
        .or_else(|_| env::var("USER"))
        .ok()
        .filter(|user| !user.is_empty() && user != "root")
}
