//! `/etc/os-release` parsing.

use anyhow::{Context, Result};
use serde::Serialize;
use std::fs;
use std::path::Path;

/// Distribution identity from os-release.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OsRelease {
    /// Lowercase distro id (`ID=`), e.g. `rhel`, `debian`.
    pub id: String,
    /// Version (`VERSION_ID=`), e.g. `9.3`, `12`, `22.04`.
    pub version_id: String,
    /// Human-readable name (`PRETTY_NAME=`), if present.
    pub pretty_name: Option<String>,
}

impl OsRelease {
    pub fn load(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        Ok(Self::parse(&content))
    }

    pub fn parse(content: &str) -> Self {
        let mut release = Self::default();
        for line in content.lines() {
            let Some((key, value)) = line.trim().split_once('=') else {
                continue;
            };
            let value = unquote(value);
            match key {
                "ID" => release.id = value.to_ascii_lowercase(),
                "VERSION_ID" => release.version_id = value.to_string(),
                "PRETTY_NAME" => release.pretty_name = Some(value.to_string()),
                _ => {}
            }
        }
        release
    }
}

fn unquote(value: &str) -> &str {
    let value = value.trim();
    value
        .strip_prefix('"')
        .and_then(|v| v.strip_suffix('"'))
        .or_else(|| value.strip_prefix('\'').and_then(|v| v.strip_suffix('\'')))
        .unwrap_or(value)
}
