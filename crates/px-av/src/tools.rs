//! External tool detection.
//!
//! The [`ToolRegistry`] locates ffmpeg and ffprobe once, honouring path
//! overrides from [`px_core::config::ToolsConfig`], and hands out their
//! paths to the ffmpeg codec backend.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::command::ToolCommand;

/// Tools the ffmpeg backend depends on.
const KNOWN_TOOLS: &[&str] = &["ffmpeg", "ffprobe"];

/// A discovered tool.
#[derive(Debug, Clone, Serialize)]
pub struct ToolConfig {
    pub name: String,
    pub path: PathBuf,
}

/// Availability information for a tool, returned by [`ToolRegistry::check_all`].
#[derive(Debug, Clone, Serialize)]
pub struct ToolInfo {
    pub name: String,
    pub available: bool,
    /// First line of `-version` output, if available.
    pub version: Option<String>,
    pub path: Option<PathBuf>,
}

/// Registry holding discovered tool locations.
#[derive(Debug, Clone, Default)]
pub struct ToolRegistry {
    tools: HashMap<String, ToolConfig>,
}

impl ToolRegistry {
    /// Discover tools, preferring configured paths that exist and falling
    /// back to [`which::which`]. Missing tools are omitted.
    pub fn discover(tools_config: &px_core::config::ToolsConfig) -> Self {
        let mut tools = HashMap::new();

        for &name in KNOWN_TOOLS {
            let custom_path = match name {
                "ffmpeg" => tools_config.ffmpeg_path.as_deref(),
                "ffprobe" => tools_config.ffprobe_path.as_deref(),
                _ => None,
            };

            let resolved = match custom_path {
                Some(p) if p.exists() => Some(p.to_path_buf()),
                Some(p) => {
                    tracing::warn!("Configured {name} path {} does not exist; searching PATH", p.display());
                    which::which(name).ok()
                }
                None => which::which(name).ok(),
            };

            if let Some(path) = resolved {
                tracing::debug!(tool = name, path = %path.display(), "Discovered tool");
                tools.insert(
                    name.to_string(),
                    ToolConfig {
                        name: name.to_string(),
                        path,
                    },
                );
            }
        }

        Self { tools }
    }

    /// Path of a discovered tool, or [`px_core::Error::Tool`] if it is missing.
    pub fn require(&self, name: &str) -> px_core::Result<&Path> {
        self.tools
            .get(name)
            .map(|t| t.path.as_path())
            .ok_or_else(|| px_core::Error::tool(name, format!("{name} not found; is it installed and in PATH?")))
    }

    /// Whether the given tool was found.
    pub fn has(&self, name: &str) -> bool {
        self.tools.contains_key(name)
    }

    /// Check all known tools and return availability information.
    pub async fn check_all(&self) -> Vec<ToolInfo> {
        let mut infos = Vec::with_capacity(KNOWN_TOOLS.len());
        for &name in KNOWN_TOOLS {
            let info = match self.tools.get(name) {
                Some(cfg) => ToolInfo {
                    name: name.to_string(),
                    available: true,
                    version: detect_version(&cfg.path).await,
                    path: Some(cfg.path.clone()),
                },
                None => ToolInfo {
                    name: name.to_string(),
                    available: false,
                    version: None,
                    path: None,
                },
            };
            infos.push(info);
        }
        infos
    }

    /// Whether ffmpeg was built with the named encoder.
    pub async fn has_encoder(&self, encoder: &str) -> px_core::Result<bool> {
        let ffmpeg = self.require("ffmpeg")?;
        let output = ToolCommand::new(ffmpeg.to_path_buf())
            .args(["-hide_banner", "-encoders"])
            .execute()
            .await?;
        Ok(output
            .stdout
            .lines()
            .filter_map(|line| line.split_whitespace().nth(1))
            .any(|name| name == encoder))
    }
}

async fn detect_version(path: &Path) -> Option<String> {
    let output = ToolCommand::new(path.to_path_buf())
        .arg("-version")
        .execute()
        .await
        .ok()?;
    output.stdout.lines().next().map(|s| s.to_string())
}
