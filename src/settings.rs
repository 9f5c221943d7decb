//! Cluster settings.
//!
//! Settings come from a `[cluster]` TOML section with per-field defaults,
//! then environment overrides:
//!
//! ```toml
//! [cluster]
//! root = "/tmp/rigup"
//! nodes = ["localhost", "docker"]
//! poll_interval_ms = 1000
//! stop_timeout_secs = 10
//! stop_poll_interval_ms = 500
//! template_dir = "templates"
//! ```
//!
//! | Variable                 | Overrides          |
//! |--------------------------|--------------------|
//! | `RIGUP_ROOT`             | `root`             |
//! | `RIGUP_POLL_INTERVAL_MS` | `poll_interval_ms` |

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

use crate::node::{DOCKER_NODE, LOCAL_NODE};

/// Runtime settings for a [`crate::Cluster`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterSettings {
    /// Directory under which `<cluster>/<instance>/...` trees are created
    #[serde(default = "default_root")]
    pub root: PathBuf,
    /// Node names; the first one is the default node
    #[serde(default = "default_nodes")]
    pub nodes: Vec<String>,
    /// Interval between readiness polls
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long `stop` waits for a process to exit after SIGTERM
    #[serde(default = "default_stop_timeout_secs")]
    pub stop_timeout_secs: u64,
    /// Interval between exit checks while stopping
    #[serde(default = "default_stop_poll_interval_ms")]
    pub stop_poll_interval_ms: u64,
    /// Directory holding `<AppKind>/<name>.template` files
    #[serde(default)]
    pub template_dir: Option<PathBuf>,
}

fn default_root() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("rigup")
}

fn default_nodes() -> Vec<String> {
    vec![LOCAL_NODE.to_string(), DOCKER_NODE.to_string()]
}

fn default_poll_interval_ms() -> u64 {
    1000
}

fn default_stop_timeout_secs() -> u64 {
    10
}

fn default_stop_poll_interval_ms() -> u64 {
    500
}

impl Default for ClusterSettings {
    fn default() -> Self {
        Self {
            root: default_root(),
            nodes: default_nodes(),
            poll_interval_ms: default_poll_interval_ms(),
            stop_timeout_secs: default_stop_timeout_secs(),
            stop_poll_interval_ms: default_stop_poll_interval_ms(),
            template_dir: None,
        }
    }
}

impl ClusterSettings {
    /// Settings rooted at `root`, defaults elsewhere.
    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            ..Self::default()
        }
    }

    /// Apply `RIGUP_*` overrides from the process environment.
    pub fn apply_env(self) -> Result<Self> {
        self.apply_env_from(|key| std::env::var(key).ok())
    }

    /// Apply `RIGUP_*` overrides using `lookup` as the environment.
    pub fn apply_env_from(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(root) = lookup("RIGUP_ROOT") {
            self.root = PathBuf::from(root);
        }
        if let Some(ms) = lookup("RIGUP_POLL_INTERVAL_MS") {
            self.poll_interval_ms = ms
                .trim()
                .parse()
                .with_context(|| format!("Invalid RIGUP_POLL_INTERVAL_MS '{}'", ms))?;
        }
        Ok(self)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stop_timeout(&self) -> Duration {
        Duration::from_secs(self.stop_timeout_secs)
    }

    pub fn stop_poll_interval(&self) -> Duration {
        Duration::from_millis(self.stop_poll_interval_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_settings_defaults() {
        let settings = ClusterSettings::default();
        assert_eq!(settings.nodes, vec!["localhost", "docker"]);
        assert_eq!(settings.poll_interval(), Duration::from_secs(1));
        assert_eq!(settings.stop_timeout(), Duration::from_secs(10));
        assert_eq!(settings.stop_poll_interval(), Duration::from_millis(500));
        assert!(settings.root.ends_with("rigup"));
        assert!(settings.template_dir.is_none());
    }

    #[test]
    fn test_partial_section_keeps_defaults() {
        let settings: ClusterSettings = toml::from_str(
            r#"
root = "/var/tmp/it"
poll_interval_ms = 50
"#,
        )
        .unwrap();
        assert_eq!(settings.root, PathBuf::from("/var/tmp/it"));
        assert_eq!(settings.poll_interval(), Duration::from_millis(50));
        assert_eq!(settings.stop_timeout_secs, 10); // default
        assert_eq!(settings.nodes.len(), 2); // default
    }

    #[test]
    fn test_invalid_section_is_rejected() {
        assert!(toml::from_str::<ClusterSettings>("poll_interval_ms = \"fast\"").is_err());
    }

    #[test]
    fn test_env_overrides() {
        let settings = ClusterSettings::default()
            .apply_env_from(|key| match key {
                "RIGUP_ROOT" => Some("/scratch".to_string()),
                "RIGUP_POLL_INTERVAL_MS" => Some("25".to_string()),
                _ => None,
            })
            .unwrap();
        assert_eq!(settings.root, PathBuf::from("/scratch"));
        assert_eq!(settings.poll_interval_ms, 25);
    }

    #[test]
    fn test_env_override_rejects_garbage() {
        let result = ClusterSettings::default().apply_env_from(|key| {
            (key == "RIGUP_POLL_INTERVAL_MS").then(|| "soon".to_string())
        });
        assert!(result.unwrap_err().to_string().contains("soon"));
    }
}
