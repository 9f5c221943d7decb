//! Artifact bookkeeping and selective cleanup.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// What a recorded path is for; decides whether cleanup keeps it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PathCategory {
    /// Survives cleanup unless explicitly not kept (installed bundles, caches)
    #[serde(rename = "perm")]
    Permanent,
    /// Scratch data
    #[serde(rename = "temp")]
    Temporary,
    /// Process output and other logs
    Log,
}

impl PathCategory {
    /// What `cleanup` keeps when the caller doesn't say.
    pub const DEFAULT_KEEP: [PathCategory; 2] = [PathCategory::Permanent, PathCategory::Log];
}

impl fmt::Display for PathCategory {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PathCategory::Permanent => write!(f, "perm"),
            PathCategory::Temporary => write!(f, "temp"),
            PathCategory::Log => write!(f, "log"),
        }
    }
}

impl std::str::FromStr for PathCategory {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "perm" | "permanent" => Ok(PathCategory::Permanent),
            "temp" | "temporary" => Ok(PathCategory::Temporary),
            "log" | "logs" => Ok(PathCategory::Log),
            _ => anyhow::bail!(
                "Invalid path category '{}'. Valid values: perm, temp, log",
                s
            ),
        }
    }
}

/// A filesystem path an App created.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathRecord {
    pub path: PathBuf,
    pub category: PathCategory,
}

/// Delete every recorded path whose category is not in `keep`.
///
/// Paths are visited in record order. A directory that holds a kept path is
/// emptied around it instead of removed. Failures are logged and skipped.
pub(crate) fn cleanup_paths(app: &str, records: &[PathRecord], keep: &[PathCategory]) {
    let kept: Vec<&Path> = records
        .iter()
        .filter(|r| keep.contains(&r.category))
        .map(|r| r.path.as_path())
        .collect();

    for record in records {
        let path = &record.path;
        let Ok(meta) = std::fs::symlink_metadata(path) else {
            continue;
        };
        if keep.contains(&record.category) {
            continue;
        }
        debug!(app, path = %path.display(), category = %record.category, "cleanup");

        if meta.is_dir() {
            if kept.iter().any(|k| k.starts_with(path) && *k != path.as_path()) {
                prune_dir(app, path, &kept);
            } else {
                remove_logged(app, path, true);
            }
        } else {
            remove_logged(app, path, false);
        }
    }
}

fn prune_dir(app: &str, dir: &Path, kept: &[&Path]) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            warn!(app, path = %dir.display(), error = %e, "cleanup: read_dir failed: ignoring");
            return;
        }
    };
    for entry in entries.flatten() {
        let path = entry.path();
        if kept.iter().any(|k| *k == path.as_path()) {
            continue;
        }
        let is_dir = entry.file_type().map(|t| t.is_dir()).unwrap_or(false);
        if is_dir && kept.iter().any(|k| k.starts_with(&path)) {
            prune_dir(app, &path, kept);
        } else {
            remove_logged(app, &path, is_dir);
        }
    }
}

fn remove_logged(app: &str, path: &Path, is_dir: bool) {
    let result = if is_dir {
        std::fs::remove_dir_all(path)
    } else {
        std::fs::remove_file(path)
    };
    if let Err(e) = result {
        warn!(app, path = %path.display(), error = %e, "remove failed: ignoring");
    }
}
