//! Topology files: a cluster described in TOML.
//!
//! ```toml
//! name = "itest"
//!
//! [cluster]
//! poll_interval_ms = 200
//!
//! [[app]]
//! kind = "command"
//! label = "zk"
//! ports = ["port"]
//! start_cmd = "zookeeper-server-start %(conf)s"
//!
//! [[app]]
//! kind = "docker"
//! on = "docker"
//! image = "redis"
//! expose = { port = 6379 }
//! ```
//!
//! Everything in an `[[app]]` table besides `kind` and `on` becomes the App's
//! config. Apps are constructed in file order, which must be dependency
//! order.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result, bail};
use serde::Deserialize;

use crate::allocator::AppId;
use crate::app::config::AppConfig;
use crate::cluster::Cluster;
use crate::errors::ClusterError;
use crate::services::{CommandApp, DockerApp};
use crate::settings::ClusterSettings;

/// Builds and registers one App.
pub type Constructor = fn(&mut Cluster, AppConfig, Option<&str>) -> Result<AppId, ClusterError>;

/// Maps topology `kind` names to collaborator constructors.
pub struct Registry {
    constructors: HashMap<String, Constructor>,
}

impl Registry {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// `command` and `docker`.
    pub fn builtin() -> Self {
        let mut registry = Self::empty();
        registry.register("command", CommandApp::create);
        registry.register("docker", DockerApp::create);
        registry
    }

    pub fn register(&mut self, kind: &str, constructor: Constructor) {
        self.constructors.insert(kind.to_string(), constructor);
    }

    pub fn get(&self, kind: &str) -> Option<Constructor> {
        self.constructors.get(kind).copied()
    }

    pub fn kinds(&self) -> Vec<&str> {
        let mut kinds: Vec<&str> = self.constructors.keys().map(String::as_str).collect();
        kinds.sort();
        kinds
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::builtin()
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct AppEntry {
    pub kind: String,
    #[serde(default)]
    pub on: Option<String>,
    #[serde(flatten)]
    pub config: AppConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Topology {
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub cluster: Option<ClusterSettings>,
    #[serde(default, rename = "app")]
    pub apps: Vec<AppEntry>,
    #[serde(skip)]
    base_dir: Option<PathBuf>,
    #[serde(skip)]
    file_stem: Option<String>,
}

impl Topology {
    pub fn parse(content: &str) -> Result<Self> {
        toml::from_str(content).context("Failed to parse topology")
    }

    /// Load a topology file. Relative `template_dir` settings resolve against
    /// the file's directory.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read topology {}", path.display()))?;
        let mut topology: Topology = toml::from_str(&content)
            .with_context(|| format!("Failed to parse topology {}", path.display()))?;
        topology.base_dir = path.parent().map(Path::to_path_buf);
        topology.file_stem = path
            .file_stem()
            .map(|s| s.to_string_lossy().into_owned());
        Ok(topology)
    }

    /// Cluster name: `name`, else the file stem, else `rigup`.
    pub fn cluster_name(&self) -> String {
        self.name
            .clone()
            .or_else(|| self.file_stem.clone())
            .unwrap_or_else(|| "rigup".to_string())
    }

    /// Effective settings: the `[cluster]` section with `RIGUP_*` overrides.
    pub fn settings(&self) -> Result<ClusterSettings> {
        let mut settings = self.cluster.clone().unwrap_or_default();
        if let (Some(dir), Some(base)) = (&settings.template_dir, &self.base_dir) {
            if dir.is_relative() {
                settings.template_dir = Some(base.join(dir));
            }
        }
        settings.apply_env()
    }

    /// Construct every App in file order.
    pub fn build(&self, registry: &Registry) -> Result<Cluster> {
        self.build_with(registry, self.settings()?)
    }

    pub fn build_with(&self, registry: &Registry, settings: ClusterSettings) -> Result<Cluster> {
        let mut cluster = Cluster::new(self.cluster_name(), settings);
        for (index, entry) in self.apps.iter().enumerate() {
            let Some(constructor) = registry.get(&entry.kind) else {
                cluster.purge();
                bail!(
                    "app #{}: unknown kind '{}' (known: {})",
                    index + 1,
                    entry.kind,
                    registry.kinds().join(", ")
                );
            };
            if let Err(e) = constructor(&mut cluster, entry.config.clone(), entry.on.as_deref()) {
                cluster.purge();
                return Err(e).with_context(|| format!("Failed to construct app #{} ({})", index + 1, entry.kind));
            }
        }
        Ok(cluster)
    }
}
