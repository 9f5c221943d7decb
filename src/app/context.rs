//! Per-App state shared between the core and a collaborator.

use std::collections::BTreeMap;
use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::process::ExitStatus;
use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::process::Child;
use tracing::{debug, info, warn};

use super::config::AppConfig;
use super::paths::{PathCategory, PathRecord, cleanup_paths};
use super::process;
use super::template::{self, TemplateOptions};
use super::AppState;
use crate::allocator::{AppId, UuidAllocator};
use crate::errors::{AppError, TemplateError};
use crate::node::Node;

/// Lifecycle tunables copied from the cluster settings at construction.
#[derive(Debug, Clone)]
pub(crate) struct Lifecycle {
    pub poll_interval: Duration,
    pub stop_timeout: Duration,
    pub stop_poll_interval: Duration,
    pub template_dir: Option<PathBuf>,
}

/// Everything the orchestrator tracks for one App, minus its behaviour.
///
/// A collaborator receives the context from [`crate::Cluster::create_app`],
/// fills in its config, paths and deferred commands, and hands it back
/// through [`crate::Cluster::register`].
pub struct AppContext {
    id: AppId,
    kind: String,
    node: Arc<Node>,
    config: AppConfig,
    env: BTreeMap<String, String>,
    paths: Vec<PathRecord>,
    deferred: Vec<String>,
    root: PathBuf,
    lifecycle: Lifecycle,
    pub(super) state: AppState,
    pub(super) process: Option<Child>,
    pid: Option<u32>,
    t_started: Option<Instant>,
    t_stopped: Option<Instant>,
    /// Started by `Cluster::start`
    pub autostart: bool,
    /// Artifacts removed by `cleanup`
    pub do_cleanup: bool,
}

impl AppContext {
    pub(crate) fn new(
        id: AppId,
        kind: &str,
        node: Arc<Node>,
        conf: Option<AppConfig>,
        kind_root: &Path,
        lifecycle: Lifecycle,
    ) -> Result<Self, AppError> {
        let mut config = conf.unwrap_or_default();
        config.set_reserved("appid", id);
        config.set_reserved("name", kind);
        config.set_reserved("nodename", node.name());
        config.set_default("version", "master")?;

        let mut ctx = Self {
            id,
            kind: kind.to_string(),
            node,
            config,
            env: BTreeMap::new(),
            paths: Vec::new(),
            deferred: Vec::new(),
            root: kind_root.join(id.to_string()),
            lifecycle,
            state: AppState::Init,
            process: None,
            pid: None,
            t_started: None,
            t_stopped: None,
            autostart: true,
            do_cleanup: true,
        };
        ctx.env_add("LC_ALL", "C", true);
        ctx.create_dir("", false)?;
        debug!(app = %ctx, "Creating {} instance", ctx.kind);
        Ok(ctx)
    }

    pub fn id(&self) -> AppId {
        self.id
    }

    /// The collaborator kind, e.g. `CommandApp`.
    pub fn kind(&self) -> &str {
        &self.kind
    }

    pub fn node(&self) -> &Node {
        &self.node
    }

    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    pub fn config_mut(&mut self) -> &mut AppConfig {
        &mut self.config
    }

    pub fn state(&self) -> AppState {
        self.state
    }

    /// PID of the launched process, kept after it exits.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    /// Time since start, or start-to-stop once stopped.
    pub fn runtime(&self) -> Duration {
        match (self.t_started, self.t_stopped) {
            (Some(start), Some(stop)) => stop.duration_since(start),
            (Some(start), None) => start.elapsed(),
            _ => Duration::ZERO,
        }
    }

    // ---- environment ----

    /// Add an environment variable, appending to an existing value with a
    /// space separator when `append` is set, overwriting otherwise.
    pub fn env_add(&mut self, name: &str, value: &str, append: bool) {
        match self.env.get_mut(name) {
            Some(existing) if append => {
                existing.push(' ');
                existing.push_str(value);
            }
            _ => {
                self.env.insert(name.to_string(), value.to_string());
            }
        }
    }

    pub fn environment(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    // ---- deferred commands ----

    /// Queue a shell command to run once, the first time the App is
    /// observed operational.
    pub fn defer_command(&mut self, cmd: impl Into<String>) {
        self.deferred.push(cmd.into());
    }

    pub fn deferred_commands(&self) -> &[String] {
        &self.deferred
    }

    pub(crate) async fn run_deferred(&mut self) -> Result<(), AppError> {
        let cmds = std::mem::take(&mut self.deferred);
        if cmds.is_empty() {
            return Ok(());
        }
        debug!(app = %self, "Running {} deferred command(s)", cmds.len());
        for cmd in cmds {
            match process::run_shell(&cmd, &self.env).await {
                Ok(output) => {
                    debug!(app = %self, command = %cmd, "returned: {}", String::from_utf8_lossy(&output.stdout).trim());
                }
                Err(e) => {
                    warn!(app = %self, command = %cmd, "Failed to run deferred command");
                    return Err(e);
                }
            }
        }
        Ok(())
    }

    /// Run `cmd` on this App's node to completion.
    pub async fn execute(&self, cmd: &str) -> Result<std::process::Output, AppError> {
        let line = self.node.command_line(cmd);
        debug!(app = %self, command = %line, "Executing");
        process::run_shell(&line, &self.env).await
    }

    // ---- paths ----

    /// The App sandbox: `<instance>/<kind>/<id>`.
    pub fn root_path(&self) -> &Path {
        &self.root
    }

    pub fn paths(&self) -> &[PathRecord] {
        &self.paths
    }

    /// Record `path` for cleanup.
    pub fn add_path(&mut self, path: impl Into<PathBuf>, category: PathCategory) -> PathBuf {
        let path = path.into();
        self.paths.push(PathRecord {
            path: path.clone(),
            category,
        });
        path
    }

    /// A sandbox path for `relpath`, recorded with `category`. Nothing is
    /// created on disk.
    pub fn mkpath(&mut self, relpath: &str, category: PathCategory, unique: bool) -> PathBuf {
        let mut path = if relpath.is_empty() {
            self.root.clone()
        } else {
            self.root.join(relpath)
        };
        if unique {
            let mut name = path.into_os_string();
            name.push(".");
            name.push(UuidAllocator::next(36));
            path = PathBuf::from(name);
        }
        self.add_path(path, category)
    }

    pub fn create_dir(&mut self, relpath: &str, unique: bool) -> Result<PathBuf, AppError> {
        let path = self.mkpath(relpath, PathCategory::Temporary, unique);
        std::fs::create_dir_all(&path).map_err(|e| AppError::io(&path, e))?;
        Ok(path)
    }

    /// Create (truncate) a sandbox file and its parent directories.
    pub fn open_file(
        &mut self,
        relpath: &str,
        category: PathCategory,
        unique: bool,
    ) -> Result<(File, PathBuf), AppError> {
        let path = self.mkpath(relpath, category, unique);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| AppError::io(parent, e))?;
        }
        let file = File::create(&path).map_err(|e| AppError::io(&path, e))?;
        Ok((file, path))
    }

    pub fn create_file(
        &mut self,
        relpath: &str,
        data: impl AsRef<[u8]>,
        category: PathCategory,
        unique: bool,
    ) -> Result<PathBuf, AppError> {
        let (file, path) = self.open_file(relpath, category, unique)?;
        drop(file);
        std::fs::write(&path, data).map_err(|e| AppError::io(&path, e))?;
        Ok(path)
    }

    /// Render `template` against this App's config into a sandbox file.
    pub fn create_file_from_template(
        &mut self,
        relpath: &str,
        template: &str,
        opts: &TemplateOptions,
    ) -> Result<PathBuf, AppError> {
        let contents = template::materialize(template, &self.config, opts)?;
        self.create_file(relpath, contents, opts.category, opts.unique)
    }

    /// Like [`Self::create_file_from_template`], reading the template from
    /// `<template_dir>/<kind>/<name>.template`. `name` defaults to the file
    /// name of `relpath`.
    pub fn create_file_from_template_dir(
        &mut self,
        relpath: &str,
        template_name: Option<&str>,
        opts: &TemplateOptions,
    ) -> Result<PathBuf, AppError> {
        let name = template_name
            .map(str::to_string)
            .or_else(|| {
                Path::new(relpath)
                    .file_name()
                    .map(|n| n.to_string_lossy().into_owned())
            })
            .unwrap_or_else(|| relpath.to_string());

        let dir = self
            .lifecycle
            .template_dir
            .as_ref()
            .ok_or_else(|| TemplateError::NoTemplateDir { name: name.clone() })?;
        let path = dir.join(&self.kind).join(format!("{}.template", name));
        let template = std::fs::read_to_string(&path)
            .map_err(|_| TemplateError::NotFound { name, path: path.clone() })?;

        self.create_file_from_template(relpath, &template, opts)
    }

    /// Delete recorded artifacts whose category is not in `keep`.
    pub fn cleanup(&self, keep: &[PathCategory]) {
        if !self.do_cleanup {
            return;
        }
        let keep_list: Vec<String> = keep.iter().map(|c| c.to_string()).collect();
        debug!(app = %self, "Cleaning up {} path(s) (keep={})", self.paths.len(), keep_list.join(","));
        cleanup_paths(&self.to_string(), &self.paths, keep);
    }

    /// Remove the sandbox of a context that was never registered.
    pub(crate) fn discard(self) {
        if let Err(e) = std::fs::remove_dir_all(&self.root) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(app = %self, path = %self.root.display(), error = %e, "Failed to remove sandbox");
            }
        }
    }

    // ---- process ----

    pub(crate) fn lifecycle(&self) -> &Lifecycle {
        &self.lifecycle
    }

    /// Launch `cmd` on this App's node with output captured in the sandbox.
    pub(crate) fn launch(&mut self, cmd: &str) -> Result<(), AppError> {
        let line = self.node.command_line(cmd);
        let stdout_path = self.mkpath("stdout.log", PathCategory::Log, false);
        let stderr_path = self.mkpath("stderr.log", PathCategory::Log, false);
        std::fs::create_dir_all(&self.root).map_err(|e| AppError::io(&self.root, e))?;

        let fdlimit = process::resolve_fdlimit(&self.to_string(), &self.config);
        debug!(app = %self, command = %line, "Executing");
        let child = process::spawn(&line, &self.env, fdlimit, &stdout_path, &stderr_path)?;

        self.pid = child.id();
        self.process = Some(child);
        self.state = AppState::Started;
        self.t_started = Some(Instant::now());
        self.t_stopped = None;
        info!(app = %self, pid = ?self.pid, "started");
        Ok(())
    }

    /// Record that the process exited with `status`.
    pub(super) fn mark_exited(&mut self, status: Option<ExitStatus>) {
        match status {
            Some(status) if !status.success() => {
                warn!(app = %self, pid = ?self.pid, "process terminated: {}", status);
            }
            Some(status) => {
                debug!(app = %self, pid = ?self.pid, "process terminated: {}", status);
            }
            None => {}
        }
        self.process = None;
        self.state = AppState::Stopped;
        self.t_stopped = Some(Instant::now());
    }

    /// Observe whether a started or stale process exited on its own.
    pub(crate) fn refresh_status(&mut self) -> AppState {
        if !matches!(self.state, AppState::Started | AppState::Stale) {
            return self.state;
        }
        if let Some(child) = self.process.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => self.mark_exited(Some(status)),
                Ok(None) => {}
                Err(e) => warn!(app = %self, error = %e, "try_wait failed"),
            }
        }
        self.state
    }

    /// Poll for the process to exit for up to `timeout`.
    ///
    /// On timeout, `force` SIGKILLs the process group and waits for it;
    /// otherwise the App is left running and marked stale.
    pub(crate) async fn wait_stopped(&mut self, timeout: Duration, force: bool) -> Result<bool, AppError> {
        let Some(pid) = self.pid else {
            return Ok(true);
        };
        let deadline = Instant::now() + timeout;
        loop {
            let Some(child) = self.process.as_mut() else {
                return Ok(true);
            };
            match child.try_wait() {
                Ok(Some(status)) => {
                    self.mark_exited(Some(status));
                    return Ok(true);
                }
                Ok(None) => {}
                Err(source) => return Err(AppError::WaitFailed { pid, source }),
            }
            if Instant::now() >= deadline {
                break;
            }
            tokio::time::sleep(self.lifecycle.stop_poll_interval).await;
        }

        if !force {
            warn!(app = %self, pid, "process did not terminate in {:.1}s", timeout.as_secs_f64());
            self.state = AppState::Stale;
            return Ok(false);
        }

        debug!(app = %self, pid, "forcing termination");
        self.kill_and_reap(pid).await?;
        Ok(true)
    }

    pub(super) async fn kill_and_reap(&mut self, pid: u32) -> Result<(), AppError> {
        if let Err(e) = process::signal_group(pid, libc::SIGKILL) {
            warn!(app = %self, pid, error = %e, "forced kill failed: ignoring");
        }
        self.reap(pid).await
    }

    /// SIGKILL whatever is left of the process group once the leader is gone.
    pub(super) fn sweep_group(&self, pid: u32) {
        match process::signal_group(pid, libc::SIGKILL) {
            Ok(()) => debug!(app = %self, pid, "killed remaining process group members"),
            Err(e) if e.raw_os_error() == Some(libc::ESRCH) => {}
            Err(e) => warn!(app = %self, pid, error = %e, "forced kill of process group failed: ignoring"),
        }
    }

    /// Block until the OS confirms the process exited.
    pub(super) async fn reap(&mut self, pid: u32) -> Result<(), AppError> {
        if let Some(child) = self.process.as_mut() {
            let status = child
                .wait()
                .await
                .map_err(|source| AppError::WaitFailed { pid, source })?;
            self.mark_exited(Some(status));
        } else {
            self.mark_exited(None);
        }
        Ok(())
    }
}

impl fmt::Display for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{{{}@{}:{}({})}}",
            self.kind,
            self.node.name(),
            self.id,
            self.state
        )
    }
}

impl fmt::Debug for AppContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AppContext")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("node", &self.node.name())
            .field("state", &self.state)
            .field("pid", &self.pid)
            .field("root", &self.root)
            .finish()
    }
}

impl Drop for AppContext {
    fn drop(&mut self) {
        let Some(pid) = self.pid else {
            return;
        };
        if self.process.is_none() {
            return;
        }
        warn!(app = %self, pid, "dropped while running: killing process group");
        let _ = process::signal_group(pid, libc::SIGKILL);
        if let Some(child) = self.process.as_mut() {
            let _ = child.start_kill();
        }
    }
}
