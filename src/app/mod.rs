//! A managed unit of work and its lifecycle state machine.
//!
//! ```text
//! init ──start──▶ started ──stop──▶ stopped
//!                    │                 ▲
//!                    └─stop (timeout)──▶ stale ──kill──┘
//! ```
//!
//! `stopped` and `stale` are terminal for a process instance: an App is
//! never restarted in place.

pub mod config;
mod context;
pub mod paths;
pub mod process;
pub mod template;

use std::fmt;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

pub use context::AppContext;
pub(crate) use context::Lifecycle;

use crate::allocator::AppId;
use crate::errors::AppError;
use crate::service::Service;
use paths::PathCategory;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum AppState {
    Init,
    Started,
    Stopped,
    /// Did not exit within the stop timeout and was not forced
    Stale,
}

impl fmt::Display for AppState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            AppState::Init => write!(f, "init"),
            AppState::Started => write!(f, "started"),
            AppState::Stopped => write!(f, "stopped"),
            AppState::Stale => write!(f, "stale"),
        }
    }
}

/// A registered App: its context plus the collaborator that drives it.
pub struct App {
    ctx: AppContext,
    service: Box<dyn Service>,
    deployed: bool,
}

impl App {
    pub(crate) fn new(ctx: AppContext, service: Box<dyn Service>) -> Self {
        Self {
            ctx,
            service,
            deployed: false,
        }
    }

    pub fn id(&self) -> AppId {
        self.ctx.id()
    }

    pub fn kind(&self) -> &str {
        self.ctx.kind()
    }

    pub fn context(&self) -> &AppContext {
        &self.ctx
    }

    pub fn context_mut(&mut self) -> &mut AppContext {
        &mut self.ctx
    }

    pub fn config(&self) -> &config::AppConfig {
        self.ctx.config()
    }

    /// Last recorded state. Use [`App::status`] to observe an exit first.
    pub fn state(&self) -> AppState {
        self.ctx.state()
    }

    pub fn pid(&self) -> Option<u32> {
        self.ctx.pid()
    }

    pub fn runtime(&self) -> Duration {
        self.ctx.runtime()
    }

    pub fn is_deployed(&self) -> bool {
        self.deployed
    }

    pub async fn deploy(&mut self) -> Result<(), AppError> {
        if self.deployed {
            return Ok(());
        }
        debug!(app = %self.ctx, "Deploying");
        self.service.deploy(&mut self.ctx).await?;
        self.deployed = true;
        Ok(())
    }

    pub fn start(&mut self) -> Result<(), AppError> {
        match self.ctx.state() {
            AppState::Init => {}
            AppState::Started => {
                return Err(AppError::AlreadyStarted {
                    app: self.ctx.to_string(),
                });
            }
            state @ (AppState::Stopped | AppState::Stale) => {
                return Err(AppError::NoRestart {
                    app: self.ctx.to_string(),
                    state: state.to_string(),
                });
            }
        }

        let Some(cmd) = self.service.start_cmd(&self.ctx) else {
            debug!(app = %self.ctx, "Not starting: no start command");
            return Ok(());
        };
        self.ctx.launch(&cmd)
    }

    /// Current state, noticing a process that exited on its own.
    pub fn status(&mut self) -> AppState {
        self.ctx.refresh_status()
    }

    /// Stop the App. A no-op unless it is started.
    ///
    /// Returns the resulting state: `Stopped`, or `Stale` when the process
    /// outlived the stop timeout and `force` was not set.
    pub async fn stop(&mut self, force: bool) -> Result<AppState, AppError> {
        if self.ctx.state() != AppState::Started {
            return Ok(self.ctx.state());
        }
        let Some(pid) = self.ctx.pid() else {
            return Ok(self.ctx.state());
        };
        debug!(app = %self.ctx, pid, "Stopping");

        if let Some(cmd) = self.service.stop_cmd(&self.ctx) {
            if let Err(e) = self.ctx.execute(&cmd).await {
                warn!(app = %self.ctx, error = %e, "stop command failed: falling back to signals");
            }
        }

        let stop_timeout = self.ctx.lifecycle().stop_timeout;
        let t_end = Instant::now() + stop_timeout;
        if self.ctx.refresh_status() == AppState::Started {
            if let Err(e) = process::signal_group(pid, libc::SIGTERM) {
                warn!(app = %self.ctx, pid, error = %e, "killpg() failed: already dead?: ignoring");
                self.ctx.reap(pid).await?;
            } else {
                let remaining = t_end.saturating_duration_since(Instant::now());
                self.ctx.wait_stopped(remaining, force).await?;
            }
        }
        if force {
            self.ctx.sweep_group(pid);
        }

        info!(app = %self.ctx, "now {}, runtime {:.1}s", self.ctx.state(), self.ctx.runtime().as_secs_f64());
        Ok(self.ctx.state())
    }

    /// Escalate a started or stale App to stopped with SIGKILL.
    pub async fn kill(&mut self) -> Result<AppState, AppError> {
        match (self.ctx.state(), self.ctx.pid()) {
            (AppState::Started | AppState::Stale, Some(pid)) => {
                warn!(app = %self.ctx, pid, "Killing");
                self.ctx.kill_and_reap(pid).await?;
            }
            _ => {}
        }
        Ok(self.ctx.state())
    }

    /// The collaborator's readiness probe.
    pub async fn operational(&self) -> bool {
        self.service.operational(&self.ctx).await
    }

    /// Poll until the App is operational (running its deferred commands),
    /// has stopped, or `timeout` elapses.
    pub async fn wait_operational(&mut self, timeout: Duration) -> Result<bool, AppError> {
        let t_end = Instant::now() + timeout;
        let interval = self.ctx.lifecycle().poll_interval;
        loop {
            if self.status() == AppState::Stopped {
                return Ok(false);
            }
            if self.operational().await {
                self.ctx.run_deferred().await?;
                return Ok(true);
            }
            if Instant::now() >= t_end {
                return Ok(false);
            }
            debug!(app = %self.ctx, "Waiting to go operational");
            tokio::time::sleep(interval).await;
        }
    }

    /// Wait up to `timeout` for the process to exit. See [`App::stop`] for
    /// `force`.
    ///
    /// A stale App counts as running: this returns false on timeout unless
    /// `force` kills it.
    pub async fn wait_stopped(&mut self, timeout: Duration, force: bool) -> Result<bool, AppError> {
        match self.status() {
            AppState::Init | AppState::Stopped => Ok(true),
            AppState::Started | AppState::Stale => self.ctx.wait_stopped(timeout, force).await,
        }
    }

    pub(crate) async fn run_deferred(&mut self) -> Result<(), AppError> {
        self.ctx.run_deferred().await
    }

    /// Remove this App's artifacts, keeping the `keep` categories.
    pub fn cleanup(&self, keep: &[PathCategory]) {
        self.ctx.cleanup(keep);
    }
}

impl fmt::Display for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&self.ctx, f)
    }
}

impl fmt::Debug for App {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("App")
            .field("ctx", &self.ctx)
            .field("deployed", &self.deployed)
            .finish()
    }
}
