use async_trait::async_trait;

use crate::app::AppContext;
use crate::errors::AppError;

/// Per-service behaviour plugged into the orchestration core.
///
/// A collaborator builds its [`AppContext`] through
/// [`crate::Cluster::create_app`], then registers itself with
/// [`crate::Cluster::register`]. Everything it derives at construction
/// (ports, paths, addresses) lives in the context config; the hooks below
/// read it from there.
#[async_trait]
pub trait Service: Send + Sync {
    /// Provision whatever the App needs before it can start.
    /// Called at most once per App.
    async fn deploy(&mut self, _ctx: &mut AppContext) -> Result<(), AppError> {
        Ok(())
    }

    /// Command line to launch, without the node prefix. `None` means there is
    /// nothing to run.
    fn start_cmd(&self, ctx: &AppContext) -> Option<String>;

    /// Graceful stop command, run on the App's node before signalling the
    /// process group.
    fn stop_cmd(&self, _ctx: &AppContext) -> Option<String> {
        None
    }

    /// Cheap readiness probe.
    async fn operational(&self, _ctx: &AppContext) -> bool {
        true
    }
}
