//! The orchestration core: one run's nodes, Apps and allocation state.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::Value;
use tracing::{debug, info, warn};

use crate::allocator::{Allocations, AppId, IdAllocator, TcpPortAllocator, UuidAllocator};
use crate::app::config::AppConfig;
use crate::app::paths::PathCategory;
use crate::app::{App, AppContext, AppState, Lifecycle};
use crate::errors::ClusterError;
use crate::node::Node;
use crate::service::Service;
use crate::settings::ClusterSettings;

/// Owns the Nodes and Apps of one orchestration run.
///
/// Apps are kept in registration order. `start` and `deploy` walk that order,
/// `stop` and `cleanup` walk it backwards.
pub struct Cluster {
    name: String,
    instance: String,
    root: PathBuf,
    settings: ClusterSettings,
    nodes: Vec<Arc<Node>>,
    apps: Vec<App>,
    allocations: Allocations,
}

impl Cluster {
    pub fn new(name: impl Into<String>, settings: ClusterSettings) -> Self {
        let name = name.into();
        let root = std::path::absolute(&settings.root)
            .unwrap_or_else(|_| settings.root.clone())
            .join(&name);
        let nodes = settings
            .nodes
            .iter()
            .map(|n| Arc::new(Node::new(n.as_str())))
            .collect();
        let instance = instance_token();
        info!(cluster = %name, instance = %instance, root = %root.display(), "Created cluster");

        Self {
            name,
            instance,
            root,
            settings,
            nodes,
            apps: Vec::new(),
            allocations: Allocations::new(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// The run instance token.
    pub fn instance(&self) -> &str {
        &self.instance
    }

    pub fn settings(&self) -> &ClusterSettings {
        &self.settings
    }

    // ---- nodes ----

    pub fn nodes(&self) -> impl Iterator<Item = &Node> {
        self.nodes.iter().map(|n| n.as_ref())
    }

    /// Add a node, or return the existing one with that name.
    pub fn add_node(&mut self, name: &str) -> Arc<Node> {
        if let Some(node) = self.find_node(name) {
            return node;
        }
        let node = Arc::new(Node::new(name));
        self.nodes.push(Arc::clone(&node));
        node
    }

    pub fn find_node(&self, name: &str) -> Option<Arc<Node>> {
        self.nodes.iter().find(|n| n.name() == name).cloned()
    }

    /// The first configured node.
    pub fn default_node(&self) -> Option<Arc<Node>> {
        self.nodes.first().cloned()
    }

    // ---- construction ----

    /// Begin constructing an App of `kind`.
    ///
    /// Assigns the App id, binds it to node `on` (or the default node) and
    /// creates its sandbox. The returned context is handed back through
    /// [`Cluster::register`] once the collaborator has filled it in.
    pub fn create_app(
        &mut self,
        kind: &str,
        conf: Option<AppConfig>,
        on: Option<&str>,
    ) -> Result<AppContext, ClusterError> {
        let node = match on {
            Some(name) => self.find_node(name),
            None => self.default_node(),
        }
        .ok_or_else(|| ClusterError::NoNode {
            app: kind.to_string(),
            requested: on.map(str::to_string),
        })?;

        let id = IdAllocator::new(&mut self.allocations).next();
        let lifecycle = Lifecycle {
            poll_interval: self.settings.poll_interval(),
            stop_timeout: self.settings.stop_timeout(),
            stop_poll_interval: self.settings.stop_poll_interval(),
            template_dir: self.settings.template_dir.clone(),
        };
        let kind_root = self.instance_path().join(kind);
        Ok(AppContext::new(id, kind, node, conf, &kind_root, lifecycle)?)
    }

    /// Create a context, let `configure` fill it in and register the
    /// resulting collaborator. A failed `configure` removes the sandbox it
    /// was building; ports it allocated stay claimed for the rest of the run.
    pub fn construct<S, F>(
        &mut self,
        kind: &str,
        conf: Option<AppConfig>,
        on: Option<&str>,
        configure: F,
    ) -> Result<AppId, ClusterError>
    where
        S: Service + 'static,
        F: FnOnce(&mut Cluster, &mut AppContext) -> Result<S, ClusterError>,
    {
        let mut ctx = self.create_app(kind, conf, on)?;
        match configure(self, &mut ctx) {
            Ok(service) => Ok(self.register(ctx, service)),
            Err(e) => {
                warn!(cluster = %self.name, app = %ctx, error = %e, "Construction failed");
                ctx.discard();
                Err(e)
            }
        }
    }

    /// Append an App to the cluster.
    pub fn register(&mut self, ctx: AppContext, service: impl Service + 'static) -> AppId {
        self.register_boxed(ctx, Box::new(service))
    }

    pub fn register_boxed(&mut self, ctx: AppContext, service: Box<dyn Service>) -> AppId {
        let id = ctx.id();
        debug!(cluster = %self.name, app = %ctx, "Registered");
        self.apps.push(App::new(ctx, service));
        id
    }

    /// Allocate a TCP port for `app`, trying `preferred` and upwards if given.
    pub fn allocate_port(&mut self, app: AppId, preferred: Option<u16>) -> Result<u16, ClusterError> {
        Ok(self.port_allocator().next(app, preferred)?)
    }

    /// Port allocator over this run's claimed-port registry.
    pub fn port_allocator(&mut self) -> TcpPortAllocator<'_> {
        TcpPortAllocator::new(&mut self.allocations)
    }

    pub fn allocations(&self) -> &Allocations {
        &self.allocations
    }

    // ---- lookup ----

    pub fn apps(&self) -> &[App] {
        &self.apps
    }

    pub fn app(&self, id: AppId) -> Option<&App> {
        self.apps.iter().find(|a| a.id() == id)
    }

    pub fn app_mut(&mut self, id: AppId) -> Option<&mut App> {
        self.apps.iter_mut().find(|a| a.id() == id)
    }

    pub fn find(&self, pred: impl Fn(&App) -> bool) -> Option<&App> {
        self.apps.iter().find(|a| pred(a))
    }

    pub fn find_all(&self, pred: impl Fn(&App) -> bool) -> Vec<&App> {
        self.apps.iter().filter(|a| pred(a)).collect()
    }

    /// First App of `kind`, optionally with config `key == value`.
    pub fn find_by_class(&self, kind: &str, filter: Option<(&str, &Value)>) -> Option<&App> {
        self.find(|a| {
            a.kind() == kind && filter.is_none_or(|(key, value)| a.config().matches(key, value))
        })
    }

    /// Like [`Cluster::find_by_class`], but a missing App is a construction
    /// error attributed to `dependent`.
    pub fn require_by_class(
        &self,
        dependent: &AppContext,
        kind: &str,
        filter: Option<(&str, &Value)>,
    ) -> Result<&App, ClusterError> {
        self.find_by_class(kind, filter)
            .ok_or_else(|| ClusterError::DependencyNotFound {
                app: dependent.to_string(),
                kind: kind.to_string(),
                filter: filter
                    .map(|(k, v)| format!(" with {}={}", k, v))
                    .unwrap_or_default(),
            })
    }

    /// Apps of `kind`, optionally only those in `state`.
    pub fn find_apps(&self, kind: &str, state: Option<AppState>) -> Vec<&App> {
        self.find_all(|a| a.kind() == kind && state.is_none_or(|s| a.state() == s))
    }

    /// Config `key` from every App of `kind`, `default` where unset.
    pub fn get_all(&self, key: &str, default: Value, kind: &str) -> Vec<Value> {
        self.apps
            .iter()
            .filter(|a| a.kind() == kind)
            .map(|a| a.config().get(key).cloned().unwrap_or_else(|| default.clone()))
            .collect()
    }

    // ---- orchestration ----

    /// Deploy every App in registration order.
    pub async fn deploy(&mut self) -> Result<(), ClusterError> {
        for app in &mut self.apps {
            app.deploy().await?;
        }
        Ok(())
    }

    /// Start every autostart App that has not run yet, in registration order.
    ///
    /// With a timeout, then wait for the cluster to go operational.
    pub async fn start(&mut self, timeout: Option<Duration>) -> Result<(), ClusterError> {
        for app in &mut self.apps {
            if !app.context().autostart {
                continue;
            }
            match app.status() {
                AppState::Init => app.start()?,
                state => debug!(cluster = %self.name, app = %app, "Not starting: {}", state),
            }
        }

        if let Some(timeout) = timeout {
            if !self.wait_operational(timeout).await? {
                return Err(ClusterError::NotOperational { timeout });
            }
        }
        Ok(())
    }

    /// Stop every App in reverse registration order. Failures are logged.
    pub async fn stop(&mut self, force: bool) {
        for app in self.apps.iter_mut().rev() {
            if let Err(e) = app.stop(force).await {
                warn!(cluster = %self.name, app = %app, error = %e, "Failed to stop");
            }
        }
    }

    /// Wait for every started App to go operational.
    ///
    /// Returns false as soon as any App is found stopped, or when `timeout`
    /// elapses. On success each App's deferred commands are run.
    pub async fn wait_operational(&mut self, timeout: Duration) -> Result<bool, ClusterError> {
        let t_end = Instant::now() + timeout;
        loop {
            let stopped: Vec<String> = self
                .apps
                .iter_mut()
                .filter_map(|a| (a.status() == AppState::Stopped).then(|| a.to_string()))
                .collect();
            if !stopped.is_empty() {
                warn!(
                    cluster = %self.name,
                    "{} app(s) terminated while waiting to go operational: {}",
                    stopped.len(),
                    stopped.join(", ")
                );
                return Ok(false);
            }

            let mut not_operational = Vec::new();
            for app in &self.apps {
                if app.state() == AppState::Started && !app.operational().await {
                    not_operational.push(app.to_string());
                }
            }
            if not_operational.is_empty() {
                for app in &mut self.apps {
                    app.run_deferred().await?;
                }
                info!(cluster = %self.name, "Cluster operational");
                return Ok(true);
            }

            if Instant::now() >= t_end {
                warn!(cluster = %self.name, "Timed out waiting for: {}", not_operational.join(", "));
                return Ok(false);
            }
            debug!(
                cluster = %self.name,
                "Waiting for {} app(s) to go operational: {}",
                not_operational.len(),
                not_operational.join(", ")
            );
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }

    /// Wait until no App is started or stale.
    pub async fn wait_stopped(&mut self, timeout: Duration) -> bool {
        let t_end = Instant::now() + timeout;
        loop {
            let running: Vec<String> = self
                .apps
                .iter_mut()
                .filter_map(|a| {
                    matches!(a.status(), AppState::Started | AppState::Stale).then(|| a.to_string())
                })
                .collect();
            if running.is_empty() {
                return true;
            }
            if Instant::now() >= t_end {
                return false;
            }
            debug!(cluster = %self.name, "Waiting for {} app(s) to stop: {}", running.len(), running.join(", "));
            tokio::time::sleep(self.settings.poll_interval()).await;
        }
    }

    /// Remove App artifacts in reverse registration order, keeping `keep`.
    pub fn cleanup(&self, keep: &[PathCategory]) {
        for app in self.apps.iter().rev() {
            app.cleanup(keep);
        }
    }

    /// Remove every App artifact and the instance directory.
    pub fn purge(&self) {
        self.cleanup(&[]);
        let path = self.instance_path();
        if let Err(e) = std::fs::remove_dir_all(&path) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!(cluster = %self.name, path = %path.display(), error = %e, "Failed to remove instance directory");
            }
        }
    }

    // ---- paths ----

    /// `<root>/<cluster>/<instance>`
    pub fn instance_path(&self) -> PathBuf {
        self.root.join(&self.instance)
    }

    /// A cluster-wide path, never cleaned up.
    pub fn mkpath(&self, relpath: &str, unique: bool, in_instance: bool) -> PathBuf {
        let base = if in_instance {
            self.instance_path()
        } else {
            self.root.clone()
        };
        let mut path = base.join(relpath).into_os_string();
        if unique {
            path.push(".");
            path.push(UuidAllocator::next(36));
        }
        PathBuf::from(path)
    }

    /// The host's name as seen from a container.
    pub fn docker_host(&self) -> Result<&'static str, ClusterError> {
        docker_host_for(std::env::consts::OS)
    }
}

fn docker_host_for(os: &str) -> Result<&'static str, ClusterError> {
    match os {
        "macos" => Ok("host.docker.internal"),
        "linux" => Ok("localhost"),
        other => Err(ClusterError::UnsupportedPlatform(other.to_string())),
    }
}

/// Unix seconds without the leading two digits, plus a random suffix so that
/// runs started within the same second get distinct trees.
fn instance_token() -> String {
    let secs = chrono::Utc::now().timestamp().to_string();
    format!("{}-{}", &secs[2.min(secs.len())..], UuidAllocator::next(6))
}

impl std::fmt::Debug for Cluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Cluster")
            .field("name", &self.name)
            .field("instance", &self.instance)
            .field("root", &self.root)
            .field("apps", &self.apps)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::AppError;
    use async_trait::async_trait;
    use serde_json::json;
    use std::path::Path;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn settings(root: &Path) -> ClusterSettings {
        ClusterSettings {
            poll_interval_ms: 20,
            stop_poll_interval_ms: 20,
            stop_timeout_secs: 2,
            ..ClusterSettings::with_root(root)
        }
    }

    /// Runs a command and records its label on stop.
    struct Labelled {
        start: Option<String>,
        stop_log: Option<PathBuf>,
        label: String,
    }

    #[async_trait]
    impl Service for Labelled {
        fn start_cmd(&self, _ctx: &AppContext) -> Option<String> {
            self.start.clone()
        }

        fn stop_cmd(&self, _ctx: &AppContext) -> Option<String> {
            self.stop_log
                .as_ref()
                .map(|log| format!("echo {} >> {}", self.label, log.display()))
        }
    }

    fn add(cluster: &mut Cluster, kind: &str, label: &str, start: Option<&str>, stop_log: Option<&Path>) -> AppId {
        let mut ctx = cluster.create_app(kind, None, None).unwrap();
        ctx.config_mut().set("label", label).unwrap();
        cluster.register(
            ctx,
            Labelled {
                start: start.map(str::to_string),
                stop_log: stop_log.map(Path::to_path_buf),
                label: label.to_string(),
            },
        )
    }

    /// Becomes operational on the `ready_after`-th poll.
    struct Countdown {
        polls: Arc<AtomicUsize>,
        ready_after: usize,
    }

    #[async_trait]
    impl Service for Countdown {
        fn start_cmd(&self, _ctx: &AppContext) -> Option<String> {
            Some("sleep 30".into())
        }

        async fn operational(&self, _ctx: &AppContext) -> bool {
            self.polls.fetch_add(1, Ordering::SeqCst) + 1 >= self.ready_after
        }
    }

    #[test]
    fn ids_are_unique_and_sandboxes_nested_by_kind() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = Cluster::new("itest", settings(dir.path()));
        let a = add(&mut cluster, "Zookeeper", "a", None, None);
        let b = add(&mut cluster, "Kafka", "b", None, None);
        assert_ne!(a, b);

        let kafka = cluster.app(b).unwrap();
        assert_eq!(
            kafka.context().root_path(),
            cluster.instance_path().join("Kafka").join(b.to_string())
        );
        assert!(cluster.instance_path().starts_with(dir.path().join("itest")));
        assert_eq!(kafka.config().get_str("nodename"), Some("localhost"));
    }

    #[test]
    fn unknown_node_is_a_construction_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = Cluster::new("itest", settings(dir.path()));
        let err = cluster.create_app("Kafka", None, Some("broker-7")).unwrap_err();
        assert!(matches!(err, ClusterError::NoNode { requested: Some(ref n), .. } if n == "broker-7"));

        let ctx = cluster.create_app("Kafka", None, Some("docker")).unwrap();
        assert_eq!(ctx.node().name(), "docker");
        cluster.add_node("broker-7");
        assert!(cluster.create_app("Kafka", None, Some("broker-7")).is_ok());
    }

    #[test]
    fn empty_node_list_has_no_default() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        s.nodes.clear();
        let mut cluster = Cluster::new("itest", s);
        assert!(matches!(
            cluster.create_app("Kafka", None, None),
            Err(ClusterError::NoNode { requested: None, .. })
        ));
    }

    #[test]
    fn lookups_by_kind_and_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = Cluster::new("itest", settings(dir.path()));
        add(&mut cluster, "Kafka", "one", None, None);
        let two = add(&mut cluster, "Kafka", "two", None, None);
        add(&mut cluster, "Zookeeper", "zk", None, None);

        assert_eq!(cluster.find_apps("Kafka", None).len(), 2);
        assert_eq!(cluster.find_apps("Kafka", Some(AppState::Started)).len(), 0);
        let found = cluster
            .find_by_class("Kafka", Some(("label", &json!("two"))))
            .unwrap();
        assert_eq!(found.id(), two);
        assert!(cluster.find_by_class("SchemaRegistry", None).is_none());
        assert_eq!(
            cluster.get_all("label", json!(null), "Kafka"),
            vec![json!("one"), json!("two")]
        );
        assert_eq!(
            cluster.get_all("missing", json!("dflt"), "Zookeeper"),
            vec![json!("dflt")]
        );

        let ctx = cluster.create_app("KsqlDb", None, None).unwrap();
        let err = cluster.require_by_class(&ctx, "SchemaRegistry", None).unwrap_err();
        assert!(matches!(err, ClusterError::DependencyNotFound { ref kind, .. } if kind == "SchemaRegistry"));
    }

    #[test]
    fn allocated_ports_are_unique_across_apps() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = Cluster::new("itest", settings(dir.path()));
        let a = add(&mut cluster, "Kafka", "a", None, None);
        let b = add(&mut cluster, "Kafka", "b", None, None);
        let pa = cluster.allocate_port(a, None).unwrap();
        let pb = cluster.allocate_port(b, Some(pa)).unwrap();
        assert_ne!(pa, pb);
        assert_eq!(cluster.allocations().port_owner(pb), Some(b));
    }

    #[test]
    fn cluster_paths_are_never_recorded() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = Cluster::new("itest", settings(dir.path()));
        let shared = cluster.mkpath("downloads", false, false);
        assert_eq!(shared, dir.path().join("itest").join("downloads"));
        let scoped = cluster.mkpath("certs", true, true);
        assert!(scoped.starts_with(cluster.instance_path()));
        assert_ne!(scoped, cluster.instance_path().join("certs"));
    }

    #[test]
    fn docker_host_per_platform() {
        assert_eq!(docker_host_for("macos").unwrap(), "host.docker.internal");
        assert_eq!(docker_host_for("linux").unwrap(), "localhost");
        assert!(matches!(
            docker_host_for("windows"),
            Err(ClusterError::UnsupportedPlatform(_))
        ));
    }

    #[test]
    fn instance_tokens_are_distinct() {
        let a = instance_token();
        let b = instance_token();
        assert_ne!(a, b);
        assert!(a.contains('-'));
    }

    #[tokio::test]
    async fn stop_runs_in_reverse_registration_order() {
        let dir = tempfile::tempdir().unwrap();
        let log = dir.path().join("stop-order.log");
        let mut cluster = Cluster::new("itest", settings(dir.path()));
        for label in ["A", "B", "C"] {
            add(&mut cluster, "Sleeper", label, Some("sleep 30"), Some(&log));
        }

        cluster.start(None).await.unwrap();
        assert_eq!(cluster.find_apps("Sleeper", Some(AppState::Started)).len(), 3);

        cluster.stop(false).await;
        assert_eq!(std::fs::read_to_string(&log).unwrap(), "C\nB\nA\n");
        assert!(cluster.apps().iter().all(|a| a.state() == AppState::Stopped));
        assert!(cluster.wait_stopped(Duration::from_secs(1)).await);
    }

    #[tokio::test]
    async fn start_skips_non_autostart_apps() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = Cluster::new("itest", settings(dir.path()));
        let manual = add(&mut cluster, "Sleeper", "manual", Some("sleep 30"), None);
        cluster.app_mut(manual).unwrap().context_mut().autostart = false;
        cluster.start(None).await.unwrap();
        assert_eq!(cluster.app(manual).unwrap().state(), AppState::Init);
    }

    #[tokio::test]
    async fn readiness_converges_and_deferred_commands_run_once() {
        let dir = tempfile::tempdir().unwrap();
        let marker = dir.path().join("post-start");
        let polls = Arc::new(AtomicUsize::new(0));
        let mut cluster = Cluster::new("itest", settings(dir.path()));

        let mut ctx = cluster.create_app("Countdown", None, None).unwrap();
        ctx.defer_command(format!("echo ran >> {}", marker.display()));
        cluster.register(
            ctx,
            Countdown {
                polls: Arc::clone(&polls),
                ready_after: 3,
            },
        );

        cluster.start(Some(Duration::from_secs(5))).await.unwrap();
        assert_eq!(polls.load(Ordering::SeqCst), 3);
        assert!(cluster.wait_operational(Duration::from_secs(1)).await.unwrap());
        assert_eq!(std::fs::read_to_string(&marker).unwrap(), "ran\n");

        cluster.stop(true).await;
    }

    #[tokio::test]
    async fn never_ready_cluster_fails_start_with_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = Cluster::new("itest", settings(dir.path()));
        let ctx = cluster.create_app("Countdown", None, None).unwrap();
        cluster.register(
            ctx,
            Countdown {
                polls: Arc::new(AtomicUsize::new(0)),
                ready_after: usize::MAX,
            },
        );

        let err = cluster.start(Some(Duration::from_millis(200))).await.unwrap_err();
        assert!(matches!(err, ClusterError::NotOperational { .. }));
        cluster.stop(true).await;
    }

    #[tokio::test]
    async fn wait_operational_fails_fast_when_a_started_app_exits() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = Cluster::new("itest", settings(dir.path()));
        add(&mut cluster, "Sleeper", "keeper", Some("sleep 30"), None);
        add(&mut cluster, "Crasher", "crash", Some("sleep 1; exit 3"), None);
        cluster.start(None).await.unwrap();

        struct NotYet;
        #[async_trait]
        impl Service for NotYet {
            fn start_cmd(&self, _ctx: &AppContext) -> Option<String> {
                Some("sleep 30".into())
            }
            async fn operational(&self, _ctx: &AppContext) -> bool {
                false
            }
        }
        let ctx = cluster.create_app("NotYet", None, None).unwrap();
        cluster.register(ctx, NotYet);
        cluster.start(None).await.unwrap();

        let began = Instant::now();
        assert!(!cluster.wait_operational(Duration::from_secs(20)).await.unwrap());
        assert!(began.elapsed() < Duration::from_secs(10));
        cluster.stop(true).await;
    }

    #[tokio::test]
    async fn failing_deferred_command_is_a_command_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = Cluster::new("itest", settings(dir.path()));
        let mut ctx = cluster.create_app("Helper", None, None).unwrap();
        ctx.defer_command("exit 4");
        cluster.register(
            ctx,
            Labelled {
                start: None,
                stop_log: None,
                label: "helper".into(),
            },
        );
        let err = cluster.wait_operational(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            ClusterError::App(AppError::CommandFailed { code: 4, .. })
        ));
    }

    #[tokio::test]
    async fn deploy_is_idempotent() {
        struct CountingDeploy(Arc<AtomicUsize>);
        #[async_trait]
        impl Service for CountingDeploy {
            async fn deploy(&mut self, _ctx: &mut AppContext) -> Result<(), AppError> {
                self.0.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            fn start_cmd(&self, _ctx: &AppContext) -> Option<String> {
                None
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let deploys = Arc::new(AtomicUsize::new(0));
        let mut cluster = Cluster::new("itest", settings(dir.path()));
        let ctx = cluster.create_app("Bundle", None, None).unwrap();
        cluster.register(ctx, CountingDeploy(Arc::clone(&deploys)));

        cluster.deploy().await.unwrap();
        cluster.deploy().await.unwrap();
        assert_eq!(deploys.load(Ordering::SeqCst), 1);
        assert!(cluster.apps()[0].is_deployed());
    }

    #[tokio::test]
    async fn cleanup_respects_do_cleanup() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = Cluster::new("itest", settings(dir.path()));
        let kept = add(&mut cluster, "Keeper", "k", None, None);
        let gone = add(&mut cluster, "Scratch", "s", None, None);
        cluster.app_mut(kept).unwrap().context_mut().do_cleanup = false;

        let kept_root = cluster.app(kept).unwrap().context().root_path().to_path_buf();
        let gone_root = cluster.app(gone).unwrap().context().root_path().to_path_buf();
        cluster.cleanup(&[]);
        assert!(kept_root.exists());
        assert!(!gone_root.exists());
    }

    #[tokio::test]
    async fn stale_apps_keep_wait_stopped_pending() {
        let dir = tempfile::tempdir().unwrap();
        let mut s = settings(dir.path());
        s.stop_timeout_secs = 1;
        let mut cluster = Cluster::new("itest", s);
        let id = add(
            &mut cluster,
            "Stubborn",
            "s",
            Some("trap '' TERM; while true; do sleep 0.05; done"),
            None,
        );
        cluster.start(None).await.unwrap();
        tokio::time::sleep(Duration::from_millis(100)).await;

        cluster.stop(false).await;
        assert_eq!(cluster.app(id).unwrap().state(), AppState::Stale);
        assert!(!cluster.wait_stopped(Duration::from_millis(200)).await);

        let app = cluster.app_mut(id).unwrap();
        assert_eq!(app.kill().await.unwrap(), AppState::Stopped);
        assert!(cluster.wait_stopped(Duration::from_millis(200)).await);
    }
}
