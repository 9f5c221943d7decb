//! A generic command-line App.
//!
//! ```toml
//! [[app]]
//! kind = "command"
//! label = "echo"
//! ports = ["port"]
//! requires = ["zk"]
//! start_cmd = "my-server --port %(port)d --zk %(zk_address)s"
//! readiness = { check = "tcp", port = "port" }
//! post_start = ["echo ready > %(logdir)s/ready"]
//!
//! [[app.files]]
//! key = "conf"
//! path = "server.properties"
//! template = "port=%(port)d"
//! ```

use async_trait::async_trait;
use serde::Deserialize;
use tracing::debug;

use super::Readiness;
use crate::allocator::AppId;
use crate::app::config::AppConfig;
use crate::app::paths::PathCategory;
use crate::app::template::{self, TemplateOptions};
use crate::app::AppContext;
use crate::cluster::Cluster;
use crate::errors::{ClusterError, ConfigError};
use crate::service::Service;

pub const KIND: &str = "CommandApp";

/// A file rendered into the sandbox at construction; its path is stored
/// under config `key`.
#[derive(Debug, Clone, Deserialize)]
struct FileSpec {
    key: String,
    path: String,
    /// Inline template text
    #[serde(default)]
    template: Option<String>,
    /// Name of a template in the template directory
    #[serde(default)]
    template_name: Option<String>,
    #[serde(default = "default_substitute")]
    substitute: bool,
    #[serde(default)]
    append: Option<String>,
    #[serde(default)]
    category: Option<PathCategory>,
}

fn default_substitute() -> bool {
    true
}

#[derive(Debug)]
pub struct CommandApp {
    command: Option<String>,
    readiness: Readiness,
}

impl CommandApp {
    /// Build and register a command App.
    pub fn create(cluster: &mut Cluster, conf: AppConfig, on: Option<&str>) -> Result<AppId, ClusterError> {
        cluster.construct(KIND, Some(conf), on, Self::configure)
    }

    fn configure(cluster: &mut Cluster, ctx: &mut AppContext) -> Result<Self, ClusterError> {
        super::apply_flags(ctx);

        let logdir = ctx.create_dir("logs", false)?;
        ctx.config_mut().set("logdir", logdir.to_string_lossy().into_owned())?;
        let rootdir = ctx.root_path().to_string_lossy().into_owned();
        ctx.config_mut().set("rootdir", rootdir)?;

        super::allocate_ports(cluster, ctx)?;
        super::import_requires(cluster, ctx)?;
        materialize_files(ctx)?;
        super::apply_env(ctx)?;

        let command = match ctx.config().get("start_cmd") {
            None => None,
            Some(value) => {
                let raw = value.as_str().ok_or_else(|| ConfigError::WrongType {
                    key: "start_cmd".into(),
                    expected: "string",
                })?;
                Some(template::render(raw, ctx.config())?)
            }
        };
        if let Some(cmd) = &command {
            ctx.config_mut().set("command", cmd.as_str())?;
        }
        let readiness = Readiness::from_config(ctx.config())?;
        super::defer_post_start(ctx)?;

        debug!(app = %ctx, command = ?command, "Configured");
        Ok(CommandApp { command, readiness })
    }
}

fn materialize_files(ctx: &mut AppContext) -> Result<(), ClusterError> {
    let Some(value) = ctx.config().get("files").cloned() else {
        return Ok(());
    };
    let files: Vec<FileSpec> = serde_json::from_value(value).map_err(|_| ConfigError::WrongType {
        key: "files".into(),
        expected: "list of {key, path, template | template_name} tables",
    })?;

    for file in files {
        let opts = TemplateOptions {
            substitute: file.substitute,
            append: file.append.clone(),
            category: file.category.unwrap_or(PathCategory::Temporary),
            unique: false,
        };
        let path = match (&file.template, &file.template_name) {
            (Some(text), _) => ctx.create_file_from_template(&file.path, text, &opts)?,
            (None, name) => ctx.create_file_from_template_dir(&file.path, name.as_deref(), &opts)?,
        };
        ctx.config_mut()
            .set(file.key, path.to_string_lossy().into_owned())?;
    }
    Ok(())
}

#[async_trait]
impl Service for CommandApp {
    fn start_cmd(&self, _ctx: &AppContext) -> Option<String> {
        self.command.clone()
    }

    async fn operational(&self, ctx: &AppContext) -> bool {
        self.readiness.check(ctx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::settings::ClusterSettings;
    use serde_json::{Value, json};
    use std::time::Duration;

    fn conf(value: Value) -> AppConfig {
        serde_json::from_value(value).unwrap()
    }

    fn cluster(root: &std::path::Path) -> Cluster {
        Cluster::new(
            "cmd",
            ClusterSettings {
                poll_interval_ms: 20,
                stop_poll_interval_ms: 20,
                stop_timeout_secs: 2,
                ..ClusterSettings::with_root(root)
            },
        )
    }

    #[test]
    fn start_cmd_and_files_are_rendered_from_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster(dir.path());
        let id = CommandApp::create(
            &mut cluster,
            conf(json!({
                "label": "srv",
                "ports": ["port"],
                "files": [{"key": "conf", "path": "server.properties", "template": "port=%(port)d"}],
                "start_cmd": "serve --config %(conf)s --port %(port)d",
            })),
            None,
        )
        .unwrap();

        let app = cluster.app(id).unwrap();
        let port = app.config().get_u64("port").unwrap();
        let conf_path = app.config().get_str("conf").unwrap();
        assert_eq!(
            std::fs::read_to_string(conf_path).unwrap(),
            format!("port={}", port)
        );
        assert_eq!(
            app.config().get_str("command").unwrap(),
            format!("serve --config {} --port {}", conf_path, port)
        );
    }

    #[test]
    fn requires_imports_labelled_config() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster(dir.path());
        CommandApp::create(&mut cluster, conf(json!({"label": "zk", "ports": ["port"]})), None).unwrap();
        let id = CommandApp::create(
            &mut cluster,
            conf(json!({"label": "kafka", "requires": ["zk"], "start_cmd": "broker --zk localhost:%(zk_port)d"})),
            None,
        )
        .unwrap();

        let kafka = cluster.app(id).unwrap();
        let zk_port = kafka.config().get_u64("zk_port").unwrap();
        assert!(kafka.config().get_str("command").unwrap().ends_with(&zk_port.to_string()));
    }

    #[test]
    fn missing_requirement_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster(dir.path());
        let err = CommandApp::create(&mut cluster, conf(json!({"requires": ["zk"]})), None).unwrap_err();
        assert!(matches!(err, ClusterError::DependencyNotFound { .. }));
        assert!(cluster.apps().is_empty());
    }

    #[test]
    fn unknown_template_key_is_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster(dir.path());
        let err = CommandApp::create(&mut cluster, conf(json!({"start_cmd": "run %(nope)s"})), None).unwrap_err();
        assert!(matches!(err, ClusterError::Template(_)));

        let kind_dir = cluster.instance_path().join(KIND);
        let sandboxes = std::fs::read_dir(&kind_dir).map(|e| e.count()).unwrap_or(0);
        assert_eq!(sandboxes, 0);
    }

    #[tokio::test]
    async fn tcp_readiness_follows_the_listener() {
        let dir = tempfile::tempdir().unwrap();
        let mut cluster = cluster(dir.path());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();

        let id = CommandApp::create(
            &mut cluster,
            conf(json!({
                "target": port,
                "readiness": {"check": "tcp", "port": "target"},
                "start_cmd": "sleep 30",
                "env": {"TARGET": "127.0.0.1:%(target)d"},
            })),
            None,
        )
        .unwrap();
        assert_eq!(
            cluster.app(id).unwrap().context().environment()["TARGET"],
            format!("127.0.0.1:{}", port)
        );

        cluster.start(Some(Duration::from_secs(5))).await.unwrap();
        drop(listener);
        assert!(!cluster.app(id).unwrap().operational().await);
        cluster.stop(true).await;
    }
}
