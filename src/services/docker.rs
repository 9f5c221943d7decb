//! A container run through the docker CLI on the `docker` node.
//!
//! ```toml
//! [[app]]
//! kind = "docker"
//! image = "confluentinc/cp-kafka"
//! tag = "7.6.0"
//! expose = { port = 9092 }
//! mounts = { "/etc/kafka/secrets" = "secrets" }
//! props = { KAFKA_BROKER_ID = "1" }
//! readiness = { check = "tcp", port = "port" }
//! ```
//!
//! `expose` maps a config key to a container port; a host port is allocated
//! under that key. Relative mount sources are sandbox directories.

use async_trait::async_trait;
use serde_json::Value;
use tracing::debug;

use super::Readiness;
use crate::allocator::{AppId, UuidAllocator};
use crate::app::config::AppConfig;
use crate::app::template;
use crate::app::AppContext;
use crate::cluster::Cluster;
use crate::errors::{AppError, ClusterError, ConfigError};
use crate::node::DOCKER_NODE;
use crate::service::Service;

pub const KIND: &str = "DockerApp";

#[derive(Debug)]
pub struct DockerApp {
    image: String,
    container_name: String,
    docker_args: Vec<String>,
    app_args: Vec<String>,
    pull: bool,
    readiness: Readiness,
}

impl DockerApp {
    /// A container for `image:tag` named `rigup_<image basename>_<token>`.
    pub fn new(image: &str, tag: &str) -> Self {
        let basename = image.rsplit('/').next().unwrap_or(image);
        Self {
            image: format!("{}:{}", image, tag),
            container_name: format!("rigup_{}_{}", basename, UuidAllocator::next(7)),
            docker_args: Vec::new(),
            app_args: Vec::new(),
            pull: true,
            readiness: Readiness::None,
        }
    }

    pub fn image(&self) -> &str {
        &self.image
    }

    pub fn container_name(&self) -> &str {
        &self.container_name
    }

    /// Publish container port `container` on host port `host`.
    pub fn expose_port(&mut self, container: u16, host: u16) {
        self.docker_args.push(format!("-p {}:{}", host, container));
    }

    pub fn add_mount(&mut self, container: &str, host: &str) {
        self.docker_args.push(format!(
            "--mount type=bind,source={},destination={}",
            host, container
        ));
    }

    /// Pass `NAME=value` into the container environment.
    pub fn add_prop(&mut self, prop: impl Into<String>) {
        self.app_args.push(prop.into());
    }

    pub fn add_docker_arg(&mut self, arg: impl Into<String>) {
        self.docker_args.push(arg.into());
    }

    /// Build and register a container App from config keys `image`, `tag`
    /// (default `latest`), `pull`, `expose`, `mounts`, `props`, `args` and
    /// `readiness`.
    pub fn create(cluster: &mut Cluster, conf: AppConfig, on: Option<&str>) -> Result<AppId, ClusterError> {
        cluster.construct(KIND, Some(conf), Some(on.unwrap_or(DOCKER_NODE)), Self::configure)
    }

    fn configure(cluster: &mut Cluster, ctx: &mut AppContext) -> Result<Self, ClusterError> {
        super::apply_flags(ctx);

        let image = ctx.config().require_str("image")?.to_string();
        let tag = ctx.config().get_str("tag").unwrap_or("latest").to_string();
        let mut docker = DockerApp::new(&image, &tag);
        docker.pull = ctx.config().get_bool("pull").unwrap_or(true);

        for (key, container_port) in super::port_requests(ctx.config(), "expose")? {
            let Some(container_port) = container_port else {
                return Err(ConfigError::WrongType {
                    key: format!("expose.{}", key),
                    expected: "container port number",
                }
                .into());
            };
            let host_port = cluster.allocate_port(ctx.id(), None)?;
            ctx.config_mut().set(key, host_port)?;
            docker.expose_port(container_port, host_port);
        }

        super::import_requires(cluster, ctx)?;

        if let Some(Value::Object(mounts)) = ctx.config().get("mounts").cloned() {
            for (container, source) in mounts {
                let source = source.as_str().ok_or_else(|| ConfigError::WrongType {
                    key: format!("mounts.{}", container),
                    expected: "string",
                })?;
                let host = if source.starts_with('/') {
                    source.to_string()
                } else {
                    ctx.create_dir(source, false)?.to_string_lossy().into_owned()
                };
                docker.add_mount(&container, &host);
            }
        }

        if let Some(Value::Object(props)) = ctx.config().get("props").cloned() {
            for (name, value) in props {
                let raw = match value {
                    Value::String(s) => s,
                    other => other.to_string(),
                };
                let rendered = template::render(&raw, ctx.config())?;
                docker.add_prop(format!("{}={}", name, rendered));
            }
        }

        for arg in super::string_list(ctx.config(), "args")? {
            docker.add_docker_arg(template::render(&arg, ctx.config())?);
        }

        docker.readiness = Readiness::from_config(ctx.config())?;
        super::apply_env(ctx)?;
        super::defer_post_start(ctx)?;
        ctx.config_mut().set("container_name", docker.container_name.as_str())?;

        debug!(app = %ctx, image = %docker.image, container = %docker.container_name, "Configured");
        Ok(docker)
    }

    fn run_args(&self) -> String {
        let props: Vec<String> = self.app_args.iter().map(|p| format!("-e {}", p)).collect();
        [
            "run -a stdout -a stderr".to_string(),
            self.docker_args.join(" "),
            format!("--name {}", self.container_name),
            props.join(" "),
            self.image.clone(),
        ]
        .into_iter()
        .filter(|part| !part.is_empty())
        .collect::<Vec<_>>()
        .join(" ")
    }
}

#[async_trait]
impl Service for DockerApp {
    async fn deploy(&mut self, ctx: &mut AppContext) -> Result<(), AppError> {
        if !self.pull {
            return Ok(());
        }
        debug!(app = %ctx, image = %self.image, "Pulling docker image");
        ctx.execute(&format!("pull {}", self.image)).await?;
        Ok(())
    }

    fn start_cmd(&self, _ctx: &AppContext) -> Option<String> {
        Some(self.run_args())
    }

    fn stop_cmd(&self, _ctx: &AppContext) -> Option<String> {
        Some(format!("stop {}", self.container_name))
    }

    async fn operational(&self, ctx: &AppContext) -> bool {
        self.readiness.check(ctx).await
    }
}
