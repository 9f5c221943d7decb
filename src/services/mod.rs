//! Collaborators shipped with the crate and the construction helpers they
//! share.
//!
//! Each collaborator exposes `create(&mut Cluster, AppConfig, Option<&str>)`,
//! which builds the App context, derives its config and registers it.

pub mod command;
pub mod docker;

pub use command::CommandApp;
pub use docker::DockerApp;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::app::config::AppConfig;
use crate::app::template;
use crate::app::AppContext;
use crate::cluster::Cluster;
use crate::errors::{ClusterError, ConfigError};
use crate::probe;

/// Host probed by readiness checks.
pub const PROBE_HOST: &str = "127.0.0.1";

/// How a collaborator decides it is operational.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(tag = "check", rename_all = "snake_case")]
pub enum Readiness {
    /// Operational as soon as started
    #[default]
    None,
    /// A TCP connect to the port stored under config key `port` succeeds
    Tcp { port: String },
    /// The reply on `port` (after sending `send`) contains `expect`
    Banner {
        port: String,
        #[serde(default)]
        send: Option<String>,
        expect: String,
    },
    /// HEAD on a templated URL answers below 500
    Http { url: String },
}

impl Readiness {
    /// Parse the optional `readiness` config table.
    pub fn from_config(config: &AppConfig) -> Result<Self, ConfigError> {
        match config.get("readiness") {
            None => Ok(Readiness::None),
            Some(value) => serde_json::from_value(value.clone()).map_err(|_| ConfigError::WrongType {
                key: "readiness".into(),
                expected: "table with check = none|tcp|banner|http",
            }),
        }
    }

    pub async fn check(&self, ctx: &AppContext) -> bool {
        match self {
            Readiness::None => true,
            Readiness::Tcp { port } => match port_of(ctx, port) {
                Some(port) => probe::tcp_connect(PROBE_HOST, port).await,
                None => false,
            },
            Readiness::Banner { port, send, expect } => match port_of(ctx, port) {
                Some(port) => probe::tcp_banner(PROBE_HOST, port, send.as_deref(), expect).await,
                None => false,
            },
            Readiness::Http { url } => match template::render(url, ctx.config()) {
                Ok(url) => probe::http_head(&url).await,
                Err(_) => false,
            },
        }
    }
}

fn port_of(ctx: &AppContext, key: &str) -> Option<u16> {
    ctx.config()
        .get_u64(key)
        .and_then(|p| u16::try_from(p).ok())
}

/// Named port requests from the `key` config entry: either a list of names
/// (any port) or a table of name to preferred port (`0` for any).
pub(crate) fn port_requests(config: &AppConfig, key: &str) -> Result<Vec<(String, Option<u16>)>, ConfigError> {
    let wrong_type = || ConfigError::WrongType {
        key: key.to_string(),
        expected: "list of names or table of name = preferred port",
    };
    match config.get(key) {
        None => Ok(Vec::new()),
        Some(Value::Array(names)) => names
            .iter()
            .map(|n| n.as_str().map(|n| (n.to_string(), None)).ok_or_else(wrong_type))
            .collect(),
        Some(Value::Object(table)) => table
            .iter()
            .map(|(name, preferred)| {
                let preferred = preferred
                    .as_u64()
                    .and_then(|p| u16::try_from(p).ok())
                    .ok_or_else(wrong_type)?;
                Ok((name.clone(), (preferred != 0).then_some(preferred)))
            })
            .collect(),
        Some(_) => Err(wrong_type()),
    }
}

/// Allocate every port named under `ports` and store it in the config.
pub(crate) fn allocate_ports(cluster: &mut Cluster, ctx: &mut AppContext) -> Result<(), ClusterError> {
    for (name, preferred) in port_requests(ctx.config(), "ports")? {
        let port = cluster.allocate_port(ctx.id(), preferred)?;
        ctx.config_mut().set(name, port)?;
    }
    Ok(())
}

/// Import the config of every App labelled in `requires` as
/// `<label>_<key>`.
pub(crate) fn import_requires(cluster: &Cluster, ctx: &mut AppContext) -> Result<(), ClusterError> {
    let labels = string_list(ctx.config(), "requires")?;
    for label in labels {
        let wanted = Value::String(label.clone());
        let dep = cluster
            .find(|a| a.config().matches("label", &wanted))
            .ok_or_else(|| ClusterError::DependencyNotFound {
                app: ctx.to_string(),
                kind: "labelled".into(),
                filter: format!(" with label={}", label),
            })?;
        let imported: Vec<(String, Value)> = dep
            .config()
            .iter()
            .map(|(k, v)| (format!("{}_{}", label, k), v.clone()))
            .collect();
        for (key, value) in imported {
            ctx.config_mut().set(key, value)?;
        }
    }
    Ok(())
}

/// Apply the `autostart` and `do_cleanup` config flags.
pub(crate) fn apply_flags(ctx: &mut AppContext) {
    if let Some(autostart) = ctx.config().get_bool("autostart") {
        ctx.autostart = autostart;
    }
    if let Some(do_cleanup) = ctx.config().get_bool("do_cleanup") {
        ctx.do_cleanup = do_cleanup;
    }
}

/// Render the `env` table against the config into the App environment.
pub(crate) fn apply_env(ctx: &mut AppContext) -> Result<(), ClusterError> {
    let Some(env) = ctx.config().get("env").cloned() else {
        return Ok(());
    };
    let Value::Object(table) = env else {
        return Err(ConfigError::WrongType {
            key: "env".into(),
            expected: "table of strings",
        }
        .into());
    };
    for (name, value) in table {
        let raw = match value {
            Value::String(s) => s,
            other => other.to_string(),
        };
        let rendered = template::render(&raw, ctx.config())?;
        ctx.env_add(&name, &rendered, false);
    }
    Ok(())
}

/// Queue each templated `post_start` command as a deferred command.
pub(crate) fn defer_post_start(ctx: &mut AppContext) -> Result<(), ClusterError> {
    for cmd in string_list(ctx.config(), "post_start")? {
        let rendered = template::render(&cmd, ctx.config())?;
        ctx.defer_command(rendered);
    }
    Ok(())
}

pub(crate) fn string_list(config: &AppConfig, key: &str) -> Result<Vec<String>, ConfigError> {
    match config.get(key) {
        None => Ok(Vec::new()),
        Some(Value::String(s)) => Ok(vec![s.clone()]),
        Some(Value::Array(items)) => items
            .iter()
            .map(|v| {
                v.as_str().map(str::to_string).ok_or_else(|| ConfigError::WrongType {
                    key: key.to_string(),
                    expected: "list of strings",
                })
            })
            .collect(),
        Some(_) => Err(ConfigError::WrongType {
            key: key.to_string(),
            expected: "list of strings",
        }),
    }
}
