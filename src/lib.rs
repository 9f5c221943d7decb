//! Provision, start, monitor and tear down ad hoc topologies of local or
//! dockerized service processes for integration testing.
//!
//! A [`Cluster`] owns the run: nodes, Apps, allocated ports and the
//! on-disk instance tree. Each App pairs an [`AppContext`] (config,
//! environment, paths, process) with a [`Service`] that supplies its
//! per-service behaviour.

pub mod allocator;
pub mod app;
pub mod cluster;
pub mod errors;
pub mod logging;
pub mod node;
pub mod probe;
pub mod service;
pub mod services;
pub mod settings;
pub mod topology;

pub use allocator::{AppId, IdAllocator, TcpPortAllocator, UuidAllocator};
pub use app::config::AppConfig;
pub use app::paths::PathCategory;
pub use app::template::TemplateOptions;
pub use app::{App, AppContext, AppState};
pub use cluster::Cluster;
pub use errors::{AllocationError, AppError, ClusterError, ConfigError, TemplateError};
pub use node::Node;
pub use service::Service;
pub use settings::ClusterSettings;
