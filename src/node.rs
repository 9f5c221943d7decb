//! Execution targets.

use std::fmt;

/// Name of the pseudo-node that runs commands through the docker CLI.
pub const DOCKER_NODE: &str = "docker";

/// Name of the node that runs commands on this host.
pub const LOCAL_NODE: &str = "localhost";

/// A named place to run commands.
///
/// A node only knows how to prefix a command line so that it executes in the
/// right place: nothing for the local host, the docker CLI for the `docker`
/// pseudo-node, and `ssh <host>` for anything else.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Node {
    name: String,
    exec_prefix: String,
}

impl Node {
    pub fn new(name: impl Into<String>) -> Self {
        let name = name.into();
        let exec_prefix = match name.as_str() {
            LOCAL_NODE => String::new(),
            DOCKER_NODE => "docker ".to_string(),
            host => format!("ssh {} ", host),
        };
        Self { name, exec_prefix }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn exec_prefix(&self) -> &str {
        &self.exec_prefix
    }

    pub fn is_local(&self) -> bool {
        self.exec_prefix.is_empty()
    }

    /// Full command line for `cmd` on this node.
    pub fn command_line(&self, cmd: &str) -> String {
        format!("{}{}", self.exec_prefix, cmd)
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.name)
    }
}
