//! Server descriptors: identity and launch parameters for one tool server.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Identity and launch parameters for one supervised tool-server process.
///
/// `name` is the primary key across all supervisor state; the supervisor
/// never holds two live handles for the same name.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerDescriptor {
    /// Unique, stable identifier for this server.
    pub name: String,
    /// Executable to spawn.
    pub command: String,
    /// Command-line arguments, in order.
    #[serde(default)]
    pub args: Vec<String>,
    /// Environment variables set for the child process.
    #[serde(default)]
    pub env: HashMap<String, String>,
    /// When `false` the supervisor never connects this server automatically.
    /// Flipped to `false` by the supervisor itself after retries are
    /// exhausted.
    #[serde(default = "default_true")]
    pub enabled: bool,
}

fn default_true() -> bool {
    true
}

impl ServerDescriptor {
    /// Creates an enabled descriptor with no arguments or environment.
    pub fn new(name: impl Into<String>, command: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            command: command.into(),
            args: Vec::new(),
            env: HashMap::new(),
            enabled: true,
        }
    }

    /// Whether `other` launches a different process than `self`.
    ///
    /// Compares command, args, and env; `enabled` and `name` are identity
    /// and policy, not launch parameters, and are ignored here.
    pub fn launch_differs(&self, other: &Self) -> bool {
        self.command != other.command || self.args != other.args || self.env != other.env
    }
}
