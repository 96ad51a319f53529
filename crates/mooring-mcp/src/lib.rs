//! Connection supervisor for MCP tool-server processes.
//!
//! A [`Supervisor`] owns a fleet of independently configured, long-lived
//! tool-server peers and drives each one's lifecycle: connect with bounded
//! retry, auto-disable after repeated failure, reconnect after unexpected
//! process death, and restart when a server's launch configuration
//! changes. The transport is injected through the [`ToolService`] /
//! [`ServiceFactory`] seam; [`StdioService`] is the production
//! implementation over a spawned subprocess.
//!
//! # Main types
//!
//! - [`Supervisor`] — the coordinator owning all per-server state.
//! - [`ServerDescriptor`] — identity and launch parameters for one server.
//! - [`ConnectionState`] / [`PeerStatus`] — observable per-server state.
//! - [`ToolService`] — the capability interface to one connected server.
//! - [`RetryPolicy`] — injectable attempt budget and delay providers.

pub mod config;
pub mod protocol;
pub mod service;
pub mod stdio;
pub mod supervisor;

pub use config::ServerDescriptor;
pub use service::{RetryPolicy, ServiceFactory, TerminationEvent, TerminationSink, ToolService};
pub use stdio::{stdio_factory, StdioService};
pub use supervisor::{ConnectionState, PeerStatus, Supervisor};
