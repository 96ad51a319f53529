//! The service seam between the supervisor and whatever speaks to a
//! tool-server process.
//!
//! The supervisor only ever sees [`ToolService`] objects produced by an
//! injected [`ServiceFactory`], and only learns about process death through
//! [`TerminationEvent`]s delivered via a [`TerminationSink`]. Delay and
//! attempt policy is injected as plain functions in [`RetryPolicy`] so
//! tests run without sleeping.

use crate::config::ServerDescriptor;
use crate::protocol::{ResourceDescriptor, ToolDescriptor};
use async_trait::async_trait;
use mooring_core::MooringResult;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use uuid::Uuid;

/// One connection to one tool-server process.
///
/// A service is constructed not-yet-connected; `connect` is called exactly
/// once per instance. A service that failed to connect is discarded, never
/// reconnected in place.
#[async_trait]
pub trait ToolService: Send + Sync {
    /// Establish the connection (spawn, handshake).
    async fn connect(&self) -> MooringResult<()>;

    /// Tear the connection down. Idempotent; a second call is a no-op.
    ///
    /// A deliberate disconnect must not be reported through the
    /// termination sink.
    fn disconnect(&self);

    /// List the tools the server exposes.
    async fn list_tools(&self) -> MooringResult<Vec<ToolDescriptor>>;

    /// List the resources the server exposes.
    async fn list_resources(&self) -> MooringResult<Vec<ResourceDescriptor>>;

    /// Invoke a tool and return its textual output.
    async fn call_tool(&self, name: &str, arguments: serde_json::Value) -> MooringResult<String>;

    /// Register the delegate channel for unexpected-termination reports.
    ///
    /// The supervisor calls this once, after `connect` succeeds.
    fn set_termination_sink(&self, sink: TerminationSink);
}

/// Constructs a new, not-yet-connected service for a descriptor.
pub type ServiceFactory = Arc<dyn Fn(&ServerDescriptor) -> Arc<dyn ToolService> + Send + Sync>;

/// Asynchronous report that a connected service died unexpectedly.
///
/// Tagged with the originating handle's id so the supervisor can discard
/// events from handles it has already replaced.
#[derive(Debug, Clone)]
pub struct TerminationEvent {
    /// Name of the server the handle belonged to.
    pub server: String,
    /// Identity of the handle that died.
    pub handle_id: Uuid,
    /// Error description, when one is known.
    pub error: Option<String>,
}

/// The delegate channel a connected service reports termination through.
///
/// Cheap to clone; sends never block. Events sent after the supervisor has
/// shut down are silently dropped.
#[derive(Debug, Clone)]
pub struct TerminationSink {
    server: String,
    handle_id: Uuid,
    tx: mpsc::UnboundedSender<TerminationEvent>,
}

impl TerminationSink {
    /// Creates a sink that tags events with `server` and `handle_id`.
    pub fn new(
        server: impl Into<String>,
        handle_id: Uuid,
        tx: mpsc::UnboundedSender<TerminationEvent>,
    ) -> Self {
        Self {
            server: server.into(),
            handle_id,
            tx,
        }
    }

    /// Report that the underlying process terminated unexpectedly.
    pub fn notify(&self, error: Option<String>) {
        let _ = self.tx.send(TerminationEvent {
            server: self.server.clone(),
            handle_id: self.handle_id,
            error,
        });
    }
}

/// Delay provider for connect retries, given the failed-attempt count.
pub type RetryDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Delay provider for reconnects after unexpected termination.
pub type ReconnectDelayFn = Arc<dyn Fn() -> Duration + Send + Sync>;

/// Attempt budget and delay policy for the supervisor, injectable so tests
/// run delay-free.
#[derive(Clone)]
pub struct RetryPolicy {
    /// Total connect attempts before a server is auto-disabled.
    pub max_attempts: u32,
    /// Delay before retry number `n` (1-based failed-attempt count).
    pub retry_delay: RetryDelayFn,
    /// Delay before reconnecting after an unexpected termination.
    pub reconnect_delay: ReconnectDelayFn,
}

impl RetryPolicy {
    /// Policy with the given attempt budget and zero delays, for tests.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            retry_delay: Arc::new(|_| Duration::ZERO),
            reconnect_delay: Arc::new(|| Duration::ZERO),
        }
    }
}

impl Default for RetryPolicy {
    /// 3 attempts; exponential retry delay 1s * 2^(n-1) capped at 60s;
    /// fixed 1s reconnect delay.
    fn default() -> Self {
        Self {
            max_attempts: 3,
            retry_delay: Arc::new(|attempt| {
                let exp = attempt.saturating_sub(1).min(6);
                Duration::from_secs(1 << exp).min(Duration::from_secs(60))
            }),
            reconnect_delay: Arc::new(|| Duration::from_secs(1)),
        }
    }
}

impl std::fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RetryPolicy")
            .field("max_attempts", &self.max_attempts)
            .finish_non_exhaustive()
    }
}
