//! The connection supervisor.
//!
//! Owns all per-server state and drives every lifecycle transition:
//! connect with bounded retry, auto-disable on exhaustion, reconnect after
//! unexpected process death, and restart when a server's launch
//! configuration changes. Servers are supervised independently — one
//! server's failure never stalls another.
//!
//! Concurrency model: every server has an async *op lock* that serializes
//! connect/reconnect/restart/remove for that name (different names proceed
//! concurrently), and a sync state lock guarding the observable
//! [`PeerStatus`] so `get_status` never blocks behind an in-flight connect.
//! The state lock is only ever held for short, non-awaiting sections.

use crate::config::ServerDescriptor;
use crate::protocol::{ResourceDescriptor, ToolDescriptor};
use crate::service::{RetryPolicy, ServiceFactory, TerminationEvent, TerminationSink, ToolService};
use chrono::{DateTime, Utc};
use mooring_core::{MooringError, MooringResult};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::sync::{Arc, Weak};
use tokio::sync::{mpsc, Mutex as OpMutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Connection lifecycle state of one supervised server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// Registered, no connection and none in progress.
    Disconnected,
    /// A connect attempt sequence is running.
    Connecting,
    /// Steady state: a live handle is serving requests.
    Connected,
    /// The process died unexpectedly; a reconnect is scheduled.
    Reconnecting,
    /// Auto-disabled after exhausting connect retries. Terminal until the
    /// descriptor is explicitly re-enabled.
    Disabled,
}

/// Observable status snapshot for one supervised server.
#[derive(Debug, Clone, Serialize)]
pub struct PeerStatus {
    /// Current lifecycle state.
    pub state: ConnectionState,
    /// Most recent failure, if any. `None` while connected.
    pub last_error: Option<String>,
    /// Failed connect attempts in the current attempt sequence.
    pub retry_count: u32,
    /// When the current connection was established.
    pub connected_at: Option<DateTime<Utc>>,
}

impl PeerStatus {
    fn initial() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            last_error: None,
            retry_count: 0,
            connected_at: None,
        }
    }
}

/// A live service handle tagged with its identity.
///
/// The id is what lets the supervisor tell a termination event from the
/// current handle apart from one sent by a handle it already replaced.
struct ActiveHandle {
    id: Uuid,
    service: Arc<dyn ToolService>,
}

/// State guarded by the per-server sync lock.
struct PeerShared {
    descriptor: ServerDescriptor,
    status: PeerStatus,
    /// Present iff `status.state` is Connecting, Connected, or Reconnecting.
    handle: Option<ActiveHandle>,
    /// Bumped to invalidate any pending reconnect task.
    reconnect_epoch: u64,
    reconnect_task: Option<tokio::task::JoinHandle<()>>,
}

/// One supervised server: op lock + observable state.
struct PeerSlot {
    op: Arc<OpMutex<()>>,
    shared: Mutex<PeerShared>,
}

impl PeerSlot {
    fn new(descriptor: ServerDescriptor) -> Self {
        Self {
            op: Arc::new(OpMutex::new(())),
            shared: Mutex::new(PeerShared {
                descriptor,
                status: PeerStatus::initial(),
                handle: None,
                reconnect_epoch: 0,
                reconnect_task: None,
            }),
        }
    }
}

/// Invalidate and abort any pending reconnect for this server.
///
/// Must be called with the shared lock held. After this, a reconnect task
/// that already woke up will fail its epoch re-check and exit without
/// touching anything.
fn cancel_reconnect(shared: &mut PeerShared) {
    shared.reconnect_epoch += 1;
    if let Some(task) = shared.reconnect_task.take() {
        task.abort();
    }
}

struct SupervisorInner {
    peers: RwLock<HashMap<String, Arc<PeerSlot>>>,
    factory: ServiceFactory,
    policy: RetryPolicy,
    events_tx: mpsc::UnboundedSender<TerminationEvent>,
}

/// Supervises connections to a fleet of tool-server processes.
///
/// Cheap to clone; all clones share the same state. Requires a tokio
/// runtime: construction spawns the termination-event pump task.
#[derive(Clone)]
pub struct Supervisor {
    inner: Arc<SupervisorInner>,
}

impl Supervisor {
    /// Creates a supervisor using `factory` to build service handles and
    /// `policy` for retry/reconnect delays.
    pub fn new(factory: ServiceFactory, policy: RetryPolicy) -> Self {
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        let inner = Arc::new(SupervisorInner {
            peers: RwLock::new(HashMap::new()),
            factory,
            policy,
            events_tx,
        });
        tokio::spawn(pump_events(Arc::downgrade(&inner), events_rx));
        Self { inner }
    }

    fn slot(&self, name: &str) -> Option<Arc<PeerSlot>> {
        self.inner.peers.read().get(name).cloned()
    }

    // --- Descriptor registry ---

    /// Registers a new server, or updates an existing one.
    ///
    /// Updating the launch parameters (command/args/env) of a server that
    /// currently holds a handle tears the old connection down and starts a
    /// new one under the new descriptor. The restart is queued on the
    /// server's op lock before this returns, so no other operation on the
    /// same name can interleave mid-restart; the connect itself proceeds
    /// asynchronously. Re-enabling a disabled server resets its retry
    /// count and makes it eligible for [`Supervisor::connect_server`]
    /// again.
    pub async fn set_descriptor(&self, descriptor: ServerDescriptor) {
        let name = descriptor.name.clone();

        let slot = match self.slot(&name) {
            Some(slot) => slot,
            None => {
                let slot = Arc::new(PeerSlot::new(descriptor));
                self.inner.peers.write().insert(name.clone(), Arc::clone(&slot));
                debug!(server = %name, "Server registered");
                return;
            }
        };

        let op = Arc::clone(&slot.op).lock_owned().await;

        let restart = {
            let mut shared = slot.shared.lock();
            let live = shared.handle.is_some();
            let differs = shared.descriptor.launch_differs(&descriptor);
            let was_disabled = shared.status.state == ConnectionState::Disabled;

            if live && !descriptor.enabled {
                // Disable-while-live: tear down, no replacement.
                cancel_reconnect(&mut shared);
                if let Some(handle) = shared.handle.take() {
                    handle.service.disconnect();
                }
                shared.descriptor = descriptor;
                shared.status.state = ConnectionState::Disconnected;
                shared.status.retry_count = 0;
                shared.status.connected_at = None;
                false
            } else if live && differs {
                cancel_reconnect(&mut shared);
                if let Some(handle) = shared.handle.take() {
                    handle.service.disconnect();
                }
                shared.descriptor = descriptor;
                shared.status.state = ConnectionState::Disconnected;
                shared.status.retry_count = 0;
                shared.status.connected_at = None;
                true
            } else {
                if was_disabled && descriptor.enabled {
                    shared.status.state = ConnectionState::Disconnected;
                    shared.status.retry_count = 0;
                }
                shared.descriptor = descriptor;
                false
            }
        };

        if restart {
            info!(server = %name, "Launch configuration changed, restarting server");
            let inner = Arc::clone(&self.inner);
            let slot = Arc::clone(&slot);
            // The op guard moves into the task, so the restart is already
            // first in line for this server when set_descriptor returns.
            tokio::spawn(async move {
                let _ = run_connect(&inner, &slot, op).await;
            });
        }
    }

    /// Removes a server: disconnects any active handle, cancels any
    /// pending reconnect, and deletes all supervisor state for the name.
    /// Removing an unknown name is a no-op.
    pub async fn remove_descriptor(&self, name: &str) {
        // Detach from the map first so no new operation can find the slot.
        let slot = self.inner.peers.write().remove(name);
        let Some(slot) = slot else {
            return;
        };
        let _op = Arc::clone(&slot.op).lock_owned().await;
        let mut shared = slot.shared.lock();
        cancel_reconnect(&mut shared);
        if let Some(handle) = shared.handle.take() {
            handle.service.disconnect();
        }
        shared.status.state = ConnectionState::Disconnected;
        shared.status.connected_at = None;
        debug!(server = %name, "Server removed");
    }

    /// Returns a copy of the stored descriptor, `None` for unknown names.
    ///
    /// Reflects supervisor-made changes, notably `enabled = false` after
    /// retries were exhausted.
    pub fn get_descriptor(&self, name: &str) -> Option<ServerDescriptor> {
        let slot = self.slot(name)?;
        let shared = slot.shared.lock();
        Some(shared.descriptor.clone())
    }

    // --- Connect state machine ---

    /// Connects a server, registering or updating its descriptor first.
    ///
    /// No-op when `descriptor.enabled` is `false`. Otherwise resolves only
    /// at a terminal outcome: `Ok(())` once connected, or
    /// [`MooringError::RetriesExhausted`] once every allowed attempt
    /// failed and the server was auto-disabled. Transient attempt failures
    /// are retried internally and never surface here. A server that
    /// already holds a live handle is torn down and connected fresh.
    pub async fn connect_server(&self, descriptor: ServerDescriptor) -> MooringResult<()> {
        let name = descriptor.name.clone();

        let slot = match self.slot(&name) {
            Some(slot) => slot,
            None => {
                let slot = Arc::new(PeerSlot::new(descriptor.clone()));
                self.inner
                    .peers
                    .write()
                    .insert(name.clone(), Arc::clone(&slot));
                slot
            }
        };

        if !descriptor.enabled {
            debug!(server = %name, "Server disabled, not connecting");
            return Ok(());
        }

        let op = Arc::clone(&slot.op).lock_owned().await;

        {
            let mut shared = slot.shared.lock();
            // A manual connect supersedes any scheduled reconnect and any
            // existing handle; two handles must never coexist for a name.
            cancel_reconnect(&mut shared);
            if let Some(handle) = shared.handle.take() {
                handle.service.disconnect();
            }
            shared.descriptor = descriptor;
            shared.status.state = ConnectionState::Disconnected;
            shared.status.retry_count = 0;
            shared.status.connected_at = None;
        }

        run_connect(&self.inner, &slot, op).await
    }

    /// Registers and connects every descriptor in order, returning the
    /// errors of the servers that could not be connected. Disabled
    /// descriptors are registered but not connected.
    pub async fn connect_all(&self, descriptors: Vec<ServerDescriptor>) -> Vec<MooringError> {
        let mut errors = Vec::new();
        for descriptor in descriptors {
            let name = descriptor.name.clone();
            if let Err(e) = self.connect_server(descriptor).await {
                warn!(server = %name, error = %e, "Failed to connect server");
                errors.push(e);
            }
        }
        errors
    }

    /// Disconnects a server's active handle, if any, and cancels any
    /// pending reconnect. The descriptor stays registered.
    pub async fn disconnect_server(&self, name: &str) -> MooringResult<()> {
        let slot = self
            .slot(name)
            .ok_or_else(|| MooringError::UnknownServer(name.to_string()))?;
        let _op = Arc::clone(&slot.op).lock_owned().await;
        let mut shared = slot.shared.lock();
        cancel_reconnect(&mut shared);
        if let Some(handle) = shared.handle.take() {
            handle.service.disconnect();
            debug!(server = %name, "Server disconnected");
        }
        if shared.status.state != ConnectionState::Disabled {
            shared.status.state = ConnectionState::Disconnected;
        }
        shared.status.connected_at = None;
        Ok(())
    }

    /// Disconnects every server and clears the registry. Called once at
    /// session end.
    pub async fn shutdown(&self) {
        info!("Shutting down supervisor");
        let slots: Vec<(String, Arc<PeerSlot>)> =
            self.inner.peers.write().drain().collect();
        for (name, slot) in slots {
            let _op = Arc::clone(&slot.op).lock_owned().await;
            let mut shared = slot.shared.lock();
            cancel_reconnect(&mut shared);
            if let Some(handle) = shared.handle.take() {
                debug!(server = %name, "Disconnecting server");
                handle.service.disconnect();
            }
            shared.status.state = ConnectionState::Disconnected;
        }
    }

    // --- Status and introspection ---

    /// Whether `name` is currently connected.
    pub fn is_connected(&self, name: &str) -> bool {
        self.get_status(name)
            .is_some_and(|s| s.state == ConnectionState::Connected)
    }

    /// Status snapshot for one server, `None` for unknown names.
    pub fn get_status(&self, name: &str) -> Option<PeerStatus> {
        let slot = self.slot(name)?;
        let shared = slot.shared.lock();
        Some(shared.status.clone())
    }

    /// Number of servers currently connecting or reconnecting.
    pub fn pending_count(&self) -> usize {
        let peers = self.inner.peers.read();
        peers
            .values()
            .filter(|slot| {
                matches!(
                    slot.shared.lock().status.state,
                    ConnectionState::Connecting | ConnectionState::Reconnecting
                )
            })
            .count()
    }

    /// Names of all registered servers.
    pub fn server_names(&self) -> Vec<String> {
        self.inner.peers.read().keys().cloned().collect()
    }

    /// Status snapshot of every registered server.
    pub fn statuses(&self) -> HashMap<String, PeerStatus> {
        let peers = self.inner.peers.read();
        peers
            .iter()
            .map(|(name, slot)| (name.clone(), slot.shared.lock().status.clone()))
            .collect()
    }

    // --- Pass-throughs to the active handle ---

    /// Lists the tools of a connected server.
    pub async fn list_tools(&self, name: &str) -> MooringResult<Vec<ToolDescriptor>> {
        let service = self.connected_service(name)?;
        service.list_tools().await
    }

    /// Lists the resources of a connected server.
    pub async fn list_resources(&self, name: &str) -> MooringResult<Vec<ResourceDescriptor>> {
        let service = self.connected_service(name)?;
        service.list_resources().await
    }

    /// Invokes a tool on a connected server.
    pub async fn call_tool(
        &self,
        name: &str,
        tool: &str,
        arguments: serde_json::Value,
    ) -> MooringResult<String> {
        let service = self.connected_service(name)?;
        service.call_tool(tool, arguments).await
    }

    fn connected_service(&self, name: &str) -> MooringResult<Arc<dyn ToolService>> {
        let slot = self
            .slot(name)
            .ok_or_else(|| MooringError::UnknownServer(name.to_string()))?;
        let shared = slot.shared.lock();
        if shared.status.state != ConnectionState::Connected {
            return Err(MooringError::NotConnected(name.to_string()));
        }
        shared
            .handle
            .as_ref()
            .map(|handle| Arc::clone(&handle.service))
            .ok_or_else(|| MooringError::NotConnected(name.to_string()))
    }
}

/// Drive one connect attempt sequence to a terminal outcome.
///
/// Runs with the server's op guard held for the whole sequence. Each
/// attempt builds a brand-new handle from the factory — a handle that
/// failed to connect may hold half-initialized process state and is never
/// retried in place. Status is committed here, after `connect()` resolves,
/// so callers observe `Connected` no later than this function returning.
async fn run_connect(
    inner: &Arc<SupervisorInner>,
    slot: &Arc<PeerSlot>,
    _op: OwnedMutexGuard<()>,
) -> MooringResult<()> {
    loop {
        let descriptor = slot.shared.lock().descriptor.clone();
        let name = descriptor.name.clone();
        let service = (inner.factory)(&descriptor);
        let handle_id = Uuid::new_v4();
        {
            let mut shared = slot.shared.lock();
            shared.status.state = ConnectionState::Connecting;
            // Replaces (and drops) the previous attempt's failed handle.
            shared.handle = Some(ActiveHandle {
                id: handle_id,
                service: Arc::clone(&service),
            });
        }

        match service.connect().await {
            Ok(()) => {
                service.set_termination_sink(TerminationSink::new(
                    &name,
                    handle_id,
                    inner.events_tx.clone(),
                ));
                let mut shared = slot.shared.lock();
                shared.status.state = ConnectionState::Connected;
                shared.status.retry_count = 0;
                shared.status.last_error = None;
                shared.status.connected_at = Some(Utc::now());
                info!(server = %name, "Server connected");
                return Ok(());
            }
            Err(e) => {
                let reason = e.to_string();
                let (attempt, give_up) = {
                    let mut shared = slot.shared.lock();
                    shared.status.retry_count += 1;
                    shared.status.last_error = Some(reason.clone());
                    (
                        shared.status.retry_count,
                        shared.status.retry_count >= inner.policy.max_attempts,
                    )
                };
                // Reap whatever the failed attempt left behind.
                service.disconnect();

                if give_up {
                    let mut shared = slot.shared.lock();
                    shared.handle = None;
                    shared.descriptor.enabled = false;
                    shared.status.state = ConnectionState::Disabled;
                    warn!(
                        server = %name,
                        attempts = attempt,
                        error = %reason,
                        "Retries exhausted, server disabled"
                    );
                    return Err(MooringError::RetriesExhausted(format!(
                        "'{name}' failed after {attempt} attempts: {reason}"
                    )));
                }

                debug!(
                    server = %name,
                    attempt,
                    error = %reason,
                    "Connect attempt failed, retrying"
                );
                tokio::time::sleep((inner.policy.retry_delay)(attempt)).await;
            }
        }
    }
}

/// Consume termination events until the supervisor is dropped.
async fn pump_events(
    weak: Weak<SupervisorInner>,
    mut events_rx: mpsc::UnboundedReceiver<TerminationEvent>,
) {
    while let Some(event) = events_rx.recv().await {
        let Some(inner) = weak.upgrade() else {
            break;
        };
        handle_termination(&inner, event);
    }
}

/// React to one unexpected-termination report.
///
/// Stale events — from a handle that is no longer the active handle for
/// its server, or for a server that was removed — are dropped here and
/// never surfaced.
fn handle_termination(inner: &Arc<SupervisorInner>, event: TerminationEvent) {
    let Some(slot) = inner.peers.read().get(&event.server).cloned() else {
        debug!(server = %event.server, "Termination event for removed server, dropping");
        return;
    };

    let epoch = {
        let mut shared = slot.shared.lock();
        let is_active = shared
            .handle
            .as_ref()
            .is_some_and(|handle| handle.id == event.handle_id);
        if !is_active {
            debug!(
                server = %event.server,
                handle = %event.handle_id,
                "Stale termination event, dropping"
            );
            return;
        }
        warn!(
            server = %event.server,
            error = event.error.as_deref().unwrap_or("unknown"),
            "Server terminated unexpectedly, scheduling reconnect"
        );
        // Reap the dead process; the handle stays recorded until the
        // reconnect builds its replacement.
        if let Some(handle) = shared.handle.as_ref() {
            handle.service.disconnect();
        }
        shared.status.state = ConnectionState::Reconnecting;
        shared.status.last_error = event.error.clone();
        shared.status.connected_at = None;
        // A fresh reconnect request supersedes any prior pending one.
        cancel_reconnect(&mut shared);
        shared.reconnect_epoch
    };

    let delay = (inner.policy.reconnect_delay)();
    let inner = Arc::clone(inner);
    let task_slot = Arc::clone(&slot);
    let name = event.server.clone();
    let task = tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        finish_reconnect(inner, task_slot, name, epoch).await;
    });
    slot.shared.lock().reconnect_task = Some(task);
}

/// Complete a scheduled reconnect, unless it was cancelled meanwhile.
async fn finish_reconnect(
    inner: Arc<SupervisorInner>,
    slot: Arc<PeerSlot>,
    name: String,
    epoch: u64,
) {
    let op = Arc::clone(&slot.op).lock_owned().await;

    // Re-validate under the op lock: the server may have been removed,
    // replaced, disabled, or superseded by a newer reconnect while the
    // delay ran.
    let still_current = inner
        .peers
        .read()
        .get(&name)
        .is_some_and(|current| Arc::ptr_eq(current, &slot));
    if !still_current {
        return;
    }
    {
        let mut shared = slot.shared.lock();
        if shared.reconnect_epoch != epoch {
            return;
        }
        shared.reconnect_task = None;
        if !shared.descriptor.enabled {
            return;
        }
        // A reconnect cycle gets a fresh attempt budget.
        shared.status.retry_count = 0;
    }

    debug!(server = %name, "Reconnecting after unexpected termination");
    let _ = run_connect(&inner, &slot, op).await;
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use std::collections::VecDeque;
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    /// Per-server scripts of connect outcomes, plus every handle ever
    /// built, in construction order.
    #[derive(Default)]
    struct FleetState {
        outcomes: HashMap<String, VecDeque<Result<(), String>>>,
        built: Vec<Arc<MockService>>,
    }

    /// A scripted in-memory service: connect outcomes come from the shared
    /// fleet script, and every call is counted for assertions.
    struct MockService {
        server: String,
        args: Vec<String>,
        fleet: Arc<Mutex<FleetState>>,
        connect_calls: AtomicU32,
        disconnect_calls: AtomicU32,
        sink: Mutex<Option<TerminationSink>>,
    }

    #[async_trait]
    impl ToolService for MockService {
        async fn connect(&self) -> MooringResult<()> {
            self.connect_calls.fetch_add(1, Ordering::SeqCst);
            let outcome = self
                .fleet
                .lock()
                .outcomes
                .get_mut(&self.server)
                .and_then(VecDeque::pop_front)
                .unwrap_or(Ok(()));
            outcome.map_err(MooringError::ConnectionFailed)
        }

        fn disconnect(&self) {
            self.disconnect_calls.fetch_add(1, Ordering::SeqCst);
        }

        async fn list_tools(&self) -> MooringResult<Vec<ToolDescriptor>> {
            Ok(Vec::new())
        }

        async fn list_resources(&self) -> MooringResult<Vec<ResourceDescriptor>> {
            Ok(Vec::new())
        }

        async fn call_tool(
            &self,
            name: &str,
            _arguments: serde_json::Value,
        ) -> MooringResult<String> {
            Ok(format!("{}:{name}", self.server))
        }

        fn set_termination_sink(&self, sink: TerminationSink) {
            *self.sink.lock() = Some(sink);
        }
    }

    fn scripted_fleet(
        scripts: Vec<(&str, Vec<Result<(), String>>)>,
    ) -> (ServiceFactory, Arc<Mutex<FleetState>>) {
        let fleet = Arc::new(Mutex::new(FleetState {
            outcomes: scripts
                .into_iter()
                .map(|(name, outcomes)| (name.to_string(), outcomes.into()))
                .collect(),
            built: Vec::new(),
        }));
        let factory_fleet = Arc::clone(&fleet);
        let factory: ServiceFactory = Arc::new(move |descriptor| {
            let service = Arc::new(MockService {
                server: descriptor.name.clone(),
                args: descriptor.args.clone(),
                fleet: Arc::clone(&factory_fleet),
                connect_calls: AtomicU32::new(0),
                disconnect_calls: AtomicU32::new(0),
                sink: Mutex::new(None),
            });
            factory_fleet.lock().built.push(Arc::clone(&service));
            service
        });
        (factory, fleet)
    }

    fn fail(reason: &str) -> Result<(), String> {
        Err(reason.to_string())
    }

    async fn wait_until(mut condition: impl FnMut() -> bool) {
        for _ in 0..200 {
            if condition() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached within 2s");
    }

    fn handle(fleet: &Arc<Mutex<FleetState>>, index: usize) -> Arc<MockService> {
        Arc::clone(&fleet.lock().built[index])
    }

    fn built_count(fleet: &Arc<Mutex<FleetState>>) -> usize {
        fleet.lock().built.len()
    }

    #[tokio::test]
    async fn test_retry_then_succeed() {
        let (factory, fleet) = scripted_fleet(vec![("p", vec![fail("boom"), Ok(())])]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(3));

        supervisor
            .connect_server(ServerDescriptor::new("p", "cmd"))
            .await
            .unwrap();

        assert!(supervisor.is_connected("p"));
        let status = supervisor.get_status("p").unwrap();
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(status.last_error.is_none());
        assert_eq!(status.retry_count, 0);
        assert!(status.connected_at.is_some());
        assert!(supervisor.get_descriptor("p").unwrap().enabled);

        // One fresh handle per attempt, one connect call per handle.
        assert_eq!(built_count(&fleet), 2);
        assert_eq!(handle(&fleet, 0).connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(handle(&fleet, 1).connect_calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_exhaustion_disables() {
        let (factory, fleet) = scripted_fleet(vec![(
            "p",
            vec![fail("one"), fail("two"), fail("three")],
        )]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(3));

        let err = supervisor
            .connect_server(ServerDescriptor::new("p", "cmd"))
            .await
            .unwrap_err();
        assert!(matches!(err, MooringError::RetriesExhausted(_)));

        assert!(!supervisor.is_connected("p"));
        let status = supervisor.get_status("p").unwrap();
        assert_eq!(status.state, ConnectionState::Disabled);
        assert_eq!(status.retry_count, 3);
        assert!(status.last_error.as_deref().unwrap().contains("three"));
        assert!(!supervisor.get_descriptor("p").unwrap().enabled);
        assert_eq!(built_count(&fleet), 3);
    }

    #[tokio::test]
    async fn test_disabled_descriptor_is_noop() {
        let (factory, fleet) = scripted_fleet(vec![]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(3));

        let mut descriptor = ServerDescriptor::new("p", "cmd");
        descriptor.enabled = false;
        supervisor.connect_server(descriptor).await.unwrap();

        assert_eq!(built_count(&fleet), 0);
        assert_eq!(
            supervisor.get_status("p").unwrap().state,
            ConnectionState::Disconnected
        );
    }

    #[tokio::test]
    async fn test_reconnect_after_termination() {
        let (factory, fleet) = scripted_fleet(vec![("p", vec![Ok(()), Ok(())])]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(3));

        supervisor
            .connect_server(ServerDescriptor::new("p", "cmd"))
            .await
            .unwrap();
        let original = handle(&fleet, 0);
        let sink = original.sink.lock().clone().unwrap();

        sink.notify(Some("process exited: signal 9".to_string()));

        {
            let supervisor = supervisor.clone();
            let fleet = Arc::clone(&fleet);
            wait_until(move || supervisor.is_connected("p") && built_count(&fleet) == 2).await;
        }

        // A brand-new handle took over; the original was reaped.
        let replacement = handle(&fleet, 1);
        assert!(!Arc::ptr_eq(&original, &replacement));
        assert_eq!(replacement.connect_calls.load(Ordering::SeqCst), 1);
        assert!(original.disconnect_calls.load(Ordering::SeqCst) >= 1);
        assert!(supervisor.get_status("p").unwrap().last_error.is_none());
    }

    #[tokio::test]
    async fn test_restart_on_config_change() {
        let (factory, fleet) = scripted_fleet(vec![("p", vec![Ok(()), Ok(())])]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(3));

        let mut descriptor = ServerDescriptor::new("p", "cmd");
        descriptor.args = vec!["a".to_string()];
        supervisor.connect_server(descriptor.clone()).await.unwrap();
        let original = handle(&fleet, 0);
        assert_eq!(original.args, vec!["a"]);

        descriptor.args = vec!["b".to_string()];
        supervisor.set_descriptor(descriptor).await;

        {
            let supervisor = supervisor.clone();
            let fleet = Arc::clone(&fleet);
            wait_until(move || supervisor.is_connected("p") && built_count(&fleet) == 2).await;
        }

        assert_eq!(original.disconnect_calls.load(Ordering::SeqCst), 1);
        let replacement = handle(&fleet, 1);
        assert_eq!(replacement.args, vec!["b"]);
        assert_eq!(replacement.connect_calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            supervisor.get_descriptor("p").unwrap().args,
            vec!["b".to_string()]
        );
    }

    #[tokio::test]
    async fn test_stale_termination_event_is_dropped() {
        let (factory, fleet) = scripted_fleet(vec![("p", vec![Ok(()), Ok(())])]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(3));

        let mut descriptor = ServerDescriptor::new("p", "cmd");
        supervisor.connect_server(descriptor.clone()).await.unwrap();
        let original = handle(&fleet, 0);
        let stale_sink = original.sink.lock().clone().unwrap();

        // Replace the handle via a launch-parameter restart.
        descriptor.args = vec!["v2".to_string()];
        supervisor.set_descriptor(descriptor).await;
        {
            let supervisor = supervisor.clone();
            let fleet = Arc::clone(&fleet);
            wait_until(move || supervisor.is_connected("p") && built_count(&fleet) == 2).await;
        }

        // A late event from the superseded handle must change nothing.
        stale_sink.notify(Some("late crash report".to_string()));
        tokio::time::sleep(Duration::from_millis(100)).await;

        assert_eq!(built_count(&fleet), 2);
        let status = supervisor.get_status("p").unwrap();
        assert_eq!(status.state, ConnectionState::Connected);
        assert!(status.last_error.is_none());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let (factory, _fleet) = scripted_fleet(vec![("p", vec![Ok(())])]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(3));

        supervisor
            .connect_server(ServerDescriptor::new("p", "cmd"))
            .await
            .unwrap();

        supervisor.remove_descriptor("p").await;
        assert!(supervisor.get_status("p").is_none());
        // Second removal is a no-op.
        supervisor.remove_descriptor("p").await;
        assert!(supervisor.get_status("p").is_none());
    }

    #[tokio::test]
    async fn test_disconnect_twice_is_safe() {
        let (factory, fleet) = scripted_fleet(vec![("p", vec![Ok(())])]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(3));

        supervisor
            .connect_server(ServerDescriptor::new("p", "cmd"))
            .await
            .unwrap();

        supervisor.disconnect_server("p").await.unwrap();
        supervisor.disconnect_server("p").await.unwrap();

        assert_eq!(
            supervisor.get_status("p").unwrap().state,
            ConnectionState::Disconnected
        );
        // The supervisor disconnected the handle once; extra calls on the
        // service itself are also safe.
        let original = handle(&fleet, 0);
        original.disconnect();
        assert!(original.disconnect_calls.load(Ordering::SeqCst) >= 2);
    }

    #[tokio::test]
    async fn test_cancelled_reconnect_never_mutates() {
        let (factory, fleet) = scripted_fleet(vec![("p", vec![Ok(())])]);
        // Non-zero reconnect delay so removal lands mid-delay.
        let policy = RetryPolicy {
            max_attempts: 3,
            retry_delay: Arc::new(|_| Duration::ZERO),
            reconnect_delay: Arc::new(|| Duration::from_millis(80)),
        };
        let supervisor = Supervisor::new(factory, policy);

        supervisor
            .connect_server(ServerDescriptor::new("p", "cmd"))
            .await
            .unwrap();
        let sink = handle(&fleet, 0).sink.lock().clone().unwrap();
        sink.notify(Some("crashed".to_string()));

        {
            let supervisor = supervisor.clone();
            wait_until(move || {
                supervisor
                    .get_status("p")
                    .is_some_and(|s| s.state == ConnectionState::Reconnecting)
            })
            .await;
        }

        supervisor.remove_descriptor("p").await;
        tokio::time::sleep(Duration::from_millis(200)).await;

        // The pending reconnect was cancelled: no new handle, no state.
        assert_eq!(built_count(&fleet), 1);
        assert!(supervisor.get_status("p").is_none());
    }

    #[tokio::test]
    async fn test_reenable_after_auto_disable() {
        let (factory, fleet) = scripted_fleet(vec![("p", vec![fail("down"), Ok(())])]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(1));

        let descriptor = ServerDescriptor::new("p", "cmd");
        let err = supervisor.connect_server(descriptor.clone()).await.unwrap_err();
        assert!(matches!(err, MooringError::RetriesExhausted(_)));
        assert!(!supervisor.get_descriptor("p").unwrap().enabled);

        // Re-enabling resets the peer to disconnected with a fresh budget.
        supervisor.set_descriptor(descriptor.clone()).await;
        let status = supervisor.get_status("p").unwrap();
        assert_eq!(status.state, ConnectionState::Disconnected);
        assert_eq!(status.retry_count, 0);

        supervisor.connect_server(descriptor).await.unwrap();
        assert!(supervisor.is_connected("p"));
        assert_eq!(built_count(&fleet), 2);
    }

    #[tokio::test]
    async fn test_pass_through_requires_connection() {
        let (factory, _fleet) = scripted_fleet(vec![("p", vec![Ok(())])]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(3));

        let err = supervisor
            .call_tool("ghost", "echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MooringError::UnknownServer(_)));

        supervisor
            .set_descriptor(ServerDescriptor::new("p", "cmd"))
            .await;
        let err = supervisor
            .call_tool("p", "echo", serde_json::json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, MooringError::NotConnected(_)));

        supervisor
            .connect_server(ServerDescriptor::new("p", "cmd"))
            .await
            .unwrap();
        let out = supervisor
            .call_tool("p", "echo", serde_json::json!({}))
            .await
            .unwrap();
        assert_eq!(out, "p:echo");
        assert!(supervisor.list_tools("p").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_servers_fail_independently() {
        let (factory, _fleet) = scripted_fleet(vec![
            ("good", vec![Ok(())]),
            ("bad", vec![fail("no"), fail("no"), fail("no")]),
        ]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(3));

        let errors = supervisor
            .connect_all(vec![
                ServerDescriptor::new("bad", "cmd"),
                ServerDescriptor::new("good", "cmd"),
            ])
            .await;

        assert_eq!(errors.len(), 1);
        assert!(supervisor.is_connected("good"));
        assert_eq!(
            supervisor.get_status("bad").unwrap().state,
            ConnectionState::Disabled
        );
        assert_eq!(supervisor.pending_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_disconnects_everything() {
        let (factory, fleet) = scripted_fleet(vec![("a", vec![Ok(())]), ("b", vec![Ok(())])]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(3));

        supervisor
            .connect_all(vec![
                ServerDescriptor::new("a", "cmd"),
                ServerDescriptor::new("b", "cmd"),
            ])
            .await;
        assert_eq!(supervisor.server_names().len(), 2);

        supervisor.shutdown().await;

        assert!(supervisor.server_names().is_empty());
        for service in &fleet.lock().built {
            assert!(service.disconnect_calls.load(Ordering::SeqCst) >= 1);
        }
    }

    #[tokio::test]
    async fn test_statuses_snapshot() {
        let (factory, _fleet) = scripted_fleet(vec![("a", vec![Ok(())])]);
        let supervisor = Supervisor::new(factory, RetryPolicy::immediate(3));

        supervisor
            .connect_server(ServerDescriptor::new("a", "cmd"))
            .await
            .unwrap();
        supervisor
            .set_descriptor(ServerDescriptor::new("b", "cmd"))
            .await;

        let statuses = supervisor.statuses();
        assert_eq!(statuses.len(), 2);
        assert_eq!(statuses["a"].state, ConnectionState::Connected);
        assert_eq!(statuses["b"].state, ConnectionState::Disconnected);
    }
}
