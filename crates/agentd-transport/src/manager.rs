//! Connection manager: admission, reconnection, grace windows, health.

use std::{
    collections::HashMap,
    sync::Arc,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use thiserror::Error;
use tokio::sync::RwLock;
use uuid::Uuid;

use agentd_events::{ConnectionId, EventId, SessionId};
use agentd_session::{
    AttachMode, ReplayHandle, Session, SessionError, SessionRegistry, TaskSpec,
};

use crate::backoff::MAX_ATTEMPTS;

/// Connection manager configuration.
#[derive(Debug, Clone)]
pub struct ManagerConfig {
    /// Concurrent-connection ceiling; admissions beyond it are shed.
    pub max_connections: usize,
    /// Per-user connection ceiling.
    pub max_per_user: usize,
    /// How long a disconnected session honors reconnection before its
    /// connection record is dropped.
    pub grace_window: Duration,
    /// Health sweep period.
    pub health_interval: Duration,
    /// Connections silent for longer than this fail the liveness check and
    /// are proactively closed into the grace window.
    pub liveness_timeout: Duration,
    /// Retry hint attached to load-shed rejections.
    pub retry_after: Duration,
}

impl Default for ManagerConfig {
    fn default() -> Self {
        Self {
            max_connections: 256,
            max_per_user: 4,
            grace_window: Duration::from_secs(30),
            health_interval: Duration::from_secs(15),
            liveness_timeout: Duration::from_secs(45),
            retry_after: Duration::from_secs(5),
        }
    }
}

/// Health of a tracked connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthState {
    Open,
    /// Transport gone; the bound session stays alive awaiting reconnection.
    Grace,
}

/// A live client transport endpoint. References its session by id only;
/// closing a connection never destroys the session.
#[derive(Debug, Clone)]
pub struct Connection {
    pub connection_id: ConnectionId,
    pub user_id: String,
    pub bound_session_id: SessionId,
    pub connected_at: DateTime<Utc>,
    pub health: HealthState,
}

struct Entry {
    connection: Connection,
    last_seen: Instant,
    grace_deadline: Option<Instant>,
}

/// A new-session admission request.
#[derive(Debug, Clone)]
pub struct ConnectionRequest {
    pub user_id: String,
    pub task: TaskSpec,
}

/// Result of a successful accept or reconnect.
#[derive(Debug)]
pub struct Attached {
    pub connection: Connection,
    pub session: Arc<Session>,
    pub replay: ReplayHandle,
}

/// Connection error. `retry_after` distinguishes load shedding (come back
/// later) from terminal refusals.
#[derive(Debug, Error)]
pub enum ConnectError {
    #[error("connection ceiling reached")]
    AtCapacity { retry_after: Duration },
    #[error("per-user connection limit reached")]
    UserLimit { retry_after: Duration },
    #[error("no sandbox capacity available")]
    SandboxExhausted { retry_after: Duration },
    #[error("session {0} not found")]
    UnknownSession(SessionId),
    /// Authorization failure: refused immediately, never retried.
    #[error("requesting identity does not own the session")]
    NotOwner,
    /// The client exceeded the reconnect budget; terminal.
    #[error("reconnect budget exhausted after {attempts} attempts")]
    ReconnectExhausted { attempts: u32 },
    /// The transport closed before a session was bound.
    #[error("connection closed before session start")]
    HandshakeFailed,
    #[error(transparent)]
    Session(#[from] SessionError),
}

impl ConnectError {
    /// Stable reason code for the wire.
    #[must_use]
    pub const fn code(&self) -> &'static str {
        match self {
            Self::AtCapacity { .. } => "at_capacity",
            Self::UserLimit { .. } => "user_limit",
            Self::SandboxExhausted { .. } => "sandbox_exhausted",
            Self::UnknownSession(_) => "unknown_session",
            Self::NotOwner => "not_owner",
            Self::ReconnectExhausted { .. } => "reconnect_exhausted",
            Self::HandshakeFailed => "handshake_failed",
            Self::Session(_) => "session_error",
        }
    }

    /// Retry hint; `None` means the refusal is terminal.
    #[must_use]
    pub const fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::AtCapacity { retry_after }
            | Self::UserLimit { retry_after }
            | Self::SandboxExhausted { retry_after } => Some(*retry_after),
            _ => None,
        }
    }
}

/// Multiplexes client connections onto sessions.
///
/// Holds a handle to the session registry; connections themselves carry
/// only session ids. Admission accounts for sandbox capacity as well as
/// connection counts, so accepted work can actually run.
pub struct ConnectionManager {
    registry: Arc<SessionRegistry>,
    config: ManagerConfig,
    entries: RwLock<HashMap<ConnectionId, Entry>>,
    owners: RwLock<HashMap<SessionId, String>>,
}

impl ConnectionManager {
    #[must_use]
    pub fn new(registry: Arc<SessionRegistry>, config: ManagerConfig) -> Arc<Self> {
        Arc::new(Self {
            registry,
            config,
            entries: RwLock::new(HashMap::new()),
            owners: RwLock::new(HashMap::new()),
        })
    }

    /// The backing registry.
    #[must_use]
    pub const fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    /// Open connections currently tracked.
    pub async fn open_connections(&self) -> usize {
        self.entries
            .read()
            .await
            .values()
            .filter(|e| e.connection.health == HealthState::Open)
            .count()
    }

    /// Snapshot of one connection record.
    pub async fn connection(&self, connection_id: ConnectionId) -> Option<Connection> {
        self.entries.read().await.get(&connection_id).map(|e| e.connection.clone())
    }

    /// Admit a new connection, creating and binding a fresh session.
    ///
    /// # Errors
    /// Rejects with a retry hint when the connection ceiling, the per-user
    /// limit or sandbox capacity is exhausted; never silently drops.
    pub async fn accept(&self, request: ConnectionRequest) -> Result<Attached, ConnectError> {
        self.check_admission(&request.user_id).await?;
        if self.registry.sandbox_pool().available() == 0 {
            return Err(ConnectError::SandboxExhausted { retry_after: self.config.retry_after });
        }

        let session = match self.registry.create(request.task).await {
            Ok(session) => session,
            Err(SessionError::SandboxExhausted) => {
                return Err(ConnectError::SandboxExhausted {
                    retry_after: self.config.retry_after,
                });
            }
            Err(e) => return Err(e.into()),
        };
        self.owners.write().await.insert(session.id(), request.user_id.clone());

        let connection_id = Uuid::new_v4();
        let replay = session.attach(connection_id, AttachMode::Driver, None).await?;
        let connection = self.track(connection_id, request.user_id, session.id()).await;

        tracing::info!(%connection_id, session_id = %session.id(), "connection accepted");
        Ok(Attached { connection, session, replay })
    }

    /// Resume an owned session from `last_event_id`. A reconnect supersedes
    /// any previous transport still bound to the session.
    ///
    /// # Errors
    /// Returns `ReconnectExhausted` past the attempt budget, `NotOwner` for
    /// foreign sessions (audit-logged, no retry), `UnknownSession` when the
    /// id resolves to nothing.
    pub async fn reconnect(
        &self,
        user_id: &str,
        session_id: SessionId,
        last_event_id: Option<EventId>,
        attempt: u32,
    ) -> Result<Attached, ConnectError> {
        if attempt >= MAX_ATTEMPTS {
            return Err(ConnectError::ReconnectExhausted { attempts: attempt });
        }

        match self.owners.read().await.get(&session_id) {
            Some(owner) if owner == user_id => {}
            Some(_) => {
                tracing::warn!(%session_id, user_id, "rejected reconnect: not the session owner");
                return Err(ConnectError::NotOwner);
            }
            None => return Err(ConnectError::UnknownSession(session_id)),
        }

        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or(ConnectError::UnknownSession(session_id))?;

        // Drop the superseded transport, if any, so the driver slot frees.
        let superseded: Vec<ConnectionId> = self
            .entries
            .read()
            .await
            .values()
            .filter(|e| e.connection.bound_session_id == session_id)
            .map(|e| e.connection.connection_id)
            .collect();
        for old_id in superseded {
            session.detach(old_id).await;
            self.entries.write().await.remove(&old_id);
            tracing::debug!(connection_id = %old_id, "superseded by reconnect");
        }

        let connection_id = Uuid::new_v4();
        let replay = session.attach(connection_id, AttachMode::Driver, last_event_id).await?;
        let connection = self.track(connection_id, user_id.to_string(), session_id).await;

        tracing::info!(%connection_id, %session_id, attempt, "reconnected");
        Ok(Attached { connection, session, replay })
    }

    /// Attach a read-only subscriber (e.g. a monitor) to an owned session.
    ///
    /// # Errors
    /// Returns `NotOwner`/`UnknownSession` as for reconnect. Observers do
    /// not count against the connection ceiling.
    pub async fn attach_observer(
        &self,
        user_id: &str,
        session_id: SessionId,
        last_event_id: Option<EventId>,
    ) -> Result<ReplayHandle, ConnectError> {
        match self.owners.read().await.get(&session_id) {
            Some(owner) if owner == user_id => {}
            Some(_) => return Err(ConnectError::NotOwner),
            None => return Err(ConnectError::UnknownSession(session_id)),
        }
        let session = self
            .registry
            .get(session_id)
            .await
            .ok_or(ConnectError::UnknownSession(session_id))?;
        Ok(session.attach(Uuid::new_v4(), AttachMode::Observer, last_event_id).await?)
    }

    /// Record liveness for a connection.
    pub async fn heartbeat(&self, connection_id: ConnectionId) {
        if let Some(entry) = self.entries.write().await.get_mut(&connection_id) {
            entry.last_seen = Instant::now();
        }
    }

    /// The transport closed. The connection enters its grace window and the
    /// bound session stays alive for reconnection.
    pub async fn on_disconnect(&self, connection_id: ConnectionId) {
        let session_id = {
            let mut entries = self.entries.write().await;
            let Some(entry) = entries.get_mut(&connection_id) else {
                return;
            };
            entry.connection.health = HealthState::Grace;
            entry.grace_deadline = Some(Instant::now() + self.config.grace_window);
            entry.connection.bound_session_id
        };

        if let Some(session) = self.registry.get(session_id).await {
            session.detach(connection_id).await;
        }
        tracing::debug!(%connection_id, %session_id, "disconnected, grace window started");
    }

    /// Probe tracked connections: close (into grace) any that failed the
    /// liveness check, and drop records whose grace window lapsed. Returns
    /// `(closed, dropped)`.
    pub async fn health_sweep(&self) -> (usize, usize) {
        let now = Instant::now();
        let (stale, expired): (Vec<ConnectionId>, Vec<ConnectionId>) = {
            let entries = self.entries.read().await;
            let stale = entries
                .values()
                .filter(|e| {
                    e.connection.health == HealthState::Open
                        && now.duration_since(e.last_seen) >= self.config.liveness_timeout
                })
                .map(|e| e.connection.connection_id)
                .collect();
            let expired = entries
                .values()
                .filter(|e| {
                    e.connection.health == HealthState::Grace
                        && e.grace_deadline.is_some_and(|deadline| deadline <= now)
                })
                .map(|e| e.connection.connection_id)
                .collect();
            (stale, expired)
        };

        for connection_id in &stale {
            tracing::info!(%connection_id, "liveness check failed, closing");
            self.on_disconnect(*connection_id).await;
        }
        let dropped = expired.len();
        {
            let mut entries = self.entries.write().await;
            for connection_id in expired {
                entries.remove(&connection_id);
            }
        }
        (stale.len(), dropped)
    }

    /// Run the health sweep on its configured period.
    #[must_use]
    pub fn spawn_health_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let manager = Arc::downgrade(self);
        let period = self.config.health_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let (closed, dropped) = manager.health_sweep().await;
                if closed + dropped > 0 {
                    tracing::debug!(closed, dropped, "health sweep complete");
                }
            }
        })
    }

    async fn check_admission(&self, user_id: &str) -> Result<(), ConnectError> {
        let entries = self.entries.read().await;
        let open = entries
            .values()
            .filter(|e| e.connection.health == HealthState::Open)
            .count();
        if open >= self.config.max_connections {
            return Err(ConnectError::AtCapacity { retry_after: self.config.retry_after });
        }
        let per_user = entries
            .values()
            .filter(|e| {
                e.connection.health == HealthState::Open && e.connection.user_id == user_id
            })
            .count();
        if per_user >= self.config.max_per_user {
            return Err(ConnectError::UserLimit { retry_after: self.config.retry_after });
        }
        Ok(())
    }

    async fn track(
        &self,
        connection_id: ConnectionId,
        user_id: String,
        session_id: SessionId,
    ) -> Connection {
        let connection = Connection {
            connection_id,
            user_id,
            bound_session_id: session_id,
            connected_at: Utc::now(),
            health: HealthState::Open,
        };
        self.entries.write().await.insert(
            connection_id,
            Entry { connection: connection.clone(), last_seen: Instant::now(), grace_deadline: None },
        );
        connection
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::StreamExt;

    use agentd_control::{Decider, Decision, DecisionError, ScriptedDecider, State};
    use agentd_events::{Action, EventId, MemoryEventStore, ObservationKind};
    use agentd_gateway::{
        SandboxProvider, SandboxRequest, SandboxResponse, SandboxTransport, TransportError,
    };
    use agentd_session::{RegistryConfig, SessionConfig};

    use super::*;

    struct EchoTransport;

    #[async_trait]
    impl SandboxTransport for EchoTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn execute_action(
            &self,
            request: SandboxRequest,
        ) -> Result<SandboxResponse, TransportError> {
            let observation = match request.action {
                Action::RunCommand { command, .. } => ObservationKind::CommandOutput {
                    output: "ok\n".to_string(),
                    command,
                    exit_code: Some(0),
                    error: false,
                    timeout: false,
                },
                other => {
                    ObservationKind::Error { message: format!("unexpected {}", other.kind_name()) }
                }
            };
            Ok(SandboxResponse { observation })
        }
    }

    struct EchoProvider;

    #[async_trait]
    impl SandboxProvider for EchoProvider {
        async fn provision(
            &self,
            _session_id: SessionId,
        ) -> Result<Arc<dyn SandboxTransport>, TransportError> {
            Ok(Arc::new(EchoTransport))
        }
    }

    /// Parks sessions in `decide` so they stay running through the test.
    struct IdleDecider;

    #[async_trait]
    impl Decider for IdleDecider {
        async fn decide(&self, _state: &State) -> Result<Decision, DecisionError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Decision::free(Action::Finish { outcome: None }))
        }
    }

    fn idle_registry(sandbox_capacity: usize) -> Arc<SessionRegistry> {
        SessionRegistry::new(
            Arc::new(MemoryEventStore::new()),
            Arc::new(EchoProvider),
            Arc::new(IdleDecider),
            None,
            SessionConfig {
                controller: agentd_control::ControllerConfig {
                    decide_timeout: Duration::from_secs(7200),
                    ..Default::default()
                },
                ..Default::default()
            },
            RegistryConfig { sandbox_capacity, ..Default::default() },
        )
    }

    fn scripted_registry(commands: usize) -> Arc<SessionRegistry> {
        let decisions: Vec<Decision> = (0..commands)
            .map(|i| {
                Decision::free(Action::RunCommand {
                    command: format!("echo {i}"),
                    timeout_secs: None,
                })
            })
            .collect();
        SessionRegistry::new(
            Arc::new(MemoryEventStore::new()),
            Arc::new(EchoProvider),
            Arc::new(ScriptedDecider::new(decisions)),
            None,
            SessionConfig::default(),
            RegistryConfig::default(),
        )
    }

    fn request(user: &str) -> ConnectionRequest {
        ConnectionRequest { user_id: user.to_string(), task: TaskSpec::new("task") }
    }

    #[tokio::test]
    async fn ceiling_rejects_with_retry_hint() {
        let manager = ConnectionManager::new(
            idle_registry(8),
            ManagerConfig { max_connections: 2, ..Default::default() },
        );

        manager.accept(request("a")).await.unwrap();
        manager.accept(request("b")).await.unwrap();
        assert_eq!(manager.open_connections().await, 2);

        let err = manager.accept(request("c")).await.unwrap_err();
        assert!(matches!(err, ConnectError::AtCapacity { .. }));
        assert_eq!(err.code(), "at_capacity");
        assert!(err.retry_after().is_some(), "shed connections get a hint, not a drop");
        manager.registry().shutdown().await;
    }

    #[tokio::test]
    async fn per_user_limit_applies() {
        let manager = ConnectionManager::new(
            idle_registry(8),
            ManagerConfig { max_per_user: 1, ..Default::default() },
        );

        manager.accept(request("alice")).await.unwrap();
        let err = manager.accept(request("alice")).await.unwrap_err();
        assert!(matches!(err, ConnectError::UserLimit { .. }));

        // A different user is unaffected.
        manager.accept(request("bob")).await.unwrap();
        manager.registry().shutdown().await;
    }

    #[tokio::test]
    async fn sandbox_capacity_gates_admission() {
        let manager = ConnectionManager::new(idle_registry(1), ManagerConfig::default());

        manager.accept(request("a")).await.unwrap();
        let err = manager.accept(request("b")).await.unwrap_err();
        assert!(matches!(err, ConnectError::SandboxExhausted { .. }));
        assert!(err.retry_after().is_some());
        manager.registry().shutdown().await;
    }

    #[tokio::test]
    async fn disconnect_keeps_the_session_alive_for_reconnect() {
        let manager = ConnectionManager::new(scripted_registry(2), ManagerConfig::default());

        let attached = manager.accept(request("alice")).await.unwrap();
        let session_id = attached.session.id();
        attached.session.wait_terminal().await;
        let total = attached.session.export_events(0, None).await.unwrap().len() as EventId;

        // Read a prefix, then lose the transport.
        let seen: Vec<EventId> =
            attached.replay.events.take(3).map(|e| e.id).collect().await;
        let last_seen = *seen.last().unwrap();
        manager.on_disconnect(attached.connection.connection_id).await;

        assert!(manager.registry().get(session_id).await.is_some(), "session survives");

        let resumed = manager
            .reconnect("alice", session_id, Some(last_seen), 1)
            .await
            .unwrap();
        let rest: Vec<EventId> = resumed
            .replay
            .events
            .take((total - last_seen - 1) as usize)
            .map(|e| e.id)
            .collect()
            .await;

        // No event <= last_seen re-delivered, none above it skipped.
        assert_eq!(rest, ((last_seen + 1)..total).collect::<Vec<_>>());
        manager.registry().shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_validates_ownership() {
        let manager = ConnectionManager::new(idle_registry(8), ManagerConfig::default());
        let attached = manager.accept(request("alice")).await.unwrap();
        let session_id = attached.session.id();

        let err = manager.reconnect("mallory", session_id, None, 0).await.unwrap_err();
        assert!(matches!(err, ConnectError::NotOwner));
        assert!(err.retry_after().is_none(), "authorization failures are terminal");

        let err = manager.reconnect("alice", Uuid::new_v4(), None, 0).await.unwrap_err();
        assert!(matches!(err, ConnectError::UnknownSession(_)));
        manager.registry().shutdown().await;
    }

    #[tokio::test]
    async fn reconnect_budget_is_terminal_at_ten() {
        let manager = ConnectionManager::new(idle_registry(8), ManagerConfig::default());
        let attached = manager.accept(request("alice")).await.unwrap();

        let err = manager
            .reconnect("alice", attached.session.id(), None, MAX_ATTEMPTS)
            .await
            .unwrap_err();
        assert!(matches!(err, ConnectError::ReconnectExhausted { attempts: 10 }));
        assert_eq!(err.code(), "reconnect_exhausted");
        assert!(err.retry_after().is_none());
        manager.registry().shutdown().await;
    }

    #[tokio::test]
    async fn health_sweep_closes_stale_then_drops_after_grace() {
        let manager = ConnectionManager::new(
            idle_registry(8),
            ManagerConfig {
                liveness_timeout: Duration::from_millis(20),
                grace_window: Duration::from_millis(20),
                ..Default::default()
            },
        );

        let attached = manager.accept(request("alice")).await.unwrap();
        let connection_id = attached.connection.connection_id;

        tokio::time::sleep(Duration::from_millis(40)).await;
        let (closed, dropped) = manager.health_sweep().await;
        assert_eq!((closed, dropped), (1, 0));
        assert_eq!(
            manager.connection(connection_id).await.unwrap().health,
            HealthState::Grace
        );

        tokio::time::sleep(Duration::from_millis(40)).await;
        let (closed, dropped) = manager.health_sweep().await;
        assert_eq!((closed, dropped), (0, 1));
        assert!(manager.connection(connection_id).await.is_none());

        // The session itself is untouched by connection cleanup.
        assert!(manager.registry().get(attached.session.id()).await.is_some());
        manager.registry().shutdown().await;
    }

    #[tokio::test]
    async fn heartbeat_defers_the_liveness_check() {
        let manager = ConnectionManager::new(
            idle_registry(8),
            ManagerConfig { liveness_timeout: Duration::from_millis(50), ..Default::default() },
        );

        let attached = manager.accept(request("alice")).await.unwrap();
        for _ in 0..3 {
            tokio::time::sleep(Duration::from_millis(20)).await;
            manager.heartbeat(attached.connection.connection_id).await;
        }
        let (closed, _) = manager.health_sweep().await;
        assert_eq!(closed, 0, "a heartbeating connection must not be closed");
        manager.registry().shutdown().await;
    }

    #[tokio::test]
    async fn observers_do_not_consume_admission_slots() {
        let manager = ConnectionManager::new(
            idle_registry(8),
            ManagerConfig { max_connections: 1, ..Default::default() },
        );
        let attached = manager.accept(request("alice")).await.unwrap();

        // Ceiling is reached, observers still attach.
        manager
            .attach_observer("alice", attached.session.id(), None)
            .await
            .unwrap();
        let err = manager.accept(request("bob")).await.unwrap_err();
        assert!(matches!(err, ConnectError::AtCapacity { .. }));
        manager.registry().shutdown().await;
    }
}
