//! One session: an event log, a control loop and a gateway under one owner.

use std::{
    collections::HashMap,
    fmt,
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicI64, AtomicU32, Ordering},
    },
    time::Duration,
};

use chrono::{DateTime, Utc};
use futures::stream::BoxStream;
use thiserror::Error;
use tokio::sync::Mutex;

use agentd_control::{
    ControlError, Controller, ControllerConfig, ControllerHandle, Decider, LoopPolicy,
};
use agentd_events::{
    AgentStatus, ConnectionId, Event, EventId, EventLog, EventLogError, EventPayload, EventSource,
    EventStore, Observation, ObservationKind, SessionId,
};
use agentd_gateway::{
    ExecutionGateway, GatewayConfig, SandboxLease, SandboxTransport, TransportError,
};

/// What a session is asked to do.
#[derive(Debug, Clone, Default)]
pub struct TaskSpec {
    /// The user's opening intent; becomes the first event.
    pub intent: String,
    /// Secret values masked out of every persisted and delivered event.
    pub secrets: HashMap<String, String>,
}

impl TaskSpec {
    /// Task with just an intent.
    #[must_use]
    pub fn new(intent: impl Into<String>) -> Self {
        Self { intent: intent.into(), secrets: HashMap::new() }
    }
}

/// Per-session configuration.
#[derive(Debug, Clone, Default)]
pub struct SessionConfig {
    pub controller: ControllerConfig,
    pub gateway: GatewayConfig,
}

/// How a connection attaches to a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AttachMode {
    /// Exactly one driver at a time may send control operations.
    Driver,
    /// Read-only subscribers; any number may attach concurrently.
    Observer,
}

/// Replay stream handed to an attaching connection. Delivery starts at the
/// caller's `last_event_id + 1` with no gap and no duplicate.
pub struct ReplayHandle {
    pub session_id: SessionId,
    pub connection_id: ConnectionId,
    pub mode: AttachMode,
    pub events: BoxStream<'static, Event>,
}

impl fmt::Debug for ReplayHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReplayHandle")
            .field("session_id", &self.session_id)
            .field("connection_id", &self.connection_id)
            .field("mode", &self.mode)
            .field("events", &"<stream>")
            .finish()
    }
}

/// Session error.
#[derive(Debug, Error)]
pub enum SessionError {
    #[error("session is terminated")]
    Terminated,
    #[error("another driver connection is already attached")]
    DriverAttached,
    #[error("no sandbox capacity available")]
    SandboxExhausted,
    #[error(transparent)]
    EventLog(#[from] EventLogError),
    #[error(transparent)]
    Control(#[from] ControlError),
    #[error(transparent)]
    Transport(#[from] TransportError),
}

/// One logical task/conversation.
///
/// The session exclusively owns its event log, control loop and sandbox
/// lease; none are shared across sessions. Connections refer to sessions by
/// id through the registry, so closing a connection never destroys the
/// session and reconnection can resume it.
pub struct Session {
    session_id: SessionId,
    created_at: DateTime<Utc>,
    log: Arc<EventLog>,
    controller: ControllerHandle,
    lease: Mutex<Option<SandboxLease>>,
    driver: Mutex<Option<ConnectionId>>,
    last_activity_ms: AtomicI64,
    reconnection_count: AtomicU32,
    error_count: AtomicU32,
    stopped: AtomicBool,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("session_id", &self.session_id)
            .field("created_at", &self.created_at)
            .field("reconnection_count", &self.reconnection_count.load(Ordering::SeqCst))
            .field("error_count", &self.error_count.load(Ordering::SeqCst))
            .field("stopped", &self.stopped.load(Ordering::SeqCst))
            .finish_non_exhaustive()
    }
}

impl Session {
    /// Create the session and start its control loop.
    ///
    /// Appends the initial user-intent event before the loop starts, so it
    /// is always event 0 of the session.
    ///
    /// # Errors
    /// Returns error if the log cannot be opened or the intent cannot be
    /// appended.
    pub async fn spawn(
        session_id: SessionId,
        task: TaskSpec,
        store: Arc<dyn EventStore>,
        transport: Arc<dyn SandboxTransport>,
        decider: Arc<dyn Decider>,
        policy: Option<Arc<dyn LoopPolicy>>,
        config: SessionConfig,
        lease: Option<SandboxLease>,
    ) -> Result<Arc<Self>, SessionError> {
        let log = Arc::new(EventLog::open(session_id, store).await?);
        if !task.secrets.is_empty() {
            log.set_secrets(task.secrets).await;
        }
        log.append(
            EventSource::User,
            EventPayload::Observation(Observation::external(ObservationKind::UserMessage {
                content: task.intent,
            })),
        )
        .await?;

        let gateway = Arc::new(ExecutionGateway::new(transport, config.gateway));
        let controller =
            Controller::spawn(Arc::clone(&log), gateway, decider, policy, config.controller);

        tracing::info!(%session_id, "session started");
        Ok(Arc::new(Self {
            session_id,
            created_at: Utc::now(),
            log,
            controller,
            lease: Mutex::new(lease),
            driver: Mutex::new(None),
            last_activity_ms: AtomicI64::new(Utc::now().timestamp_millis()),
            reconnection_count: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            stopped: AtomicBool::new(false),
        }))
    }

    #[must_use]
    pub const fn id(&self) -> SessionId {
        self.session_id
    }

    #[must_use]
    pub const fn created_at(&self) -> DateTime<Utc> {
        self.created_at
    }

    #[must_use]
    pub fn status(&self) -> AgentStatus {
        self.controller.status()
    }

    /// Driver re-attaches honored so far.
    #[must_use]
    pub fn reconnection_count(&self) -> u32 {
        self.reconnection_count.load(Ordering::SeqCst)
    }

    /// Failures observed against this session.
    #[must_use]
    pub fn error_count(&self) -> u32 {
        self.error_count.load(Ordering::SeqCst)
    }

    /// Record a failure against this session.
    pub fn note_error(&self) {
        self.error_count.fetch_add(1, Ordering::SeqCst);
    }

    /// The controller's execution token, for instrumentation.
    #[must_use]
    pub fn step_token(&self) -> Arc<agentd_control::StepToken> {
        self.controller.step_token()
    }

    /// Attach a connection, replaying from `last_event_id + 1` (or from the
    /// beginning when the caller has none). Idempotent with respect to
    /// event loss: the same `last_event_id` always yields the same stream.
    ///
    /// # Errors
    /// Returns `Terminated` for driver attaches to a stopped session,
    /// `DriverAttached` when another driver holds the session, or the log
    /// error if history cannot be read.
    pub async fn attach(
        &self,
        connection_id: ConnectionId,
        mode: AttachMode,
        last_event_id: Option<EventId>,
    ) -> Result<ReplayHandle, SessionError> {
        if mode == AttachMode::Driver {
            if self.stopped.load(Ordering::SeqCst) {
                return Err(SessionError::Terminated);
            }
            let mut driver = self.driver.lock().await;
            match *driver {
                Some(existing) if existing != connection_id => {
                    return Err(SessionError::DriverAttached);
                }
                _ => *driver = Some(connection_id),
            }
            if last_event_id.is_some() {
                self.reconnection_count.fetch_add(1, Ordering::SeqCst);
            }
        }

        let from = last_event_id.map_or(0, |id| id + 1);
        let events = self.log.subscribe(from).await?;
        self.touch();

        tracing::debug!(session_id = %self.session_id, %connection_id, ?mode, from, "attached");
        Ok(ReplayHandle { session_id: self.session_id, connection_id, mode, events })
    }

    /// Detach a connection. Releases the driver slot when it held one; the
    /// session itself stays alive for reconnection.
    pub async fn detach(&self, connection_id: ConnectionId) {
        let mut driver = self.driver.lock().await;
        if *driver == Some(connection_id) {
            *driver = None;
        }
        drop(driver);
        self.touch();
        tracing::debug!(session_id = %self.session_id, %connection_id, "detached");
    }

    /// Pause the control loop.
    ///
    /// # Errors
    /// Returns error if the loop already exited.
    pub fn pause(&self) -> Result<(), SessionError> {
        self.touch();
        Ok(self.controller.pause()?)
    }

    /// Resume a paused control loop.
    ///
    /// # Errors
    /// Returns error if the loop already exited.
    pub fn resume(&self) -> Result<(), SessionError> {
        self.touch();
        Ok(self.controller.resume()?)
    }

    /// Approve or reject the action awaiting confirmation.
    ///
    /// # Errors
    /// Returns error if the loop already exited.
    pub fn confirm(&self, approve: bool) -> Result<(), SessionError> {
        self.touch();
        Ok(self.controller.confirm(approve)?)
    }

    /// Inject a user message.
    ///
    /// # Errors
    /// Returns error if the loop already exited.
    pub fn post_user_message(&self, content: impl Into<String>) -> Result<(), SessionError> {
        self.touch();
        Ok(self.controller.post_user_message(content)?)
    }

    /// Wait until the control loop reaches a terminal status.
    pub async fn wait_terminal(&self) -> AgentStatus {
        self.controller.wait_terminal().await
    }

    /// Tear down the control loop and release the sandbox lease. Safe to
    /// call at any point in the step cycle; idempotent. The event log
    /// remains readable for export and audit.
    pub async fn stop(&self) {
        if self.stopped.swap(true, Ordering::SeqCst) {
            return;
        }
        self.controller.stop().await;
        self.lease.lock().await.take();
        tracing::info!(session_id = %self.session_id, "session stopped");
    }

    /// Finite slice of the log for replay or audit, `from..=to` by id.
    /// Available after `stop()`.
    ///
    /// # Errors
    /// Returns error if the store cannot be read.
    pub async fn export_events(
        &self,
        from: EventId,
        to: Option<EventId>,
    ) -> Result<Vec<Event>, SessionError> {
        Ok(self.log.read_range(from, to).await?)
    }

    /// Highest appended event id.
    pub async fn last_event_id(&self) -> Option<EventId> {
        self.log.last_id().await
    }

    /// Whether the session has no driver and no activity inside `window`.
    pub async fn is_idle(&self, window: Duration) -> bool {
        if self.driver.lock().await.is_some() {
            return false;
        }
        let last = self.last_activity_ms.load(Ordering::SeqCst);
        let idle_ms = Utc::now().timestamp_millis().saturating_sub(last);
        idle_ms >= window.as_millis() as i64
    }

    fn touch(&self) {
        self.last_activity_ms.store(Utc::now().timestamp_millis(), Ordering::SeqCst);
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use futures::StreamExt;
    use uuid::Uuid;

    use agentd_control::{Decision, ScriptedDecider};
    use agentd_events::{Action, MemoryEventStore};
    use agentd_gateway::{SandboxRequest, SandboxResponse, SandboxTransport};

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
                    output: "hi\n".to_string(),
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

    async fn spawn_session(decisions: Vec<Decision>) -> Arc<Session> {
        Session::spawn(
            Uuid::new_v4(),
            TaskSpec::new("say hi"),
            Arc::new(MemoryEventStore::new()),
            Arc::new(EchoTransport),
            Arc::new(ScriptedDecider::new(decisions)),
            None,
            SessionConfig::default(),
            None,
        )
        .await
        .unwrap()
    }

    fn echo_decision() -> Decision {
        Decision::free(Action::RunCommand { command: "echo hi".to_string(), timeout_secs: None })
    }

    #[tokio::test]
    async fn intent_is_event_zero() {
        let session = spawn_session(vec![]).await;
        session.wait_terminal().await;

        let events = session.export_events(0, None).await.unwrap();
        match &events[0].payload {
            EventPayload::Observation(Observation {
                kind: ObservationKind::UserMessage { content },
                ..
            }) => assert_eq!(content, "say hi"),
            other => panic!("expected user intent first, got {other:?}"),
        }
        assert_eq!(events[0].id, 0);
    }

    #[tokio::test]
    async fn attach_resumes_exactly_after_last_event_id() {
        let session = spawn_session(vec![echo_decision()]).await;
        session.wait_terminal().await;

        let all = session.export_events(0, None).await.unwrap();
        assert!(all.len() > 3);
        let n = 2;

        let handle = session
            .attach(Uuid::new_v4(), AttachMode::Observer, Some(n))
            .await
            .unwrap();
        let replayed: Vec<EventId> =
            handle.events.take(all.len() - (n as usize + 1)).map(|e| e.id).collect().await;

        // No event <= n re-delivered, no event > n skipped.
        assert_eq!(replayed, ((n + 1)..all.len() as u64).collect::<Vec<_>>());
    }

    #[tokio::test]
    async fn attach_is_idempotent_for_sequential_connections() {
        let session = spawn_session(vec![echo_decision()]).await;
        session.wait_terminal().await;
        let total = session.export_events(0, None).await.unwrap().len();

        let first_conn = Uuid::new_v4();
        let first = session
            .attach(first_conn, AttachMode::Driver, Some(1))
            .await
            .unwrap();
        let first_ids: Vec<EventId> =
            first.events.take(total - 2).map(|e| e.id).collect().await;
        session.detach(first_conn).await;

        let second_conn = Uuid::new_v4();
        let second = session
            .attach(second_conn, AttachMode::Driver, Some(1))
            .await
            .unwrap();
        let second_ids: Vec<EventId> =
            second.events.take(total - 2).map(|e| e.id).collect().await;

        assert_eq!(first_ids, second_ids);
    }

    #[tokio::test]
    async fn one_driver_at_a_time_but_many_observers() {
        let session = spawn_session(vec![]).await;

        let driver = Uuid::new_v4();
        session.attach(driver, AttachMode::Driver, None).await.unwrap();

        let err = session
            .attach(Uuid::new_v4(), AttachMode::Driver, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::DriverAttached));

        // Observers are unconstrained.
        session.attach(Uuid::new_v4(), AttachMode::Observer, None).await.unwrap();
        session.attach(Uuid::new_v4(), AttachMode::Observer, None).await.unwrap();

        // Releasing the driver slot admits a new driver.
        session.detach(driver).await;
        session.attach(Uuid::new_v4(), AttachMode::Driver, None).await.unwrap();
    }

    #[tokio::test]
    async fn log_remains_readable_after_stop() {
        let session = spawn_session(vec![echo_decision()]).await;
        session.wait_terminal().await;
        session.stop().await;

        let events = session.export_events(0, None).await.unwrap();
        assert!(!events.is_empty());

        // Driver attach is refused, observer replay still works.
        let err = session
            .attach(Uuid::new_v4(), AttachMode::Driver, None)
            .await
            .unwrap_err();
        assert!(matches!(err, SessionError::Terminated));
        session.attach(Uuid::new_v4(), AttachMode::Observer, None).await.unwrap();
    }

    #[tokio::test]
    async fn stop_is_idempotent_and_safe_mid_cycle() {
        let session = spawn_session((0..50).map(|_| echo_decision()).collect()).await;
        session.stop().await;
        session.stop().await;
        assert_eq!(session.step_token().in_flight(), 0);
    }

    #[tokio::test]
    async fn idle_detection_requires_no_driver() {
        let session = spawn_session(vec![]).await;
        assert!(!session.is_idle(Duration::from_secs(3600)).await);

        let driver = Uuid::new_v4();
        session.attach(driver, AttachMode::Driver, None).await.unwrap();
        assert!(!session.is_idle(Duration::ZERO).await, "driver attached");

        session.detach(driver).await;
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert!(session.is_idle(Duration::from_millis(1)).await);
    }

    #[tokio::test]
    async fn echo_hi_end_to_end_through_a_real_sandbox() {
        use agentd_gateway::{LocalSandbox, LocalSandboxConfig};

        let dir = tempfile::tempdir().unwrap();
        let session = Session::spawn(
            Uuid::new_v4(),
            TaskSpec::new("print a greeting"),
            Arc::new(MemoryEventStore::new()),
            Arc::new(LocalSandbox::new(LocalSandboxConfig::new(dir.path()))),
            Arc::new(ScriptedDecider::new(vec![echo_decision()])),
            None,
            SessionConfig::default(),
            None,
        )
        .await
        .unwrap();

        assert_eq!(session.wait_terminal().await, AgentStatus::Finished);

        let events = session.export_events(0, None).await.unwrap();
        let output = events.iter().find_map(|e| match e.observation().map(|o| &o.kind) {
            Some(ObservationKind::CommandOutput { output, error, .. }) => {
                Some((output.clone(), *error))
            }
            _ => None,
        });
        let (output, error) = output.expect("command observation missing");
        assert_eq!(output, "hi\n");
        assert!(!error);
    }

    #[tokio::test]
    async fn sandbox_timeout_is_recorded_and_the_loop_continues() {
        use agentd_gateway::{LocalSandbox, LocalSandboxConfig};

        let dir = tempfile::tempdir().unwrap();
        let decisions = vec![
            Decision::free(Action::RunCommand {
                command: "sleep 5".to_string(),
                timeout_secs: Some(1),
            }),
            echo_decision(),
        ];
        let session = Session::spawn(
            Uuid::new_v4(),
            TaskSpec::new("slow then fast"),
            Arc::new(MemoryEventStore::new()),
            Arc::new(LocalSandbox::new(LocalSandboxConfig::new(dir.path()))),
            Arc::new(ScriptedDecider::new(decisions)),
            None,
            SessionConfig::default(),
            None,
        )
        .await
        .unwrap();

        // The timeout is data: the loop reaches the next decide and finishes.
        assert_eq!(session.wait_terminal().await, AgentStatus::Finished);

        let events = session.export_events(0, None).await.unwrap();
        let outputs: Vec<(bool, bool)> = events
            .iter()
            .filter_map(|e| match e.observation().map(|o| &o.kind) {
                Some(ObservationKind::CommandOutput { error, timeout, .. }) => {
                    Some((*error, *timeout))
                }
                _ => None,
            })
            .collect();
        assert_eq!(outputs, vec![(true, true), (false, false)]);
    }

    #[tokio::test]
    async fn reconnection_count_tracks_resumes() {
        let session = spawn_session(vec![]).await;
        let conn = Uuid::new_v4();

        session.attach(conn, AttachMode::Driver, None).await.unwrap();
        assert_eq!(session.reconnection_count(), 0);
        session.detach(conn).await;

        let conn2 = Uuid::new_v4();
        session.attach(conn2, AttachMode::Driver, Some(0)).await.unwrap();
        assert_eq!(session.reconnection_count(), 1);
    }
}
