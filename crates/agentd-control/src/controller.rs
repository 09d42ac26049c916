//! Per-session control loop: an explicit task driven by message-passing.

use std::sync::{
    Arc,
    atomic::{AtomicU32, Ordering},
};
use std::time::Duration;

use thiserror::Error;
use tokio::sync::{Semaphore, mpsc, watch};

use agentd_events::{
    Action, AgentStatus, EventLog, EventLogError, EventPayload, EventSource, Observation,
    ObservationKind,
};
use agentd_gateway::{ExecutionGateway, GatewayError};

use crate::decider::{Decider, Decision, DecisionError};
use crate::policy::{LoopPolicy, PolicyVerdict};
use crate::state::State;

/// Control loop configuration.
#[derive(Debug, Clone)]
pub struct ControllerConfig {
    /// Iteration ceiling; reaching it is a hard stop to `Stuck`.
    pub max_iterations: u32,
    /// Accumulated-cost ceiling; reaching it is a hard stop to `Stuck`.
    pub max_budget: Option<f64>,
    /// Timeout for one decision collaborator call.
    pub decide_timeout: Duration,
    /// Default timeout for one gateway dispatch.
    pub dispatch_timeout: Duration,
    /// Decision retries before escalating to `Error`.
    pub decider_retries: u32,
    /// Initial decision retry delay; doubles per attempt.
    pub decider_retry_delay: Duration,
    /// Gate executable actions behind an explicit confirmation.
    pub confirm_actions: bool,
}

impl Default for ControllerConfig {
    fn default() -> Self {
        Self {
            max_iterations: 100,
            max_budget: None,
            decide_timeout: Duration::from_secs(120),
            dispatch_timeout: Duration::from_secs(30),
            decider_retries: 3,
            decider_retry_delay: Duration::from_millis(500),
            confirm_actions: false,
        }
    }
}

/// Signals accepted by a running control loop.
#[derive(Debug)]
pub enum ControlSignal {
    Pause,
    Resume,
    Stop,
    /// Approve or reject the action awaiting confirmation.
    Confirm { approve: bool },
    /// Inject a user message; cancels an in-flight decide so the next
    /// decision sees it.
    UserMessage { content: String },
}

/// Control error.
#[derive(Debug, Error)]
pub enum ControlError {
    #[error("control loop has exited")]
    LoopClosed,
}

/// Per-session execution token. At most one step is in flight at a time;
/// the gauge records the high-water mark so tests can verify the invariant
/// under concurrent pause/resume/stop traffic.
pub struct StepToken {
    permits: Semaphore,
    in_flight: AtomicU32,
    max_in_flight: AtomicU32,
}

impl StepToken {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            permits: Semaphore::new(1),
            in_flight: AtomicU32::new(0),
            max_in_flight: AtomicU32::new(0),
        })
    }

    async fn acquire(self: &Arc<Self>) -> Option<StepGuard> {
        let permit = self.permits.acquire().await.ok()?;
        permit.forget();
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        Some(StepGuard { token: Arc::clone(self) })
    }

    /// Steps currently in flight.
    #[must_use]
    pub fn in_flight(&self) -> u32 {
        self.in_flight.load(Ordering::SeqCst)
    }

    /// Highest concurrent step count ever observed. Anything above 1 is a
    /// broken invariant.
    #[must_use]
    pub fn max_in_flight(&self) -> u32 {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

/// Released on drop, including on error paths and abrupt stops.
struct StepGuard {
    token: Arc<StepToken>,
}

impl Drop for StepGuard {
    fn drop(&mut self) {
        self.token.in_flight.fetch_sub(1, Ordering::SeqCst);
        self.token.permits.add_permits(1);
    }
}

/// Handle to a spawned control loop.
pub struct ControllerHandle {
    signal_tx: mpsc::UnboundedSender<ControlSignal>,
    status_rx: watch::Receiver<AgentStatus>,
    token: Arc<StepToken>,
    join: tokio::sync::Mutex<Option<tokio::task::JoinHandle<()>>>,
}

impl ControllerHandle {
    /// Current status.
    #[must_use]
    pub fn status(&self) -> AgentStatus {
        *self.status_rx.borrow()
    }

    /// The execution token, exposed for instrumentation.
    #[must_use]
    pub fn step_token(&self) -> Arc<StepToken> {
        Arc::clone(&self.token)
    }

    /// Request a pause; the in-flight dispatch completes, no new step begins.
    ///
    /// # Errors
    /// Returns `LoopClosed` if the loop already exited.
    pub fn pause(&self) -> Result<(), ControlError> {
        self.send(ControlSignal::Pause)
    }

    /// Resume from pause, re-entering build-context with the latest state.
    ///
    /// # Errors
    /// Returns `LoopClosed` if the loop already exited.
    pub fn resume(&self) -> Result<(), ControlError> {
        self.send(ControlSignal::Resume)
    }

    /// Approve or reject the action awaiting confirmation.
    ///
    /// # Errors
    /// Returns `LoopClosed` if the loop already exited.
    pub fn confirm(&self, approve: bool) -> Result<(), ControlError> {
        self.send(ControlSignal::Confirm { approve })
    }

    /// Inject a user message into the session.
    ///
    /// # Errors
    /// Returns `LoopClosed` if the loop already exited.
    pub fn post_user_message(&self, content: impl Into<String>) -> Result<(), ControlError> {
        self.send(ControlSignal::UserMessage { content: content.into() })
    }

    /// Stop the loop and wait for it to exit. Safe to call at any point in
    /// the step cycle; idempotent.
    pub async fn stop(&self) {
        let _ = self.send(ControlSignal::Stop);
        let handle = self.join.lock().await.take();
        if let Some(handle) = handle {
            if let Err(e) = handle.await {
                tracing::warn!("control loop join failed: {e}");
            }
        }
    }

    /// Wait until the loop reaches a terminal status.
    pub async fn wait_terminal(&self) -> AgentStatus {
        let mut rx = self.status_rx.clone();
        loop {
            let status = *rx.borrow_and_update();
            if status.is_terminal() {
                return status;
            }
            if rx.changed().await.is_err() {
                return *rx.borrow();
            }
        }
    }

    fn send(&self, signal: ControlSignal) -> Result<(), ControlError> {
        self.signal_tx.send(signal).map_err(|_| ControlError::LoopClosed)
    }
}

enum Flow {
    Continue,
    Stop,
}

enum StepOutcome {
    Continue,
    Stop,
    Finished,
    DeciderFailed(DecisionError),
    LogFailed(EventLogError),
}

enum Gate {
    Approved,
    Rejected,
    Stop,
}

/// The per-session control loop task.
pub struct Controller {
    log: Arc<EventLog>,
    gateway: Arc<ExecutionGateway>,
    decider: Arc<dyn Decider>,
    policy: Option<Arc<dyn LoopPolicy>>,
    config: ControllerConfig,
    signal_rx: mpsc::UnboundedReceiver<ControlSignal>,
    status_tx: watch::Sender<AgentStatus>,
    status: AgentStatus,
    token: Arc<StepToken>,
}

impl Controller {
    /// Spawn the control loop over an event log and gateway. The loop runs
    /// until it reaches a terminal status or is stopped through the handle.
    #[must_use]
    pub fn spawn(
        log: Arc<EventLog>,
        gateway: Arc<ExecutionGateway>,
        decider: Arc<dyn Decider>,
        policy: Option<Arc<dyn LoopPolicy>>,
        config: ControllerConfig,
    ) -> ControllerHandle {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(AgentStatus::Idle);
        let token = StepToken::new();

        let controller = Self {
            log,
            gateway,
            decider,
            policy,
            config,
            signal_rx,
            status_tx,
            status: AgentStatus::Idle,
            token: Arc::clone(&token),
        };
        let join = tokio::spawn(controller.run());

        ControllerHandle {
            signal_tx,
            status_rx,
            token,
            join: tokio::sync::Mutex::new(Some(join)),
        }
    }

    async fn run(mut self) {
        let session_id = self.log.session_id();
        if let Err(e) = self.transition(AgentStatus::Running).await {
            tracing::error!(%session_id, "failed to start control loop: {e}");
            let _ = self.status_tx.send(AgentStatus::Error);
            return;
        }

        let mut state = State::new();

        loop {
            // Pending signals beat the next step.
            loop {
                match self.signal_rx.try_recv() {
                    Ok(signal) => {
                        if matches!(self.handle_signal(signal).await, Flow::Stop) {
                            self.finish_stopped().await;
                            return;
                        }
                    }
                    Err(mpsc::error::TryRecvError::Empty) => break,
                    Err(mpsc::error::TryRecvError::Disconnected) => {
                        self.finish_stopped().await;
                        return;
                    }
                }
            }

            if self.status.is_terminal() {
                break;
            }
            if self.status == AgentStatus::Paused {
                // Parked; only a signal can move us.
                let Some(signal) = self.signal_rx.recv().await else {
                    self.finish_stopped().await;
                    return;
                };
                if matches!(self.handle_signal(signal).await, Flow::Stop) {
                    self.finish_stopped().await;
                    return;
                }
                continue;
            }

            // Resource ceilings and policy run between iterations; both are
            // deterministic hard stops, never silently retried.
            if state.iteration_count >= self.config.max_iterations {
                self.transition_stuck(format!(
                    "iteration ceiling of {} reached",
                    self.config.max_iterations
                ))
                .await;
                continue;
            }
            if let Some(budget) = self.config.max_budget {
                if state.accumulated_cost >= budget {
                    self.transition_stuck(format!("cost budget of {budget} exhausted")).await;
                    continue;
                }
            }
            if let Some(policy) = self.policy.clone() {
                if let PolicyVerdict::Stuck { reason } = policy.inspect(&state) {
                    self.transition_stuck(reason).await;
                    continue;
                }
            }

            let Some(_step) = self.token.acquire().await else {
                break;
            };
            let outcome = self.step(&mut state).await;
            // _step drops here: the token is released on every path.

            match outcome {
                StepOutcome::Continue => {}
                StepOutcome::Stop => {
                    self.finish_stopped().await;
                    return;
                }
                StepOutcome::Finished => {
                    if let Err(e) = self.transition(AgentStatus::Finished).await {
                        tracing::error!(%session_id, "failed to record finish: {e}");
                    }
                }
                StepOutcome::DeciderFailed(e) => {
                    tracing::error!(%session_id, "decision collaborator failed: {e}");
                    let observation = Observation::external(ObservationKind::Error {
                        message: format!("decision failed: {e}"),
                    });
                    if let Err(e) = self
                        .log
                        .append(EventSource::Environment, EventPayload::Observation(observation))
                        .await
                    {
                        tracing::error!(%session_id, "failed to record decision error: {e}");
                    }
                    if let Err(e) = self.transition(AgentStatus::Error).await {
                        tracing::error!(%session_id, "failed to record error status: {e}");
                    }
                }
                StepOutcome::LogFailed(e) => {
                    tracing::error!(%session_id, "event log failure, stopping loop: {e}");
                    self.status = AgentStatus::Error;
                    let _ = self.status_tx.send(AgentStatus::Error);
                    break;
                }
            }
        }
    }

    /// One step: build-context, decide, emit, dispatch, observe. Runs with
    /// the execution token held; phases never overlap for a session.
    async fn step(&mut self, state: &mut State) -> StepOutcome {
        if let Err(e) = self.catch_up(state).await {
            return StepOutcome::LogFailed(e);
        }

        // Decide is the only long-blocking collaborator call and therefore
        // the cancellation point: a signal here cancels the in-flight call
        // and skips emit/dispatch for this iteration.
        let decision = tokio::select! {
            biased;
            signal = self.signal_rx.recv() => {
                return match signal {
                    None => StepOutcome::Stop,
                    Some(signal) => match self.handle_signal(signal).await {
                        Flow::Stop => StepOutcome::Stop,
                        Flow::Continue => StepOutcome::Continue,
                    },
                };
            }
            decided = decide_with_retry(
                Arc::clone(&self.decider),
                self.config.clone(),
                &*state,
            ) => match decided {
                Ok(decision) => decision,
                Err(e) => return StepOutcome::DeciderFailed(e),
            },
        };

        state.add_cost(decision.cost);

        let action = decision.action;
        let action_id = match self
            .log
            .append(EventSource::Agent, EventPayload::Action(action.clone()))
            .await
        {
            Ok(id) => id,
            Err(e) => return StepOutcome::LogFailed(e),
        };

        match &action {
            Action::Finish { .. } => return StepOutcome::Finished,
            // Recorded, nothing to execute.
            Action::Think { .. } | Action::Message { .. } => {}
            _ => {
                if self.config.confirm_actions {
                    match self.await_confirmation().await {
                        Gate::Approved => {}
                        Gate::Stop => return StepOutcome::Stop,
                        Gate::Rejected => {
                            let observation = Observation::caused(
                                action_id,
                                ObservationKind::Error {
                                    message: "action rejected by user".to_string(),
                                },
                            );
                            return match self
                                .log
                                .append(
                                    EventSource::User,
                                    EventPayload::Observation(observation),
                                )
                                .await
                            {
                                Ok(_) => StepOutcome::Continue,
                                Err(e) => StepOutcome::LogFailed(e),
                            };
                        }
                    }
                }

                let observation = match self
                    .gateway
                    .execute(&action, action_id, self.dispatch_timeout(&action))
                    .await
                {
                    Ok(observation) => observation,
                    Err(e @ GatewayError::UnsupportedAction(_)) => {
                        // Protocol error: record it and keep stepping.
                        tracing::warn!("unsupported action reached dispatch: {e}");
                        Observation::caused(action_id, ObservationKind::Error {
                            message: e.to_string(),
                        })
                    }
                    Err(e @ GatewayError::SandboxUnavailable { .. }) => {
                        tracing::warn!("dispatch failed: {e}");
                        Observation::caused(action_id, ObservationKind::Error {
                            message: e.to_string(),
                        })
                    }
                };

                if let Err(e) = self
                    .log
                    .append(EventSource::Environment, EventPayload::Observation(observation))
                    .await
                {
                    return StepOutcome::LogFailed(e);
                }
            }
        }

        if let Err(e) = self.catch_up(state).await {
            return StepOutcome::LogFailed(e);
        }
        StepOutcome::Continue
    }

    /// Build-context: fold events appended since the last step.
    async fn catch_up(&self, state: &mut State) -> Result<(), EventLogError> {
        let from = state.last_event_id.map_or(0, |id| id + 1);
        for event in self.log.read_range(from, None).await? {
            state.apply(&event);
        }
        Ok(())
    }

    async fn handle_signal(&mut self, signal: ControlSignal) -> Flow {
        match signal {
            ControlSignal::Pause => {
                if self.status == AgentStatus::Running {
                    if let Err(e) = self.transition(AgentStatus::Paused).await {
                        tracing::error!("failed to record pause: {e}");
                    }
                }
                Flow::Continue
            }
            ControlSignal::Resume => {
                if self.status == AgentStatus::Paused {
                    if let Err(e) = self.transition(AgentStatus::Running).await {
                        tracing::error!("failed to record resume: {e}");
                    }
                }
                Flow::Continue
            }
            ControlSignal::Stop => Flow::Stop,
            ControlSignal::Confirm { .. } => {
                tracing::debug!("confirmation received with nothing awaiting it");
                Flow::Continue
            }
            ControlSignal::UserMessage { content } => {
                let observation =
                    Observation::external(ObservationKind::UserMessage { content });
                if let Err(e) = self
                    .log
                    .append(EventSource::User, EventPayload::Observation(observation))
                    .await
                {
                    tracing::error!("failed to record user message: {e}");
                }
                Flow::Continue
            }
        }
    }

    async fn await_confirmation(&mut self) -> Gate {
        if let Err(e) = self.transition(AgentStatus::AwaitingConfirmation).await {
            tracing::error!("failed to record awaiting-confirmation: {e}");
        }
        loop {
            let Some(signal) = self.signal_rx.recv().await else {
                return Gate::Stop;
            };
            match signal {
                ControlSignal::Confirm { approve } => {
                    if let Err(e) = self.transition(AgentStatus::Running).await {
                        tracing::error!("failed to record resume from confirmation: {e}");
                    }
                    return if approve { Gate::Approved } else { Gate::Rejected };
                }
                ControlSignal::Stop => return Gate::Stop,
                other => {
                    // Pause/resume wait their turn; user messages still land.
                    if matches!(self.handle_signal(other).await, Flow::Stop) {
                        return Gate::Stop;
                    }
                }
            }
        }
    }

    fn dispatch_timeout(&self, action: &Action) -> Duration {
        match action {
            Action::RunCommand { timeout_secs: Some(secs), .. } => Duration::from_secs(*secs),
            _ => self.config.dispatch_timeout,
        }
    }

    async fn transition(&mut self, status: AgentStatus) -> Result<(), EventLogError> {
        self.status = status;
        let _ = self.status_tx.send(status);
        let observation = Observation::external(ObservationKind::StatusChanged { status });
        self.log
            .append(EventSource::Environment, EventPayload::Observation(observation))
            .await?;
        Ok(())
    }

    async fn transition_stuck(&mut self, reason: String) {
        tracing::warn!(session_id = %self.log.session_id(), "control loop stuck: {reason}");
        let observation = Observation::external(ObservationKind::Error {
            message: format!("stuck: {reason}"),
        });
        if let Err(e) = self
            .log
            .append(EventSource::Environment, EventPayload::Observation(observation))
            .await
        {
            tracing::error!("failed to record stuck reason: {e}");
        }
        if let Err(e) = self.transition(AgentStatus::Stuck).await {
            tracing::error!("failed to record stuck status: {e}");
        }
    }

    async fn finish_stopped(&mut self) {
        if !self.status.is_terminal() {
            if let Err(e) = self.transition(AgentStatus::Finished).await {
                tracing::error!("failed to record stop: {e}");
            }
        }
    }
}

/// Call the decider with a per-attempt timeout and bounded, doubling-delay
/// retries. Unrecoverable after the budget: the caller escalates to `Error`.
async fn decide_with_retry(
    decider: Arc<dyn Decider>,
    config: ControllerConfig,
    state: &State,
) -> Result<Decision, DecisionError> {
    let mut delay = config.decider_retry_delay;
    let mut attempt = 0;
    loop {
        let result =
            match tokio::time::timeout(config.decide_timeout, decider.decide(state)).await {
                Ok(result) => result,
                Err(_elapsed) => Err(DecisionError::Timeout),
            };
        match result {
            Ok(decision) => return Ok(decision),
            Err(e) => {
                attempt += 1;
                if attempt > config.decider_retries {
                    return Err(e);
                }
                tracing::warn!(attempt, "decision failed, retrying: {e}");
                tokio::time::sleep(delay).await;
                delay *= 2;
            }
        }
    }
}
