//! Explicit session registry with sandbox accounting and idle sweep.

use std::{collections::HashMap, sync::Arc, time::Duration};

use tokio::sync::RwLock;
use uuid::Uuid;

use agentd_control::{Decider, LoopPolicy};
use agentd_events::{EventStore, SessionId};
use agentd_gateway::{SandboxPool, SandboxProvider};

use crate::session::{Session, SessionConfig, SessionError, TaskSpec};

/// Registry configuration.
#[derive(Debug, Clone)]
pub struct RegistryConfig {
    /// Sessions with no attached connection and no activity for this long
    /// are torn down by the sweep.
    pub idle_timeout: Duration,
    /// Sweep period.
    pub sweep_interval: Duration,
    /// Sandbox pool size; admission control accounts for it.
    pub sandbox_capacity: usize,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            idle_timeout: Duration::from_secs(600),
            sweep_interval: Duration::from_secs(60),
            sandbox_capacity: 8,
        }
    }
}

/// Owns every live session in the process.
///
/// An explicit object passed by handle, with defined init and teardown; no
/// process-wide mutable globals. Connections hold session ids and look them
/// up here rather than holding sessions directly, which keeps ownership
/// acyclic: registry → session → {control loop, gateway}.
pub struct SessionRegistry {
    sessions: RwLock<HashMap<SessionId, Arc<Session>>>,
    store: Arc<dyn EventStore>,
    provider: Arc<dyn SandboxProvider>,
    decider: Arc<dyn Decider>,
    policy: Option<Arc<dyn LoopPolicy>>,
    session_config: SessionConfig,
    pool: SandboxPool,
    config: RegistryConfig,
}

impl SessionRegistry {
    /// Create a registry over shared collaborators.
    #[must_use]
    pub fn new(
        store: Arc<dyn EventStore>,
        provider: Arc<dyn SandboxProvider>,
        decider: Arc<dyn Decider>,
        policy: Option<Arc<dyn LoopPolicy>>,
        session_config: SessionConfig,
        config: RegistryConfig,
    ) -> Arc<Self> {
        let pool = SandboxPool::new(config.sandbox_capacity);
        Arc::new(Self {
            sessions: RwLock::new(HashMap::new()),
            store,
            provider,
            decider,
            policy,
            session_config,
            pool,
            config,
        })
    }

    /// The sandbox pool, for admission accounting.
    #[must_use]
    pub const fn sandbox_pool(&self) -> &SandboxPool {
        &self.pool
    }

    /// Create a session for `task` and start it.
    ///
    /// # Errors
    /// Returns `SandboxExhausted` when no sandbox slot is free, or the
    /// provisioning/spawn error.
    pub async fn create(&self, task: TaskSpec) -> Result<Arc<Session>, SessionError> {
        let lease = self.pool.try_acquire().ok_or(SessionError::SandboxExhausted)?;
        let session_id = Uuid::new_v4();
        let transport = self.provider.provision(session_id).await?;

        let session = Session::spawn(
            session_id,
            task,
            Arc::clone(&self.store),
            transport,
            Arc::clone(&self.decider),
            self.policy.clone(),
            self.session_config.clone(),
            Some(lease),
        )
        .await?;

        self.sessions.write().await.insert(session_id, Arc::clone(&session));
        Ok(session)
    }

    /// Look up a live session.
    pub async fn get(&self, session_id: SessionId) -> Option<Arc<Session>> {
        self.sessions.read().await.get(&session_id).cloned()
    }

    /// Number of live sessions.
    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    /// Whether the registry holds no sessions.
    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }

    /// Stop and remove a session. The persisted log stays readable through
    /// the store.
    pub async fn remove(&self, session_id: SessionId) {
        let session = self.sessions.write().await.remove(&session_id);
        if let Some(session) = session {
            session.stop().await;
        }
    }

    /// Tear down sessions idle past the configured window. Returns how many
    /// were removed.
    pub async fn sweep(&self) -> usize {
        let candidates: Vec<Arc<Session>> =
            self.sessions.read().await.values().cloned().collect();

        let mut removed = 0;
        for session in candidates {
            if session.is_idle(self.config.idle_timeout).await {
                tracing::info!(session_id = %session.id(), "sweeping idle session");
                self.remove(session.id()).await;
                removed += 1;
            }
        }
        removed
    }

    /// Run the idle sweep on its configured period until the task is
    /// aborted or the registry is dropped.
    #[must_use]
    pub fn spawn_sweeper(self: &Arc<Self>) -> tokio::task::JoinHandle<()> {
        let registry = Arc::downgrade(self);
        let period = self.config.sweep_interval;
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                interval.tick().await;
                let Some(registry) = registry.upgrade() else {
                    break;
                };
                let removed = registry.sweep().await;
                if removed > 0 {
                    tracing::debug!(removed, "idle sweep complete");
                }
            }
        })
    }

    /// Stop every session; used at process shutdown.
    pub async fn shutdown(&self) {
        let sessions: Vec<Arc<Session>> = {
            let mut map = self.sessions.write().await;
            map.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.stop().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;

    use agentd_control::{Decider, Decision, DecisionError, State};
    use agentd_events::{Action, MemoryEventStore};
    use agentd_gateway::{
        SandboxRequest, SandboxResponse, SandboxTransport, TransportError,
    };

    use crate::session::AttachMode;

    use super::*;

    struct NullTransport;

    #[async_trait]
    impl SandboxTransport for NullTransport {
        async fn connect(&self) -> Result<(), TransportError> {
            Ok(())
        }

        async fn execute_action(
            &self,
            _request: SandboxRequest,
        ) -> Result<SandboxResponse, TransportError> {
            Ok(SandboxResponse {
                observation: agentd_events::ObservationKind::Error {
                    message: "not under test".to_string(),
                },
            })
        }
    }

    struct NullProvider;

    #[async_trait]
    impl SandboxProvider for NullProvider {
        async fn provision(
            &self,
            _session_id: SessionId,
        ) -> Result<Arc<dyn SandboxTransport>, TransportError> {
            Ok(Arc::new(NullTransport))
        }
    }

    /// Never decides; keeps sessions alive until stopped.
    struct IdleDecider;

    #[async_trait]
    impl Decider for IdleDecider {
        async fn decide(&self, _state: &State) -> Result<Decision, DecisionError> {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            Ok(Decision::free(Action::Finish { outcome: None }))
        }
    }

    fn registry(capacity: usize, idle_timeout: Duration) -> Arc<SessionRegistry> {
        SessionRegistry::new(
            Arc::new(MemoryEventStore::new()),
            Arc::new(NullProvider),
            Arc::new(IdleDecider),
            None,
            SessionConfig {
                controller: agentd_control::ControllerConfig {
                    decide_timeout: Duration::from_secs(7200),
                    ..Default::default()
                },
                ..Default::default()
            },
            RegistryConfig {
                idle_timeout,
                sweep_interval: Duration::from_millis(10),
                sandbox_capacity: capacity,
            },
        )
    }

    #[tokio::test]
    async fn create_consumes_sandbox_capacity() {
        let registry = registry(2, Duration::from_secs(3600));

        let a = registry.create(TaskSpec::new("one")).await.unwrap();
        let _b = registry.create(TaskSpec::new("two")).await.unwrap();
        assert_eq!(registry.sandbox_pool().available(), 0);

        let err = registry.create(TaskSpec::new("three")).await.unwrap_err();
        assert!(matches!(err, SessionError::SandboxExhausted));

        // Stopping a session releases its slot.
        registry.remove(a.id()).await;
        assert_eq!(registry.sandbox_pool().available(), 1);
        registry.create(TaskSpec::new("four")).await.unwrap();
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn lookup_by_id() {
        let registry = registry(4, Duration::from_secs(3600));
        let session = registry.create(TaskSpec::new("task")).await.unwrap();

        let found = registry.get(session.id()).await.unwrap();
        assert_eq!(found.id(), session.id());
        assert!(registry.get(Uuid::new_v4()).await.is_none());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn sweep_removes_idle_sessions_only() {
        let registry = registry(4, Duration::from_millis(20));

        let idle = registry.create(TaskSpec::new("idle")).await.unwrap();
        let held = registry.create(TaskSpec::new("held")).await.unwrap();
        let conn = Uuid::new_v4();
        held.attach(conn, AttachMode::Driver, None).await.unwrap();

        tokio::time::sleep(Duration::from_millis(40)).await;
        let removed = registry.sweep().await;

        assert_eq!(removed, 1);
        assert!(registry.get(idle.id()).await.is_none());
        assert!(registry.get(held.id()).await.is_some());
        registry.shutdown().await;
    }

    #[tokio::test]
    async fn shutdown_stops_everything() {
        let registry = registry(4, Duration::from_secs(3600));
        registry.create(TaskSpec::new("a")).await.unwrap();
        registry.create(TaskSpec::new("b")).await.unwrap();

        registry.shutdown().await;
        assert!(registry.is_empty().await);
        assert_eq!(registry.sandbox_pool().available(), 4);
    }
}
