//! Demo server: the full stack behind one WebSocket endpoint.
//!
//! Run with: cargo run -p agentd-demo-server
//!
//! Open a WebSocket to `ws://localhost:3000/ws?user_id=demo`, send
//! `{"type":"start","intent":"echo hello"}` and watch the event stream. The
//! demo decider runs the intent as a shell command and finishes, standing in
//! for a model-backed decision collaborator.

use std::{net::SocketAddr, sync::Arc};

use async_trait::async_trait;
use tower_http::cors::CorsLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use agentd_control::{Decider, Decision, DecisionError, RepetitionPolicy, State};
use agentd_events::{Action, EventPayload, FileEventStore};
use agentd_gateway::LocalSandboxProvider;
use agentd_session::{RegistryConfig, SessionConfig, SessionRegistry};
use agentd_transport::{ConnectionManager, ManagerConfig, websocket::create_ws_router};

/// Runs the latest user message as a shell command, then finishes. A stand-in
/// for the model-backed decider this crate treats as an external collaborator.
struct ShellDecider;

#[async_trait]
impl Decider for ShellDecider {
    async fn decide(&self, state: &State) -> Result<Decision, DecisionError> {
        let history = state.history();
        let last_user = history.iter().rposition(|event| {
            matches!(
                &event.payload,
                EventPayload::Observation(observation)
                    if matches!(observation.kind, agentd_events::ObservationKind::UserMessage { .. })
            )
        });

        let Some(last_user) = last_user else {
            return Ok(Decision::free(Action::Finish { outcome: None }));
        };

        // One command per user message; finish once it was answered.
        let answered = history[last_user..].iter().any(|event| event.action().is_some());
        if answered {
            return Ok(Decision::free(Action::Finish {
                outcome: Some("command executed".to_string()),
            }));
        }

        let command = match &history[last_user].payload {
            EventPayload::Observation(observation) => match &observation.kind {
                agentd_events::ObservationKind::UserMessage { content } => content.clone(),
                _ => return Err(DecisionError::Malformed("lost the user message".to_string())),
            },
            EventPayload::Action(_) => {
                return Err(DecisionError::Malformed("lost the user message".to_string()));
            }
        };

        Ok(Decision { action: Action::RunCommand { command, timeout_secs: None }, cost: 0.01 })
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::registry()
        .with(tracing_subscriber::fmt::layer())
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let data_dir = std::env::var("AGENTD_DATA_DIR").unwrap_or_else(|_| "./data".to_string());
    let store = Arc::new(FileEventStore::new(format!("{data_dir}/events")).await?);
    let provider = Arc::new(LocalSandboxProvider::new(format!("{data_dir}/workspaces")));

    let registry = SessionRegistry::new(
        store,
        provider,
        Arc::new(ShellDecider),
        Some(Arc::new(RepetitionPolicy::new())),
        SessionConfig::default(),
        RegistryConfig::default(),
    );
    let _sweeper = registry.spawn_sweeper();

    let manager = ConnectionManager::new(Arc::clone(&registry), ManagerConfig::default());
    let _health = manager.spawn_health_sweeper();

    let app = create_ws_router(manager).layer(CorsLayer::permissive());

    let addr = SocketAddr::from(([127, 0, 0, 1], 3000));
    tracing::info!("agentd demo server listening on ws://{addr}/ws");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;

    registry.shutdown().await;
    Ok(())
}
